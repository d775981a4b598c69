//! The deployment supervisor state machine.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::events::{DeploymentEvent, Termination};
use super::state::DeploymentState;
use crate::context::DeploymentContext;
use crate::error::{DeploymentError, DeploymentResult};
use crate::model::{DeploymentSpec, PortDirection};
use crate::process::{LOCALHOST, ProcessExit, ProcessHandle};
use crate::reaper::DeadConnectionReaper;
use crate::registry::DeploymentRecord;
use crate::task::{TaskBinding, TaskHandle, TaskHandleRegistry};

const EVENT_CAPACITY: usize = 16;

/// Per-instance arguments of a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentArguments {
    /// Machine to run on; `localhost` when unset.
    pub on: Option<String>,
    /// Whether output ports get logged once the deployment is ready.
    pub log: bool,
}

impl Default for DeploymentArguments {
    fn default() -> Self {
        Self { on: None, log: true }
    }
}

impl DeploymentArguments {
    #[must_use]
    pub fn on(mut self, machine: impl Into<String>) -> Self {
        self.on = Some(machine.into());
        self
    }

    #[must_use]
    pub const fn with_log(mut self, log: bool) -> Self {
        self.log = log;
        self
    }
}

/// What a single poll step observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing to watch in the current state.
    Idle,
    /// The process is starting but not ready yet.
    Pending,
    /// The deployment just became ready.
    BecameReady,
    /// The process exit was observed.
    Died(Termination),
}

/// Supervises one deployment process and the tasks it hosts.
///
/// The supervisor never blocks: `start` and `stop` only issue requests, and
/// readiness and exit are observed by calling [`poll`] from a cooperative
/// loop.
///
/// [`poll`]: DeploymentSupervisor::poll
pub struct DeploymentSupervisor {
    spec: Arc<DeploymentSpec>,
    arguments: DeploymentArguments,
    context: Arc<DeploymentContext>,
    state: DeploymentState,
    process: Option<Arc<dyn ProcessHandle>>,
    log_dir: Option<PathBuf>,
    tasks: TaskHandleRegistry,
    dependents: Vec<TaskBinding>,
    logged_ports: Vec<(String, String)>,
    ready_to_die: bool,
    termination: Option<Termination>,
    events: broadcast::Sender<DeploymentEvent>,
}

impl DeploymentSupervisor {
    #[must_use]
    pub fn new(spec: Arc<DeploymentSpec>, context: Arc<DeploymentContext>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            spec,
            arguments: DeploymentArguments::default(),
            context,
            state: DeploymentState::Created,
            process: None,
            log_dir: None,
            tasks: TaskHandleRegistry::new(),
            dependents: Vec::new(),
            logged_ports: Vec::new(),
            ready_to_die: false,
            termination: None,
            events,
        }
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: DeploymentArguments) -> Self {
        self.arguments = arguments;
        self
    }

    /// Deployment name, i.e. the name of its executable.
    #[must_use]
    pub fn name(&self) -> &str {
        self.spec.name()
    }

    #[must_use]
    pub fn spec(&self) -> &DeploymentSpec {
        &self.spec
    }

    /// Machine this deployment runs on.
    #[must_use]
    pub fn machine(&self) -> &str {
        self.arguments.on.as_deref().unwrap_or(LOCALHOST)
    }

    #[must_use]
    pub const fn state(&self) -> DeploymentState {
        self.state
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == DeploymentState::Ready
    }

    #[must_use]
    pub fn is_dead(&self) -> bool {
        self.state == DeploymentState::Dead
    }

    /// Whether a stop was requested, as opposed to an unexpected exit.
    #[must_use]
    pub const fn ready_to_die(&self) -> bool {
        self.ready_to_die
    }

    #[must_use]
    pub fn process(&self) -> Option<&Arc<dyn ProcessHandle>> {
        self.process.as_ref()
    }

    /// Log directory of the process server the deployment was started on.
    #[must_use]
    pub fn log_dir(&self) -> Option<&Path> {
        self.log_dir.as_deref()
    }

    #[must_use]
    pub const fn task_handles(&self) -> &TaskHandleRegistry {
        &self.tasks
    }

    /// `(task, port)` pairs whose logging was requested at ready time.
    #[must_use]
    pub fn logged_ports(&self) -> &[(String, String)] {
        &self.logged_ports
    }

    #[must_use]
    pub const fn termination(&self) -> Option<Termination> {
        self.termination
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeploymentEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: DeploymentEvent) {
        if let Err(e) = self.events.send(event) {
            debug!("No active subscribers for deployment event: {}", e);
        }
    }

    fn transition(&mut self, state: DeploymentState) {
        debug!(deployment = %self.name(), from = %self.state, to = %state, "state transition");
        self.state = state;
        if let Some(process) = &self.process {
            self.context.registry.update_state(&process.id(), state);
        }
    }

    /// Spawn the deployment process.
    ///
    /// The deployment is ready only once a later [`poll`] sees the process
    /// running.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` unless the deployment is `Created`,
    /// `UnknownProcessServer` if no server handles the machine, and
    /// `SpawnFailed` if the server could not start the process. The
    /// deployment stays `Created` on error.
    ///
    /// [`poll`]: DeploymentSupervisor::poll
    pub fn start(&mut self) -> DeploymentResult<()> {
        if self.state != DeploymentState::Created {
            return Err(DeploymentError::invalid_state_transition(
                self.name(),
                "start",
                self.state,
            ));
        }

        let host = self.machine().to_string();
        info!(deployment = %self.name(), host = %host, "starting deployment {} on {}", self.name(), host);

        let entry = self.context.process_servers.get(&host)?.clone();
        let process = entry
            .server
            .start(self.name(), &entry.log_dir, &self.context.output)
            .map_err(|e| DeploymentError::spawn_failed(self.name(), &host, e.to_string()))?;

        self.context.registry.register(DeploymentRecord {
            deployment: self.name().to_string(),
            machine: host.clone(),
            state: DeploymentState::Starting,
            process: Arc::clone(&process),
        });
        let pid = process.id();
        self.process = Some(process);
        self.log_dir = Some(entry.log_dir);
        self.transition(DeploymentState::Starting);

        self.emit(DeploymentEvent::Started {
            deployment: self.name().to_string(),
            machine: host,
            process: pid,
        });
        Ok(())
    }

    /// One non-blocking supervision step.
    ///
    /// Observes the process exit first, then readiness while starting.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be queried or if a task of the
    /// deployment cannot be discovered once the process runs. The deployment
    /// stays `Starting` and the next poll retries.
    pub fn poll(&mut self) -> DeploymentResult<PollOutcome> {
        if matches!(self.state, DeploymentState::Created | DeploymentState::Dead) {
            return Ok(PollOutcome::Idle);
        }
        let Some(process) = self.process.clone() else {
            return Ok(PollOutcome::Idle);
        };

        if let Some(exit) = process.try_exit()? {
            return Ok(self
                .dead(Some(exit))
                .map_or(PollOutcome::Idle, PollOutcome::Died));
        }

        if self.state != DeploymentState::Starting {
            return Ok(PollOutcome::Idle);
        }
        if !process.wait_running(Duration::ZERO)? {
            return Ok(PollOutcome::Pending);
        }

        self.become_ready(process.as_ref())?;
        Ok(PollOutcome::BecameReady)
    }

    fn become_ready(&mut self, process: &dyn ProcessHandle) -> DeploymentResult<()> {
        let pid = process.id();
        let validity = self.tasks.validity();
        let handles = self
            .spec
            .activities()
            .iter()
            .map(|activity| {
                let remote = self.context.discovery.lookup(&activity.name)?;
                let handle = TaskHandle::owned(
                    &activity.name,
                    self.name(),
                    pid.clone(),
                    remote,
                    Arc::clone(&validity),
                );
                Ok((activity.name.clone(), handle))
            })
            .collect::<DeploymentResult<BTreeMap<_, _>>>()?;
        self.tasks.populate(handles);

        self.configure_logging(process);

        for dependent in &self.dependents {
            if let Some(handle) = self.tasks.get(dependent.name()) {
                dependent.bind(handle.clone());
            }
        }

        self.transition(DeploymentState::Ready);
        info!(deployment = %self.name(), tasks = self.tasks.len(), "deployment {} is ready", self.name());
        self.emit(DeploymentEvent::Ready {
            deployment: self.name().to_string(),
        });
        Ok(())
    }

    fn configure_logging(&mut self, process: &dyn ProcessHandle) {
        let policy = Arc::clone(&self.context.log_policy);
        if !self.arguments.log || policy.deployment_excluded(self.name()) {
            info!("not automatically logging any port in deployment {}", self.name());
            return;
        }

        let log_dir = self.log_dir.clone().unwrap_or_default();
        let remote = self.machine() != LOCALHOST;
        for activity in self.spec.activities() {
            let Some(handle) = self.tasks.get(&activity.name) else {
                continue;
            };
            let ports = handle.remote().ports().unwrap_or_else(|e| {
                warn!(
                    task = %activity.name,
                    error = %e,
                    "cannot list ports, falling back to the ports declared by {}",
                    activity.model
                );
                activity.model.ports().to_vec()
            });

            for port in ports.iter().filter(|p| p.direction == PortDirection::Output) {
                if !policy.should_log(self.name(), &activity.model, &activity.name, port) {
                    info!("not logging {}:{}", activity.name, port.name);
                    continue;
                }
                match process.log_port(&activity.name, &port.name, &log_dir, remote) {
                    Ok(()) => self
                        .logged_ports
                        .push((activity.name.clone(), port.name.clone())),
                    Err(e) => warn!(
                        task = %activity.name,
                        port = %port.name,
                        error = %e,
                        "failed to start logging port"
                    ),
                }
            }
        }
    }

    /// Ask the process to terminate.
    ///
    /// Does not wait: the exit is observed by a later [`poll`]. Stopping a
    /// deployment that is already stopping or dead does nothing.
    ///
    /// # Errors
    ///
    /// Returns `InvalidStateTransition` if the deployment was never started,
    /// or the error of the kill request.
    ///
    /// [`poll`]: DeploymentSupervisor::poll
    pub fn stop(&mut self) -> DeploymentResult<()> {
        match self.state {
            DeploymentState::Stopping | DeploymentState::Dead => {
                debug!(deployment = %self.name(), state = %self.state, "stop ignored");
                Ok(())
            }
            DeploymentState::Created => Err(DeploymentError::invalid_state_transition(
                self.name(),
                "stop",
                self.state,
            )),
            DeploymentState::Starting | DeploymentState::Ready => {
                if let Some(process) = &self.process {
                    process.kill(false)?;
                }
                self.ready_to_die = true;
                info!(deployment = %self.name(), "stopping deployment {}", self.name());
                self.transition(DeploymentState::Stopping);
                self.emit(DeploymentEvent::Stopping {
                    deployment: self.name().to_string(),
                });
                Ok(())
            }
        }
    }

    /// Process termination.
    ///
    /// Unregisters the deployment, drops the configured markers and handle
    /// bindings of its tasks and reaps their connections. Returns `None` if
    /// the deployment was already dead.
    pub fn dead(&mut self, exit: Option<ProcessExit>) -> Option<Termination> {
        if self.is_dead() {
            return None;
        }

        let termination = Termination::classify(exit);
        if self.ready_to_die || !termination.is_failure() {
            info!(deployment = %self.name(), "deployment {} {}", self.name(), termination);
        } else {
            warn!(deployment = %self.name(), "deployment {} died unexpectedly: {}", self.name(), termination);
        }

        self.transition(DeploymentState::Dead);
        if let Some(process) = &self.process {
            self.context.registry.remove(&process.id());
        }
        for activity in self.spec.activities() {
            self.context.configured.clear(&activity.name);
        }
        for dependent in self.dependents.drain(..) {
            dependent.unbind();
        }

        let owned = self.tasks.invalidate();
        let report =
            DeadConnectionReaper::new(&self.context.registry, &self.context.dataflow).reap(&owned);
        if !report.is_noop() {
            info!(
                deployment = %self.name(),
                disconnects = report.actions.len(),
                failures = report.failures,
                removed_edges = report.removed_edges,
                "cleaned up dead connections"
            );
        }

        self.termination = Some(termination);
        self.emit(DeploymentEvent::Terminated {
            deployment: self.name().to_string(),
            termination,
            requested: self.ready_to_die,
        });
        Some(termination)
    }

    /// Bind a task instance executed by this deployment.
    ///
    /// The binding carries the live handle while the deployment is ready.
    ///
    /// # Errors
    ///
    /// Returns `TaskNotFound` if `name` is not one of the deployment's tasks.
    pub fn task(&mut self, name: &str) -> DeploymentResult<TaskBinding> {
        let activity = self
            .spec
            .activity(name)
            .cloned()
            .ok_or_else(|| DeploymentError::task_not_found(name, self.name()))?;
        if let Some(existing) = self.dependents.iter().find(|d| d.name() == name) {
            return Ok(existing.clone());
        }

        let binding = TaskBinding::new(self.name(), activity);
        if self.is_ready() {
            if let Some(handle) = self.tasks.get(name) {
                binding.bind(handle.clone());
            }
        }
        self.dependents.push(binding.clone());
        Ok(binding)
    }

    /// Bind every task of the deployment.
    ///
    /// # Errors
    ///
    /// Never fails in practice since every name comes from the deployment
    /// itself; the error type is shared with [`task`].
    ///
    /// [`task`]: DeploymentSupervisor::task
    pub fn task_all(&mut self) -> DeploymentResult<Vec<TaskBinding>> {
        let names: Vec<String> = self
            .spec
            .activities()
            .iter()
            .map(|a| a.name.clone())
            .collect();
        names.iter().map(|name| self.task(name)).collect()
    }
}

impl std::fmt::Debug for DeploymentSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeploymentSupervisor")
            .field("name", &self.name())
            .field("machine", &self.machine())
            .field("state", &self.state)
            .field("ready_to_die", &self.ready_to_die)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryDiscovery, InMemoryProcessServer};
    use crate::model::{TaskActivity, TaskModel};

    fn started(server: &InMemoryProcessServer) -> DeploymentResult<Arc<crate::memory::InMemoryProcess>> {
        server
            .process("nav_deployment")
            .ok_or_else(|| DeploymentError::process("nav_deployment was never started"))
    }

    fn setup(server: InMemoryProcessServer) -> (DeploymentSupervisor, Arc<InMemoryProcessServer>) {
        let server = Arc::new(server);
        let context = DeploymentContext::new(Arc::new(InMemoryDiscovery::permissive()))
            .with_process_server(LOCALHOST, server.clone(), "/tmp/fleet-logs");
        let spec = DeploymentSpec::new("nav_deployment")
            .with_activity(TaskActivity::new("nav", Arc::new(TaskModel::new("nav::Task"))));
        (
            DeploymentSupervisor::new(Arc::new(spec), Arc::new(context)),
            server,
        )
    }

    #[test]
    fn should_default_machine_to_localhost() {
        let (supervisor, _) = setup(InMemoryProcessServer::new());
        assert_eq!(supervisor.machine(), "localhost");

        let supervisor = supervisor.with_arguments(DeploymentArguments::default().on("arm"));
        assert_eq!(supervisor.machine(), "arm");
    }

    #[test]
    fn should_pass_log_dir_and_output_pattern_to_server() -> DeploymentResult<()> {
        let (mut supervisor, server) = setup(InMemoryProcessServer::new());
        supervisor.start()?;

        let starts = server.starts();
        assert_eq!(starts.len(), 1);
        assert_eq!(starts[0].deployment, "nav_deployment");
        assert_eq!(starts[0].working_directory, PathBuf::from("/tmp/fleet-logs"));
        assert_eq!(starts[0].output.pattern(), "%m-%p.txt");
        assert_eq!(supervisor.log_dir(), Some(Path::new("/tmp/fleet-logs")));
        Ok(())
    }

    #[test]
    fn should_reject_second_start() -> DeploymentResult<()> {
        let (mut supervisor, _) = setup(InMemoryProcessServer::new());
        supervisor.start()?;

        let result = supervisor.start();
        assert!(matches!(
            result,
            Err(DeploymentError::InvalidStateTransition { .. })
        ));
        Ok(())
    }

    #[test]
    fn should_stay_created_when_spawn_fails() {
        let (mut supervisor, _) = setup(InMemoryProcessServer::new().failing("no such executable"));

        let result = supervisor.start();
        assert!(matches!(result, Err(DeploymentError::SpawnFailed { .. })));
        assert_eq!(supervisor.state(), DeploymentState::Created);
        assert!(supervisor.process().is_none());
    }

    #[test]
    fn should_fail_start_on_unknown_machine() {
        let (supervisor, _) = setup(InMemoryProcessServer::new());
        let mut supervisor = supervisor.with_arguments(DeploymentArguments::default().on("arm"));

        let result = supervisor.start();
        assert!(matches!(
            result,
            Err(DeploymentError::UnknownProcessServer { .. })
        ));
    }

    #[test]
    fn should_reject_stop_before_start() {
        let (mut supervisor, _) = setup(InMemoryProcessServer::new());
        assert!(supervisor.stop().is_err());
    }

    #[test]
    fn should_bind_task_requested_after_ready() -> DeploymentResult<()> {
        let (mut supervisor, _) = setup(InMemoryProcessServer::new());
        supervisor.start()?;
        assert_eq!(supervisor.poll()?, PollOutcome::BecameReady);

        let binding = supervisor.task("nav")?;
        assert!(binding.is_bound());
        assert_eq!(binding.deployment(), "nav_deployment");
        Ok(())
    }

    #[test]
    fn should_emit_transitions_in_order() -> DeploymentResult<()> {
        let (mut supervisor, server) = setup(InMemoryProcessServer::new());
        let mut events = supervisor.subscribe();

        supervisor.start()?;
        supervisor.poll()?;
        supervisor.stop()?;
        started(&server)?
            .exit(ProcessExit::Signaled { signal: 15 });
        supervisor.poll()?;

        let received: Vec<DeploymentEvent> = std::iter::from_fn(|| events.try_recv().ok()).collect();
        assert_eq!(received.len(), 4);
        assert!(matches!(received[0], DeploymentEvent::Started { .. }));
        assert!(matches!(received[1], DeploymentEvent::Ready { .. }));
        assert!(matches!(received[2], DeploymentEvent::Stopping { .. }));
        assert!(matches!(
            received[3],
            DeploymentEvent::Terminated {
                termination: Termination::Signaled { signal: 15 },
                requested: true,
                ..
            }
        ));
        Ok(())
    }

    #[test]
    fn should_report_failed_when_exit_is_unknown() -> DeploymentResult<()> {
        let (mut supervisor, _) = setup(InMemoryProcessServer::new());
        supervisor.start()?;

        assert_eq!(
            supervisor.dead(None),
            Some(Termination::Failed { exit: None })
        );
        assert!(!supervisor.ready_to_die());
        Ok(())
    }

    #[test]
    fn should_not_flag_requested_death_when_kill_fails() -> DeploymentResult<()> {
        let (mut supervisor, server) = setup(InMemoryProcessServer::new());
        supervisor.start()?;
        supervisor.poll()?;
        let process = started(&server)?;
        process.set_refuse_kill(true);

        assert!(supervisor.stop().is_err());
        assert_eq!(supervisor.state(), DeploymentState::Ready);
        assert!(!supervisor.ready_to_die());

        let mut events = supervisor.subscribe();
        process.exit(ProcessExit::Signaled { signal: 11 });
        supervisor.poll()?;
        assert!(matches!(
            events.try_recv(),
            Ok(DeploymentEvent::Terminated { requested: false, .. })
        ));
        Ok(())
    }

    #[test]
    fn should_share_one_binding_per_task() -> DeploymentResult<()> {
        let (mut supervisor, _) = setup(InMemoryProcessServer::new());
        let first = supervisor.task("nav")?;
        let second = supervisor.task("nav")?;
        supervisor.task_all()?;
        assert_eq!(supervisor.dependents.len(), 1);

        supervisor.start()?;
        supervisor.poll()?;
        assert!(first.is_bound());
        assert!(second.is_bound());

        assert!(supervisor.dead(Some(ProcessExit::Exited { code: 0 })).is_some());
        assert!(!first.is_bound());
        assert!(supervisor.dependents.is_empty());
        Ok(())
    }
}
