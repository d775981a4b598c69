//! In-memory collaborators.
//!
//! Process server, process, remote task and discovery implementations that
//! keep everything in memory and record what was asked of them. They back
//! dry runs and the test suites.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::{DeploymentError, DeploymentResult};
use crate::model::PortDecl;
use crate::process::{OutputSpec, ProcessExit, ProcessHandle, ProcessId, ProcessServer};
use crate::task::{RemoteTask, TaskDiscovery};

static NEXT_PID: AtomicU32 = AtomicU32::new(1000);

/// A simulated deployment process.
///
/// It reports ready after a configurable number of readiness polls and
/// exits only when told to.
#[derive(Debug)]
pub struct InMemoryProcess {
    deployment: String,
    pid: u32,
    running: AtomicBool,
    ready_after: AtomicU32,
    readiness_polls: AtomicU32,
    exit_on_kill: AtomicBool,
    refuse_kill: AtomicBool,
    exit: Mutex<Option<ProcessExit>>,
    kills: Mutex<Vec<bool>>,
    logged: Mutex<Vec<(String, String)>>,
}

impl InMemoryProcess {
    #[must_use]
    pub fn new(deployment: impl Into<String>, pid: u32) -> Self {
        Self {
            deployment: deployment.into(),
            pid,
            running: AtomicBool::new(true),
            ready_after: AtomicU32::new(0),
            readiness_polls: AtomicU32::new(0),
            exit_on_kill: AtomicBool::new(false),
            refuse_kill: AtomicBool::new(false),
            exit: Mutex::new(None),
            kills: Mutex::new(Vec::new()),
            logged: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn deployment(&self) -> &str {
        &self.deployment
    }

    /// Number of readiness polls answered "not yet" before reporting ready.
    pub fn set_ready_after(&self, polls: u32) {
        self.ready_after.store(polls, Ordering::SeqCst);
    }

    /// Exit with SIGTERM (or SIGKILL when forced) as soon as killed.
    pub fn set_exit_on_kill(&self, exit: bool) {
        self.exit_on_kill.store(exit, Ordering::SeqCst);
    }

    /// Make kill requests fail, as when the signal cannot be delivered.
    pub fn set_refuse_kill(&self, refuse: bool) {
        self.refuse_kill.store(refuse, Ordering::SeqCst);
    }

    /// Simulate the termination of the process.
    pub fn exit(&self, exit: ProcessExit) {
        self.running.store(false, Ordering::SeqCst);
        *self.exit.lock() = Some(exit);
    }

    /// The `force` flag of every kill request received.
    #[must_use]
    pub fn kills(&self) -> Vec<bool> {
        self.kills.lock().clone()
    }

    #[must_use]
    pub fn readiness_polls(&self) -> u32 {
        self.readiness_polls.load(Ordering::SeqCst)
    }

    /// `(task, port)` pairs that logging was requested for.
    #[must_use]
    pub fn logged_ports(&self) -> Vec<(String, String)> {
        self.logged.lock().clone()
    }
}

impl ProcessHandle for InMemoryProcess {
    fn id(&self) -> ProcessId {
        ProcessId::new(self.pid.to_string())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn wait_running(&self, _timeout: Duration) -> DeploymentResult<bool> {
        if !self.is_running() {
            return Ok(false);
        }
        let polls = self
            .readiness_polls
            .fetch_add(1, Ordering::SeqCst)
            .saturating_add(1);
        Ok(polls > self.ready_after.load(Ordering::SeqCst))
    }

    fn try_exit(&self) -> DeploymentResult<Option<ProcessExit>> {
        Ok(*self.exit.lock())
    }

    fn kill(&self, force: bool) -> DeploymentResult<()> {
        self.kills.lock().push(force);
        if self.refuse_kill.load(Ordering::SeqCst) {
            return Err(DeploymentError::process(format!("cannot signal {}", self.pid)));
        }
        if self.exit_on_kill.load(Ordering::SeqCst) {
            let signal = if force { 9 } else { 15 };
            self.exit(ProcessExit::Signaled { signal });
        }
        Ok(())
    }

    fn log_port(&self, task: &str, port: &str, _log_dir: &Path, _remote: bool) -> DeploymentResult<()> {
        self.logged.lock().push((task.to_string(), port.to_string()));
        Ok(())
    }
}

/// A start request received by [`InMemoryProcessServer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartRequest {
    pub deployment: String,
    pub working_directory: PathBuf,
    pub output: OutputSpec,
}

/// Process server that hands out [`InMemoryProcess`]es.
#[derive(Debug, Default)]
pub struct InMemoryProcessServer {
    processes: Mutex<Vec<Arc<InMemoryProcess>>>,
    starts: Mutex<Vec<StartRequest>>,
    failure: Mutex<Option<String>>,
    ready_after: AtomicU32,
    exit_on_kill: AtomicBool,
}

impl InMemoryProcessServer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every subsequent start fails with `reason`.
    #[must_use]
    pub fn failing(self, reason: impl Into<String>) -> Self {
        *self.failure.lock() = Some(reason.into());
        self
    }

    /// Processes report ready after `polls` readiness checks.
    #[must_use]
    pub fn with_ready_after(self, polls: u32) -> Self {
        self.ready_after.store(polls, Ordering::SeqCst);
        self
    }

    /// Processes exit as soon as they are killed.
    #[must_use]
    pub fn with_exit_on_kill(self) -> Self {
        self.exit_on_kill.store(true, Ordering::SeqCst);
        self
    }

    /// The most recent process started for `deployment`.
    #[must_use]
    pub fn process(&self, deployment: &str) -> Option<Arc<InMemoryProcess>> {
        self.processes
            .lock()
            .iter()
            .rev()
            .find(|p| p.deployment() == deployment)
            .cloned()
    }

    #[must_use]
    pub fn starts(&self) -> Vec<StartRequest> {
        self.starts.lock().clone()
    }
}

impl ProcessServer for InMemoryProcessServer {
    fn start(
        &self,
        deployment: &str,
        working_directory: &Path,
        output: &OutputSpec,
    ) -> DeploymentResult<Arc<dyn ProcessHandle>> {
        self.starts.lock().push(StartRequest {
            deployment: deployment.to_string(),
            working_directory: working_directory.to_path_buf(),
            output: output.clone(),
        });
        if let Some(reason) = self.failure.lock().clone() {
            return Err(DeploymentError::process(reason));
        }

        let process = Arc::new(InMemoryProcess::new(
            deployment,
            NEXT_PID.fetch_add(1, Ordering::SeqCst),
        ));
        process.set_ready_after(self.ready_after.load(Ordering::SeqCst));
        process.set_exit_on_kill(self.exit_on_kill.load(Ordering::SeqCst));
        self.processes.lock().push(Arc::clone(&process));
        Ok(process)
    }
}

/// A call received by an [`InMemoryTask`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    DisconnectFrom {
        source_port: String,
        sink_task: String,
        sink_port: String,
    },
    DisconnectAll {
        port: String,
    },
}

/// A remote task that records port operations.
#[derive(Debug)]
pub struct InMemoryTask {
    name: String,
    ports: Vec<PortDecl>,
    failing: bool,
    calls: Mutex<Vec<RemoteCall>>,
}

impl InMemoryTask {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ports: Vec::new(),
            failing: false,
            calls: Mutex::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_ports(mut self, ports: Vec<PortDecl>) -> Self {
        self.ports = ports;
        self
    }

    /// Every port operation fails after being recorded.
    #[must_use]
    pub const fn failing(mut self) -> Self {
        self.failing = true;
        self
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: RemoteCall) -> DeploymentResult<()> {
        self.calls.lock().push(call);
        if self.failing {
            return Err(DeploymentError::remote_call(&self.name, "connection refused"));
        }
        Ok(())
    }
}

impl RemoteTask for InMemoryTask {
    fn ports(&self) -> DeploymentResult<Vec<PortDecl>> {
        if self.failing {
            return Err(DeploymentError::remote_call(&self.name, "connection refused"));
        }
        Ok(self.ports.clone())
    }

    fn disconnect_from(
        &self,
        source_port: &str,
        sink_task: &str,
        sink_port: &str,
    ) -> DeploymentResult<()> {
        self.record(RemoteCall::DisconnectFrom {
            source_port: source_port.to_string(),
            sink_task: sink_task.to_string(),
            sink_port: sink_port.to_string(),
        })
    }

    fn disconnect_all(&self, port: &str) -> DeploymentResult<()> {
        self.record(RemoteCall::DisconnectAll {
            port: port.to_string(),
        })
    }
}

/// Task discovery over a table of [`InMemoryTask`]s.
#[derive(Debug, Default)]
pub struct InMemoryDiscovery {
    tasks: Mutex<HashMap<String, Arc<InMemoryTask>>>,
    create_missing: bool,
    lookups: AtomicU32,
}

impl InMemoryDiscovery {
    /// Discovery that only knows registered tasks.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Discovery that creates a port-less task for any unknown name.
    #[must_use]
    pub fn permissive() -> Self {
        Self {
            create_missing: true,
            ..Self::default()
        }
    }

    pub fn register(&self, task: Arc<InMemoryTask>) {
        self.tasks.lock().insert(task.name().to_string(), task);
    }

    #[must_use]
    pub fn task(&self, name: &str) -> Option<Arc<InMemoryTask>> {
        self.tasks.lock().get(name).cloned()
    }

    #[must_use]
    pub fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl TaskDiscovery for InMemoryDiscovery {
    fn lookup(&self, qualified_name: &str) -> DeploymentResult<Arc<dyn RemoteTask>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get(qualified_name) {
            return Ok(Arc::clone(task) as Arc<dyn RemoteTask>);
        }
        if !self.create_missing {
            return Err(DeploymentError::discovery_failed(qualified_name));
        }
        let task = Arc::new(InMemoryTask::new(qualified_name));
        tasks.insert(qualified_name.to_string(), Arc::clone(&task));
        Ok(task)
    }
}
