//! Cooperative poll loop driving a set of deployment supervisors.
//!
//! Every tick polls each supervisor once. A supervisor whose poll fails is
//! logged and retried on the next tick; it never keeps its siblings from
//! being polled.

use std::sync::Arc;
use std::time::Duration;

use fleet_core::ResultExt;
use tokio::sync::watch;
use tokio::time::{Interval, MissedTickBehavior, timeout};
use tracing::{debug, error, info, warn};

use crate::config::SupervisorConfig;
use crate::context::DeploymentContext;
use crate::deployment::{DeploymentState, DeploymentSupervisor, PollOutcome, Termination};
use crate::error::{DeploymentError, DeploymentResult};

/// What one tick observed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepReport {
    /// Deployments that became ready.
    pub ready: Vec<String>,
    /// Deployments whose exit was observed.
    pub died: Vec<(String, Termination)>,
    /// Supervisors whose poll failed.
    pub errors: usize,
}

impl StepReport {
    #[must_use]
    pub fn is_quiet(&self) -> bool {
        self.ready.is_empty() && self.died.is_empty() && self.errors == 0
    }
}

/// Shortest tick the loop accepts.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// How long `run` waits for exits after force-killing.
pub const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Drives supervisors until they are all dead or shutdown is requested.
#[derive(Debug)]
pub struct PollLoop {
    interval: Duration,
    kill_timeout: Duration,
    supervisors: Vec<DeploymentSupervisor>,
}

impl PollLoop {
    /// Intervals below [`MIN_POLL_INTERVAL`] are raised to it.
    #[must_use]
    pub fn new(interval: Duration) -> Self {
        Self {
            interval: interval.max(MIN_POLL_INTERVAL),
            kill_timeout: KILL_TIMEOUT,
            supervisors: Vec::new(),
        }
    }

    #[must_use]
    pub const fn with_kill_timeout(mut self, kill_timeout: Duration) -> Self {
        self.kill_timeout = kill_timeout;
        self
    }

    /// One supervisor per configured deployment, sharing `context`.
    ///
    /// The configured log policy replaces the one of `context`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTaskModel` if a deployment cannot be resolved.
    pub fn from_config(config: &SupervisorConfig, context: DeploymentContext) -> DeploymentResult<Self> {
        let context = Arc::new(context.with_log_policy(config.log_policy()));
        let supervisors = config
            .deployment_specs()?
            .into_iter()
            .map(|(spec, arguments)| {
                DeploymentSupervisor::new(Arc::new(spec), Arc::clone(&context))
                    .with_arguments(arguments)
            })
            .collect();
        let mut poll_loop = Self::new(config.poll_interval());
        poll_loop.supervisors = supervisors;
        Ok(poll_loop)
    }

    pub fn add(&mut self, supervisor: DeploymentSupervisor) {
        self.supervisors.push(supervisor);
    }

    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    #[must_use]
    pub fn supervisors(&self) -> &[DeploymentSupervisor] {
        &self.supervisors
    }

    #[must_use]
    pub fn supervisor(&self, name: &str) -> Option<&DeploymentSupervisor> {
        self.supervisors.iter().find(|s| s.name() == name)
    }

    pub fn supervisor_mut(&mut self, name: &str) -> Option<&mut DeploymentSupervisor> {
        self.supervisors.iter_mut().find(|s| s.name() == name)
    }

    /// Start every supervisor that was not started yet. Returns the
    /// deployments that failed to start.
    pub fn start_all(&mut self) -> Vec<(String, DeploymentError)> {
        self.supervisors
            .iter_mut()
            .filter(|s| s.state() == DeploymentState::Created)
            .filter_map(|s| {
                s.start()
                    .inspect_error(|e| error!(deployment = %s.name(), error = %e, "failed to start deployment"))
                    .err()
                    .map(|e| (s.name().to_string(), e))
            })
            .collect()
    }

    /// Poll every supervisor once.
    pub fn step(&mut self) -> StepReport {
        let mut report = StepReport::default();
        for supervisor in &mut self.supervisors {
            let outcome = supervisor.poll().inspect_error(|e| {
                if e.is_fatal() {
                    error!(deployment = %supervisor.name(), error = %e, "poll step failed");
                } else {
                    warn!(deployment = %supervisor.name(), error = %e, "poll step failed, retrying");
                }
            });
            match outcome {
                Ok(PollOutcome::BecameReady) => report.ready.push(supervisor.name().to_string()),
                Ok(PollOutcome::Died(termination)) => report
                    .died
                    .push((supervisor.name().to_string(), termination)),
                Ok(PollOutcome::Idle | PollOutcome::Pending) => {}
                Err(_) => report.errors = report.errors.saturating_add(1),
            }
        }
        if !report.is_quiet() {
            debug!(
                ready = report.ready.len(),
                died = report.died.len(),
                errors = report.errors,
                "poll step"
            );
        }
        report
    }

    /// Ask every running deployment to stop.
    pub fn stop_all(&mut self) {
        for supervisor in &mut self.supervisors {
            if supervisor.state() == DeploymentState::Created {
                continue;
            }
            if let Err(e) = supervisor.stop() {
                warn!(deployment = %supervisor.name(), error = %e, "failed to stop deployment");
            }
        }
    }

    /// Force-kill every deployment process whose exit was not observed yet.
    pub fn kill_all(&self) {
        for supervisor in &self.supervisors {
            if !supervisor.state().has_process() {
                continue;
            }
            if let Some(process) = supervisor.process().filter(|p| p.is_running()) {
                if let Err(e) = process.kill(true) {
                    warn!(deployment = %supervisor.name(), error = %e, "failed to kill deployment");
                }
            }
        }
    }

    /// True when no supervised process is left running.
    #[must_use]
    pub fn all_dead(&self) -> bool {
        self.supervisors.iter().all(|s| !s.state().has_process())
    }

    /// Poll on every tick until `shutdown` turns true, then stop every
    /// deployment and wait for the exits. Processes still running after
    /// `grace` are killed, and the loop gives up on them once the kill
    /// timeout expires.
    ///
    /// Returns the deployments whose exit was never observed.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>, grace: Duration) -> Vec<String> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(deployments = self.supervisors.len(), "poll loop started");
        while !*shutdown.borrow() {
            tokio::select! {
                _ = ticker.tick() => {
                    self.step();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        debug!("shutdown sender dropped");
                        break;
                    }
                }
            }
        }

        info!("shutdown requested, stopping deployments");
        self.stop_all();

        if timeout(grace, self.wait_for_exits(&mut ticker)).await.is_err() {
            warn!(grace_ms = grace.as_millis(), "deployments still running after grace period, killing");
            self.kill_all();
            if timeout(self.kill_timeout, self.wait_for_exits(&mut ticker)).await.is_err() {
                error!(
                    timeout_ms = self.kill_timeout.as_millis(),
                    "deployments survived the kill, giving up"
                );
            }
        }

        let survivors = self.running();
        if survivors.is_empty() {
            info!("poll loop finished");
        } else {
            warn!(survivors = ?survivors, "poll loop finished with deployments still running");
        }
        survivors
    }

    /// Names of the deployments whose process is still considered running.
    #[must_use]
    pub fn running(&self) -> Vec<String> {
        self.supervisors
            .iter()
            .filter(|s| s.state().has_process())
            .map(|s| s.name().to_string())
            .collect()
    }

    async fn wait_for_exits(&mut self, ticker: &mut Interval) {
        while !self.all_dead() {
            ticker.tick().await;
            self.step();
        }
    }
}
