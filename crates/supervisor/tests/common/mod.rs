// Common test infrastructure for supervisor tests
#![allow(dead_code)]

use std::sync::Arc;

use supervisor::memory::{InMemoryDiscovery, InMemoryProcess, InMemoryProcessServer, InMemoryTask};
use supervisor::process::LOCALHOST;
use supervisor::{
    DeploymentContext, DeploymentSpec, DeploymentSupervisor, LogPolicy, NoLogging, PortDecl,
    TaskActivity, TaskModel,
};

/// Route tracing output to the test harness; `RUST_LOG` picks the level.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Unwrap an Option or panic with context
pub fn unwrap_option<T>(option: Option<T>, context: &str) -> T {
    match option {
        Some(value) => value,
        None => panic!("{}", context),
    }
}

/// Unwrap a Result or panic with context
pub fn unwrap_result<T, E: std::fmt::Display>(result: Result<T, E>, context: &str) -> T {
    match result {
        Ok(value) => value,
        Err(e) => panic!("{}: {}", context, e),
    }
}

/// A process server, a discovery table and the context shared by every
/// supervisor of one test.
pub struct Fleet {
    pub server: Arc<InMemoryProcessServer>,
    pub discovery: Arc<InMemoryDiscovery>,
    pub context: Arc<DeploymentContext>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::with(InMemoryProcessServer::new(), Arc::new(NoLogging))
    }

    pub fn with(server: InMemoryProcessServer, log_policy: Arc<dyn LogPolicy>) -> Self {
        init_tracing();
        let server = Arc::new(server);
        let discovery = Arc::new(InMemoryDiscovery::new());
        let context = DeploymentContext::new(discovery.clone())
            .with_process_server(LOCALHOST, server.clone(), "/tmp/fleet-test")
            .with_log_policy(log_policy);
        Self {
            server,
            discovery,
            context: Arc::new(context),
        }
    }

    /// Make `name` discoverable with the given ports.
    pub fn task(&self, name: &str, ports: Vec<PortDecl>) -> Arc<InMemoryTask> {
        let task = Arc::new(InMemoryTask::new(name).with_ports(ports));
        self.discovery.register(task.clone());
        task
    }

    /// Make a discoverable task whose port operations all fail.
    pub fn failing_task(&self, name: &str) -> Arc<InMemoryTask> {
        let task = Arc::new(InMemoryTask::new(name).failing());
        self.discovery.register(task.clone());
        task
    }

    /// A supervisor for `deployment` hosting `tasks`, all of model
    /// `<deployment>::Task`.
    pub fn supervisor(&self, deployment: &str, tasks: &[&str]) -> DeploymentSupervisor {
        let model = Arc::new(TaskModel::new(format!("{deployment}::Task")));
        let spec = tasks.iter().fold(DeploymentSpec::new(deployment), |spec, task| {
            spec.with_activity(TaskActivity::new(*task, Arc::clone(&model)))
        });
        DeploymentSupervisor::new(Arc::new(spec), Arc::clone(&self.context))
    }

    /// The process most recently started for `deployment`.
    pub fn process(&self, deployment: &str) -> Arc<InMemoryProcess> {
        unwrap_option(
            self.server.process(deployment),
            "deployment should have been started",
        )
    }
}

/// Start `supervisor` and poll it until it is ready.
pub fn start_ready(supervisor: &mut DeploymentSupervisor) {
    unwrap_result(supervisor.start(), "start should succeed");
    for _ in 0..10 {
        unwrap_result(supervisor.poll(), "poll should succeed");
        if supervisor.is_ready() {
            return;
        }
    }
    panic!("{} never became ready", supervisor.name());
}
