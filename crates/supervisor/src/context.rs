//! Services shared by every supervisor of a process.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use crate::dataflow::{DataFlow, SharedDataFlow};
use crate::log_policy::{LogPolicy, NoLogging};
use crate::process::{OutputSpec, ProcessServer, ProcessServers};
use crate::registry::DeploymentRegistry;
use crate::task::{ConfiguredTasks, TaskDiscovery};

/// Collaborators injected into deployment supervisors.
#[derive(Clone)]
pub struct DeploymentContext {
    pub process_servers: ProcessServers,
    pub registry: Arc<DeploymentRegistry>,
    pub dataflow: SharedDataFlow,
    pub discovery: Arc<dyn TaskDiscovery>,
    pub log_policy: Arc<dyn LogPolicy>,
    pub configured: Arc<ConfiguredTasks>,
    pub output: OutputSpec,
}

impl DeploymentContext {
    /// A context with fresh registry and data flow, no process server and
    /// no port logging.
    #[must_use]
    pub fn new(discovery: Arc<dyn TaskDiscovery>) -> Self {
        Self {
            process_servers: ProcessServers::new(),
            registry: Arc::new(DeploymentRegistry::new()),
            dataflow: DataFlow::shared(),
            discovery,
            log_policy: Arc::new(NoLogging),
            configured: Arc::new(ConfiguredTasks::new()),
            output: OutputSpec::default(),
        }
    }

    #[must_use]
    pub fn with_process_server(
        mut self,
        host: impl Into<String>,
        server: Arc<dyn ProcessServer>,
        log_dir: impl Into<PathBuf>,
    ) -> Self {
        self.process_servers = self.process_servers.with_server(host, server, log_dir);
        self
    }

    #[must_use]
    pub fn with_log_policy(mut self, policy: Arc<dyn LogPolicy>) -> Self {
        self.log_policy = policy;
        self
    }

    #[must_use]
    pub fn with_registry(mut self, registry: Arc<DeploymentRegistry>) -> Self {
        self.registry = registry;
        self
    }

    #[must_use]
    pub fn with_dataflow(mut self, dataflow: SharedDataFlow) -> Self {
        self.dataflow = dataflow;
        self
    }

    #[must_use]
    pub fn with_output(mut self, output: OutputSpec) -> Self {
        self.output = output;
        self
    }
}

impl fmt::Debug for DeploymentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeploymentContext")
            .field("process_servers", &self.process_servers)
            .field("registry", &self.registry)
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}
