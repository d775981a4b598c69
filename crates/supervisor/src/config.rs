//! Supervisor configuration loaded from TOML.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::deployment::DeploymentArguments;
use crate::error::DeploymentResult;
use crate::log_policy::{ExclusionPolicy, LogPolicy, NoLogging};
use crate::model::{DeploymentSpec, PortDecl, TaskModel, TaskModelRegistry};
use crate::process::{ProcessServer, ProcessServers};

/// Top-level supervisor configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Delay between two poll steps, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Port logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Machines deployments can be started on.
    #[serde(default)]
    pub process_servers: Vec<ProcessServerConfig>,

    /// Task models available to deployments.
    #[serde(default)]
    pub task_models: Vec<TaskModelConfig>,

    /// Deployments to supervise.
    #[serde(default)]
    pub deployments: Vec<DeploymentConfig>,
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log output ports of ready deployments.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Deployments whose ports are never logged.
    #[serde(default)]
    pub exclude_deployments: Vec<String>,

    /// `task:port` patterns, `*` allowed on either side.
    #[serde(default)]
    pub exclude_ports: Vec<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            exclude_deployments: Vec::new(),
            exclude_ports: Vec::new(),
        }
    }
}

/// `[[process_servers]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessServerConfig {
    pub host: String,
    pub log_dir: PathBuf,
}

/// `[[task_models]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskModelConfig {
    pub name: String,
    #[serde(default)]
    pub ports: Vec<PortDecl>,
}

/// `[[deployments]]` entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentConfig {
    pub name: String,

    /// Machine to run on; `localhost` when absent.
    #[serde(default)]
    pub on: Option<String>,

    /// Per-deployment switch for port logging.
    #[serde(default = "default_true")]
    pub log: bool,

    #[serde(default)]
    pub tasks: Vec<TaskConfig>,
}

/// A task hosted by a configured deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub model: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            logging: LoggingConfig::default(),
            process_servers: Vec::new(),
            task_models: Vec::new(),
            deployments: Vec::new(),
        }
    }
}

impl SupervisorConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `TomlParseFailed` on malformed input and `InvalidConfig` if
    /// validation fails.
    pub fn from_toml_str(input: &str) -> fleet_core::Result<Self> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a configuration file.
    ///
    /// # Errors
    ///
    /// Returns `FileReadFailed` if the file cannot be read, otherwise the
    /// errors of [`from_toml_str`].
    ///
    /// [`from_toml_str`]: SupervisorConfig::from_toml_str
    pub fn load(path: &Path) -> fleet_core::Result<Self> {
        let input = std::fs::read_to_string(path)
            .map_err(|e| fleet_core::Error::file_read_failed(path, e.to_string()))?;
        Self::from_toml_str(&input)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` naming the first problem found.
    pub fn validate(&self) -> fleet_core::Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(fleet_core::Error::invalid_config(
                "poll_interval_ms must be greater than 0",
            ));
        }

        let mut hosts = HashSet::new();
        if let Some(server) = self
            .process_servers
            .iter()
            .find(|s| !hosts.insert(s.host.as_str()))
        {
            return Err(fleet_core::Error::invalid_config(format!(
                "process server {} is declared twice",
                server.host
            )));
        }

        let models: HashSet<&str> = self.task_models.iter().map(|m| m.name.as_str()).collect();
        let mut deployments = HashSet::new();
        let mut tasks = HashSet::new();
        for deployment in &self.deployments {
            if !deployments.insert(deployment.name.as_str()) {
                return Err(fleet_core::Error::invalid_config(format!(
                    "deployment {} is declared twice",
                    deployment.name
                )));
            }
            for task in &deployment.tasks {
                if !tasks.insert(task.name.as_str()) {
                    return Err(fleet_core::Error::invalid_config(format!(
                        "task {} is declared by more than one deployment",
                        task.name
                    )));
                }
                if !models.contains(task.model.as_str()) {
                    return Err(fleet_core::Error::invalid_config(format!(
                        "task {} of deployment {} uses unknown model {}",
                        task.name, deployment.name, task.model
                    )));
                }
            }
        }

        Ok(())
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Register every configured task model.
    #[must_use]
    pub fn task_models(&self) -> TaskModelRegistry {
        self.task_models
            .iter()
            .fold(TaskModelRegistry::new(), |mut registry, model| {
                let task_model = model
                    .ports
                    .iter()
                    .cloned()
                    .fold(TaskModel::new(&model.name), TaskModel::with_port);
                registry.register(task_model);
                registry
            })
    }

    /// Resolve every configured deployment against the task models.
    ///
    /// # Errors
    ///
    /// Returns `UnknownTaskModel` if a deployment uses a model that is not
    /// declared.
    pub fn deployment_specs(&self) -> DeploymentResult<Vec<(DeploymentSpec, DeploymentArguments)>> {
        let models = self.task_models();
        self.deployments
            .iter()
            .map(|deployment| {
                let spec = DeploymentSpec::resolve(
                    &deployment.name,
                    deployment
                        .tasks
                        .iter()
                        .map(|t| (t.name.as_str(), t.model.as_str())),
                    &models,
                )?;
                let arguments = DeploymentArguments {
                    on: deployment.on.clone(),
                    log: deployment.log,
                };
                Ok((spec, arguments))
            })
            .collect()
    }

    /// The port logging policy described by `[logging]`.
    #[must_use]
    pub fn log_policy(&self) -> Arc<dyn LogPolicy> {
        if !self.logging.enabled {
            return Arc::new(NoLogging);
        }
        let policy = self
            .logging
            .exclude_deployments
            .iter()
            .fold(ExclusionPolicy::new(), |policy, d| {
                policy.exclude_deployment(d.clone())
            });
        Arc::new(
            self.logging
                .exclude_ports
                .iter()
                .fold(policy, |policy, p| policy.exclude_port(p)),
        )
    }

    /// Build the process server table, asking `make_server` for the server
    /// of each configured host.
    pub fn process_servers<F>(&self, mut make_server: F) -> ProcessServers
    where
        F: FnMut(&ProcessServerConfig) -> Arc<dyn ProcessServer>,
    {
        self.process_servers
            .iter()
            .fold(ProcessServers::new(), |servers, entry| {
                let server = make_server(entry);
                servers.with_server(&entry.host, server, &entry.log_dir)
            })
    }
}

const fn default_poll_interval_ms() -> u64 {
    100
}

const fn default_true() -> bool {
    true
}
