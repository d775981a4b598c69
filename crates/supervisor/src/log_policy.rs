//! Port logging policy.
//!
//! Consulted once per output port when a deployment becomes ready. Ports are
//! not logged unless a policy says so.

use std::collections::HashSet;

use crate::model::{PortDecl, TaskModel};

/// Decides which ports of a ready deployment get logged.
pub trait LogPolicy: Send + Sync {
    /// Skip logging for the whole deployment.
    fn deployment_excluded(&self, _deployment: &str) -> bool {
        false
    }

    /// Whether `task:port` should be logged.
    fn should_log(&self, deployment: &str, model: &TaskModel, task: &str, port: &PortDecl) -> bool;
}

/// Never logs anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoLogging;

impl LogPolicy for NoLogging {
    fn deployment_excluded(&self, _deployment: &str) -> bool {
        true
    }

    fn should_log(&self, _: &str, _: &TaskModel, _: &str, _: &PortDecl) -> bool {
        false
    }
}

/// `owner:port` pattern where either side may be `*`. The owner matches a
/// task name or a task model name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortPattern {
    owner: Option<String>,
    port: Option<String>,
}

impl PortPattern {
    /// Parse `owner:port`; a pattern without `:` names a port on any task.
    #[must_use]
    pub fn parse(pattern: &str) -> Self {
        let wildcard = |s: &str| (s != "*").then(|| s.to_string());
        match pattern.rsplit_once(':') {
            Some((owner, port)) => Self {
                owner: wildcard(owner),
                port: wildcard(port),
            },
            None => Self {
                owner: None,
                port: wildcard(pattern),
            },
        }
    }

    #[must_use]
    pub fn matches(&self, model: &TaskModel, task: &str, port: &str) -> bool {
        let owner_ok = self
            .owner
            .as_deref()
            .is_none_or(|owner| owner == task || owner == model.name());
        let port_ok = self.port.as_deref().is_none_or(|p| p == port);
        owner_ok && port_ok
    }
}

/// Logs every port except the excluded ones.
#[derive(Debug, Clone, Default)]
pub struct ExclusionPolicy {
    excluded_deployments: HashSet<String>,
    excluded_ports: Vec<PortPattern>,
}

impl ExclusionPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn exclude_deployment(mut self, deployment: impl Into<String>) -> Self {
        self.excluded_deployments.insert(deployment.into());
        self
    }

    #[must_use]
    pub fn exclude_port(mut self, pattern: &str) -> Self {
        self.excluded_ports.push(PortPattern::parse(pattern));
        self
    }
}

impl LogPolicy for ExclusionPolicy {
    fn deployment_excluded(&self, deployment: &str) -> bool {
        self.excluded_deployments.contains(deployment)
    }

    fn should_log(&self, _deployment: &str, model: &TaskModel, task: &str, port: &PortDecl) -> bool {
        !self
            .excluded_ports
            .iter()
            .any(|pattern| pattern.matches(model, task, &port.name))
    }
}
