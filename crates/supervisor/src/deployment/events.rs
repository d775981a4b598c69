//! Lifecycle notifications emitted by a deployment supervisor.

use std::fmt;

use crate::process::{ProcessExit, ProcessId};

/// How a deployment ended, as reported to whoever depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Succeeded,
    Failed { exit: Option<ProcessExit> },
    Signaled { signal: i32 },
}

impl Termination {
    /// Classify a process exit observation.
    ///
    /// Missing exit information counts as a failure.
    #[must_use]
    pub fn classify(exit: Option<ProcessExit>) -> Self {
        match exit {
            None => Self::Failed { exit: None },
            Some(status) if status.success() => Self::Succeeded,
            Some(ProcessExit::Signaled { signal }) => Self::Signaled { signal },
            Some(status) => Self::Failed { exit: Some(status) },
        }
    }

    /// Signaled terminations are failures too.
    #[must_use]
    pub const fn is_failure(&self) -> bool {
        !matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => f.write_str("succeeded"),
            Self::Failed { exit: None } => f.write_str("failed"),
            Self::Failed { exit: Some(exit) } => write!(f, "failed ({exit})"),
            Self::Signaled { signal } => write!(f, "signaled ({signal})"),
        }
    }
}

/// State transition notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentEvent {
    Started {
        deployment: String,
        machine: String,
        process: ProcessId,
    },
    Ready {
        deployment: String,
    },
    Stopping {
        deployment: String,
    },
    Terminated {
        deployment: String,
        termination: Termination,
        /// The deployment had been asked to stop.
        requested: bool,
    },
}

impl DeploymentEvent {
    #[must_use]
    pub fn deployment(&self) -> &str {
        match self {
            Self::Started { deployment, .. }
            | Self::Ready { deployment }
            | Self::Stopping { deployment }
            | Self::Terminated { deployment, .. } => deployment,
        }
    }
}
