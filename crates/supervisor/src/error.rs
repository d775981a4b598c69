//! Deployment error types.
//!
//! Only configuration and spawn errors are expected to reach the caller of a
//! lifecycle operation. Teardown failures are logged by the reaper and never
//! surface here.

use thiserror::Error;

/// Errors returned by deployment supervision.
#[derive(Debug, Clone, Error)]
pub enum DeploymentError {
    /// The requested task is not part of the deployment.
    #[error("no task called {task} in {deployment}")]
    TaskNotFound { task: String, deployment: String },

    /// No process server is known for the requested machine.
    #[error("no process server registered for host '{host}'")]
    UnknownProcessServer { host: String },

    /// The process server could not start the deployment.
    #[error("failed to start deployment {deployment} on {host}: {reason}")]
    SpawnFailed {
        deployment: String,
        host: String,
        reason: String,
    },

    /// A lifecycle command was issued in a state that does not accept it.
    #[error("cannot {action} deployment {deployment} while {state}")]
    InvalidStateTransition {
        deployment: String,
        action: String,
        state: String,
    },

    /// A task activity references a model that was never registered.
    #[error("unknown task model: {0}")]
    UnknownTaskModel(String),

    /// Task discovery could not resolve a running task.
    #[error("task context '{0}' not found")]
    DiscoveryFailed(String),

    /// A call on a remote task failed.
    #[error("remote call on {task} failed: {reason}")]
    RemoteCall { task: String, reason: String },

    /// The process handle reported an error.
    #[error("process error: {0}")]
    Process(String),

    /// The process server cannot perform the operation.
    #[error("{operation} is not supported by {backend}")]
    Unsupported { operation: String, backend: String },

    /// Configuration or I/O failure from the core layer.
    #[error("{0}")]
    Core(String),
}

impl DeploymentError {
    /// Create a task not found error.
    pub fn task_not_found(task: impl Into<String>, deployment: impl Into<String>) -> Self {
        Self::TaskNotFound {
            task: task.into(),
            deployment: deployment.into(),
        }
    }

    /// Create an unknown process server error.
    pub fn unknown_process_server(host: impl Into<String>) -> Self {
        Self::UnknownProcessServer { host: host.into() }
    }

    /// Create a spawn failure error.
    pub fn spawn_failed(
        deployment: impl Into<String>,
        host: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SpawnFailed {
            deployment: deployment.into(),
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create an invalid state transition error.
    pub fn invalid_state_transition(
        deployment: impl Into<String>,
        action: impl Into<String>,
        state: impl std::fmt::Display,
    ) -> Self {
        Self::InvalidStateTransition {
            deployment: deployment.into(),
            action: action.into(),
            state: state.to_string(),
        }
    }

    /// Create an unknown task model error.
    pub fn unknown_task_model(model: impl Into<String>) -> Self {
        Self::UnknownTaskModel(model.into())
    }

    /// Create a discovery failure error.
    pub fn discovery_failed(name: impl Into<String>) -> Self {
        Self::DiscoveryFailed(name.into())
    }

    /// Create a remote call error.
    pub fn remote_call(task: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::RemoteCall {
            task: task.into(),
            reason: reason.into(),
        }
    }

    /// Create a process error.
    pub fn process(msg: impl Into<String>) -> Self {
        Self::Process(msg.into())
    }

    /// Create an unsupported operation error.
    pub fn unsupported(operation: impl Into<String>, backend: impl Into<String>) -> Self {
        Self::Unsupported {
            operation: operation.into(),
            backend: backend.into(),
        }
    }

    /// Whether this error should abort the caller's operation rather than
    /// being logged and skipped.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::RemoteCall { .. } | Self::DiscoveryFailed(_) | Self::Unsupported { .. }
        )
    }
}

impl From<fleet_core::Error> for DeploymentError {
    fn from(e: fleet_core::Error) -> Self {
        Self::Core(e.to_string())
    }
}

/// Result type for deployment operations.
pub type DeploymentResult<T> = std::result::Result<T, DeploymentError>;
