//! Deployment lifecycle states.

use std::fmt;

/// Lifecycle state of a deployment.
///
/// Transitions only move forward:
/// `Created -> Starting -> Ready -> (Stopping ->) Dead`. A deployment that is
/// stopped before it became ready goes `Starting -> Stopping`, and any state
/// can jump to `Dead` when the process exit is observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DeploymentState {
    #[default]
    Created,
    Starting,
    Ready,
    Stopping,
    Dead,
}

impl DeploymentState {
    /// Stopping or dead: peers must not expect cooperation anymore.
    #[must_use]
    pub const fn is_finishing(self) -> bool {
        matches!(self, Self::Stopping | Self::Dead)
    }

    /// A live process is expected in this state.
    #[must_use]
    pub const fn has_process(self) -> bool {
        matches!(self, Self::Starting | Self::Ready | Self::Stopping)
    }

    /// Stable string identifier.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Stopping => "stopping",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
