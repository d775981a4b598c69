//! # Deployment
//!
//! Lifecycle of one deployment process: spawning, readiness, stop requests
//! and termination handling.

mod events;
mod state;
mod supervisor;

pub use events::{DeploymentEvent, Termination};
pub use state::DeploymentState;
pub use supervisor::{DeploymentArguments, DeploymentSupervisor, PollOutcome};
