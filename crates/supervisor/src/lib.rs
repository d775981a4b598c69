//! # Supervisor
//!
//! Supervision of deployment processes and of the task components they
//! host.
//!
//! A [`DeploymentSupervisor`] drives one deployment through
//! `Created -> Starting -> Ready -> Stopping -> Dead`. When the process
//! exits, its task handles are invalidated and the [`DeadConnectionReaper`]
//! tears down every actual connection that still points at one of its tasks,
//! asking surviving peers to drop their end. A [`PollLoop`] steps many
//! supervisors cooperatively.

#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![forbid(clippy::panic)]
#![deny(clippy::expect_used)]

pub mod config;
pub mod context;
pub mod dataflow;
pub mod deployment;
pub mod error;
pub mod executor;
#[cfg(unix)]
pub mod local;
pub mod log_policy;
pub mod memory;
pub mod model;
pub mod process;
pub mod reaper;
pub mod registry;
pub mod task;

pub use config::SupervisorConfig;
pub use context::DeploymentContext;
pub use dataflow::{Connection, ConnectionGraph, ConnectionPolicy, DataFlow, PortMapping, SharedDataFlow};
pub use deployment::{
    DeploymentArguments, DeploymentEvent, DeploymentState, DeploymentSupervisor, PollOutcome,
    Termination,
};
pub use error::{DeploymentError, DeploymentResult};
pub use executor::{KILL_TIMEOUT, MIN_POLL_INTERVAL, PollLoop, StepReport};
#[cfg(unix)]
pub use local::{LocalProcess, LocalProcessServer};
pub use log_policy::{ExclusionPolicy, LogPolicy, NoLogging, PortPattern};
pub use model::{DeploymentSpec, PortDecl, PortDirection, TaskActivity, TaskModel, TaskModelRegistry};
pub use process::{OutputSpec, ProcessExit, ProcessHandle, ProcessId, ProcessServer, ProcessServers};
pub use reaper::{DeadConnectionReaper, DisconnectAction, ReapReport};
pub use registry::{DeploymentRecord, DeploymentRegistry};
pub use task::{ConfiguredTasks, RemoteTask, TaskBinding, TaskDiscovery, TaskHandle, TaskHandleRegistry};
