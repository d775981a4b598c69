//! # Data flow
//!
//! Required and actual connection graphs between task ports.
//!
//! The required graph is configuration: it names tasks, survives process
//! restarts and is never touched by teardown. The actual graph holds live
//! task handles and only contains the connections believed to exist right
//! now. Both graphs are bookkeeping; issuing connect calls on the wire is
//! left to the caller.

mod graph;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

pub use graph::{ConnectionGraph, Endpoint};

use crate::task::TaskHandle;

/// Delivery policy of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionPolicy {
    /// The sink pulls samples, so the connection has to be torn down
    /// explicitly from the source side.
    #[serde(default)]
    pub pull: bool,
    /// Buffer length; zero means a single data slot.
    #[serde(default)]
    pub buffer_size: usize,
}

impl ConnectionPolicy {
    /// Push-based data connection.
    #[must_use]
    pub const fn data() -> Self {
        Self {
            pull: false,
            buffer_size: 0,
        }
    }

    /// Pull-based data connection.
    #[must_use]
    pub const fn pull() -> Self {
        Self {
            pull: true,
            buffer_size: 0,
        }
    }

    #[must_use]
    pub const fn with_buffer(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }
}

/// The port pair carried by a graph edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMapping {
    pub source_port: String,
    pub sink_port: String,
    pub policy: ConnectionPolicy,
}

impl PortMapping {
    #[must_use]
    pub fn new(
        source_port: impl Into<String>,
        sink_port: impl Into<String>,
        policy: ConnectionPolicy,
    ) -> Self {
        Self {
            source_port: source_port.into(),
            sink_port: sink_port.into(),
            policy,
        }
    }
}

/// A fully named connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub source_task: String,
    pub source_port: String,
    pub sink_task: String,
    pub sink_port: String,
    pub policy: ConnectionPolicy,
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.source_task, self.source_port, self.sink_task, self.sink_port
        )
    }
}

/// Required and actual connection graphs.
#[derive(Debug, Default)]
pub struct DataFlow {
    required: ConnectionGraph<String>,
    actual: ConnectionGraph<TaskHandle>,
}

/// Data flow shared between every supervisor of a process.
pub type SharedDataFlow = Arc<Mutex<DataFlow>>;

impl DataFlow {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn shared() -> SharedDataFlow {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Declare a connection the system should maintain.
    pub fn require(
        &mut self,
        source_task: &str,
        source_port: &str,
        sink_task: &str,
        sink_port: &str,
        policy: ConnectionPolicy,
    ) -> bool {
        self.required.add(
            source_task.to_string(),
            sink_task.to_string(),
            PortMapping::new(source_port, sink_port, policy),
        )
    }

    /// Record a connection that was established at runtime.
    pub fn connect(
        &mut self,
        source: &TaskHandle,
        source_port: &str,
        sink: &TaskHandle,
        sink_port: &str,
        policy: ConnectionPolicy,
    ) -> bool {
        self.actual.add(
            source.clone(),
            sink.clone(),
            PortMapping::new(source_port, sink_port, policy),
        )
    }

    /// Record an explicit disconnection.
    pub fn disconnect(
        &mut self,
        source_task: &str,
        source_port: &str,
        sink_task: &str,
        sink_port: &str,
    ) -> Option<ConnectionPolicy> {
        self.actual
            .remove(source_task, source_port, sink_task, sink_port)
    }

    #[must_use]
    pub const fn required(&self) -> &ConnectionGraph<String> {
        &self.required
    }

    #[must_use]
    pub const fn actual(&self) -> &ConnectionGraph<TaskHandle> {
        &self.actual
    }

    pub(crate) fn actual_mut(&mut self) -> &mut ConnectionGraph<TaskHandle> {
        &mut self.actual
    }

    /// Required connections that are not currently live, e.g. because one
    /// side was reaped and its replacement is not wired yet.
    #[must_use]
    pub fn missing_connections(&self) -> Vec<Connection> {
        self.required
            .edges()
            .filter(|(source, sink, mapping)| {
                !self.actual.has_connection(
                    source,
                    &mapping.source_port,
                    sink,
                    &mapping.sink_port,
                )
            })
            .map(|(source, sink, mapping)| Connection {
                source_task: source.clone(),
                source_port: mapping.source_port.clone(),
                sink_task: sink.clone(),
                sink_port: mapping.sink_port.clone(),
                policy: mapping.policy,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryTask;

    fn handle(name: &str) -> TaskHandle {
        TaskHandle::detached(name, Arc::new(InMemoryTask::new(name)))
    }

    #[test]
    fn should_report_required_connections_missing_from_actual() {
        let mut flow = DataFlow::new();
        flow.require("camB", "frame_out", "camA", "frame_in", ConnectionPolicy::pull());
        flow.require("camA", "status", "monitor", "in", ConnectionPolicy::data());

        flow.connect(
            &handle("camB"),
            "frame_out",
            &handle("camA"),
            "frame_in",
            ConnectionPolicy::pull(),
        );

        let missing = flow.missing_connections();
        assert_eq!(missing.len(), 1);
        assert_eq!(
            missing.first().map(ToString::to_string).as_deref(),
            Some("camA:status -> monitor:in")
        );
    }

    #[test]
    fn should_remove_connection_on_disconnect() {
        let mut flow = DataFlow::new();
        flow.connect(
            &handle("a"),
            "out",
            &handle("b"),
            "in",
            ConnectionPolicy::data().with_buffer(10),
        );

        let policy = flow.disconnect("a", "out", "b", "in");
        assert_eq!(policy.map(|p| p.buffer_size), Some(10));
        assert!(flow.actual().is_empty());
    }
}
