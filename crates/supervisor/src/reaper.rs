//! Dead connection reaping.
//!
//! When a deployment dies, every actual connection touching one of its tasks
//! is stale. The reaper asks the surviving side of each connection to drop
//! it, then forgets the dead tasks.
//!
//! # Contract
//!
//! Reaping is best effort. A peer is only asked to disconnect when it is
//! alive: registered and neither stopping nor dead. A disconnect
//! call that fails is logged as a warning and treated as done, since the
//! peer most likely went down at the same time. Whatever the outcome, the
//! dead task and all its edges leave the actual graph, so running the reaper
//! again on the same tasks does nothing. The required graph is never
//! modified.

use std::collections::HashSet;
use std::fmt;

use tracing::{debug, warn};

use crate::dataflow::{PortMapping, SharedDataFlow};
use crate::registry::DeploymentRegistry;
use crate::task::TaskHandle;

/// A disconnect call issued on a surviving peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectAction {
    /// `source:source_port` was disconnected from a dead sink.
    Disconnect {
        source: String,
        source_port: String,
        sink: String,
        sink_port: String,
    },
    /// Every connection of the surviving `sink:sink_port` was dropped.
    DisconnectAll { sink: String, sink_port: String },
}

impl fmt::Display for DisconnectAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnect {
                source,
                source_port,
                sink,
                sink_port,
            } => write!(f, "disconnect {source}:{source_port} from {sink}:{sink_port}"),
            Self::DisconnectAll { sink, sink_port } => {
                write!(f, "disconnect all on {sink}:{sink_port}")
            }
        }
    }
}

/// Outcome of one reaper run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Calls that were issued, including the ones that failed.
    pub actions: Vec<DisconnectAction>,
    /// Calls that raised and were assumed effective.
    pub failures: usize,
    /// Connections skipped because the peer is gone or shutting down.
    pub skipped: usize,
    /// Edges removed from the actual graph.
    pub removed_edges: usize,
}

impl ReapReport {
    #[must_use]
    pub fn is_noop(&self) -> bool {
        self.actions.is_empty() && self.removed_edges == 0
    }
}

/// Tears down the actual connections of dead tasks.
pub struct DeadConnectionReaper<'a> {
    registry: &'a DeploymentRegistry,
    dataflow: &'a SharedDataFlow,
}

impl<'a> DeadConnectionReaper<'a> {
    #[must_use]
    pub const fn new(registry: &'a DeploymentRegistry, dataflow: &'a SharedDataFlow) -> Self {
        Self { registry, dataflow }
    }

    /// Peers dying in the same batch are never alive. A peer without a
    /// known process is assumed reachable.
    fn peer_alive(&self, peer: &TaskHandle, dying: &HashSet<&str>) -> bool {
        !dying.contains(peer.name())
            && peer
                .process()
                .is_none_or(|pid| self.registry.is_peer_alive(pid))
    }

    /// Reap the connections of `dead_tasks`.
    pub fn reap(&self, dead_tasks: &[TaskHandle]) -> ReapReport {
        let _snapshot = self.registry.hold();
        let dying: HashSet<&str> = dead_tasks.iter().map(TaskHandle::name).collect();
        let mut report = ReapReport::default();

        for task in dead_tasks {
            // The graph lock is released while peers are called.
            let (inbound, outbound) = {
                let flow = self.dataflow.lock();
                (
                    flow.actual().inbound(task.name()),
                    flow.actual().outbound(task.name()),
                )
            };

            for (source, mapping) in &inbound {
                if self.peer_alive(source, &dying) {
                    self.reap_inbound(task, source, mapping, &mut report);
                } else {
                    report.skipped = report.skipped.saturating_add(1);
                }
            }
            for (sink, mapping) in &outbound {
                if self.peer_alive(sink, &dying) {
                    self.reap_outbound(task, sink, mapping, &mut report);
                } else {
                    report.skipped = report.skipped.saturating_add(1);
                }
            }

            let removed = self.dataflow.lock().actual_mut().remove_task(task.name());
            report.removed_edges = report.removed_edges.saturating_add(removed);
            debug!(task = %task, removed, "removed dead task from actual data flow");
        }

        report
    }

    /// `task` is the dead sink of a live source; only pull connections need
    /// the source to act.
    fn reap_inbound(
        &self,
        task: &TaskHandle,
        source: &TaskHandle,
        mapping: &PortMapping,
        report: &mut ReapReport,
    ) {
        if !mapping.policy.pull {
            return;
        }

        report.actions.push(DisconnectAction::Disconnect {
            source: source.name().to_string(),
            source_port: mapping.source_port.clone(),
            sink: task.name().to_string(),
            sink_port: mapping.sink_port.clone(),
        });
        if let Err(e) =
            source
                .remote()
                .disconnect_from(&mapping.source_port, task.name(), &mapping.sink_port)
        {
            warn!(
                "error while disconnecting {}:{} from {}:{} after {} died ({}). Assuming that both tasks are already dead.",
                source, mapping.source_port, task, mapping.sink_port, task, e
            );
            report.failures = report.failures.saturating_add(1);
        }
    }

    /// `task` is the dead source of a live sink; the sink port loses all its
    /// inputs.
    fn reap_outbound(
        &self,
        task: &TaskHandle,
        sink: &TaskHandle,
        mapping: &PortMapping,
        report: &mut ReapReport,
    ) {
        report.actions.push(DisconnectAction::DisconnectAll {
            sink: sink.name().to_string(),
            sink_port: mapping.sink_port.clone(),
        });
        if let Err(e) = sink.remote().disconnect_all(&mapping.sink_port) {
            warn!(
                "error while disconnecting {}:{} from {}:{} after {} died ({}). Assuming that both tasks are already dead.",
                task, mapping.source_port, sink, mapping.sink_port, task, e
            );
            report.failures = report.failures.saturating_add(1);
        }
    }
}
