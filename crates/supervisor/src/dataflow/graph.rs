//! Directed connection graph over task endpoints, backed by petgraph.

use std::collections::HashMap;

use petgraph::Direction;
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};

use super::{ConnectionPolicy, PortMapping};
use crate::task::TaskHandle;

/// A node of a connection graph, identified by its task name.
pub trait Endpoint: Clone {
    fn task_name(&self) -> &str;
}

impl Endpoint for String {
    fn task_name(&self) -> &str {
        self
    }
}

impl Endpoint for TaskHandle {
    fn task_name(&self) -> &str {
        self.name()
    }
}

/// Directed graph of port connections between tasks.
///
/// There is one edge per (source port, sink port) pair. Node indices stay
/// stable across removals, so the name index never needs rebuilding.
#[derive(Debug, Clone)]
pub struct ConnectionGraph<N> {
    graph: StableDiGraph<N, PortMapping>,
    node_map: HashMap<String, NodeIndex>,
}

impl<N: Endpoint> Default for ConnectionGraph<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: Endpoint> ConnectionGraph<N> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            graph: StableDiGraph::new(),
            node_map: HashMap::new(),
        }
    }

    /// Insert `node`, or refresh the stored weight if the task is known.
    fn ensure_node(&mut self, node: N) -> NodeIndex {
        match self.node_map.get(node.task_name()) {
            Some(&index) => {
                if let Some(weight) = self.graph.node_weight_mut(index) {
                    *weight = node;
                }
                index
            }
            None => {
                let name = node.task_name().to_string();
                let index = self.graph.add_node(node);
                self.node_map.insert(name, index);
                index
            }
        }
    }

    fn find_edge(
        &self,
        source: NodeIndex,
        sink: NodeIndex,
        source_port: &str,
        sink_port: &str,
    ) -> Option<petgraph::stable_graph::EdgeIndex> {
        self.graph
            .edges_directed(source, Direction::Outgoing)
            .find(|e| {
                e.target() == sink
                    && e.weight().source_port == source_port
                    && e.weight().sink_port == sink_port
            })
            .map(|e| e.id())
    }

    /// Add a connection. Returns false if the port pair was already
    /// connected, in which case only its policy is updated.
    pub fn add(&mut self, source: N, sink: N, mapping: PortMapping) -> bool {
        let source = self.ensure_node(source);
        let sink = self.ensure_node(sink);
        match self.find_edge(source, sink, &mapping.source_port, &mapping.sink_port) {
            Some(edge) => {
                if let Some(existing) = self.graph.edge_weight_mut(edge) {
                    existing.policy = mapping.policy;
                }
                false
            }
            None => {
                self.graph.add_edge(source, sink, mapping);
                true
            }
        }
    }

    /// Remove one connection, returning its policy if it existed.
    pub fn remove(
        &mut self,
        source_task: &str,
        source_port: &str,
        sink_task: &str,
        sink_port: &str,
    ) -> Option<ConnectionPolicy> {
        let source = *self.node_map.get(source_task)?;
        let sink = *self.node_map.get(sink_task)?;
        let edge = self.find_edge(source, sink, source_port, sink_port)?;
        self.graph.remove_edge(edge).map(|m| m.policy)
    }

    #[must_use]
    pub fn has_connection(
        &self,
        source_task: &str,
        source_port: &str,
        sink_task: &str,
        sink_port: &str,
    ) -> bool {
        match (self.node_map.get(source_task), self.node_map.get(sink_task)) {
            (Some(&source), Some(&sink)) => self
                .find_edge(source, sink, source_port, sink_port)
                .is_some(),
            _ => false,
        }
    }

    #[must_use]
    pub fn contains_task(&self, name: &str) -> bool {
        self.node_map.contains_key(name)
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&N> {
        self.node_map
            .get(name)
            .and_then(|&index| self.graph.node_weight(index))
    }

    fn neighbors(&self, name: &str, direction: Direction) -> Vec<(N, PortMapping)> {
        let Some(&index) = self.node_map.get(name) else {
            return Vec::new();
        };
        self.graph
            .edges_directed(index, direction)
            .filter_map(|edge| {
                let peer = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                self.graph
                    .node_weight(peer)
                    .map(|node| (node.clone(), edge.weight().clone()))
            })
            .collect()
    }

    /// Connections where `name` is the sink, paired with their source.
    #[must_use]
    pub fn inbound(&self, name: &str) -> Vec<(N, PortMapping)> {
        self.neighbors(name, Direction::Incoming)
    }

    /// Connections where `name` is the source, paired with their sink.
    #[must_use]
    pub fn outbound(&self, name: &str) -> Vec<(N, PortMapping)> {
        self.neighbors(name, Direction::Outgoing)
    }

    /// Remove a task and every connection touching it. Returns the number
    /// of connections removed.
    pub fn remove_task(&mut self, name: &str) -> usize {
        let Some(index) = self.node_map.remove(name) else {
            return 0;
        };
        let outgoing = self.graph.edges_directed(index, Direction::Outgoing).count();
        let incoming = self
            .graph
            .edges_directed(index, Direction::Incoming)
            .filter(|e| e.source() != index)
            .count();
        self.graph.remove_node(index);
        outgoing.saturating_add(incoming)
    }

    /// Every connection as (source, sink, mapping).
    pub fn edges(&self) -> impl Iterator<Item = (&N, &N, &PortMapping)> {
        self.graph.edge_references().filter_map(move |edge| {
            let source = self.graph.node_weight(edge.source())?;
            let sink = self.graph.node_weight(edge.target())?;
            Some((source, sink, edge.weight()))
        })
    }

    #[must_use]
    pub fn task_count(&self) -> usize {
        self.graph.node_count()
    }

    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.graph.edge_count() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pull(source: &str, sink: &str) -> PortMapping {
        PortMapping::new(source, sink, ConnectionPolicy::pull())
    }

    #[test]
    fn should_add_and_list_connections() {
        let mut graph: ConnectionGraph<String> = ConnectionGraph::new();
        assert!(graph.add("camB".into(), "camA".into(), pull("frame_out", "frame_in")));
        assert!(graph.add("camB".into(), "viewer".into(), pull("frame_out", "image")));

        assert_eq!(graph.task_count(), 3);
        assert_eq!(graph.edge_count(), 2);
        assert_eq!(graph.outbound("camB").len(), 2);
        assert_eq!(graph.inbound("camA").len(), 1);
        assert!(graph.has_connection("camB", "frame_out", "camA", "frame_in"));
    }

    #[test]
    fn should_update_policy_of_duplicate_connection() {
        let mut graph: ConnectionGraph<String> = ConnectionGraph::new();
        graph.add("a".into(), "b".into(), pull("out", "in"));
        let added = graph.add(
            "a".into(),
            "b".into(),
            PortMapping::new("out", "in", ConnectionPolicy::data()),
        );

        assert!(!added);
        assert_eq!(graph.edge_count(), 1);
        assert_eq!(graph.inbound("b").first().map(|(_, m)| m.policy.pull), Some(false));
    }

    #[test]
    fn should_remove_task_with_all_its_edges() {
        let mut graph: ConnectionGraph<String> = ConnectionGraph::new();
        graph.add("a".into(), "b".into(), pull("out", "in"));
        graph.add("b".into(), "c".into(), pull("out", "in"));
        graph.add("b".into(), "b".into(), pull("loop_out", "loop_in"));

        assert_eq!(graph.remove_task("b"), 3);
        assert!(graph.is_empty());
        assert!(!graph.contains_task("b"));
        assert!(graph.contains_task("a"));
        assert_eq!(graph.remove_task("b"), 0);
    }

    #[test]
    fn should_keep_indices_valid_after_removal() {
        let mut graph: ConnectionGraph<String> = ConnectionGraph::new();
        graph.add("a".into(), "b".into(), pull("out", "in"));
        graph.add("c".into(), "d".into(), pull("out", "in"));
        graph.remove_task("a");

        assert_eq!(graph.node("d").map(String::as_str), Some("d"));
        assert!(graph.has_connection("c", "out", "d", "in"));
    }

    #[test]
    fn should_remove_single_connection() {
        let mut graph: ConnectionGraph<String> = ConnectionGraph::new();
        graph.add("a".into(), "b".into(), pull("out", "in"));

        assert_eq!(graph.remove("a", "out", "b", "in").map(|p| p.pull), Some(true));
        assert!(graph.remove("a", "out", "b", "in").is_none());
        assert!(graph.is_empty());
    }

    #[test]
    fn should_list_every_edge_with_its_endpoints() {
        let mut graph: ConnectionGraph<String> = ConnectionGraph::new();
        graph.add("a".into(), "b".into(), pull("out", "in"));
        graph.add("b".into(), "c".into(), pull("out", "in"));

        let mut edges: Vec<(String, String)> = graph
            .edges()
            .map(|(source, sink, _)| (source.clone(), sink.clone()))
            .collect();
        edges.sort();

        assert_eq!(
            edges,
            vec![("a".to_string(), "b".to_string()), ("b".to_string(), "c".to_string())]
        );
    }
}
