//! Generic directed acyclic graph keyed by integer serials.
//!
//! This is the data structure underneath both levels of a
//! [`Collection`](crate::pipeline::Collection): the pipeline-graph and every
//! pipeline's step-graph. Nodes are `(id, value)` pairs kept in insertion
//! order; edges are an adjacency map from id to successor ids. Appending an
//! edge that would close a cycle is rejected, so the graph is acyclic at all
//! times.
//!
//! Traversal is breadth-first and layered: [`Graph::walk`] delivers one
//! *frontier* (all nodes at the same BFS depth from the start node, in
//! insertion order) per visitor call, and a layer is only delivered after the
//! previous layer's visitor call returned successfully.

use miette::Diagnostic;
use rustc_hash::{FxHashMap, FxHashSet};
use thiserror::Error;

/// Errors raised by graph mutations and lookups.
///
/// `WouldCycle` and `NotFound` escaping to a pipeline run indicate a bug in
/// the append layer rather than a user mistake.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum GraphError {
    #[error("node {id} already exists in the graph")]
    #[diagnostic(code(slipway::dag::already_exists))]
    AlreadyExists { id: i64 },

    #[error("node {id} not found in the graph")]
    #[diagnostic(code(slipway::dag::not_found))]
    NotFound { id: i64 },

    #[error("edge {from} -> {to} already exists in the graph")]
    #[diagnostic(code(slipway::dag::edge_exists))]
    EdgeExists { from: i64, to: i64 },

    #[error("edge {from} -> {to} would introduce a cycle")]
    #[diagnostic(
        code(slipway::dag::would_cycle),
        help("pipeline graphs are append-only DAGs; a step cannot depend on its own successors")
    )]
    WouldCycle { from: i64, to: i64 },
}

/// A single graph node: an integer serial and the value it carries.
#[derive(Debug, Clone)]
pub struct Node<T> {
    pub id: i64,
    pub value: T,
}

/// An append-only DAG with insertion-ordered nodes.
#[derive(Debug, Clone)]
pub struct Graph<T> {
    nodes: Vec<Node<T>>,
    index: FxHashMap<i64, usize>,
    edges: FxHashMap<i64, Vec<i64>>,
}

impl<T> Default for Graph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Graph<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            index: FxHashMap::default(),
            edges: FxHashMap::default(),
        }
    }

    /// Add a node. Fails if a node with the same id is already present.
    pub fn add_node(&mut self, id: i64, value: T) -> Result<(), GraphError> {
        if self.index.contains_key(&id) {
            return Err(GraphError::AlreadyExists { id });
        }
        self.index.insert(id, self.nodes.len());
        self.nodes.push(Node { id, value });
        Ok(())
    }

    /// Add a directed edge between two existing nodes.
    ///
    /// Self-loops, duplicate edges, and edges that would close a cycle are
    /// rejected. The duplicate check is what keeps any node at no more than
    /// one incoming edge from the synthetic root.
    pub fn add_edge(&mut self, from: i64, to: i64) -> Result<(), GraphError> {
        if !self.index.contains_key(&from) {
            return Err(GraphError::NotFound { id: from });
        }
        if !self.index.contains_key(&to) {
            return Err(GraphError::NotFound { id: to });
        }
        if from == to {
            return Err(GraphError::WouldCycle { from, to });
        }
        if self.edges.get(&from).is_some_and(|succ| succ.contains(&to)) {
            return Err(GraphError::EdgeExists { from, to });
        }
        // A path from `to` back to `from` means this edge closes a cycle.
        if self.reachable(to, from) {
            return Err(GraphError::WouldCycle { from, to });
        }
        self.edges.entry(from).or_default().push(to);
        Ok(())
    }

    pub fn node(&self, id: i64) -> Result<&Node<T>, GraphError> {
        self.index
            .get(&id)
            .map(|i| &self.nodes[*i])
            .ok_or(GraphError::NotFound { id })
    }

    pub fn node_mut(&mut self, id: i64) -> Result<&mut Node<T>, GraphError> {
        match self.index.get(&id) {
            Some(i) => Ok(&mut self.nodes[*i]),
            None => Err(GraphError::NotFound { id }),
        }
    }

    /// All nodes, in insertion order.
    pub fn nodes(&self) -> &[Node<T>] {
        &self.nodes
    }

    /// The adjacency map: node id to successor ids, in edge insertion order.
    pub fn edges(&self) -> &FxHashMap<i64, Vec<i64>> {
        &self.edges
    }

    /// Nodes with no outgoing edges, in insertion order.
    pub fn leaves(&self) -> Vec<&Node<T>> {
        self.nodes
            .iter()
            .filter(|n| self.edges.get(&n.id).map_or(true, Vec::is_empty))
            .collect()
    }

    /// BFS layers starting at `from` (inclusive). Each node appears exactly
    /// once, in the layer of its first discovery; within a layer, nodes keep
    /// the order in which their incoming edges were appended.
    pub fn frontiers(&self, from: i64) -> Result<Vec<Vec<i64>>, GraphError> {
        if !self.index.contains_key(&from) {
            return Err(GraphError::NotFound { id: from });
        }
        let mut seen = FxHashSet::default();
        seen.insert(from);
        let mut layers = vec![vec![from]];
        loop {
            let mut next = Vec::new();
            for id in layers.last().into_iter().flatten() {
                for succ in self.edges.get(id).into_iter().flatten() {
                    if seen.insert(*succ) {
                        next.push(*succ);
                    }
                }
            }
            if next.is_empty() {
                break;
            }
            layers.push(next);
        }
        Ok(layers)
    }

    /// Layered breadth-first traversal from `from`. The visitor receives one
    /// frontier per call; the first visitor error stops the walk.
    pub fn walk<E, F>(&self, from: i64, mut visit: F) -> Result<(), E>
    where
        E: From<GraphError>,
        F: FnMut(&[&Node<T>]) -> Result<(), E>,
    {
        for layer in self.frontiers(from)? {
            let nodes: Vec<&Node<T>> = layer.iter().map(|id| &self.nodes[self.index[id]]).collect();
            visit(&nodes)?;
        }
        Ok(())
    }

    fn reachable(&self, from: i64, target: i64) -> bool {
        if from == target {
            return true;
        }
        let mut stack = vec![from];
        let mut seen = FxHashSet::default();
        seen.insert(from);
        while let Some(id) = stack.pop() {
            for succ in self.edges.get(&id).into_iter().flatten() {
                if *succ == target {
                    return true;
                }
                if seen.insert(*succ) {
                    stack.push(*succ);
                }
            }
        }
        false
    }
}
