//! Graph topology and the single-pump-call primitive the scheduler drives.
//!
//! A [`Graph`] owns every node and every edge buffer. Edges are plain
//! `(node index, port index)` pairs — no back-references, no `Rc`/`Weak` —
//! so cycles (the `Repeat` loop construct) are just edges whose target node
//! index happens to be lower than the source's; the scheduler's outer loop
//! supplies the iteration semantics, not the graph structure.

use std::collections::{BTreeMap, HashMap};

use anyhow::Result;
use batchfactory_entry::Entry;
use batchfactory_op::{Node, Op, PumpOptions};
use thiserror::Error;

use crate::buffer::EdgeBuffer;

/// A directed connection from one node's output port to another node's
/// input port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Edge {
    pub from_node: usize,
    pub from_port: usize,
    pub to_node: usize,
    pub to_port: usize,
}

impl Edge {
    pub fn new(from_node: usize, from_port: usize, to_node: usize, to_port: usize) -> Self {
        Self {
            from_node,
            from_port,
            to_node,
            to_port,
        }
    }
}

/// Topology errors, raised at build time before any node ever pumps.
/// A `thiserror` enum rather than `anyhow::Error` since callers — a CLI
/// reporting a malformed pipeline definition, or a test asserting a specific
/// misconfiguration — may want to match on the variant.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GraphBuildError {
    #[error("node index {0} is out of range ({1} nodes in the graph)")]
    NodeOutOfRange(usize, usize),
    #[error("edge from node {node} references output port {port}, which is out of range (node has {arity} output ports)")]
    OutputPortOutOfRange { node: usize, port: usize, arity: usize },
    #[error("edge to node {node} references input port {port}, which is out of range (node has {arity} input ports)")]
    InputPortOutOfRange { node: usize, port: usize, arity: usize },
    #[error("illegal fanout: node {node} output port {port} already feeds one outgoing edge; only a Split node may have more than one")]
    IllegalFanout { node: usize, port: usize },
    #[error("node {node} input port {port} already has an incoming edge; multiple sources into one input port are not supported")]
    DuplicateInputEdge { node: usize, port: usize },
    #[error("tail node index {0} is out of range ({1} nodes in the graph)")]
    TailOutOfRange(usize, usize),
    #[error("segment cannot be concatenated: left segment has no tail (e.g. it ends in a Split)")]
    InvalidTail,
    #[error("segment cannot be concatenated: right segment has no head (e.g. it starts with an Input or Merge)")]
    InvalidHead,
}

/// The compiled, executable graph: every node plus every edge buffer,
/// addressed by the edge's source `(node, port)`.
pub struct Graph {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    buffers: HashMap<(usize, usize), EdgeBuffer>,
    /// The node whose output port 0 is the pipeline's public sink, if any.
    tail: Option<usize>,
}

/// What one `Graph::pump` call (one scheduler iteration) produced: the
/// highest barrier level at which any node's emission was actually accepted
/// by its output buffer (not merely attempted — a stale re-emission after
/// resume does not count).
#[derive(Debug, Default)]
pub struct PumpReport {
    pub highest_emitting_level: Option<u32>,
}

impl Graph {
    /// Validate and assemble a graph from its nodes and edges. Checks port
    /// arity, the single-outgoing-edge-per-source-port fanout rule (Split
    /// nodes exempted), and that every input port has at most one incoming
    /// edge.
    pub fn build(
        nodes: Vec<Node>,
        edges: Vec<Edge>,
        tail: Option<usize>,
    ) -> Result<Graph, GraphBuildError> {
        let n = nodes.len();
        let mut outgoing_seen: HashMap<(usize, usize), usize> = HashMap::new();
        let mut incoming_seen: HashMap<(usize, usize), usize> = HashMap::new();

        for edge in &edges {
            if edge.from_node >= n {
                return Err(GraphBuildError::NodeOutOfRange(edge.from_node, n));
            }
            if edge.to_node >= n {
                return Err(GraphBuildError::NodeOutOfRange(edge.to_node, n));
            }
            let from_arity = nodes[edge.from_node].n_out_ports();
            if edge.from_port >= from_arity {
                return Err(GraphBuildError::OutputPortOutOfRange {
                    node: edge.from_node,
                    port: edge.from_port,
                    arity: from_arity,
                });
            }
            let to_arity = nodes[edge.to_node].n_in_ports();
            if edge.to_port >= to_arity {
                return Err(GraphBuildError::InputPortOutOfRange {
                    node: edge.to_node,
                    port: edge.to_port,
                    arity: to_arity,
                });
            }

            let is_split = matches!(nodes[edge.from_node], Node::Split(_));
            let out_key = (edge.from_node, edge.from_port);
            let seen = outgoing_seen.entry(out_key).or_insert(0);
            *seen += 1;
            if *seen > 1 && !is_split {
                return Err(GraphBuildError::IllegalFanout {
                    node: edge.from_node,
                    port: edge.from_port,
                });
            }

            let in_key = (edge.to_node, edge.to_port);
            let in_seen = incoming_seen.entry(in_key).or_insert(0);
            *in_seen += 1;
            if *in_seen > 1 {
                return Err(GraphBuildError::DuplicateInputEdge {
                    node: edge.to_node,
                    port: edge.to_port,
                });
            }
        }

        if let Some(t) = tail {
            if t >= n {
                return Err(GraphBuildError::TailOutOfRange(t, n));
            }
        }

        let mut buffers = HashMap::new();
        for edge in &edges {
            buffers
                .entry((edge.from_node, edge.from_port))
                .or_insert_with(EdgeBuffer::new);
        }

        Ok(Graph {
            nodes,
            edges,
            buffers,
            tail,
        })
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    /// Every distinct `barrier_level` declared by a node in this graph,
    /// ascending. The scheduler's `current_level` only ever takes one of
    /// these values.
    pub fn declared_levels(&self) -> Vec<u32> {
        let mut levels: Vec<u32> = self.nodes.iter().map(|n| n.barrier_level()).collect();
        levels.sort_unstable();
        levels.dedup();
        levels
    }

    /// Current contents of the tail node's output port 0, if a tail is
    /// designated. This is the pipeline's "final tail multiset".
    pub fn tail_entries(&self) -> Vec<Entry> {
        match self.tail {
            Some(t) => self
                .buffers
                .get(&(t, 0))
                .map(|b| b.snapshot().into_values().collect())
                .unwrap_or_default(),
            None => Vec::new(),
        }
    }

    /// Current contents of an arbitrary `(node, port)` output buffer, for
    /// tests and diagnostics.
    pub fn buffer_entries(&self, node: usize, port: usize) -> Vec<Entry> {
        self.buffers
            .get(&(node, port))
            .map(|b| b.snapshot().into_values().collect())
            .unwrap_or_default()
    }

    fn incoming_edge(&self, node: usize, port: usize) -> Option<&Edge> {
        self.edges
            .iter()
            .find(|e| e.to_node == node && e.to_port == port)
    }

    /// Pump every node with `barrier_level() <= max_barrier_level`, in node
    /// list order. Each node reads a snapshot of its input-port buffers,
    /// emits into its output-port buffers (subject to the edge buffer's
    /// dedup/monotonicity rule), and declares what it consumed from its
    /// inputs.
    pub fn pump(&mut self, max_barrier_level: u32, opts: &PumpOptions) -> Result<PumpReport> {
        let mut report = PumpReport::default();

        for idx in 0..self.nodes.len() {
            let level = self.nodes[idx].barrier_level();
            if level > max_barrier_level {
                continue;
            }

            let n_in = self.nodes[idx].n_in_ports();
            let mut inputs = Vec::with_capacity(n_in);
            for port in 0..n_in {
                let snapshot = match self.incoming_edge(idx, port) {
                    Some(edge) => self
                        .buffers
                        .get(&(edge.from_node, edge.from_port))
                        .map(|b| b.snapshot())
                        .unwrap_or_default(),
                    None => BTreeMap::new(),
                };
                inputs.push(snapshot);
            }

            let output = self.nodes[idx].pump(inputs, opts)?;

            let mut node_accepted = false;
            for (port, batch) in output.outputs.into_iter().enumerate() {
                let buffer = self.buffers.entry((idx, port)).or_insert_with(EdgeBuffer::new);
                for (_, entry) in batch {
                    if buffer.update(entry) {
                        node_accepted = true;
                    }
                }
            }

            for (port, consumed_idxs) in output.consumed.into_iter().enumerate() {
                if consumed_idxs.is_empty() {
                    continue;
                }
                if let Some(edge) = self.incoming_edge(idx, port) {
                    let key = (edge.from_node, edge.from_port);
                    if let Some(buffer) = self.buffers.get_mut(&key) {
                        for consumed_idx in &consumed_idxs {
                            buffer.consume(consumed_idx);
                        }
                    }
                }
            }

            if node_accepted {
                report.highest_emitting_level =
                    Some(report.highest_emitting_level.map_or(level, |l| l.max(level)));
                tracing::debug!(node = idx, level, "node accepted emission this pump");
            }
        }

        Ok(report)
    }
}
