//! Fluent graph composition: chain nodes with `|` (`std::ops::BitOr`),
//! tracking a head/tail pair so successive concatenation knows where to
//! splice the next join edge.
//!
//! `|` is infallible so that `a | b | c | d` composes without a `?` after
//! every step — head/tail eligibility (`Input`/`Merge` cannot be a head,
//! `Split` cannot be a tail) is checked eagerly and the first violation is
//! carried as a sticky error on the segment, surfaced only when the caller
//! calls [`Segment::compile`]. Overlapping node sets — concatenating a
//! segment with itself — has no runtime check because Rust's ownership
//! model already makes it impossible: `BitOr` consumes both operands by
//! value, so a `Segment` can't be referenced after it's been spliced into
//! another one.

use batchfactory_op::Node;

use crate::graph::{Edge, Graph, GraphBuildError};

/// A partial graph under construction: some owned nodes and edges, plus the
/// node index eligible to receive the next upstream join (`head`) and the
/// one eligible to supply the next downstream join (`tail`).
pub struct Segment {
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    head: Option<usize>,
    tail: Option<usize>,
    error: Option<GraphBuildError>,
}

impl Segment {
    /// Wrap a single node as a one-node segment. `Input` and `Merge` nodes
    /// get no `head` (nothing may pipe into them via `|`); `Split` nodes get
    /// no `tail` (nothing may pipe out of them via `|` — use explicit edges
    /// instead, since a Split's multiple outputs don't fit a single join).
    pub fn single(node: Node) -> Self {
        let head = if matches!(node, Node::Input(_) | Node::Merge(_)) {
            None
        } else {
            Some(0)
        };
        let tail = if matches!(node, Node::Split(_)) {
            None
        } else {
            Some(0)
        };
        Self {
            nodes: vec![node],
            edges: Vec::new(),
            head,
            tail,
            error: None,
        }
    }

    /// Add an edge with node indices already local to this segment (e.g. a
    /// loop-back edge connecting a later node back to an earlier one). Used
    /// to build cyclic topologies that the linear `|` operator can't express.
    pub fn with_edge(mut self, edge: Edge) -> Self {
        self.edges.push(edge);
        self
    }

    pub fn head(&self) -> Option<usize> {
        self.head
    }

    pub fn tail(&self) -> Option<usize> {
        self.tail
    }

    /// Compile this segment into an executable [`Graph`], designating its
    /// `tail` node (if any) as the public output sink. Fails if any prior
    /// `|` concatenation violated head/tail eligibility, or if the resulting
    /// topology itself is malformed (port arity, illegal fanout).
    pub fn compile(self) -> Result<Graph, GraphBuildError> {
        if let Some(err) = self.error {
            return Err(err);
        }
        Graph::build(self.nodes, self.edges, self.tail)
    }
}

impl std::ops::BitOr for Segment {
    type Output = Segment;

    fn bitor(self, rhs: Segment) -> Segment {
        if self.error.is_some() {
            return self;
        }
        if rhs.error.is_some() {
            return rhs;
        }

        let Some(tail) = self.tail else {
            return Segment {
                nodes: Vec::new(),
                edges: Vec::new(),
                head: None,
                tail: None,
                error: Some(GraphBuildError::InvalidTail),
            };
        };
        let Some(rhs_head) = rhs.head else {
            return Segment {
                nodes: Vec::new(),
                edges: Vec::new(),
                head: None,
                tail: None,
                error: Some(GraphBuildError::InvalidHead),
            };
        };

        let offset = self.nodes.len();
        let mut nodes = self.nodes;
        nodes.extend(rhs.nodes);

        let mut edges = self.edges;
        edges.extend(rhs.edges.into_iter().map(|e| Edge {
            from_node: e.from_node + offset,
            from_port: e.from_port,
            to_node: e.to_node + offset,
            to_port: e.to_port,
        }));
        edges.push(Edge::new(tail, 0, rhs_head + offset, 0));

        Segment {
            nodes,
            edges,
            head: self.head,
            tail: rhs.tail.map(|t| t + offset),
            error: None,
        }
    }
}
