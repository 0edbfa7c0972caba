//! Merge graph construction
//!
//! A merge graph is a short straight-line program over scratch tensors:
//!
//! ```text
//! n0 = input(loraA)            ne = [r, n_in]
//! n1 = input(loraB)            ne = [r, n_out]
//! n2 = input(base)             ne = [n_in, n_out]
//! n3 = matmul(n0, n1)          ne = [n_in, n_out], f32
//! n4 = scale(n3, scaling)      only when scaling != 1
//! n5 = add_inplace(n2, n4)     stored in base's element type
//! n6 = cast(n5, target)        only when base and target types differ
//! ```
//!
//! Construction is pure; executing a graph is the backend's job.

use crate::tensor::{ElementType, TensorDesc};

/// Index of a node within a [`MergeGraph`]
pub type NodeId = usize;

/// Node holding the down-projection factor
pub const DOWN_NODE: NodeId = 0;

/// Node holding the up-projection factor
pub const UP_NODE: NodeId = 1;

/// Node holding the base weight
pub const BASE_NODE: NodeId = 2;

/// Upper bound on nodes in any merge graph
pub const MAX_GRAPH_NODES: usize = 8;

/// Operation computed by a graph node
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MergeOp {
    /// Leaf populated before execution
    Input,
    /// `out[j * n_in + i] = sum_k a[i * r + k] * b[j * r + k]`
    MatMul {
        /// Down factor
        a: NodeId,
        /// Up factor
        b: NodeId,
    },
    /// Multiply every element by `factor`
    Scale {
        /// Source node
        src: NodeId,
        /// Multiplier
        factor: f32,
    },
    /// Add `src` into `dst`'s storage, keeping `dst`'s element type
    AddInPlace {
        /// Accumulator (the base weight)
        dst: NodeId,
        /// Delta
        src: NodeId,
    },
    /// Re-encode `src` into another element type
    Cast {
        /// Source node
        src: NodeId,
    },
}

/// A node and the tensor it produces
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergeNode {
    /// Operation
    pub op: MergeOp,
    /// Element type and extents of the result
    pub desc: TensorDesc,
}

/// Straight-line update program for one tensor
#[derive(Debug, Clone, PartialEq)]
pub struct MergeGraph {
    nodes: Vec<MergeNode>,
}

impl MergeGraph {
    fn push(&mut self, op: MergeOp, desc: TensorDesc) -> NodeId {
        self.nodes.push(MergeNode { op, desc });
        self.nodes.len() - 1
    }

    /// Nodes in execution order
    #[must_use]
    pub fn nodes(&self) -> &[MergeNode] {
        &self.nodes
    }

    /// Node by id
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&MergeNode> {
        self.nodes.get(id)
    }

    /// Number of nodes
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false; every graph has its three inputs
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Final node, whose bytes are committed to the model
    #[must_use]
    pub fn output(&self) -> NodeId {
        self.nodes.len() - 1
    }

    /// Element type and extents of the output
    #[must_use]
    pub fn output_desc(&self) -> TensorDesc {
        self.nodes[self.output()].desc
    }
}

/// Build the update graph for one tensor
///
/// Shapes are not validated here; callers check
/// `base.ne == [down.ne[1], up.ne[1]]` first.
#[must_use]
pub fn build_merge_graph(
    down: TensorDesc,
    up: TensorDesc,
    base: TensorDesc,
    scaling: f32,
    target: ElementType,
) -> MergeGraph {
    let mut graph = MergeGraph {
        nodes: Vec::with_capacity(MAX_GRAPH_NODES),
    };
    graph.push(MergeOp::Input, down);
    graph.push(MergeOp::Input, up);
    graph.push(MergeOp::Input, base);

    let delta_desc = TensorDesc::new(ElementType::F32, [down.ne[1], up.ne[1]]);
    let mut delta = graph.push(
        MergeOp::MatMul {
            a: DOWN_NODE,
            b: UP_NODE,
        },
        delta_desc,
    );

    if scaling != 1.0 {
        delta = graph.push(
            MergeOp::Scale {
                src: delta,
                factor: scaling,
            },
            delta_desc,
        );
    }

    let sum = graph.push(
        MergeOp::AddInPlace {
            dst: BASE_NODE,
            src: delta,
        },
        base,
    );

    if base.dtype != target {
        graph.push(MergeOp::Cast { src: sum }, TensorDesc::new(target, base.ne));
    }

    graph
}
