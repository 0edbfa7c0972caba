//! Compute backend for merge graphs
//!
//! A [`ComputeBackend`] allocates scratch buffers and executes a
//! [`MergeGraph`] over a [`ScratchContext`]. The merge engine holds one
//! backend for a whole pass and releases it exactly once at the end.
//!
//! [`CpuBackend`] is the only implementation: f32 arithmetic on a dedicated
//! rayon pool sized by the caller's thread count. Other devices plug in
//! behind the same trait.

use rayon::prelude::*;
use tracing::{debug, trace};

use crate::error::{AdaptarError, Result};
use crate::lora::graph::{MergeGraph, MergeOp, NodeId};
use crate::quantize;
use crate::tensor::ElementType;

/// Output rows below this count are computed on the calling thread
const PARALLEL_THRESHOLD: usize = 64;

/// Allocates scratch memory and executes merge graphs
pub trait ComputeBackend {
    /// Short backend name for logs
    fn name(&self) -> &str;

    /// Allocate a zeroed scratch buffer of `nbytes`
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if the memory cannot be reserved.
    fn alloc_buffer(&self, nbytes: usize) -> Result<Vec<u8>>;

    /// Execute every non-input node of `graph`
    ///
    /// Input nodes must already be bound in `ctx`. On return the output node
    /// is bound.
    ///
    /// # Errors
    ///
    /// Returns error if an input is unbound, an allocation fails, or an
    /// element type has no codec.
    fn compute(&self, graph: &MergeGraph, ctx: &mut ScratchContext) -> Result<()>;

    /// Release backend resources; called once per merge pass
    fn release(&mut self);
}

/// Fixed-capacity set of scratch buffers for one merge unit
///
/// Buffers are indexed by graph node. Everything is freed when the context
/// is dropped, so no two merge units share scratch memory.
#[derive(Debug)]
pub struct ScratchContext {
    slots: Vec<Option<Vec<u8>>>,
}

impl ScratchContext {
    /// Create a context with room for `capacity` tensor handles
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    /// Number of tensor handles
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Bind a buffer to a node, replacing any previous binding
    ///
    /// # Errors
    ///
    /// Returns `AllocationError` if `node` exceeds the context's capacity.
    pub fn bind(&mut self, node: NodeId, buffer: Vec<u8>) -> Result<()> {
        let capacity = self.slots.len();
        let slot = self
            .slots
            .get_mut(node)
            .ok_or_else(|| AdaptarError::AllocationError {
                reason: format!("scratch context holds {capacity} tensors, node {node} requested"),
            })?;
        *slot = Some(buffer);
        Ok(())
    }

    /// Borrow a node's buffer
    #[must_use]
    pub fn get(&self, node: NodeId) -> Option<&[u8]> {
        self.slots.get(node)?.as_deref()
    }

    /// Borrow a node's buffer mutably
    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut Vec<u8>> {
        self.slots.get_mut(node)?.as_mut()
    }

    /// Move a node's buffer out of the context
    pub fn take(&mut self, node: NodeId) -> Option<Vec<u8>> {
        self.slots.get_mut(node)?.take()
    }

    /// Total bytes currently bound
    #[must_use]
    pub fn allocated_bytes(&self) -> usize {
        self.slots.iter().flatten().map(Vec::len).sum()
    }

    fn require(&self, node: NodeId) -> Result<&[u8]> {
        self.get(node).ok_or_else(|| AdaptarError::InvalidShape {
            reason: format!("graph node {node} has no bound buffer"),
        })
    }
}

impl Drop for ScratchContext {
    fn drop(&mut self) {
        trace!(bytes = self.allocated_bytes(), "releasing scratch context");
    }
}

/// Reserve a zeroed buffer without aborting on allocation failure
pub(crate) fn try_alloc(nbytes: usize) -> Result<Vec<u8>> {
    try_zeroed(nbytes, "byte")
}

/// Reserve a zeroed f32 working vector without aborting on allocation failure
pub(crate) fn try_alloc_f32(len: usize) -> Result<Vec<f32>> {
    try_zeroed(len, "f32")
}

fn try_zeroed<T: Clone + Default>(len: usize, unit: &str) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|e| AdaptarError::AllocationError {
            reason: format!("{len} {unit} scratch buffer: {e}"),
        })?;
    buffer.resize(len, T::default());
    Ok(buffer)
}

/// Decode a bound buffer into a freshly reserved f32 vector
fn decode_node(dtype: ElementType, data: &[u8]) -> Result<Vec<f32>> {
    let mut values = try_alloc_f32(quantize::decoded_len(dtype, data.len())?)?;
    quantize::decode_into(dtype, data, &mut values)?;
    Ok(values)
}

/// Multi-threaded CPU backend
#[derive(Debug)]
pub struct CpuBackend {
    pool: rayon::ThreadPool,
    threads: usize,
    released: bool,
}

impl CpuBackend {
    /// Create a backend with a dedicated pool of `threads` workers
    ///
    /// # Errors
    ///
    /// Returns `BackendInit` if `threads` is zero or the pool cannot start.
    pub fn new(threads: usize) -> Result<Self> {
        if threads == 0 {
            return Err(AdaptarError::BackendInit {
                reason: "CPU backend needs at least one thread".to_string(),
            });
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("adaptar-cpu-{i}"))
            .build()
            .map_err(|e| AdaptarError::BackendInit {
                reason: e.to_string(),
            })?;
        debug!(threads, "CPU backend ready");
        Ok(Self {
            pool,
            threads,
            released: false,
        })
    }

    /// Worker thread count
    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// True once [`ComputeBackend::release`] has run
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released
    }

    /// `out[j * n_in + i] = sum_k a[i * r + k] * b[j * r + k]`
    fn matmul(&self, a: &[f32], b: &[f32], r: usize, n_in: usize, out: &mut [f32]) {
        if r == 0 || n_in == 0 {
            return;
        }

        let row = |(j, out_row): (usize, &mut [f32])| {
            let b_row = &b[j * r..(j + 1) * r];
            for (out, a_row) in out_row.iter_mut().zip(a.chunks_exact(r)) {
                *out = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
            }
        };

        if out.len() / n_in < PARALLEL_THRESHOLD {
            out.chunks_mut(n_in).enumerate().for_each(row);
        } else {
            self.pool
                .install(|| out.par_chunks_mut(n_in).enumerate().for_each(row));
        }
    }

    fn encoded_buffer(&self, dtype: ElementType, values: &[f32]) -> Result<Vec<u8>> {
        let mut buffer = self.alloc_buffer(quantize::encoded_len(dtype, values.len())?)?;
        quantize::encode_into(dtype, values, &mut buffer)?;
        Ok(buffer)
    }
}

impl ComputeBackend for CpuBackend {
    fn name(&self) -> &str {
        "cpu"
    }

    fn alloc_buffer(&self, nbytes: usize) -> Result<Vec<u8>> {
        try_alloc(nbytes)
    }

    fn compute(&self, graph: &MergeGraph, ctx: &mut ScratchContext) -> Result<()> {
        if self.released {
            return Err(AdaptarError::BackendInit {
                reason: "CPU backend already released".to_string(),
            });
        }

        for (id, node) in graph.nodes().iter().enumerate() {
            match node.op {
                MergeOp::Input => {
                    ctx.require(id)?;
                },
                MergeOp::MatMul { a, b } => {
                    let a_desc = graph.nodes()[a].desc;
                    let b_desc = graph.nodes()[b].desc;
                    let a_values = decode_node(a_desc.dtype, ctx.require(a)?)?;
                    let b_values = decode_node(b_desc.dtype, ctx.require(b)?)?;
                    let (r, n_in, n_out) = (a_desc.ne[0], a_desc.ne[1], b_desc.ne[1]);
                    if a_values.len() != r * n_in || b_values.len() != r * n_out {
                        return Err(AdaptarError::InvalidShape {
                            reason: format!("factor buffers do not match their extents at node {id}"),
                        });
                    }
                    let mut product = try_alloc_f32(n_in * n_out)?;
                    self.matmul(&a_values, &b_values, r, n_in, &mut product);
                    let buffer = self.encoded_buffer(ElementType::F32, &product)?;
                    ctx.bind(id, buffer)?;
                },
                MergeOp::Scale { src, factor } => {
                    let mut values = decode_node(ElementType::F32, ctx.require(src)?)?;
                    self.pool
                        .install(|| values.par_iter_mut().for_each(|v| *v *= factor));
                    let buffer = self.encoded_buffer(ElementType::F32, &values)?;
                    ctx.bind(id, buffer)?;
                },
                MergeOp::AddInPlace { dst, src } => {
                    let dst_desc = graph.nodes()[dst].desc;
                    let delta = decode_node(ElementType::F32, ctx.require(src)?)?;
                    let mut values = decode_node(dst_desc.dtype, ctx.require(dst)?)?;
                    if values.len() != delta.len() {
                        return Err(AdaptarError::InvalidShape {
                            reason: format!(
                                "add of {} delta elements into {} base elements",
                                delta.len(),
                                values.len()
                            ),
                        });
                    }
                    for (v, d) in values.iter_mut().zip(&delta) {
                        *v += d;
                    }
                    let mut storage = ctx.take(dst).ok_or_else(|| AdaptarError::InvalidShape {
                        reason: format!("graph node {dst} has no bound buffer"),
                    })?;
                    quantize::encode_into(dst_desc.dtype, &values, &mut storage)?;
                    ctx.bind(id, storage)?;
                },
                MergeOp::Cast { src } => {
                    let src_desc = graph.nodes()[src].desc;
                    let values = decode_node(src_desc.dtype, ctx.require(src)?)?;
                    let buffer = self.encoded_buffer(node.desc.dtype, &values)?;
                    ctx.bind(id, buffer)?;
                },
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if !self.released {
            self.released = true;
            debug!(threads = self.threads, "CPU backend released");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lora::graph::{build_merge_graph, BASE_NODE, DOWN_NODE, MAX_GRAPH_NODES, UP_NODE};
    use crate::tensor::TensorDesc;

    fn f32_bytes(values: &[f32]) -> Vec<u8> {
        values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    fn run(
        down: (&[usize; 2], &[f32]),
        up: (&[usize; 2], &[f32]),
        base: (&[usize; 2], &[f32]),
        scaling: f32,
    ) -> Vec<f32> {
        let backend = CpuBackend::new(2).unwrap();
        let graph = build_merge_graph(
            TensorDesc::new(ElementType::F32, *down.0),
            TensorDesc::new(ElementType::F32, *up.0),
            TensorDesc::new(ElementType::F32, *base.0),
            scaling,
            ElementType::F32,
        );
        let mut ctx = ScratchContext::new(MAX_GRAPH_NODES);
        ctx.bind(DOWN_NODE, f32_bytes(down.1)).unwrap();
        ctx.bind(UP_NODE, f32_bytes(up.1)).unwrap();
        ctx.bind(BASE_NODE, f32_bytes(base.1)).unwrap();
        backend.compute(&graph, &mut ctx).unwrap();
        quantize::decode_f32(ctx.get(graph.output()).unwrap()).unwrap()
    }

    #[test]
    fn test_outer_product_of_ones() {
        let out = run((&[1, 2], &[1.0, 1.0]), (&[1, 2], &[1.0, 1.0]), (&[2, 2], &[0.0; 4]), 1.0);
        assert_eq!(out, vec![1.0; 4]);
    }

    #[test]
    fn test_matmul_layout() {
        // A: n_in = 2 rows of r = 2, B: n_out = 3 rows of r = 2
        let a = [1.0, 2.0, 3.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let out = run((&[2, 2], &a), (&[2, 3], &b), (&[2, 3], &[0.0; 6]), 1.0);
        // out[j * 2 + i] = dot(a[i], b[j])
        assert_eq!(out, vec![1.0, 3.0, 2.0, 4.0, 3.0, 7.0]);
    }

    #[test]
    fn test_scaling_and_base_are_applied() {
        let out = run((&[1, 2], &[1.0, 2.0]), (&[1, 1], &[3.0]), (&[2, 1], &[10.0, 20.0]), 0.5);
        assert_eq!(out, vec![11.5, 23.0]);
    }

    #[test]
    fn test_parallel_path_matches_sequential() {
        let r = 4;
        let n_in = 8;
        let n_out = PARALLEL_THRESHOLD * 2;
        let a: Vec<f32> = (0..r * n_in).map(|i| (i % 7) as f32 - 3.0).collect();
        let b: Vec<f32> = (0..r * n_out).map(|i| (i % 5) as f32 * 0.5).collect();

        let mut serial = vec![0.0; n_in * n_out];
        let mut parallel = vec![0.0; n_in * n_out];
        CpuBackend::new(1).unwrap().matmul(&a, &b, r, n_in, &mut serial);
        CpuBackend::new(4).unwrap().matmul(&a, &b, r, n_in, &mut parallel);
        assert_eq!(serial, parallel);
        let expected: f32 = (0..r).map(|k| a[k] * b[r * 5 + k]).sum();
        assert_eq!(serial[5 * n_in], expected);
    }

    #[test]
    fn test_cast_to_f16() {
        let backend = CpuBackend::new(1).unwrap();
        let base = TensorDesc::new(ElementType::F32, [2, 1]);
        let graph = build_merge_graph(
            TensorDesc::new(ElementType::F32, [1, 2]),
            TensorDesc::new(ElementType::F32, [1, 1]),
            base,
            1.0,
            ElementType::F16,
        );
        let mut ctx = ScratchContext::new(MAX_GRAPH_NODES);
        ctx.bind(DOWN_NODE, f32_bytes(&[1.0, 2.0])).unwrap();
        ctx.bind(UP_NODE, f32_bytes(&[1.0])).unwrap();
        ctx.bind(BASE_NODE, f32_bytes(&[0.5, 0.5])).unwrap();
        backend.compute(&graph, &mut ctx).unwrap();

        let out = ctx.get(graph.output()).unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(quantize::dequantize_f16(out).unwrap(), vec![1.5, 2.5]);
    }

    #[test]
    fn test_unbound_input_fails() {
        let backend = CpuBackend::new(1).unwrap();
        let desc = TensorDesc::new(ElementType::F32, [1, 1]);
        let graph = build_merge_graph(desc, desc, desc, 1.0, ElementType::F32);
        let mut ctx = ScratchContext::new(MAX_GRAPH_NODES);
        assert!(backend.compute(&graph, &mut ctx).is_err());
    }

    #[test]
    fn test_scratch_capacity_is_fixed() {
        let mut ctx = ScratchContext::new(2);
        ctx.bind(1, vec![0; 4]).unwrap();
        assert!(matches!(
            ctx.bind(2, vec![0; 4]),
            Err(AdaptarError::AllocationError { .. })
        ));
        assert_eq!(ctx.allocated_bytes(), 4);
        assert_eq!(ctx.take(1).unwrap().len(), 4);
        assert_eq!(ctx.allocated_bytes(), 0);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut backend = CpuBackend::new(1).unwrap();
        backend.release();
        backend.release();
        assert!(backend.is_released());
        let desc = TensorDesc::new(ElementType::F32, [1, 1]);
        let graph = build_merge_graph(desc, desc, desc, 1.0, ElementType::F32);
        let mut ctx = ScratchContext::new(MAX_GRAPH_NODES);
        assert!(matches!(
            backend.compute(&graph, &mut ctx),
            Err(AdaptarError::BackendInit { .. })
        ));
    }

    #[test]
    fn test_zero_threads_rejected() {
        assert!(matches!(CpuBackend::new(0), Err(AdaptarError::BackendInit { .. })));
    }

    #[test]
    fn test_oversized_scratch_is_an_allocation_error() {
        assert!(matches!(try_alloc(usize::MAX), Err(AdaptarError::AllocationError { .. })));
        assert!(matches!(
            try_alloc_f32(usize::MAX / 2),
            Err(AdaptarError::AllocationError { .. })
        ));
        let backend = CpuBackend::new(1).unwrap();
        assert!(matches!(
            backend.alloc_buffer(usize::MAX),
            Err(AdaptarError::AllocationError { .. })
        ));
    }

    #[test]
    fn test_factor_buffer_shorter_than_extents_fails() {
        let backend = CpuBackend::new(1).unwrap();
        let graph = build_merge_graph(
            TensorDesc::new(ElementType::F32, [2, 2]),
            TensorDesc::new(ElementType::F32, [2, 2]),
            TensorDesc::new(ElementType::F32, [2, 2]),
            1.0,
            ElementType::F32,
        );
        let mut ctx = ScratchContext::new(MAX_GRAPH_NODES);
        ctx.bind(DOWN_NODE, f32_bytes(&[1.0, 1.0, 1.0])).unwrap();
        ctx.bind(UP_NODE, f32_bytes(&[1.0; 4])).unwrap();
        ctx.bind(BASE_NODE, f32_bytes(&[0.0; 4])).unwrap();
        assert!(matches!(
            backend.compute(&graph, &mut ctx),
            Err(AdaptarError::InvalidShape { .. })
        ));
    }
}
