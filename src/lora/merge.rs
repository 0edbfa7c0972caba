//! Merge engine
//!
//! Walks the target model's tensors in registry order and, for each tensor
//! with a complete factor pair, runs one merge unit:
//!
//! 1. allocate a fixed-capacity [`ScratchContext`]
//! 2. read both factor payloads and the base weight into scratch buffers
//! 3. warn (once per pass) if the base weight is quantized
//! 4. check `base.ne == [loraA.ne[1], loraB.ne[1]]`
//! 5. build and execute the merge graph
//! 6. copy the output over the model tensor
//!
//! The scratch context is dropped at the end of every unit, on success or
//! error. Any error aborts the pass; tensors merged before it stay merged.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::base::BaseModelSource;
use super::format::{LoraAdapterFile, TensorRecord};
use super::graph::{build_merge_graph, BASE_NODE, DOWN_NODE, MAX_GRAPH_NODES, UP_NODE};
use super::matcher::find_pair;
use crate::backend::{ComputeBackend, ScratchContext};
use crate::error::{AdaptarError, Result};
use crate::model::TensorRegistry;

/// Progress is logged after this many merged tensors
pub const PROGRESS_INTERVAL: usize = 4;

/// Outcome of a merge pass
#[derive(Debug, Clone, PartialEq)]
pub struct MergeReport {
    /// Tensors updated from a factor pair
    pub merged: usize,
    /// Tensors without a complete factor pair
    pub skipped: usize,
    /// Wall-clock time of the pass
    pub elapsed: Duration,
    /// `scale * alpha / rank`
    pub scaling: f32,
    /// True if any base weight was quantized
    pub quantized_base_warned: bool,
}

/// Per-pass hooks
#[derive(Default)]
pub struct MergeOptions<'a> {
    /// Called after each committed tensor with its name and the running
    /// merged count
    pub on_tensor_merged: Option<Box<dyn FnMut(&str, usize) + 'a>>,
}

impl<'a> MergeOptions<'a> {
    /// Set the per-tensor callback
    #[must_use]
    pub fn on_tensor_merged(mut self, callback: impl FnMut(&str, usize) + 'a) -> Self {
        self.on_tensor_merged = Some(Box::new(callback));
        self
    }
}

impl std::fmt::Debug for MergeOptions<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeOptions")
            .field("on_tensor_merged", &self.on_tensor_merged.is_some())
            .finish()
    }
}

/// State carried across merge units of one pass
#[derive(Debug, Default)]
struct MergeState {
    merged: usize,
    skipped: usize,
    warned_quantized_base: bool,
}

/// Releases a backend exactly once when dropped
pub(crate) struct BackendGuard<'a> {
    backend: &'a mut dyn ComputeBackend,
}

impl<'a> BackendGuard<'a> {
    pub(crate) fn new(backend: &'a mut dyn ComputeBackend) -> Self {
        Self { backend }
    }

    pub(crate) fn backend(&self) -> &dyn ComputeBackend {
        &*self.backend
    }
}

impl Drop for BackendGuard<'_> {
    fn drop(&mut self) {
        self.backend.release();
    }
}

/// Everything one merge unit reads
struct MergeUnit<'r> {
    name: &'r str,
    down: &'r TensorRecord,
    up: &'r TensorRecord,
}

/// Apply every complete factor pair in `adapter` to `model`
///
/// The returned report's `elapsed` covers only this call.
///
/// # Errors
///
/// Returns the first error from any merge unit: `ShapeMismatch`,
/// `AllocationError`, `IoError`, `TensorNotFound` (tensor missing from the
/// base model) or `UnsupportedOperation` (element type without a codec).
pub fn merge_adapter<R: TensorRegistry + ?Sized>(
    model: &mut R,
    adapter: &mut LoraAdapterFile,
    base: Option<&dyn BaseModelSource>,
    backend: &dyn ComputeBackend,
    scaling: f32,
    mut options: MergeOptions<'_>,
) -> Result<MergeReport> {
    let start = Instant::now();
    let mut state = MergeState::default();

    for name in model.tensor_names() {
        let Some(pair) = find_pair(&adapter.records, &name) else {
            state.skipped += 1;
            continue;
        };
        let down = pair.down.clone();
        let up = pair.up.clone();
        let unit = MergeUnit {
            name: &name,
            down: &down,
            up: &up,
        };

        merge_tensor(model, adapter, base, backend, scaling, &unit, &mut state)?;
        state.merged += 1;

        if let Some(callback) = options.on_tensor_merged.as_mut() {
            callback(&name, state.merged);
        }
        if state.merged % PROGRESS_INTERVAL == 0 {
            debug!(merged = state.merged, "merge progress");
        }
    }

    Ok(MergeReport {
        merged: state.merged,
        skipped: state.skipped,
        elapsed: start.elapsed(),
        scaling,
        quantized_base_warned: state.warned_quantized_base,
    })
}

fn merge_tensor<R: TensorRegistry + ?Sized>(
    model: &mut R,
    adapter: &mut LoraAdapterFile,
    base: Option<&dyn BaseModelSource>,
    backend: &dyn ComputeBackend,
    scaling: f32,
    unit: &MergeUnit<'_>,
    state: &mut MergeState,
) -> Result<()> {
    let name = unit.name;
    let target = model
        .tensor_desc(name)
        .ok_or_else(|| AdaptarError::TensorNotFound(name.to_string()))?;
    let base_desc = match base {
        Some(source) => source.tensor_desc(name)?.ok_or_else(|| {
            AdaptarError::TensorNotFound(format!("{name} (not in base model)"))
        })?,
        None => target,
    };

    let mut ctx = ScratchContext::new(MAX_GRAPH_NODES);

    let mut down = backend.alloc_buffer(unit.down.nbytes()?)?;
    adapter.read_payload(&unit.down.name, &mut down)?;
    ctx.bind(DOWN_NODE, down)?;

    let mut up = backend.alloc_buffer(unit.up.nbytes()?)?;
    adapter.read_payload(&unit.up.name, &mut up)?;
    ctx.bind(UP_NODE, up)?;

    let mut base_data = backend.alloc_buffer(base_desc.nbytes()?)?;
    match base {
        Some(source) => source.load_tensor_data(name, &mut base_data)?,
        None => {
            let live = model
                .tensor_data(name)
                .ok_or_else(|| AdaptarError::TensorNotFound(name.to_string()))?;
            if live.len() != base_data.len() {
                return Err(AdaptarError::InvalidShape {
                    reason: format!(
                        "tensor '{name}' holds {} bytes, {target:?} needs {}",
                        live.len(),
                        base_data.len()
                    ),
                });
            }
            base_data.copy_from_slice(live);
        },
    }
    ctx.bind(BASE_NODE, base_data)?;

    if base_desc.dtype.is_quantized() && !state.warned_quantized_base {
        warn!(
            tensor = name,
            dtype = %base_desc.dtype,
            "applying a LoRA adapter to quantized weights may reduce quality; \
             supply an f16 or f32 base model"
        );
        state.warned_quantized_base = true;
    }

    let expected = [unit.down.desc.ne[1], unit.up.desc.ne[1]];
    if base_desc.ne != expected {
        return Err(AdaptarError::ShapeMismatch {
            tensor: name.to_string(),
            expected,
            actual: base_desc.ne,
        });
    }
    if unit.down.desc.ne[0] != unit.up.desc.ne[0] {
        return Err(AdaptarError::InvalidShape {
            reason: format!(
                "factor ranks differ for '{name}': loraA has {}, loraB has {}",
                unit.down.desc.ne[0], unit.up.desc.ne[0]
            ),
        });
    }
    if base_desc.ne != target.ne {
        return Err(AdaptarError::ShapeMismatch {
            tensor: name.to_string(),
            expected: target.ne,
            actual: base_desc.ne,
        });
    }

    let graph = build_merge_graph(unit.down.desc, unit.up.desc, base_desc, scaling, target.dtype);
    backend.compute(&graph, &mut ctx)?;

    let output = ctx
        .get(graph.output())
        .ok_or_else(|| AdaptarError::InvalidShape {
            reason: format!("merge graph for '{name}' produced no output"),
        })?;
    model.write_tensor_data(name, output)?;

    debug!(
        tensor = name,
        rank = unit.down.desc.ne[0],
        ne0 = target.ne[0],
        ne1 = target.ne[1],
        nodes = graph.len(),
        "merged tensor"
    );
    Ok(())
}
