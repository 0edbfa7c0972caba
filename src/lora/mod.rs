//! LoRA adapter application
//!
//! Merges a low-rank adapter file into a model's weights at load time:
//! for every model tensor `W` with factors `W.loraA` and `W.loraB` in the
//! adapter,
//!
//! ```text
//! W = W + (scale * alpha / rank) * (loraA x loraB)
//! ```
//!
//! The update is computed in f32 from either the model's own weights or a
//! higher-precision base model, then written back in the model tensor's
//! element type.
//!
//! # Example
//!
//! ```no_run
//! use adaptar::{apply_lora, LoadedModel, LoraConfig};
//!
//! let mut model = LoadedModel::from_path("models/llama-7b-q8_0.gguf")?;
//! let config = LoraConfig::default()
//!     .with_scale(0.8)
//!     .with_base_model("models/llama-7b-f16.gguf");
//! let report = apply_lora(&mut model, "adapters/alpaca.ggla", &config)?;
//! println!("merged {} tensors in {:?}", report.merged, report.elapsed);
//! # Ok::<(), adaptar::AdaptarError>(())
//! ```

mod base;
pub mod format;
pub mod graph;
mod matcher;
mod merge;
mod reader;
pub mod test_factory;

use std::path::Path;
use std::time::Instant;

use tracing::{error, info};

pub use base::BaseModelSource;
pub use format::{AdapterHeader, FactorKind, LoraAdapterFile, TensorRecord};
pub use matcher::{find_pair, FactorPair};
pub use merge::{merge_adapter, MergeOptions, MergeReport, PROGRESS_INTERVAL};
pub use reader::BinaryReader;
pub use test_factory::LoraFileBuilder;

use crate::backend::{ComputeBackend, CpuBackend};
use crate::config::LoraConfig;
use crate::error::Result;
use crate::gguf::MappedGGUFModel;
use crate::model::TensorRegistry;
use merge::BackendGuard;

/// Apply an adapter file to `model` on the CPU backend
///
/// # Errors
///
/// Returns the first error of the pass. Tensors merged before the error
/// keep their new values.
pub fn apply_lora<R, P>(model: &mut R, adapter_path: P, config: &LoraConfig) -> Result<MergeReport>
where
    R: TensorRegistry + ?Sized,
    P: AsRef<Path>,
{
    apply_lora_with_options(model, adapter_path, config, MergeOptions::default())
}

/// [`apply_lora`] with per-pass hooks
///
/// # Errors
///
/// See [`apply_lora`]; also `BackendInit` if the CPU pool cannot start.
pub fn apply_lora_with_options<R, P>(
    model: &mut R,
    adapter_path: P,
    config: &LoraConfig,
    options: MergeOptions<'_>,
) -> Result<MergeReport>
where
    R: TensorRegistry + ?Sized,
    P: AsRef<Path>,
{
    config.validate()?;
    let mut backend = CpuBackend::new(config.threads)?;
    apply_lora_with_backend(model, adapter_path, config, &mut backend, options)
}

/// Apply an adapter using a caller-supplied backend
///
/// `backend.release()` is called exactly once before this returns, whether
/// the pass succeeds or fails.
///
/// # Errors
///
/// See [`apply_lora`].
pub fn apply_lora_with_backend<R, P>(
    model: &mut R,
    adapter_path: P,
    config: &LoraConfig,
    backend: &mut dyn ComputeBackend,
    options: MergeOptions<'_>,
) -> Result<MergeReport>
where
    R: TensorRegistry + ?Sized,
    P: AsRef<Path>,
{
    let adapter_path = adapter_path.as_ref();
    let start = Instant::now();
    info!(adapter = %adapter_path.display(), "applying LoRA adapter");

    let guard = BackendGuard::new(backend);
    let result = run_pass(model, adapter_path, config, guard.backend(), options);
    drop(guard);

    let mut report = result?;
    report.elapsed = start.elapsed();
    info!(
        merged = report.merged,
        skipped = report.skipped,
        scaling = report.scaling,
        elapsed_ms = report.elapsed.as_secs_f64() * 1000.0,
        "LoRA adapter applied"
    );
    Ok(report)
}

fn run_pass<R: TensorRegistry + ?Sized>(
    model: &mut R,
    adapter_path: &Path,
    config: &LoraConfig,
    backend: &dyn ComputeBackend,
    options: MergeOptions<'_>,
) -> Result<MergeReport> {
    let mut adapter = LoraAdapterFile::open(adapter_path)?;
    let scaling = adapter.scaling(config.scale);
    info!(
        rank = adapter.header.rank,
        alpha = adapter.header.alpha,
        scaling,
        records = adapter.records.len(),
        backend = backend.name(),
        "adapter parsed"
    );

    let base = match &config.base_model {
        Some(path) => {
            info!(base_model = %path.display(), "loading base model");
            Some(MappedGGUFModel::from_path(path)?)
        },
        None => None,
    };

    merge_adapter(
        model,
        &mut adapter,
        base.as_ref().map(|b| b as &dyn BaseModelSource),
        backend,
        scaling,
        options,
    )
}

/// Apply an adapter file and report a status code
///
/// Returns 0 on success and 1 on any failure. Failures are logged with
/// `tracing::error!`; the status code does not distinguish error kinds.
pub fn apply_lora_from_file<R: TensorRegistry + ?Sized>(
    model: &mut R,
    adapter_path: &Path,
    scale: f32,
    base_model: Option<&Path>,
    threads: usize,
) -> i32 {
    let mut config = LoraConfig::default().with_scale(scale).with_threads(threads);
    if let Some(base) = base_model {
        config = config.with_base_model(base);
    }

    match apply_lora(model, adapter_path, &config) {
        Ok(_) => 0,
        Err(e) => {
            error!(adapter = %adapter_path.display(), "failed to apply LoRA adapter: {e}");
            1
        },
    }
}
