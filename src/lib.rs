//! # Adaptar
//!
//! Pure Rust LoRA adapter merging for GGUF models.
//!
//! Adaptar (Spanish: "to adapt") applies a low-rank adapter file to a model
//! whose tensors are already in memory, folding `scale * alpha / rank *
//! (loraA x loraB)` into each matching weight so inference runs with no
//! extra cost.
//!
//! ## Features
//!
//! - **Adapter parsing**: the "ggla" adapter format (f32 and f16 factors)
//! - **Quantized targets**: merges into F32, F16, Q4_0, Q4_1 and Q8_0 tensors,
//!   re-quantizing the result
//! - **Base models**: optionally reads base weights from a memory-mapped,
//!   higher-precision GGUF file
//! - **Multi-threaded**: matrix products run on a dedicated rayon pool
//!
//! ## Example
//!
//! ```rust
//! use adaptar::{apply_lora, LoadedModel, LoraConfig, TensorDesc, ElementType};
//! use adaptar::lora::LoraFileBuilder;
//!
//! let mut model = LoadedModel::new();
//! model.insert("layer.weight", TensorDesc::new(ElementType::F32, [2, 2]), vec![0u8; 16])?;
//!
//! let dir = tempfile::tempdir().unwrap();
//! let adapter = dir.path().join("adapter.ggla");
//! LoraFileBuilder::new(1, 1)
//!     .add_f32("layer.weight.loraA", &[1, 2], &[1.0, 1.0])
//!     .add_f32("layer.weight.loraB", &[1, 2], &[1.0, 1.0])
//!     .write_to(&adapter)?;
//!
//! let report = apply_lora(&mut model, &adapter, &LoraConfig::default())?;
//! assert_eq!(report.merged, 1);
//! # Ok::<(), adaptar::AdaptarError>(())
//! ```
//!
//! ## Architecture
//!
//! - [`lora`]: adapter parser, tensor matcher, merge graph and merge engine
//! - [`backend`]: scratch memory and graph execution
//! - [`gguf`]: GGUF reader for target and base models
//! - [`quantize`]: element codecs used by the merge arithmetic

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
// Clippy allows (MUST come after deny/warn to override them)
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_wrap)] // extents fit in i32 by format
#![allow(clippy::cast_precision_loss)] // alpha / rank as f32
#![allow(clippy::cast_possible_truncation)] // u64 offsets -> usize on 64-bit hosts
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)] // Allow technical terms without backticks
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::float_cmp)] // scaling != 1.0 is an exact check
#![allow(clippy::too_many_arguments)]

pub mod backend;
pub mod config;
pub mod error;
pub mod gguf;
pub mod lora;
pub mod model;
pub mod quantize;
pub mod tensor;

// Re-exports for convenience
pub use backend::{ComputeBackend, CpuBackend};
pub use config::LoraConfig;
pub use error::{AdaptarError, Result};
pub use lora::{
    apply_lora, apply_lora_from_file, apply_lora_with_backend, apply_lora_with_options,
    BaseModelSource, MergeOptions, MergeReport,
};
pub use model::{LoadedModel, TensorRegistry};
pub use tensor::{ElementType, TensorDesc};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(VERSION.starts_with("0."));
        assert!(VERSION.contains('.'));
    }
}
