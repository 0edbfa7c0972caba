//! Base model source
//!
//! When the target model holds reduced-precision weights, a separate
//! higher-precision copy can supply the base weights the delta is added to.

use crate::error::Result;
use crate::tensor::TensorDesc;

/// Metadata and data oracle for base weights, keyed by tensor name
///
/// Implemented by [`crate::gguf::MappedGGUFModel`] (memory-mapped, bytes
/// copied on demand) and [`crate::model::LoadedModel`].
pub trait BaseModelSource {
    /// Element type and extents of a tensor, or `None` if absent
    ///
    /// # Errors
    ///
    /// Returns error if the tensor exists but its metadata cannot be
    /// described (unknown element type, overflowing extents).
    fn tensor_desc(&self, name: &str) -> Result<Option<TensorDesc>>;

    /// Copy a tensor's encoded bytes into `dst`
    ///
    /// # Errors
    ///
    /// Returns error if the tensor is absent or `dst` has the wrong length.
    fn load_tensor_data(&self, name: &str, dst: &mut [u8]) -> Result<()>;
}
