//! GGUF Test Factory - Synthesizes valid GGUF files in memory
//!
//! `GGUFBuilder` creates valid GGUF v3 files without real model files, for
//! tests, benchmarks and fixtures that need a target or base model.
//!
//! # Example
//!
//! ```
//! use adaptar::gguf::{GGUFBuilder, GGUFModel};
//!
//! let data = GGUFBuilder::new()
//!     .architecture("llama")
//!     .add_f32_tensor("blk.0.attn_q.weight", &[4, 4], &[0.0; 16])
//!     .build();
//!
//! let model = GGUFModel::from_bytes(&data).unwrap();
//! assert_eq!(model.tensors.len(), 1);
//! ```

use super::types::{GGUF_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_V3};
use crate::quantize;
use crate::tensor::ElementType;

/// Builder for creating valid GGUF v3 files in memory
pub struct GGUFBuilder {
    /// Metadata key-value pairs (key, type, value_bytes)
    metadata: Vec<(String, u32, Vec<u8>)>,
    /// Tensor entries (name, GGML-order dims, type code, data)
    tensors: Vec<(String, Vec<u64>, u32, Vec<u8>)>,
}

impl Default for GGUFBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GGUFBuilder {
    /// Create a new GGUF builder
    #[must_use]
    pub fn new() -> Self {
        Self {
            metadata: Vec::new(),
            tensors: Vec::new(),
        }
    }

    /// Add a string metadata value
    #[must_use]
    pub fn add_string(mut self, key: &str, value: &str) -> Self {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&(value.len() as u64).to_le_bytes());
        bytes.extend_from_slice(value.as_bytes());
        self.metadata.push((key.to_string(), 8, bytes)); // type 8 = string
        self
    }

    /// Add a u32 metadata value
    #[must_use]
    pub fn add_u32(mut self, key: &str, value: u32) -> Self {
        self.metadata
            .push((key.to_string(), 4, value.to_le_bytes().to_vec())); // type 4 = u32
        self
    }

    /// Set architecture (shorthand for general.architecture)
    #[must_use]
    pub fn architecture(self, arch: &str) -> Self {
        self.add_string("general.architecture", arch)
    }

    /// Add a tensor with pre-encoded bytes
    ///
    /// `dims` are in GGML order (contiguous extent first).
    #[must_use]
    pub fn add_tensor(self, name: &str, dims: &[u64], dtype: ElementType, data: &[u8]) -> Self {
        self.add_raw_tensor(name, dims, dtype.ggml_code(), data)
    }

    /// Add a tensor with an arbitrary GGML type code
    #[must_use]
    pub fn add_raw_tensor(mut self, name: &str, dims: &[u64], qtype: u32, data: &[u8]) -> Self {
        self.tensors
            .push((name.to_string(), dims.to_vec(), qtype, data.to_vec()));
        self
    }

    /// Add an F32 tensor
    #[must_use]
    pub fn add_f32_tensor(self, name: &str, dims: &[u64], data: &[f32]) -> Self {
        let bytes: Vec<u8> = data.iter().flat_map(|f| f.to_le_bytes()).collect();
        self.add_tensor(name, dims, ElementType::F32, &bytes)
    }

    /// Add an F16 tensor, converting from f32
    #[must_use]
    pub fn add_f16_tensor(self, name: &str, dims: &[u64], data: &[f32]) -> Self {
        let bytes: Vec<u8> = data
            .iter()
            .flat_map(|&f| half::f16::from_f32(f).to_le_bytes())
            .collect();
        self.add_tensor(name, dims, ElementType::F16, &bytes)
    }

    /// Add a Q8_0 tensor, quantizing from f32
    ///
    /// # Panics
    ///
    /// Panics if `data.len()` is not a multiple of 32.
    #[must_use]
    pub fn add_q8_0_tensor(self, name: &str, dims: &[u64], data: &[f32]) -> Self {
        let bytes = quantize::quantize_q8_0(data).expect("Q8_0 data must be whole blocks");
        self.add_tensor(name, dims, ElementType::Q8_0, &bytes)
    }

    /// Build the GGUF file as a byte vector
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let mut data = Vec::new();

        // Header
        data.extend_from_slice(&GGUF_MAGIC.to_le_bytes());
        data.extend_from_slice(&GGUF_VERSION_V3.to_le_bytes());
        data.extend_from_slice(&(self.tensors.len() as u64).to_le_bytes());
        data.extend_from_slice(&(self.metadata.len() as u64).to_le_bytes());

        // Metadata
        for (key, value_type, value_bytes) in &self.metadata {
            data.extend_from_slice(&(key.len() as u64).to_le_bytes());
            data.extend_from_slice(key.as_bytes());
            data.extend_from_slice(&value_type.to_le_bytes());
            data.extend_from_slice(value_bytes);
        }

        // Tensor info; each payload starts on an aligned offset
        let mut offsets = Vec::with_capacity(self.tensors.len());
        let mut tensor_data_offset = 0usize;
        for (name, dims, qtype, tensor_bytes) in &self.tensors {
            data.extend_from_slice(&(name.len() as u64).to_le_bytes());
            data.extend_from_slice(name.as_bytes());
            data.extend_from_slice(&(dims.len() as u32).to_le_bytes());
            for dim in dims {
                data.extend_from_slice(&dim.to_le_bytes());
            }
            data.extend_from_slice(&qtype.to_le_bytes());
            data.extend_from_slice(&(tensor_data_offset as u64).to_le_bytes());

            offsets.push(tensor_data_offset);
            tensor_data_offset =
                (tensor_data_offset + tensor_bytes.len()).div_ceil(GGUF_ALIGNMENT) * GGUF_ALIGNMENT;
        }

        let aligned = data.len().div_ceil(GGUF_ALIGNMENT) * GGUF_ALIGNMENT;
        data.resize(aligned, 0);
        let data_start = data.len();

        for ((_, _, _, tensor_bytes), offset) in self.tensors.iter().zip(offsets) {
            data.resize(data_start + offset, 0);
            data.extend_from_slice(tensor_bytes);
        }

        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gguf::GGUFModel;

    #[test]
    fn test_payloads_are_aligned() {
        let data = GGUFBuilder::new()
            .add_f32_tensor("a", &[3], &[1.0, 2.0, 3.0])
            .add_f32_tensor("b", &[2], &[4.0, 5.0])
            .build();
        let model = GGUFModel::from_bytes(&data).unwrap();
        let b = model.find_tensor("b").unwrap();
        assert_eq!(b.offset % GGUF_ALIGNMENT as u64, 0);
        let bytes = model.tensor_bytes(b, &data).unwrap();
        assert_eq!(&bytes[0..4], &4.0f32.to_le_bytes());
    }

    #[test]
    fn test_metadata_roundtrip() {
        let data = GGUFBuilder::new()
            .architecture("llama")
            .add_u32("llama.block_count", 2)
            .build();
        let model = GGUFModel::from_bytes(&data).unwrap();
        assert_eq!(model.header.metadata_count, 2);
        assert_eq!(model.architecture(), Some("llama"));
    }
}
