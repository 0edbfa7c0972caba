//! GGUF container types
//!
//! Only what the adapter merge needs from a GGUF file: the header, the
//! metadata table (kept so the architecture can be logged), and the tensor
//! directory used to locate target and base weights. Element type codes live
//! on [`crate::tensor::ElementType`].

use std::collections::HashMap;

/// `"GGUF"` read as a little-endian u32
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// The only container version accepted
pub const GGUF_VERSION_V3: u32 = 3;

/// Tensor data section and every payload in it start on this boundary
pub const GGUF_ALIGNMENT: usize = 32;

/// GGUF metadata value types
#[derive(Debug, Clone, PartialEq)]
pub enum GGUFValue {
    /// Unsigned 8-bit integer
    UInt8(u8),
    /// Signed 8-bit integer
    Int8(i8),
    /// Unsigned 16-bit integer
    UInt16(u16),
    /// Signed 16-bit integer
    Int16(i16),
    /// Unsigned 32-bit integer
    UInt32(u32),
    /// Signed 32-bit integer
    Int32(i32),
    /// 32-bit floating point
    Float32(f32),
    /// Boolean
    Bool(bool),
    /// UTF-8 string
    String(String),
    /// Array of values
    Array(Vec<GGUFValue>),
    /// Unsigned 64-bit integer
    UInt64(u64),
    /// Signed 64-bit integer
    Int64(i64),
    /// 64-bit floating point
    Float64(f64),
}

/// GGUF file header
#[derive(Debug, Clone, PartialEq)]
pub struct GGUFHeader {
    /// Magic number (must be `GGUF_MAGIC`)
    pub magic: u32,
    /// Format version
    pub version: u32,
    /// Number of tensors in the file
    pub tensor_count: u64,
    /// Number of metadata key-value pairs
    pub metadata_count: u64,
}

/// Tensor information
#[derive(Debug, Clone, PartialEq)]
pub struct TensorInfo {
    /// Tensor name
    pub name: String,
    /// Number of dimensions
    pub n_dims: u32,
    /// Extents in GGML order (`dims[0]` is contiguous)
    pub dims: Vec<u64>,
    /// GGML element type code
    pub qtype: u32,
    /// Offset of the tensor data relative to `tensor_data_start`
    pub offset: u64,
}

/// GGUF model container
#[derive(Debug, Clone)]
pub struct GGUFModel {
    /// File header
    pub header: GGUFHeader,
    /// Metadata key-value pairs
    pub metadata: HashMap<String, GGUFValue>,
    /// Tensor information, in file order
    pub tensors: Vec<TensorInfo>,
    /// Offset where tensor data starts (after header/metadata/tensor_info + alignment)
    pub tensor_data_start: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_constant() {
        // "GGUF" read as little-endian u32
        assert_eq!(GGUF_MAGIC.to_le_bytes(), *b"GGUF");
    }

    #[test]
    fn test_alignment_constant() {
        assert_eq!(GGUF_ALIGNMENT, 32);
        assert_eq!(GGUF_ALIGNMENT & (GGUF_ALIGNMENT - 1), 0);
    }

    #[test]
    fn test_tensor_info() {
        let info = TensorInfo {
            name: "blk.0.attn_q.weight".to_string(),
            n_dims: 2,
            dims: vec![4096, 4096],
            qtype: 12,
            offset: 1024,
        };
        assert_eq!(info.name, "blk.0.attn_q.weight");
        assert_eq!(info.dims, vec![4096, 4096]);
        assert_eq!(info.qtype, 12);
    }
}
