//! GGUF model parsing
//!
//! Parses the header, metadata and tensor-info sections of a GGUF v3 file.
//! Tensor payloads are not copied; callers slice them out of the original
//! buffer (or memory map) with [`GGUFModel::tensor_bytes`].

use std::collections::HashMap;
use std::io::Cursor;

use super::io;
use super::types::{
    GGUFHeader, GGUFModel, GGUFValue, TensorInfo, GGUF_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION_V3,
};
use crate::error::{AdaptarError, Result};
use crate::tensor::{ElementType, TensorDesc};

/// No model has more tensors than this; larger counts mean a corrupted header
const MAX_TENSOR_COUNT: u64 = 100_000;
/// Upper bound on metadata entries
const MAX_METADATA_COUNT: u64 = 10_000;
/// Upper bound on metadata array length
const MAX_ARRAY_LEN: u64 = 10_000_000;
/// Tensors have at most 8 dimensions (typically 1-4)
const MAX_DIMS: u32 = 8;

impl GGUFModel {
    /// Parse GGUF file from bytes
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Invalid magic number
    /// - Unsupported version
    /// - Malformed data
    ///
    /// # Examples
    ///
    /// ```rust,ignore
    /// let data = std::fs::read("model.gguf")?;
    /// let model = GGUFModel::from_bytes(&data)?;
    /// println!("Loaded {} tensors", model.tensors.len());
    /// ```
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(data);

        let header = Self::parse_header(&mut cursor)?;
        let metadata = Self::parse_metadata(&mut cursor, header.metadata_count)?;
        let tensors = Self::parse_tensor_info(&mut cursor, header.tensor_count)?;

        // Tensor data starts at the next 32-byte boundary
        let current_pos = cursor.position() as usize;
        let tensor_data_start = current_pos.div_ceil(GGUF_ALIGNMENT) * GGUF_ALIGNMENT;

        Ok(Self {
            header,
            metadata,
            tensors,
            tensor_data_start,
        })
    }

    fn parse_header(cursor: &mut Cursor<&[u8]>) -> Result<GGUFHeader> {
        let magic = io::read_u32(cursor)?;
        if magic != GGUF_MAGIC {
            return Err(AdaptarError::FormatError {
                reason: format!("Invalid GGUF magic: 0x{magic:08X}, expected 0x{GGUF_MAGIC:08X}"),
            });
        }

        let version = io::read_u32(cursor)?;
        if version != GGUF_VERSION_V3 {
            return Err(AdaptarError::FormatError {
                reason: format!("Unsupported GGUF version: {version}, only v3 supported"),
            });
        }

        let tensor_count = io::read_u64(cursor)?;
        if tensor_count > MAX_TENSOR_COUNT {
            return Err(AdaptarError::FormatError {
                reason: format!(
                    "tensor_count {tensor_count} exceeds maximum allowed {MAX_TENSOR_COUNT} (corrupted header?)"
                ),
            });
        }

        let metadata_count = io::read_u64(cursor)?;
        if metadata_count > MAX_METADATA_COUNT {
            return Err(AdaptarError::FormatError {
                reason: format!(
                    "metadata_count {metadata_count} exceeds maximum allowed {MAX_METADATA_COUNT} (corrupted header?)"
                ),
            });
        }

        Ok(GGUFHeader {
            magic,
            version,
            tensor_count,
            metadata_count,
        })
    }

    fn parse_metadata(
        cursor: &mut Cursor<&[u8]>,
        count: u64,
    ) -> Result<HashMap<String, GGUFValue>> {
        let mut metadata = HashMap::new();

        for _ in 0..count {
            let key = Self::read_string(cursor)?;
            let value_type = io::read_u32(cursor)?;
            let value = Self::read_value(cursor, value_type)?;
            metadata.insert(key, value);
        }

        Ok(metadata)
    }

    /// Read a string: u64 length + UTF-8 bytes
    fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String> {
        let len_u64 = io::read_u64(cursor)?;
        let len = usize::try_from(len_u64).map_err(|_| AdaptarError::FormatError {
            reason: format!("String length {len_u64} exceeds platform usize limit"),
        })?;

        let remaining = cursor.get_ref().len() as u64 - cursor.position();
        if len_u64 > remaining {
            return Err(AdaptarError::FormatError {
                reason: format!("String length {len} exceeds remaining {remaining} bytes"),
            });
        }

        let start = cursor.position() as usize;
        let bytes = cursor.get_ref()[start..start + len].to_vec();
        cursor.set_position((start + len) as u64);

        String::from_utf8(bytes).map_err(|e| AdaptarError::FormatError {
            reason: format!("invalid UTF-8 in string: {e}"),
        })
    }

    fn read_value(cursor: &mut Cursor<&[u8]>, value_type: u32) -> Result<GGUFValue> {
        match value_type {
            0 => Ok(GGUFValue::UInt8(io::read_u8(cursor)?)),
            1 => Ok(GGUFValue::Int8(io::read_i8(cursor)?)),
            2 => Ok(GGUFValue::UInt16(io::read_u16(cursor)?)),
            3 => Ok(GGUFValue::Int16(io::read_i16(cursor)?)),
            4 => Ok(GGUFValue::UInt32(io::read_u32(cursor)?)),
            5 => Ok(GGUFValue::Int32(io::read_i32(cursor)?)),
            6 => Ok(GGUFValue::Float32(io::read_f32(cursor)?)),
            7 => Ok(GGUFValue::Bool(io::read_bool(cursor)?)),
            8 => Ok(GGUFValue::String(Self::read_string(cursor)?)),
            9 => {
                // Array: element_type (u32) + array_len (u64) + elements
                let element_type = io::read_u32(cursor)?;
                let array_len = io::read_u64(cursor)?;
                if array_len > MAX_ARRAY_LEN {
                    return Err(AdaptarError::FormatError {
                        reason: format!(
                            "Array length {array_len} exceeds maximum {MAX_ARRAY_LEN} (corrupted?)"
                        ),
                    });
                }

                let mut elements = Vec::with_capacity(array_len as usize);
                for _ in 0..array_len {
                    elements.push(Self::read_value(cursor, element_type)?);
                }
                Ok(GGUFValue::Array(elements))
            },
            10 => Ok(GGUFValue::UInt64(io::read_u64(cursor)?)),
            11 => Ok(GGUFValue::Int64(io::read_i64(cursor)?)),
            12 => Ok(GGUFValue::Float64(io::read_f64(cursor)?)),
            _ => Err(AdaptarError::FormatError {
                reason: format!("Unsupported metadata value type: {value_type}"),
            }),
        }
    }

    fn parse_tensor_info(cursor: &mut Cursor<&[u8]>, count: u64) -> Result<Vec<TensorInfo>> {
        let mut tensors = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let name = Self::read_string(cursor)?;

            let n_dims = io::read_u32(cursor)?;
            if n_dims > MAX_DIMS {
                return Err(AdaptarError::FormatError {
                    reason: format!(
                        "tensor '{name}' has {n_dims} dimensions, max allowed is {MAX_DIMS} (corrupted?)"
                    ),
                });
            }

            // Kept in GGML order: dims[0] is the contiguous extent
            let mut dims = Vec::with_capacity(n_dims as usize);
            for _ in 0..n_dims {
                dims.push(io::read_u64(cursor)?);
            }

            let qtype = io::read_u32(cursor)?;
            let offset = io::read_u64(cursor)?;

            tensors.push(TensorInfo {
                name,
                n_dims,
                dims,
                qtype,
                offset,
            });
        }

        Ok(tensors)
    }

    /// Look up tensor info by name
    #[must_use]
    pub fn find_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    /// Slice a tensor's encoded bytes out of the file buffer
    ///
    /// # Errors
    ///
    /// Returns error if the element type is unknown, the extents overflow,
    /// or the data range lies outside `file_data`.
    pub fn tensor_bytes<'a>(&self, info: &TensorInfo, file_data: &'a [u8]) -> Result<&'a [u8]> {
        let desc = info.desc()?;
        let size = desc.nbytes()?;
        let start = usize::try_from(info.offset)
            .ok()
            .and_then(|off| off.checked_add(self.tensor_data_start))
            .ok_or_else(|| AdaptarError::FormatError {
                reason: format!("tensor '{}' offset {} overflows", info.name, info.offset),
            })?;
        let end = start.checked_add(size).filter(|&end| end <= file_data.len()).ok_or_else(|| {
            AdaptarError::FormatError {
                reason: format!(
                    "tensor '{}' data range [{start}, {start}+{size}) exceeds file size {}",
                    info.name,
                    file_data.len()
                ),
            }
        })?;
        Ok(&file_data[start..end])
    }

    /// Extract model architecture from metadata
    #[must_use]
    pub fn architecture(&self) -> Option<&str> {
        match self.metadata.get("general.architecture") {
            Some(GGUFValue::String(arch)) => Some(arch.as_str()),
            _ => None,
        }
    }
}

impl TensorInfo {
    /// Element type and extents of this tensor
    ///
    /// Extents past the second are folded into `ne[1]`; the tensor is treated
    /// as `ne[1]` rows of `dims[0]` elements.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown element type code or overflowing extents.
    pub fn desc(&self) -> Result<TensorDesc> {
        let dtype = ElementType::from_ggml(self.qtype).ok_or_else(|| AdaptarError::FormatError {
            reason: format!("tensor '{}' has unknown element type {}", self.name, self.qtype),
        })?;

        let to_usize = |d: u64| {
            usize::try_from(d).map_err(|_| AdaptarError::InvalidShape {
                reason: format!("tensor '{}' extent {d} exceeds usize", self.name),
            })
        };
        let ne0 = match self.dims.first() {
            Some(&d) => to_usize(d)?,
            None => 1,
        };
        let mut ne1 = 1usize;
        for &d in self.dims.iter().skip(1) {
            ne1 = ne1.checked_mul(to_usize(d)?).ok_or_else(|| AdaptarError::InvalidShape {
                reason: format!("tensor '{}' extents overflow: {:?}", self.name, self.dims),
            })?;
        }

        Ok(TensorDesc::new(dtype, [ne0, ne1]))
    }
}
