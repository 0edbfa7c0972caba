//! Tensor metadata
//!
//! This module provides [`ElementType`] (the on-disk encoding of a tensor's
//! elements) and [`TensorDesc`] (element type plus extents). Extents are kept
//! in GGML order: `ne[0]` is the contiguous (innermost) dimension, so a 2-D
//! tensor is stored as `ne[1]` rows of `ne[0]` elements.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{AdaptarError, Result};

/// Element encoding of a tensor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(non_camel_case_types)]
pub enum ElementType {
    /// 32-bit IEEE float
    F32,
    /// 16-bit IEEE float
    F16,
    /// 4-bit, f16 scale, block of 32
    Q4_0,
    /// 4-bit, f16 scale + min, block of 32
    Q4_1,
    /// 5-bit, f16 scale, block of 32
    Q5_0,
    /// 5-bit, f16 scale + min, block of 32
    Q5_1,
    /// 8-bit, f16 scale, block of 32
    Q8_0,
    /// 2-bit K-quant, super-block of 256
    Q2_K,
    /// 3-bit K-quant, super-block of 256
    Q3_K,
    /// 4-bit K-quant, super-block of 256
    Q4_K,
    /// 5-bit K-quant, super-block of 256
    Q5_K,
    /// 6-bit K-quant, super-block of 256
    Q6_K,
}

impl ElementType {
    /// Every element type, in GGML code order
    pub const ALL: [Self; 12] = [
        Self::F32,
        Self::F16,
        Self::Q4_0,
        Self::Q4_1,
        Self::Q5_0,
        Self::Q5_1,
        Self::Q8_0,
        Self::Q2_K,
        Self::Q3_K,
        Self::Q4_K,
        Self::Q5_K,
        Self::Q6_K,
    ];

    /// Map a GGML type code to an element type
    #[must_use]
    pub fn from_ggml(code: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|dtype| dtype.ggml_code() == code)
    }

    /// GGML type code, as stored in GGUF tensor directories and adapter records
    #[must_use]
    pub fn ggml_code(self) -> u32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q4_0 => 2,
            Self::Q4_1 => 3,
            Self::Q5_0 => 6,
            Self::Q5_1 => 7,
            Self::Q8_0 => 8,
            Self::Q2_K => 10,
            Self::Q3_K => 11,
            Self::Q4_K => 12,
            Self::Q5_K => 13,
            Self::Q6_K => 14,
        }
    }

    /// Number of elements per encoded block
    #[must_use]
    pub fn block_size(self) -> usize {
        match self {
            Self::F32 | Self::F16 => 1,
            Self::Q4_0 | Self::Q4_1 | Self::Q5_0 | Self::Q5_1 | Self::Q8_0 => 32,
            Self::Q2_K | Self::Q3_K | Self::Q4_K | Self::Q5_K | Self::Q6_K => 256,
        }
    }

    /// Bytes per encoded block
    #[must_use]
    pub fn block_bytes(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::F16 => 2,
            Self::Q4_0 => 18,
            Self::Q4_1 => 20,
            Self::Q5_0 => 22,
            Self::Q5_1 => 24,
            Self::Q8_0 => 34,
            Self::Q2_K => 84,
            Self::Q3_K => 110,
            Self::Q4_K => 144,
            Self::Q5_K => 176,
            Self::Q6_K => 210,
        }
    }

    /// True for every reduced-precision, non-floating encoding
    #[must_use]
    pub fn is_quantized(self) -> bool {
        !matches!(self, Self::F32 | Self::F16)
    }
}

impl fmt::Display for ElementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q4_0 => "q4_0",
            Self::Q4_1 => "q4_1",
            Self::Q5_0 => "q5_0",
            Self::Q5_1 => "q5_1",
            Self::Q8_0 => "q8_0",
            Self::Q2_K => "q2_K",
            Self::Q3_K => "q3_K",
            Self::Q4_K => "q4_K",
            Self::Q5_K => "q5_K",
            Self::Q6_K => "q6_K",
        };
        f.pad(name)
    }
}

/// Element type and extents of a tensor (at most two dimensions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorDesc {
    /// Element encoding
    pub dtype: ElementType,
    /// Extents in GGML order, unused trailing extents are 1
    pub ne: [usize; 2],
}

impl TensorDesc {
    /// Create a descriptor
    #[must_use]
    pub fn new(dtype: ElementType, ne: [usize; 2]) -> Self {
        Self { dtype, ne }
    }

    /// Total element count
    #[must_use]
    pub fn nelements(&self) -> usize {
        self.ne[0] * self.ne[1]
    }

    /// Encoded byte length
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if the row length is not a whole number of
    /// blocks or the size overflows `usize`.
    pub fn nbytes(&self) -> Result<usize> {
        let block = self.dtype.block_size();
        if self.ne[0] % block != 0 {
            return Err(AdaptarError::InvalidShape {
                reason: format!(
                    "row length {} is not a multiple of the {} block size {}",
                    self.ne[0], self.dtype, block
                ),
            });
        }
        (self.ne[0] / block)
            .checked_mul(self.dtype.block_bytes())
            .and_then(|row| row.checked_mul(self.ne[1]))
            .ok_or_else(|| AdaptarError::InvalidShape {
                reason: format!("tensor size overflows: {:?} x {}", self.ne, self.dtype),
            })
    }
}
