//! LoRA Test Factory - Synthesizes adapter files in memory
//!
//! `LoraFileBuilder` writes the adapter layout byte-for-byte, including the
//! 32-byte payload alignment, so tests and benchmarks do not need real
//! adapters. `add_raw` bypasses all checks to produce malformed records.
//!
//! # Example
//!
//! ```
//! use adaptar::lora::LoraFileBuilder;
//!
//! let bytes = LoraFileBuilder::new(1, 1)
//!     .add_f32("layer.weight.loraA", &[1, 2], &[1.0, 1.0])
//!     .add_f32("layer.weight.loraB", &[1, 2], &[1.0, 1.0])
//!     .build();
//! assert_eq!(bytes.len() % 32, 0);
//! ```

use std::path::Path;

use half::f16;

use super::format::{LORA_ALIGNMENT, LORA_MAGIC, LORA_VERSION};
use crate::error::{AdaptarError, Result};

struct RawRecord {
    name: String,
    n_dims: i32,
    ne: Vec<i32>,
    type_code: i32,
    payload: Vec<u8>,
}

/// Builder for adapter files
pub struct LoraFileBuilder {
    magic: u32,
    version: u32,
    rank: u32,
    alpha: u32,
    records: Vec<RawRecord>,
}

impl LoraFileBuilder {
    /// Start an adapter with the given rank and alpha
    #[must_use]
    pub fn new(rank: u32, alpha: u32) -> Self {
        Self {
            magic: LORA_MAGIC,
            version: LORA_VERSION,
            rank,
            alpha,
            records: Vec::new(),
        }
    }

    /// Override the header version
    #[must_use]
    pub fn version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    /// Override the header magic
    #[must_use]
    pub fn magic(mut self, magic: u32) -> Self {
        self.magic = magic;
        self
    }

    fn extents(ne: &[usize]) -> Vec<i32> {
        ne.iter().map(|&n| n as i32).collect()
    }

    /// Add an f32 record; `ne` is in ggml order (1 or 2 extents)
    #[must_use]
    pub fn add_f32(self, name: &str, ne: &[usize], values: &[f32]) -> Self {
        let payload = values.iter().flat_map(|v| v.to_le_bytes()).collect::<Vec<_>>();
        self.add_raw(name, ne.len() as i32, &Self::extents(ne), 0, &payload)
    }

    /// Add an f16 record, converting `values` to half precision
    #[must_use]
    pub fn add_f16(self, name: &str, ne: &[usize], values: &[f32]) -> Self {
        let payload = values
            .iter()
            .flat_map(|&v| f16::from_f32(v).to_le_bytes())
            .collect::<Vec<_>>();
        self.add_raw(name, ne.len() as i32, &Self::extents(ne), 1, &payload)
    }

    /// Add a record with arbitrary header fields and payload
    #[must_use]
    pub fn add_raw(
        mut self,
        name: &str,
        n_dims: i32,
        ne: &[i32],
        type_code: i32,
        payload: &[u8],
    ) -> Self {
        self.records.push(RawRecord {
            name: name.to_string(),
            n_dims,
            ne: ne.to_vec(),
            type_code,
            payload: payload.to_vec(),
        });
        self
    }

    /// Serialize the adapter file
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.version.to_le_bytes());
        out.extend_from_slice(&self.rank.to_le_bytes());
        out.extend_from_slice(&self.alpha.to_le_bytes());

        for record in self.records {
            out.extend_from_slice(&record.n_dims.to_le_bytes());
            out.extend_from_slice(&(record.name.len() as i32).to_le_bytes());
            out.extend_from_slice(&record.type_code.to_le_bytes());
            for extent in &record.ne {
                out.extend_from_slice(&extent.to_le_bytes());
            }
            out.extend_from_slice(record.name.as_bytes());

            let align = LORA_ALIGNMENT as usize;
            out.resize(out.len().div_ceil(align) * align, 0);
            out.extend_from_slice(&record.payload);
        }
        out
    }

    /// Serialize and write the adapter file to `path`
    ///
    /// # Errors
    ///
    /// Returns `IoError` if the file cannot be written.
    pub fn write_to<P: AsRef<Path>>(self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.build())
            .map_err(|e| AdaptarError::io(format!("write {}", path.display()), &e))
    }
}
