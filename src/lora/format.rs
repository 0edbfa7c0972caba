//! Adapter file format
//!
//! Layout (all integers little-endian, 4 bytes):
//!
//! ```text
//! magic   u32   "ggla"
//! version u32   1
//! rank    u32
//! alpha   u32
//! repeated until end-of-file:
//!   n_dims    i32          1 or 2
//!   name_len  i32
//!   elem_type i32          0 = f32, 1 = f16
//!   ne        n_dims x i32 missing extents are 1
//!   name      name_len bytes, ends in ".loraA" or ".loraB"
//!   padding to the next 32-byte boundary
//!   payload   ne[0] * ne[1] elements, row-major
//! ```

use std::collections::HashMap;
use std::path::Path;

use super::reader::BinaryReader;
use crate::error::{AdaptarError, Result};
use crate::tensor::{ElementType, TensorDesc};

/// Adapter file magic: "ggla" as a big-endian multi-char constant
pub const LORA_MAGIC: u32 = 0x6767_6c61;

/// Only supported adapter file version
pub const LORA_VERSION: u32 = 1;

/// Payload alignment in bytes
pub const LORA_ALIGNMENT: u64 = 32;

/// Size of a GGML tensor name buffer, terminator included
///
/// A record name must be shorter than this.
pub const MAX_TENSOR_NAME_LEN: usize = 64;

/// Suffix of the down-projection factor
pub const LORA_A_SUFFIX: &str = ".loraA";

/// Suffix of the up-projection factor
pub const LORA_B_SUFFIX: &str = ".loraB";

/// Which half of a low-rank pair a record holds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FactorKind {
    /// `loraA`, the down-projection factor
    Down,
    /// `loraB`, the up-projection factor
    Up,
}

impl FactorKind {
    /// Classify a record name by suffix
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        if name.ends_with(LORA_A_SUFFIX) {
            Some(Self::Down)
        } else if name.ends_with(LORA_B_SUFFIX) {
            Some(Self::Up)
        } else {
            None
        }
    }

    /// Name suffix for this factor
    #[must_use]
    pub fn suffix(self) -> &'static str {
        match self {
            Self::Down => LORA_A_SUFFIX,
            Self::Up => LORA_B_SUFFIX,
        }
    }
}

/// Adapter file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdapterHeader {
    /// File magic (always [`LORA_MAGIC`] once parsed)
    pub magic: u32,
    /// Format version (always [`LORA_VERSION`] once parsed)
    pub version: u32,
    /// Rank `r` of the factorization
    pub rank: u32,
    /// Alpha hyperparameter
    pub alpha: u32,
}

impl AdapterHeader {
    /// Effective scaling: `user_scale * alpha / rank`
    #[must_use]
    pub fn scaling(&self, user_scale: f32) -> f32 {
        user_scale * self.alpha as f32 / self.rank as f32
    }
}

/// One factor tensor stored in the adapter file
#[derive(Debug, Clone, PartialEq)]
pub struct TensorRecord {
    /// Full record name including the factor suffix
    pub name: String,
    /// Down or up factor
    pub kind: FactorKind,
    /// Element type and extents
    pub desc: TensorDesc,
    /// Absolute file offset of the payload (32-byte aligned)
    pub offset: u64,
}

impl TensorRecord {
    /// Name with the factor suffix removed
    #[must_use]
    pub fn base_name(&self) -> &str {
        &self.name[..self.name.len() - self.kind.suffix().len()]
    }

    /// Payload byte length
    ///
    /// # Errors
    ///
    /// Returns error if the extents overflow.
    pub fn nbytes(&self) -> Result<usize> {
        self.desc.nbytes()
    }
}

/// Map an adapter element-type code to an element type
fn element_type(code: i32) -> Option<ElementType> {
    match code {
        0 => Some(ElementType::F32),
        1 => Some(ElementType::F16),
        _ => None,
    }
}

/// Read and validate the adapter header
///
/// # Errors
///
/// Returns `FormatError` for a bad magic, unsupported version or zero rank,
/// and `IoError` if the file is shorter than the header.
pub fn read_header(reader: &mut BinaryReader) -> Result<AdapterHeader> {
    let magic = reader.read_u32()?;
    if magic != LORA_MAGIC {
        return Err(AdaptarError::FormatError {
            reason: format!("bad file magic 0x{magic:08X}, expected 0x{LORA_MAGIC:08X}"),
        });
    }

    let version = reader.read_u32()?;
    if version != LORA_VERSION {
        return Err(AdaptarError::FormatError {
            reason: format!("unsupported file version {version}"),
        });
    }

    let rank = reader.read_u32()?;
    let alpha = reader.read_u32()?;
    if rank == 0 {
        return Err(AdaptarError::FormatError {
            reason: "adapter rank must be positive".to_string(),
        });
    }

    Ok(AdapterHeader {
        magic,
        version,
        rank,
        alpha,
    })
}

fn read_extent(reader: &mut BinaryReader, index: usize) -> Result<usize> {
    let value = reader.read_i32()?;
    usize::try_from(value)
        .ok()
        .filter(|&v| v > 0)
        .ok_or_else(|| AdaptarError::FormatError {
            reason: format!("invalid tensor extent {value} in record {index}"),
        })
}

/// Read one tensor record and skip past its payload
fn read_record(reader: &mut BinaryReader, index: usize) -> Result<TensorRecord> {
    let n_dims = reader.read_i32()?;
    let name_len = reader.read_i32()?;
    let type_code = reader.read_i32()?;

    if n_dims != 1 && n_dims != 2 {
        return Err(AdaptarError::FormatError {
            reason: format!("unsupported tensor dimension {n_dims} in record {index}"),
        });
    }

    let mut ne = [1usize; 2];
    for extent in ne.iter_mut().take(n_dims as usize) {
        *extent = read_extent(reader, index)?;
    }

    let name_len = usize::try_from(name_len)
        .ok()
        .filter(|&len| len < MAX_TENSOR_NAME_LEN)
        .ok_or_else(|| AdaptarError::FormatError {
            reason: format!(
                "tensor name length {name_len} in record {index} outside 0..{MAX_TENSOR_NAME_LEN}"
            ),
        })?;
    let mut name_buf = vec![0u8; name_len];
    reader.read_raw(&mut name_buf)?;
    let name = String::from_utf8(name_buf).map_err(|e| AdaptarError::FormatError {
        reason: format!("tensor name in record {index} is not UTF-8: {e}"),
    })?;

    let kind = FactorKind::from_name(&name).ok_or_else(|| AdaptarError::FormatError {
        reason: format!("'{name}' is not a lora tensor"),
    })?;

    let dtype = element_type(type_code).ok_or_else(|| AdaptarError::FormatError {
        reason: format!("invalid tensor data type {type_code} for '{name}'"),
    })?;

    let desc = TensorDesc::new(dtype, ne);
    let nbytes = desc.nbytes()? as u64;

    let offset = reader.tell()?.div_ceil(LORA_ALIGNMENT) * LORA_ALIGNMENT;
    let end = offset.checked_add(nbytes).filter(|&end| end <= reader.size()).ok_or_else(|| {
        AdaptarError::FormatError {
            reason: format!(
                "tensor '{name}' payload [{offset}, {offset}+{nbytes}) extends past end of file ({} bytes)",
                reader.size()
            ),
        }
    })?;
    reader.seek(end)?;

    Ok(TensorRecord {
        name,
        kind,
        desc,
        offset,
    })
}

/// Read tensor records until the cursor reaches end-of-file
///
/// Records are keyed by full name; a later record with a repeated name
/// replaces the earlier one.
///
/// # Errors
///
/// Returns the first `FormatError` or `IoError` encountered.
pub fn scan_records(reader: &mut BinaryReader) -> Result<HashMap<String, TensorRecord>> {
    let mut records = HashMap::new();
    let mut index = 0usize;
    while reader.tell()? < reader.size() {
        let record = read_record(reader, index)?;
        records.insert(record.name.clone(), record);
        index += 1;
    }
    Ok(records)
}

/// A parsed adapter file with its payloads still on disk
#[derive(Debug)]
pub struct LoraAdapterFile {
    /// File header
    pub header: AdapterHeader,
    /// Factor records keyed by full name
    pub records: HashMap<String, TensorRecord>,
    reader: BinaryReader,
}

impl LoraAdapterFile {
    /// Open and parse an adapter file
    ///
    /// # Errors
    ///
    /// Returns `FileOpen`, `IoError` or `FormatError`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut reader = BinaryReader::open(path)?;
        let header = read_header(&mut reader)?;
        let records = scan_records(&mut reader)?;
        Ok(Self {
            header,
            records,
            reader,
        })
    }

    /// Effective scaling for a user scale
    #[must_use]
    pub fn scaling(&self, user_scale: f32) -> f32 {
        self.header.scaling(user_scale)
    }

    /// Look up a record by full name
    #[must_use]
    pub fn record(&self, name: &str) -> Option<&TensorRecord> {
        self.records.get(name)
    }

    /// Path of the adapter file
    #[must_use]
    pub fn path(&self) -> &Path {
        self.reader.path()
    }

    /// Read a record's payload into `dst`
    ///
    /// # Errors
    ///
    /// Returns `TensorNotFound`, `InvalidShape` if `dst` has the wrong
    /// length, or `IoError`.
    pub fn read_payload(&mut self, name: &str, dst: &mut [u8]) -> Result<()> {
        let record = self
            .records
            .get(name)
            .ok_or_else(|| AdaptarError::TensorNotFound(name.to_string()))?;
        let nbytes = record.nbytes()?;
        if dst.len() != nbytes {
            return Err(AdaptarError::InvalidShape {
                reason: format!(
                    "payload of '{name}' is {nbytes} bytes, destination holds {}",
                    dst.len()
                ),
            });
        }
        self.reader.seek(record.offset)?;
        self.reader.read_raw(dst)
    }
}
