//! Memory-mapped GGUF model
//!
//! `MappedGGUFModel` parses only the metadata sections of a GGUF file and
//! leaves tensor data in the mapping, so a multi-gigabyte base model costs
//! nothing until individual tensors are read. It serves as the
//! higher-precision base source during a merge pass.

use std::fs::File;
use std::path::{Path, PathBuf};

use memmap2::Mmap;

use super::types::{GGUFModel, TensorInfo};
use crate::error::{AdaptarError, Result};
use crate::lora::BaseModelSource;
use crate::tensor::TensorDesc;

/// Memory-mapped GGUF model for zero-copy tensor access
///
/// # Example
///
/// ```rust,ignore
/// let base = MappedGGUFModel::from_path("llama-7b-f16.gguf")?;
/// println!("Mapped {} tensors", base.model.tensors.len());
/// ```
pub struct MappedGGUFModel {
    /// Parsed model metadata (header, tensors, etc.)
    pub model: GGUFModel,
    /// Path the mapping was created from
    path: PathBuf,
    /// Memory-mapped file contents
    mmap: Mmap,
}

impl MappedGGUFModel {
    /// Load GGUF model via memory mapping (zero-copy)
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be opened
    /// - Memory mapping fails
    /// - GGUF parsing fails (invalid format)
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| AdaptarError::FileOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        // SAFETY: the mapping is read-only and the file is not modified while
        // mapped by this process.
        let mmap = unsafe {
            Mmap::map(&file).map_err(|e| AdaptarError::AllocationError {
                reason: format!("Failed to mmap {}: {}", path.display(), e),
            })?
        };

        let model = GGUFModel::from_bytes(&mmap)?;

        Ok(Self {
            model,
            path: path.to_path_buf(),
            mmap,
        })
    }

    /// Get the raw memory-mapped file data
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }

    /// Path of the mapped file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the size of the memory-mapped file
    #[must_use]
    pub fn file_size(&self) -> usize {
        self.mmap.len()
    }
}

impl BaseModelSource for MappedGGUFModel {
    fn tensor_desc(&self, name: &str) -> Result<Option<TensorDesc>> {
        self.model.find_tensor(name).map(TensorInfo::desc).transpose()
    }

    fn load_tensor_data(&self, name: &str, dst: &mut [u8]) -> Result<()> {
        let info = self
            .model
            .find_tensor(name)
            .ok_or_else(|| AdaptarError::TensorNotFound(name.to_string()))?;
        let src = self.model.tensor_bytes(info, &self.mmap)?;
        if src.len() != dst.len() {
            return Err(AdaptarError::InvalidShape {
                reason: format!(
                    "base tensor '{name}' is {} bytes, destination holds {}",
                    src.len(),
                    dst.len()
                ),
            });
        }
        dst.copy_from_slice(src);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::gguf::GGUFBuilder;
    use crate::tensor::ElementType;

    fn write_model(bytes: &[u8]) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(bytes).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn test_mapped_model_serves_tensor_data() {
        let data = GGUFBuilder::new()
            .add_f32_tensor("layer.weight", &[2, 2], &[1.0, 2.0, 3.0, 4.0])
            .build();
        let file = write_model(&data);

        let mapped = MappedGGUFModel::from_path(file.path()).unwrap();
        assert_eq!(mapped.file_size(), data.len());

        let desc = mapped.tensor_desc("layer.weight").unwrap().unwrap();
        assert_eq!(desc, TensorDesc::new(ElementType::F32, [2, 2]));

        let mut dst = vec![0u8; 16];
        mapped.load_tensor_data("layer.weight", &mut dst).unwrap();
        assert_eq!(&dst[12..16], &4.0f32.to_le_bytes());
    }

    #[test]
    fn test_missing_tensor() {
        let file = write_model(&GGUFBuilder::new().build());
        let mapped = MappedGGUFModel::from_path(file.path()).unwrap();
        assert!(mapped.tensor_desc("nope").unwrap().is_none());
        let err = mapped.load_tensor_data("nope", &mut []).unwrap_err();
        assert!(matches!(err, AdaptarError::TensorNotFound(_)));
    }

    #[test]
    fn test_destination_size_mismatch() {
        let data = GGUFBuilder::new()
            .add_f32_tensor("w", &[2], &[1.0, 2.0])
            .build();
        let file = write_model(&data);
        let mapped = MappedGGUFModel::from_path(file.path()).unwrap();
        let mut dst = vec![0u8; 4];
        assert!(mapped.load_tensor_data("w", &mut dst).is_err());
    }

    #[test]
    fn test_unknown_element_type_is_an_error_not_absence() {
        let data = GGUFBuilder::new()
            .add_raw_tensor("w", &[2], 42, &[0u8; 8])
            .build();
        let file = write_model(&data);
        let mapped = MappedGGUFModel::from_path(file.path()).unwrap();
        let err = mapped.tensor_desc("w").unwrap_err();
        assert!(matches!(err, AdaptarError::FormatError { .. }));
    }

    #[test]
    fn test_open_missing_file() {
        let err = MappedGGUFModel::from_path("/nonexistent/base.gguf").err().unwrap();
        assert!(matches!(err, AdaptarError::FileOpen { .. }));
    }
}
