//! In-memory target model
//!
//! [`LoadedModel`] is the named-tensor registry an adapter is merged into.
//! The merge engine only sees it through [`TensorRegistry`]: it reads
//! metadata and bytes, and overwrites bytes in place. Tensor storage is
//! never resized.

use std::collections::HashMap;
use std::path::Path;

use crate::error::{AdaptarError, Result};
use crate::gguf::GGUFModel;
use crate::lora::BaseModelSource;
use crate::tensor::TensorDesc;

/// Named tensor registry consumed by the merge engine
pub trait TensorRegistry {
    /// Tensor names in registry order
    fn tensor_names(&self) -> Vec<String>;

    /// Element type and extents of a tensor
    fn tensor_desc(&self, name: &str) -> Option<TensorDesc>;

    /// Encoded bytes of a tensor
    ///
    /// The slice must be exactly `tensor_desc(name)?.nbytes()` long; the merge
    /// engine rejects a tensor whose bytes disagree with its descriptor.
    fn tensor_data(&self, name: &str) -> Option<&[u8]>;

    /// Overwrite a tensor's bytes; `data` must match the existing length
    ///
    /// # Errors
    ///
    /// Returns error if the tensor is missing or the length differs.
    fn write_tensor_data(&mut self, name: &str, data: &[u8]) -> Result<()>;
}

/// A tensor owned by a [`LoadedModel`]
#[derive(Debug, Clone, PartialEq)]
pub struct ModelTensor {
    /// Tensor name
    pub name: String,
    /// Element type and extents
    pub desc: TensorDesc,
    /// Encoded bytes
    pub data: Vec<u8>,
}

/// Model whose tensors are resident in memory
#[derive(Debug, Clone, Default)]
pub struct LoadedModel {
    tensors: Vec<ModelTensor>,
    index: HashMap<String, usize>,
}

impl LoadedModel {
    /// Create an empty model
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tensor, replacing any tensor with the same name in place
    ///
    /// # Errors
    ///
    /// Returns `InvalidShape` if `data` does not match the descriptor's size.
    pub fn insert(&mut self, name: impl Into<String>, desc: TensorDesc, data: Vec<u8>) -> Result<()> {
        let name = name.into();
        let expected = desc.nbytes()?;
        if data.len() != expected {
            return Err(AdaptarError::InvalidShape {
                reason: format!(
                    "tensor '{name}' has {} bytes, {desc:?} needs {expected}",
                    data.len()
                ),
            });
        }

        let tensor = ModelTensor {
            name: name.clone(),
            desc,
            data,
        };
        match self.index.get(&name) {
            Some(&slot) => self.tensors[slot] = tensor,
            None => {
                self.index.insert(name, self.tensors.len());
                self.tensors.push(tensor);
            },
        }
        Ok(())
    }

    /// Load every tensor of a GGUF file into memory
    ///
    /// # Errors
    ///
    /// Returns error if the GGUF file is malformed or a tensor's data range
    /// lies outside the buffer.
    pub fn from_gguf_bytes(data: &[u8]) -> Result<Self> {
        let gguf = GGUFModel::from_bytes(data)?;
        let mut model = Self::new();
        for info in &gguf.tensors {
            let desc = info.desc()?;
            let bytes = gguf.tensor_bytes(info, data)?;
            model.insert(info.name.clone(), desc, bytes.to_vec())?;
        }
        Ok(model)
    }

    /// Read a GGUF file and load it into memory
    ///
    /// # Errors
    ///
    /// Returns `FileOpen` if the file cannot be read, or any parse error.
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| AdaptarError::FileOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_gguf_bytes(&data)
    }

    /// Look up a tensor by name
    #[must_use]
    pub fn tensor(&self, name: &str) -> Option<&ModelTensor> {
        self.index.get(name).map(|&i| &self.tensors[i])
    }

    /// Iterate tensors in registry order
    pub fn iter(&self) -> impl Iterator<Item = &ModelTensor> {
        self.tensors.iter()
    }

    /// Number of tensors
    #[must_use]
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// True if the model holds no tensors
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

impl TensorRegistry for LoadedModel {
    fn tensor_names(&self) -> Vec<String> {
        self.tensors.iter().map(|t| t.name.clone()).collect()
    }

    fn tensor_desc(&self, name: &str) -> Option<TensorDesc> {
        self.tensor(name).map(|t| t.desc)
    }

    fn tensor_data(&self, name: &str) -> Option<&[u8]> {
        self.tensor(name).map(|t| t.data.as_slice())
    }

    fn write_tensor_data(&mut self, name: &str, data: &[u8]) -> Result<()> {
        let slot = *self
            .index
            .get(name)
            .ok_or_else(|| AdaptarError::TensorNotFound(name.to_string()))?;
        let tensor = &mut self.tensors[slot];
        if tensor.data.len() != data.len() {
            return Err(AdaptarError::InvalidShape {
                reason: format!(
                    "write to '{name}' of {} bytes, tensor holds {}",
                    data.len(),
                    tensor.data.len()
                ),
            });
        }
        tensor.data.copy_from_slice(data);
        Ok(())
    }
}

impl BaseModelSource for LoadedModel {
    fn tensor_desc(&self, name: &str) -> Result<Option<TensorDesc>> {
        Ok(TensorRegistry::tensor_desc(self, name))
    }

    fn load_tensor_data(&self, name: &str, dst: &mut [u8]) -> Result<()> {
        let src = self
            .tensor_data(name)
            .ok_or_else(|| AdaptarError::TensorNotFound(name.to_string()))?;
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
