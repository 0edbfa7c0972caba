//! Merge pass configuration
//!
//! [`LoraConfig`] carries the caller-supplied knobs of a merge pass: the
//! user scale, the optional higher-precision base model, and the thread
//! count for graph execution. It can be built in code or read from JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AdaptarError, Result};

fn default_scale() -> f32 {
    1.0
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

/// Configuration for one adapter merge pass
///
/// # Example
///
/// ```
/// use adaptar::LoraConfig;
///
/// let config = LoraConfig::default()
///     .with_scale(0.5)
///     .with_threads(4)
///     .with_base_model("models/llama-7b-f16.gguf");
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// User scale multiplied into `alpha / rank`
    #[serde(default = "default_scale")]
    pub scale: f32,
    /// Higher-precision model to read base weights from
    #[serde(default)]
    pub base_model: Option<PathBuf>,
    /// Worker threads for graph execution
    #[serde(default = "default_threads")]
    pub threads: usize,
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            scale: default_scale(),
            base_model: None,
            threads: default_threads(),
        }
    }
}

impl LoraConfig {
    /// Set the user scale
    #[must_use]
    pub fn with_scale(mut self, scale: f32) -> Self {
        self.scale = scale;
        self
    }

    /// Set the base model path
    #[must_use]
    pub fn with_base_model(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_model = Some(path.into());
        self
    }

    /// Set the thread count
    #[must_use]
    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfiguration` for a non-finite scale or zero threads.
    pub fn validate(&self) -> Result<()> {
        if !self.scale.is_finite() {
            return Err(AdaptarError::InvalidConfiguration(format!(
                "scale must be finite, got {}",
                self.scale
            )));
        }
        if self.threads == 0 {
            return Err(AdaptarError::InvalidConfiguration(
                "threads must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Read a configuration from a JSON file
    ///
    /// # Errors
    ///
    /// Returns `FileOpen` if unreadable, `InvalidConfiguration` if the JSON
    /// does not parse or fails validation.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| AdaptarError::FileOpen {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| AdaptarError::InvalidConfiguration(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_default_is_valid() {
        let config = LoraConfig::default();
        assert_eq!(config.scale, 1.0);
        assert!(config.base_model.is_none());
        assert!(config.threads >= 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_threads() {
        let err = LoraConfig::default().with_threads(0).validate().unwrap_err();
        assert!(matches!(err, AdaptarError::InvalidConfiguration(_)));
    }

    #[test]
    fn test_rejects_nan_scale() {
        assert!(LoraConfig::default().with_scale(f32::NAN).validate().is_err());
        assert!(LoraConfig::default().with_scale(f32::INFINITY).validate().is_err());
    }

    #[test]
    fn test_from_json_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"scale": 2.0, "base_model": "base.gguf"}}"#).unwrap();
        let config = LoraConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.scale, 2.0);
        assert_eq!(config.base_model, Some(PathBuf::from("base.gguf")));
        assert!(config.threads >= 1);
    }

    #[test]
    fn test_from_json_file_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            LoraConfig::from_json_file(file.path()),
            Err(AdaptarError::InvalidConfiguration(_))
        ));
    }
}
