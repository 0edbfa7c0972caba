//! Error types for Adaptar
//!
//! Every fallible operation in the crate returns [`Result<T>`]. The variants
//! carry enough context (file path, tensor name, expected vs. actual extents)
//! to diagnose a failed merge pass from the log alone.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for Adaptar operations
pub type Result<T> = std::result::Result<T, AdaptarError>;

/// Error type for all Adaptar operations
#[derive(Error, Debug)]
pub enum AdaptarError {
    /// A file could not be opened for reading
    #[error("Failed to open {}: {reason}", path.display())]
    FileOpen {
        /// Path that failed to open
        path: PathBuf,
        /// Underlying OS error text
        reason: String,
    },

    /// Read or seek failed (includes reads past end-of-file)
    #[error("I/O error during {operation}: {reason}")]
    IoError {
        /// Operation being performed
        operation: String,
        /// Underlying error text
        reason: String,
    },

    /// Malformed adapter or model file
    #[error("Format error: {reason}")]
    FormatError {
        /// Description of the violation
        reason: String,
    },

    /// Base weight and factor extents disagree
    #[error(
        "Incompatible tensor dimensions for '{tensor}': expected {expected:?}, got {actual:?}"
    )]
    ShapeMismatch {
        /// Tensor being merged
        tensor: String,
        /// Extents required by the factor pair `[loraA.ne[1], loraB.ne[1]]`
        expected: [usize; 2],
        /// Extents of the base weight
        actual: [usize; 2],
    },

    /// Scratch buffer or context allocation failed
    #[error("Allocation failed: {reason}")]
    AllocationError {
        /// What could not be allocated
        reason: String,
    },

    /// Compute backend could not be created
    #[error("Compute backend unavailable: {reason}")]
    BackendInit {
        /// Why initialization failed
        reason: String,
    },

    /// Shape is invalid for the requested operation
    #[error("Invalid shape: {reason}")]
    InvalidShape {
        /// Description of the shape problem
        reason: String,
    },

    /// Operation not supported for the given inputs
    #[error("Unsupported operation '{operation}': {reason}")]
    UnsupportedOperation {
        /// Operation name
        operation: String,
        /// Reason it is unsupported
        reason: String,
    },

    /// Named tensor is not present
    #[error("Tensor '{0}' not found")]
    TensorNotFound(String),

    /// Configuration value rejected
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl AdaptarError {
    /// Build an [`AdaptarError::IoError`] from an `std::io::Error`
    pub(crate) fn io(operation: impl Into<String>, err: &std::io::Error) -> Self {
        Self::IoError {
            operation: operation.into(),
            reason: err.to_string(),
        }
    }
}
