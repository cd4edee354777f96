//! Error types for manifold-core operations

use manifold_backends::BackendError;

/// Result type for manifold-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in manifold-core operations
///
/// Every failure aborts the call that triggered it. Work already enqueued
/// on other devices is not rolled back.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A partitioning policy is already active; the existing one is kept
    #[error("partitioning policy is already set")]
    PartitioningAlreadySet,

    /// Generated or user-supplied kernel source failed to build
    #[error("failed to build kernel '{kernel}':\n{log}")]
    Build { kernel: String, log: String },

    /// Device runtime failure (allocation, transfer, launch, queue)
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// Operands do not share a device list and partition table
    #[error("partition mismatch: {0}")]
    PartitionMismatch(String),

    /// Host slice and device range differ in length
    #[error("buffer size mismatch: expected {expected}, got {actual}")]
    BufferSizeMismatch { expected: usize, actual: usize },

    /// Element index or range outside the vector
    #[error("index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    /// Expression cannot be lowered to a kernel
    #[error("unsupported expression: {0}")]
    UnsupportedExpression(String),

    /// Malformed compressed sparse row input
    #[error("invalid sparse matrix: {0}")]
    InvalidMatrix(String),

    /// Invalid operation
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    pub(crate) fn mismatch(message: impl Into<String>) -> Self {
        Self::PartitionMismatch(message.into())
    }

    pub(crate) fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedExpression(message.into())
    }
}
