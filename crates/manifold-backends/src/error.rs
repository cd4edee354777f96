//! Error types for backend operations

use std::fmt;

/// Result type for backend operations
pub type Result<T> = std::result::Result<T, BackendError>;

/// Errors reported by a device or its runtime.
///
/// Clone so that a failed command can report the same error to its event
/// and to a later `finish`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BackendError {
    /// Invalid buffer handle
    #[error("invalid buffer handle: {0}")]
    InvalidBufferHandle(u64),

    /// Invalid program handle
    #[error("invalid program handle: {0}")]
    InvalidProgramHandle(u64),

    /// Invalid kernel handle
    #[error("invalid kernel handle: {0}")]
    InvalidKernelHandle(u64),

    /// Buffer access out of bounds
    #[error("buffer access out of bounds: offset {offset} + size {size} > buffer size {buffer_size}")]
    BufferOutOfBounds {
        offset: usize,
        size: usize,
        buffer_size: usize,
    },

    /// Device allocation failed
    #[error("failed to allocate {size} bytes: {reason}")]
    AllocationFailed { size: usize, reason: String },

    /// Program build failed; `log` is the compiler output, unmodified
    #[error("program build failed:\n{log}")]
    BuildFailed { log: String },

    /// No kernel entry point with this name
    #[error("kernel '{0}' not found in program")]
    KernelNotFound(String),

    /// Argument list does not match the kernel signature
    #[error("invalid kernel arguments: {0}")]
    InvalidKernelArgs(String),

    /// Invalid launch configuration
    #[error("invalid launch configuration: {0}")]
    InvalidLaunchConfig(String),

    /// A queued command failed on the device
    #[error("{operation} failed: {message}")]
    CommandFailed { operation: String, message: String },

    /// The command queue is no longer accepting work
    #[error("command queue is closed")]
    QueueClosed,

    /// Unsupported operation
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl BackendError {
    /// Create a command failure error
    pub fn command_failed(operation: impl fmt::Display, message: impl fmt::Display) -> Self {
        Self::CommandFailed {
            operation: operation.to_string(),
            message: message.to_string(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// Short name of the operation class, used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidBufferHandle(_) | Self::BufferOutOfBounds { .. } | Self::AllocationFailed { .. } => "memory",
            Self::InvalidProgramHandle(_) | Self::BuildFailed { .. } | Self::KernelNotFound(_) => "build",
            Self::InvalidKernelHandle(_) | Self::InvalidKernelArgs(_) | Self::InvalidLaunchConfig(_) => "launch",
            Self::CommandFailed { .. } | Self::QueueClosed => "queue",
            Self::UnsupportedOperation(_) | Self::Other(_) => "other",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_failure_keeps_raw_log() {
        let err = BackendError::BuildFailed {
            log: "3:14: error: use of undeclared identifier 'y'".into(),
        };
        assert_eq!(
            err.to_string(),
            "program build failed:\n3:14: error: use of undeclared identifier 'y'"
        );
        assert_eq!(err.kind(), "build");
    }

    #[test]
    fn command_failures_name_the_operation() {
        let err = BackendError::command_failed("kernel launch", "index 9 out of bounds");
        assert_eq!(err.to_string(), "kernel launch failed: index 9 out of bounds");
    }
}
