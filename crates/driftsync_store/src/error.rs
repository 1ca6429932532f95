//! Error types for store collaborators.

use driftsync_model::ModelError;
use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors raised by store collaborators.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Local persistent store failure.
    #[error("local store error: {0}")]
    Local(String),

    /// Backend store failure.
    #[error("backend error: {message}")]
    Backend {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// A wire row could not be interpreted.
    #[error("malformed row: {0}")]
    Row(#[from] ModelError),
}

impl StoreError {
    /// Creates a local store error.
    pub fn local(message: impl Into<String>) -> Self {
        Self::Local(message.into())
    }

    /// Creates a retryable backend error.
    pub fn backend_retryable(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable backend error.
    pub fn backend_fatal(message: impl Into<String>) -> Self {
        Self::Backend {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Backend { retryable, .. } => *retryable,
            StoreError::Local(_) => true,
            StoreError::Row(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(StoreError::backend_retryable("connection reset").is_retryable());
        assert!(!StoreError::backend_fatal("permission denied").is_retryable());
        assert!(StoreError::local("disk busy").is_retryable());
        assert!(!StoreError::Row(ModelError::NotAnObject).is_retryable());
    }
}
