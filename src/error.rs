//! Error types for Windowgate.

use thiserror::Error;

use crate::store::StoreError;

/// Main error type for limiter operations.
///
/// A denied request is not an error: admission calls return `Ok(false)`.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid quota or settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid call argument, such as requesting zero units
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The local CAS loop ran out of retries
    #[error("Contention on key {key}: gave up after {attempts} attempts")]
    Contention {
        /// The contended key
        key: String,
        /// Number of CAS attempts made
        attempts: u32,
    },

    /// The shared store failed to execute an operation
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// The wait was cancelled by the caller
    #[error("Wait cancelled")]
    Cancelled,

    /// The caller's deadline passed before admission
    #[error("Wait deadline exceeded")]
    DeadlineExceeded,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LimiterError {
    /// Whether retrying the same call later can succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LimiterError::Contention { .. } => true,
            LimiterError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contention_is_transient() {
        let err = LimiterError::Contention {
            key: "user:1".to_string(),
            attempts: 64,
        };
        assert!(err.is_transient());
        assert_eq!(
            err.to_string(),
            "Contention on key user:1: gave up after 64 attempts"
        );
    }

    #[test]
    fn test_store_error_converts() {
        let err: LimiterError = StoreError::Unavailable("connection refused".to_string()).into();
        assert!(matches!(err, LimiterError::Store(_)));
        assert!(err.is_transient());
        assert!(!LimiterError::Cancelled.is_transient());
    }
}
