//! Error types for Turnstile.

use thiserror::Error;

/// Errors raised by a counter store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached or answered garbage.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store was called with parameters it cannot honour.
    #[error("Invalid store argument: {0}")]
    InvalidArgument(String),
}

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// Invalid setup, detected at construction or at first evaluation
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Counter store failure that has not been handled yet
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Failure surfaced to the caller when no safe fallback exists
    #[error("Rate limiter internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl AdmissionError {
    /// Whether this error is a transient backend outage.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, AdmissionError::Store(StoreError::Unavailable(_)))
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, AdmissionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_unavailable_detection() {
        let err = AdmissionError::from(StoreError::Unavailable("connection refused".into()));
        assert!(err.is_store_unavailable());

        let err = AdmissionError::from(StoreError::InvalidArgument("window is zero".into()));
        assert!(!err.is_store_unavailable());

        let err = AdmissionError::Internal("boom".into());
        assert!(!err.is_store_unavailable());
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err = AdmissionError::from(StoreError::Unavailable("timeout".into()));
        assert_eq!(err.to_string(), "Store unavailable: timeout");
    }
}
