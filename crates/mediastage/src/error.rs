//! Error types for mediastage

use std::time::Duration;

use thiserror::Error;

/// Main error type for ingestion operations
#[derive(Error, Debug)]
pub enum StageError {
    /// Transport errors talking to the remote source (DNS, reset, non-2xx status)
    #[error("Fetch failed: {0}")]
    FetchFailed(String),

    /// Local disk errors while writing the staging file
    #[error("Persist failed: {0}")]
    PersistFailed(String),

    /// Disk usage reached the configured ceiling
    #[error("Quota exceeded: {used} bytes used, ceiling is {ceiling} bytes")]
    QuotaExceeded { used: u64, ceiling: u64 },

    /// Handoff to the object store failed
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    /// The object ID cannot be used as a cache key and staging filename
    #[error("Invalid object id: {0}")]
    InvalidObjectId(String),

    /// The whole-request deadline elapsed
    #[error("Ingestion timed out after {0:?}")]
    TimedOut(Duration),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl StageError {
    /// Whether another attempt could succeed.
    ///
    /// Only transport failures qualify. A quota refusal is terminal since
    /// retrying would only download the same bytes again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StageError::FetchFailed(_))
    }
}

/// Result type alias for mediastage operations
pub type Result<T> = std::result::Result<T, StageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_fetch_failures_are_retryable() {
        assert!(StageError::FetchFailed("reset".to_string()).is_retryable());
        assert!(!StageError::PersistFailed("disk".to_string()).is_retryable());
        assert!(
            !StageError::QuotaExceeded {
                used: 10,
                ceiling: 5
            }
            .is_retryable()
        );
        assert!(!StageError::UploadFailed("503".to_string()).is_retryable());
        assert!(!StageError::TimedOut(Duration::from_secs(1)).is_retryable());
    }

    #[test]
    fn test_quota_message_includes_numbers() {
        let err = StageError::QuotaExceeded {
            used: 1000,
            ceiling: 1000,
        };
        assert_eq!(
            err.to_string(),
            "Quota exceeded: 1000 bytes used, ceiling is 1000 bytes"
        );
    }
}
