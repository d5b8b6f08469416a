//! Error types module
//!
//! Shared error classification plus the record store error type. Each error
//! describes whether retrying the failed operation can help and at which level
//! it should be logged.
//!
//! The `From<sqlx::Error>` conversion is gated behind the `sqlx` feature.

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

use crate::models::UploadStatus;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Debug level - for expected outcomes like lost conditional writes
    Debug,
    /// Warning level - for failures that will be retried
    Warn,
    /// Error level - for unexpected failures
    Error,
}

/// Self-description of an error for logging and retry decisions.
pub trait ErrorMetadata {
    /// Machine-readable error code (e.g., "STORE_CONFLICT")
    fn error_code(&self) -> &'static str;

    /// Whether retrying the operation may succeed
    fn is_retryable(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Upload record not found: {0}")]
    NotFound(String),

    /// Conditional write lost: the record was not in any of the expected states.
    #[error("Conflicting status for {fingerprint}: expected one of {expected:?}, found {actual}")]
    Conflict {
        fingerprint: String,
        expected: Vec<UploadStatus>,
        actual: UploadStatus,
    },

    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[cfg(feature = "sqlx")]
impl From<SqlxError> for StoreError {
    fn from(err: SqlxError) -> Self {
        StoreError::Database(err)
    }
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Static metadata for each variant: (error_code, retryable, log_level).
fn store_error_static_metadata(err: &StoreError) -> (&'static str, bool, LogLevel) {
    match err {
        StoreError::NotFound(_) => ("STORE_NOT_FOUND", false, LogLevel::Warn),
        StoreError::Conflict { .. } => ("STORE_CONFLICT", false, LogLevel::Debug),
        #[cfg(feature = "sqlx")]
        StoreError::Database(_) => ("DATABASE_ERROR", true, LogLevel::Error),
    }
}

impl ErrorMetadata for StoreError {
    fn error_code(&self) -> &'static str {
        store_error_static_metadata(self).0
    }

    fn is_retryable(&self) -> bool {
        store_error_static_metadata(self).1
    }

    fn log_level(&self) -> LogLevel {
        store_error_static_metadata(self).2
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_metadata_conflict() {
        let err = StoreError::Conflict {
            fingerprint: "abc".to_string(),
            expected: vec![UploadStatus::Pending, UploadStatus::Processing],
            actual: UploadStatus::Done,
        };
        assert!(err.is_conflict());
        assert_eq!(err.error_code(), "STORE_CONFLICT");
        assert!(!err.is_retryable());
        assert_eq!(err.log_level(), LogLevel::Debug);
        assert!(err.to_string().contains("done"));
    }

    #[test]
    fn test_error_metadata_not_found() {
        let err = StoreError::NotFound("abc".to_string());
        assert_eq!(err.error_code(), "STORE_NOT_FOUND");
        assert!(!err.is_retryable());
        assert_eq!(err.log_level(), LogLevel::Warn);
    }

    #[cfg(feature = "sqlx")]
    #[test]
    fn test_error_metadata_database() {
        let err = StoreError::from(sqlx::Error::PoolClosed);
        assert_eq!(err.error_code(), "DATABASE_ERROR");
        assert!(err.is_retryable());
    }
}
