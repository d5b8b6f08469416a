//! Storage abstraction trait
//!
//! This module defines the Storage trait that all storage backends must implement.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};
use thiserror::Error;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Invalid object key: {0}")]
    InvalidKey(String),

    #[error("Storage temporarily unavailable: {0}")]
    Unavailable(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    /// Whether the same request may succeed later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::DownloadFailed(_) | StorageError::Unavailable(_) | StorageError::IoError(_)
        )
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Local,
    Memory,
}

impl Display for StorageBackend {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            StorageBackend::Local => write!(f, "local"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Object attributes that feed the upload fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    pub size: u64,
    pub created_at: Option<DateTime<Utc>>,
}

/// Storage abstraction trait
///
/// The processing worker only reads objects; writes happen outside this system.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Download the full content of an object
    async fn download(&self, bucket: &str, object_name: &str) -> StorageResult<Vec<u8>>;

    /// Size and creation time of an object
    async fn head(&self, bucket: &str, object_name: &str) -> StorageResult<ObjectMetadata>;

    /// Names of all objects in a bucket, sorted
    async fn list(&self, bucket: &str) -> StorageResult<Vec<String>>;

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;
}

/// Reject keys that could escape their bucket.
pub(crate) fn validate_key(bucket: &str, object_name: &str) -> StorageResult<()> {
    if bucket.is_empty() || bucket.contains('/') || bucket.contains("..") {
        return Err(StorageError::InvalidKey(format!(
            "Invalid bucket name: {}",
            bucket
        )));
    }
    if object_name.is_empty()
        || object_name.starts_with('/')
        || object_name.split('/').any(|part| part == "..")
    {
        return Err(StorageError::InvalidKey(format!(
            "Invalid object name: {}",
            object_name
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_key() {
        assert!(validate_key("uploads", "orders.csv").is_ok());
        assert!(validate_key("uploads", "2025/03/orders.csv").is_ok());
        assert!(validate_key("uploads", "../secret").is_err());
        assert!(validate_key("uploads", "/etc/passwd").is_err());
        assert!(validate_key("a/b", "orders.csv").is_err());
        assert!(validate_key("", "orders.csv").is_err());
    }

    #[test]
    fn test_transient_classification() {
        assert!(StorageError::Unavailable("503".to_string()).is_transient());
        assert!(StorageError::IoError(std::io::Error::other("reset")).is_transient());
        assert!(!StorageError::NotFound("x".to_string()).is_transient());
        assert!(!StorageError::InvalidKey("x".to_string()).is_transient());
    }
}
