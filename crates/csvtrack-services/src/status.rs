use std::sync::Arc;

use csvtrack_core::models::{UploadRecord, UploadStatus};
use csvtrack_core::StoreError;
use csvtrack_db::{RecordStore, MAX_LIST_LIMIT};

pub const DEFAULT_LIST_LIMIT: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum StatusError {
    #[error("Upload not found: {0}")]
    NotFound(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Read-only queries over upload records.
#[derive(Clone)]
pub struct StatusService {
    store: Arc<dyn RecordStore>,
}

impl StatusService {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_status(&self, fingerprint: &str) -> Result<UploadRecord, StatusError> {
        self.store
            .get(fingerprint)
            .await?
            .ok_or_else(|| StatusError::NotFound(fingerprint.to_string()))
    }

    /// Most recently updated uploads first. `limit` defaults to
    /// [`DEFAULT_LIST_LIMIT`] and is clamped to `1..=MAX_LIST_LIMIT`.
    #[tracing::instrument(skip(self))]
    pub async fn list_uploads(
        &self,
        status: Option<UploadStatus>,
        limit: Option<usize>,
    ) -> Result<Vec<UploadRecord>, StatusError> {
        let limit = limit
            .unwrap_or(DEFAULT_LIST_LIMIT)
            .clamp(1, MAX_LIST_LIMIT);
        Ok(self.store.list(status, limit).await?)
    }
}
