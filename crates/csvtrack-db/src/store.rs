//! Record store abstraction trait

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use csvtrack_core::models::{StatusUpdate, UploadRecord, UploadStatus};
use csvtrack_core::StoreResult;

/// Upper bound on the number of records a single listing returns.
pub const MAX_LIST_LIMIT: usize = 1000;

/// Durable key-value store of upload records keyed by fingerprint.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Fetch a record by fingerprint.
    async fn get(&self, fingerprint: &str) -> StoreResult<Option<UploadRecord>>;

    /// Insert `record` unless a record with the same fingerprint exists.
    ///
    /// Returns `true` when this call created the record.
    async fn create_if_absent(&self, record: &UploadRecord) -> StoreResult<bool>;

    /// Apply `update` if the record's current status is one of `expected`.
    ///
    /// Fails with `StoreError::NotFound` for unknown fingerprints and
    /// `StoreError::Conflict` when the status does not match or the record is Done.
    async fn transition(
        &self,
        fingerprint: &str,
        expected: &[UploadStatus],
        update: StatusUpdate,
    ) -> StoreResult<UploadRecord>;

    /// Most recently updated records first, optionally filtered by status.
    async fn list(
        &self,
        status: Option<UploadStatus>,
        limit: usize,
    ) -> StoreResult<Vec<UploadRecord>>;

    /// Pending records last written before `older_than`, oldest first.
    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<UploadRecord>>;
}
