use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use csvtrack_core::models::{StatusUpdate, UploadRecord, UploadStatus};
use csvtrack_core::{StoreError, StoreResult};

use crate::store::{RecordStore, MAX_LIST_LIMIT};

/// Process-local record store.
///
/// Every operation holds the map lock for its whole read-check-write sequence,
/// which makes each transition atomic per record.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<String, UploadRecord>>>,
}

impl InMemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn get(&self, fingerprint: &str) -> StoreResult<Option<UploadRecord>> {
        Ok(self.records.read().await.get(fingerprint).cloned())
    }

    #[tracing::instrument(skip(self, record), fields(fingerprint = %record.fingerprint))]
    async fn create_if_absent(&self, record: &UploadRecord) -> StoreResult<bool> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.fingerprint) {
            return Ok(false);
        }
        records.insert(record.fingerprint.clone(), record.clone());
        tracing::debug!("Upload record created");
        Ok(true)
    }

    #[tracing::instrument(skip(self, update), fields(target = %update.target()))]
    async fn transition(
        &self,
        fingerprint: &str,
        expected: &[UploadStatus],
        update: StatusUpdate,
    ) -> StoreResult<UploadRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(fingerprint)
            .ok_or_else(|| StoreError::NotFound(fingerprint.to_string()))?;

        if record.status == UploadStatus::Done || !expected.contains(&record.status) {
            return Err(StoreError::Conflict {
                fingerprint: fingerprint.to_string(),
                expected: expected.to_vec(),
                actual: record.status,
            });
        }

        let from = record.status;
        record.apply(&update);
        tracing::debug!(from = %from, to = %record.status, "Upload record transitioned");
        Ok(record.clone())
    }

    async fn list(
        &self,
        status: Option<UploadStatus>,
        limit: usize,
    ) -> StoreResult<Vec<UploadRecord>> {
        let records = self.records.read().await;
        let mut matching: Vec<UploadRecord> = records
            .values()
            .filter(|r| status.map_or(true, |s| r.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| {
            b.updated_at
                .cmp(&a.updated_at)
                .then_with(|| a.fingerprint.cmp(&b.fingerprint))
        });
        matching.truncate(limit.min(MAX_LIST_LIMIT));
        Ok(matching)
    }

    async fn list_stale_pending(
        &self,
        older_than: DateTime<Utc>,
        limit: usize,
    ) -> StoreResult<Vec<UploadRecord>> {
        let records = self.records.read().await;
        let mut stale: Vec<UploadRecord> = records
            .values()
            .filter(|r| r.status == UploadStatus::Pending && r.updated_at < older_than)
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        stale.truncate(limit.min(MAX_LIST_LIMIT));
        Ok(stale)
    }
}
