use crate::traits::{validate_key, ObjectMetadata, Storage, StorageError, StorageResult};
use crate::StorageBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Clone)]
struct StoredObject {
    data: Vec<u8>,
    created_at: DateTime<Utc>,
}

/// Process-local object store for embedding and tests.
///
/// `fail_next_downloads` injects transient download failures.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    objects: Arc<Mutex<BTreeMap<(String, String), StoredObject>>>,
    failures_remaining: Arc<AtomicUsize>,
    downloads: Arc<AtomicUsize>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an object, returning the metadata an upload notification would carry.
    pub fn put(&self, bucket: &str, object_name: &str, data: impl Into<Vec<u8>>) -> ObjectMetadata {
        let data = data.into();
        let created_at = Utc::now();
        let metadata = ObjectMetadata {
            size: data.len() as u64,
            created_at: Some(created_at),
        };
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                (bucket.to_string(), object_name.to_string()),
                StoredObject { data, created_at },
            );
        metadata
    }

    /// Make the next `count` downloads fail with `StorageError::Unavailable`.
    pub fn fail_next_downloads(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of download attempts seen so far, failed ones included.
    pub fn download_count(&self) -> usize {
        self.downloads.load(Ordering::SeqCst)
    }

    fn get(&self, bucket: &str, object_name: &str) -> StorageResult<StoredObject> {
        validate_key(bucket, object_name)?;
        self.objects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(bucket.to_string(), object_name.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("{}/{}", bucket, object_name)))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn download(&self, bucket: &str, object_name: &str) -> StorageResult<Vec<u8>> {
        self.downloads.fetch_add(1, Ordering::SeqCst);

        let injected = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Unavailable(format!(
                "injected failure for {}/{}",
                bucket, object_name
            )));
        }

        Ok(self.get(bucket, object_name)?.data)
    }

    async fn head(&self, bucket: &str, object_name: &str) -> StorageResult<ObjectMetadata> {
        let object = self.get(bucket, object_name)?;
        Ok(ObjectMetadata {
            size: object.data.len() as u64,
            created_at: Some(object.created_at),
        })
    }

    async fn list(&self, bucket: &str) -> StorageResult<Vec<String>> {
        validate_key(bucket, "_")?;
        let objects = self.objects.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(objects
            .keys()
            .filter(|(b, _)| b == bucket)
            .map(|(_, name)| name.clone())
            .collect())
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}
