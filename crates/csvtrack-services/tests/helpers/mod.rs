//! Test helpers: an in-memory pipeline with injectable storage.
//!
//! Run from workspace root: `cargo test -p csvtrack-services --test pipeline_test`.

use std::sync::Arc;

use csvtrack_core::models::UploadNotification;
use csvtrack_core::PipelineConfig;
use csvtrack_db::InMemoryRecordStore;
use csvtrack_services::{MemoryStorage, Pipeline};

pub const BUCKET: &str = "uploads";

/// Pipeline plus handles on its backing stores.
pub struct TestPipeline {
    pub pipeline: Pipeline,
    pub store: InMemoryRecordStore,
    pub storage: MemoryStorage,
}

/// Defaults with short backoff so paused-clock tests stay cheap.
pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        worker_count: 4,
        max_delivery_attempts: 5,
        backoff_base_ms: 100,
        backoff_max_ms: 1_000,
        ack_deadline_secs: 30,
        processing_timeout_secs: 10,
        reconcile_interval_secs: 0,
        ..PipelineConfig::default()
    }
}

pub fn start_pipeline(config: &PipelineConfig) -> TestPipeline {
    let store = InMemoryRecordStore::new();
    let storage = MemoryStorage::new();
    let pipeline = Pipeline::start(Arc::new(store.clone()), Arc::new(storage.clone()), config);
    TestPipeline {
        pipeline,
        store,
        storage,
    }
}

impl TestPipeline {
    /// Store an object and build the notification the storage would emit for it.
    pub fn upload(&self, name: &str, content: &str) -> UploadNotification {
        let meta = self.storage.put(BUCKET, name, content);
        UploadNotification {
            bucket: BUCKET.to_string(),
            name: name.to_string(),
            size: meta.size,
            created_at: meta.created_at,
        }
    }
}

/// A CSV with a header and `rows` data rows.
pub fn csv_with_rows(rows: usize) -> String {
    let mut csv = String::from("id,name,amount\n");
    for i in 0..rows {
        csv.push_str(&format!("{},customer-{},{}.50\n", i, i, i * 3));
    }
    csv
}
