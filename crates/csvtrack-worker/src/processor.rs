use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use csvtrack_core::models::{DeliveryMessage, StatusUpdate, UploadStatus};
use csvtrack_core::{ProcessingError, ProcessingResultExt, StoreError};
use csvtrack_db::RecordStore;
use csvtrack_storage::{Storage, StorageError};

use crate::handler::{HandleOutcome, MessageHandler};
use crate::validator::CsvValidator;

/// Statuses a delivery may claim. Failed is included so a redelivery after a
/// failed attempt can start over; Done never is.
const CLAIMABLE: [UploadStatus; 3] = [
    UploadStatus::Pending,
    UploadStatus::Processing,
    UploadStatus::Failed,
];

/// Statuses from which a claimed delivery may record its result.
const SETTLEABLE: [UploadStatus; 2] = [UploadStatus::Pending, UploadStatus::Processing];

/// Processes one delivery: claim the record, download, validate, record the result.
///
/// Stateless between deliveries; everything it knows about an upload comes
/// from the record store.
pub struct ProcessingWorker {
    store: Arc<dyn RecordStore>,
    storage: Arc<dyn Storage>,
    validator: CsvValidator,
    validation_errors_retryable: bool,
}

impl ProcessingWorker {
    pub fn new(store: Arc<dyn RecordStore>, storage: Arc<dyn Storage>) -> Self {
        Self {
            store,
            storage,
            validator: CsvValidator::default(),
            validation_errors_retryable: true,
        }
    }

    /// When false, invalid content is dead-lettered on the first attempt.
    pub fn with_validation_errors_retryable(mut self, retryable: bool) -> Self {
        self.validation_errors_retryable = retryable;
        self
    }

    #[tracing::instrument(
        skip(self, message),
        fields(
            message_id = %message.id,
            fingerprint = %message.fingerprint,
            delivery_attempt = message.delivery_attempt
        )
    )]
    pub async fn process(&self, message: &DeliveryMessage) -> Result<HandleOutcome, ProcessingError> {
        let fingerprint = message.fingerprint.as_str();

        let record = self
            .store
            .get(fingerprint)
            .await
            .transient()?
            .ok_or_else(|| {
                ProcessingError::non_retryable(anyhow!(
                    "No upload record for fingerprint {}",
                    fingerprint
                ))
            })?;

        if record.status == UploadStatus::Done {
            tracing::info!("Upload already processed, skipping");
            return Ok(HandleOutcome::AlreadyDone);
        }

        match self
            .store
            .transition(fingerprint, &CLAIMABLE, StatusUpdate::Start { at: Utc::now() })
            .await
        {
            Ok(_) => {}
            // Only a Done record refuses a claim.
            Err(err) if err.is_conflict() => {
                tracing::info!("Upload completed concurrently, skipping");
                return Ok(HandleOutcome::AlreadyDone);
            }
            Err(err) => return Err(ProcessingError::transient(err)),
        }

        let source = &message.source;
        let content = match self
            .storage
            .download(&source.bucket, &source.object_name)
            .await
        {
            Ok(content) => content,
            Err(err) if err.is_transient() => return Err(ProcessingError::transient(err)),
            Err(err) => {
                let reason = download_failure_reason(&err);
                let error = ProcessingError::non_retryable(err);
                return self.record_failure(fingerprint, reason, error).await;
            }
        };

        let summary = match self.validator.validate(&content) {
            Ok(summary) => summary,
            Err(err) => {
                let reason = err.to_string();
                let error = ProcessingError::validation(err, self.validation_errors_retryable);
                return self.record_failure(fingerprint, reason, error).await;
            }
        };

        let update = StatusUpdate::Complete {
            at: Utc::now(),
            lines_processed: summary.rows,
        };
        match self.store.transition(fingerprint, &SETTLEABLE, update).await {
            Ok(_) => {
                tracing::info!(
                    lines_processed = summary.rows,
                    columns = summary.columns,
                    "Upload processed"
                );
                Ok(HandleOutcome::Processed {
                    lines: summary.rows,
                })
            }
            Err(StoreError::Conflict { actual, .. }) => {
                tracing::info!(status = %actual, "Upload settled by another delivery");
                Ok(HandleOutcome::Superseded)
            }
            Err(err) => Err(ProcessingError::transient(err)),
        }
    }

    /// Mark the record Failed and hand `error` back to the queue. If another
    /// delivery already settled the record, the failure is moot.
    async fn record_failure(
        &self,
        fingerprint: &str,
        reason: String,
        error: ProcessingError,
    ) -> Result<HandleOutcome, ProcessingError> {
        let update = StatusUpdate::Fail {
            at: Utc::now(),
            error_message: reason,
        };
        match self.store.transition(fingerprint, &SETTLEABLE, update).await {
            Ok(_) => {
                tracing::warn!(error = %error, "Upload processing failed");
                Err(error)
            }
            Err(StoreError::Conflict { actual, .. }) => {
                tracing::info!(status = %actual, "Upload settled by another delivery");
                Ok(HandleOutcome::Superseded)
            }
            Err(err) => Err(ProcessingError::transient(err)),
        }
    }
}

fn download_failure_reason(err: &StorageError) -> String {
    match err {
        StorageError::NotFound(_) => format!("Source object missing: {}", err),
        _ => err.to_string(),
    }
}

#[async_trait]
impl MessageHandler for ProcessingWorker {
    async fn handle(&self, message: &DeliveryMessage) -> Result<HandleOutcome, ProcessingError> {
        self.process(message).await
    }
}
