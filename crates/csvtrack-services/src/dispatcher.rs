use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;

use csvtrack_core::models::{
    MessageId, StatusUpdate, UploadNotification, UploadRecord, UploadStatus,
};
use csvtrack_core::{ErrorMetadata, Fingerprint, LogLevel, PipelineConfig, StoreError};
use csvtrack_db::{RecordStore, MAX_LIST_LIMIT};
use csvtrack_queue::{MessagePublisher, QueueError};

/// Which existing records a repeated notification may send back to the queue.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    /// Ignore objects whose name does not end in `.csv`.
    pub csv_only: bool,
    pub redispatch_failed: bool,
    pub redispatch_processing: bool,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            csv_only: true,
            redispatch_failed: true,
            redispatch_processing: false,
        }
    }
}

impl From<&PipelineConfig> for DispatchPolicy {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            csv_only: config.csv_only,
            redispatch_failed: config.redispatch_failed,
            redispatch_processing: config.redispatch_processing,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    /// New record created and a message published.
    Queued {
        fingerprint: Fingerprint,
        message_id: MessageId,
    },
    /// Existing Failed or Processing record reset to Pending and published again.
    Redispatched {
        fingerprint: Fingerprint,
        message_id: MessageId,
        previous: UploadStatus,
    },
    /// Already processed successfully.
    Duplicate { fingerprint: Fingerprint },
    /// Record exists and the policy leaves it alone.
    Skipped {
        fingerprint: Fingerprint,
        status: UploadStatus,
    },
    /// Not a CSV object.
    Ignored { object_name: String },
}

impl DispatchOutcome {
    pub fn fingerprint(&self) -> Option<&str> {
        match self {
            DispatchOutcome::Queued { fingerprint, .. }
            | DispatchOutcome::Redispatched { fingerprint, .. }
            | DispatchOutcome::Duplicate { fingerprint }
            | DispatchOutcome::Skipped { fingerprint, .. } => Some(fingerprint),
            DispatchOutcome::Ignored { .. } => None,
        }
    }

    /// Whether this call published a message.
    pub fn is_enqueued(&self) -> bool {
        matches!(
            self,
            DispatchOutcome::Queued { .. } | DispatchOutcome::Redispatched { .. }
        )
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    /// The record was written but no message went out; it stays Pending until
    /// the reconciliation sweep republishes it.
    #[error("Failed to publish message for {fingerprint}: {source}")]
    Publish {
        fingerprint: Fingerprint,
        #[source]
        source: QueueError,
    },
}

impl ErrorMetadata for DispatchError {
    fn error_code(&self) -> &'static str {
        match self {
            DispatchError::Store(err) => err.error_code(),
            DispatchError::Publish { source, .. } => source.error_code(),
        }
    }

    fn is_retryable(&self) -> bool {
        match self {
            DispatchError::Store(err) => err.is_retryable(),
            DispatchError::Publish { source, .. } => source.is_retryable(),
        }
    }

    fn log_level(&self) -> LogLevel {
        match self {
            DispatchError::Store(err) => err.log_level(),
            DispatchError::Publish { .. } => LogLevel::Error,
        }
    }
}

/// Turns upload notifications into tracked records and queued messages.
///
/// The record is always written before the message is published, so every
/// message refers to an existing record. Idempotent per fingerprint: a
/// notification enqueues at most once and never touches a Done record.
pub struct IngestionDispatcher {
    store: Arc<dyn RecordStore>,
    publisher: Arc<dyn MessagePublisher>,
    policy: DispatchPolicy,
}

impl IngestionDispatcher {
    pub fn new(
        store: Arc<dyn RecordStore>,
        publisher: Arc<dyn MessagePublisher>,
        policy: DispatchPolicy,
    ) -> Self {
        Self {
            store,
            publisher,
            policy,
        }
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    #[tracing::instrument(
        skip(self, notification),
        fields(bucket = %notification.bucket, object_name = %notification.name, size = notification.size)
    )]
    pub async fn on_upload(
        &self,
        notification: &UploadNotification,
    ) -> Result<DispatchOutcome, DispatchError> {
        if self.policy.csv_only && !notification.is_csv() {
            tracing::info!("Ignoring non-CSV object");
            return Ok(DispatchOutcome::Ignored {
                object_name: notification.name.clone(),
            });
        }

        let fingerprint = notification.fingerprint();
        tracing::debug!(fingerprint = %fingerprint, "Upload fingerprinted");

        if let Some(existing) = self.store.get(&fingerprint).await? {
            return self.on_existing(existing).await;
        }

        let record = UploadRecord::pending(notification, Utc::now());
        if !self.store.create_if_absent(&record).await? {
            // Another dispatcher created it between our read and write.
            let status = self
                .store
                .get(&fingerprint)
                .await?
                .map_or(UploadStatus::Pending, |r| r.status);
            tracing::info!(fingerprint = %fingerprint, status = %status, "Upload registered concurrently, skipping");
            return Ok(DispatchOutcome::Skipped {
                fingerprint,
                status,
            });
        }

        let message_id = self.publish(&record).await?;
        tracing::info!(fingerprint = %fingerprint, message_id = %message_id, "Upload queued");
        Ok(DispatchOutcome::Queued {
            fingerprint,
            message_id,
        })
    }

    async fn on_existing(&self, existing: UploadRecord) -> Result<DispatchOutcome, DispatchError> {
        let fingerprint = existing.fingerprint.clone();
        let status = existing.status;

        let redispatch = match status {
            UploadStatus::Done => {
                tracing::info!(fingerprint = %fingerprint, "Upload already processed, nothing to do");
                return Ok(DispatchOutcome::Duplicate { fingerprint });
            }
            UploadStatus::Pending => false,
            UploadStatus::Processing => self.policy.redispatch_processing,
            UploadStatus::Failed => self.policy.redispatch_failed,
        };

        if !redispatch {
            tracing::info!(fingerprint = %fingerprint, status = %status, "Upload already tracked, skipping");
            return Ok(DispatchOutcome::Skipped {
                fingerprint,
                status,
            });
        }

        let requeue = StatusUpdate::Requeue { at: Utc::now() };
        let record = match self.store.transition(&fingerprint, &[status], requeue).await {
            Ok(record) => record,
            Err(StoreError::Conflict { actual, .. }) => {
                tracing::info!(fingerprint = %fingerprint, status = %actual, "Upload changed concurrently, skipping");
                return Ok(if actual == UploadStatus::Done {
                    DispatchOutcome::Duplicate { fingerprint }
                } else {
                    DispatchOutcome::Skipped {
                        fingerprint,
                        status: actual,
                    }
                });
            }
            Err(err) => return Err(err.into()),
        };

        let message_id = self.publish(&record).await?;
        tracing::info!(
            fingerprint = %fingerprint,
            message_id = %message_id,
            previous = %status,
            "Upload redispatched"
        );
        Ok(DispatchOutcome::Redispatched {
            fingerprint,
            message_id,
            previous: status,
        })
    }

    async fn publish(&self, record: &UploadRecord) -> Result<MessageId, DispatchError> {
        self.publisher
            .publish(record.fingerprint.clone(), record.source.clone())
            .await
            .map_err(|source| {
                tracing::error!(
                    fingerprint = %record.fingerprint,
                    error = %source,
                    "Failed to publish message, record left Pending"
                );
                DispatchError::Publish {
                    fingerprint: record.fingerprint.clone(),
                    source,
                }
            })
    }

    /// Republish a message for every Pending record last touched before
    /// `older_than`. Returns how many were republished.
    ///
    /// Each record is re-stamped before publishing so the next sweep leaves it
    /// alone until it is stale again.
    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, older_than: DateTime<Utc>) -> Result<usize, DispatchError> {
        let stale = self
            .store
            .list_stale_pending(older_than, MAX_LIST_LIMIT)
            .await?;

        let mut republished = 0;
        for record in stale {
            let requeue = StatusUpdate::Requeue { at: Utc::now() };
            let record = match self
                .store
                .transition(&record.fingerprint, &[UploadStatus::Pending], requeue)
                .await
            {
                Ok(record) => record,
                // Picked up by a worker since the listing.
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            };
            self.publish(&record).await?;
            republished += 1;
        }

        if republished > 0 {
            tracing::warn!(republished, "Republished stale Pending uploads");
        } else {
            tracing::debug!("No stale Pending uploads");
        }
        Ok(republished)
    }
}
