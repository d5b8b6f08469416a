use chrono::Utc;
use std::sync::Arc;

use csvtrack_core::models::{DeadLetter, MessageId, StatusUpdate, UploadStatus};
use csvtrack_core::StoreError;
use csvtrack_db::RecordStore;
use csvtrack_queue::{DeliveryQueue, QueueError};

#[derive(Debug, thiserror::Error)]
pub enum DeadLetterError {
    #[error("Dead letter not found: {0}")]
    NotFound(MessageId),

    #[error("Record store error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),
}

/// Operator access to the dead-letter sink.
#[derive(Clone)]
pub struct DeadLetterService {
    store: Arc<dyn RecordStore>,
    queue: DeliveryQueue,
}

impl DeadLetterService {
    pub fn new(store: Arc<dyn RecordStore>, queue: DeliveryQueue) -> Self {
        Self { store, queue }
    }

    /// Oldest dead letters first, without removing them.
    pub fn list(&self, limit: usize) -> Vec<DeadLetter> {
        self.queue.dead_letters().peek(limit)
    }

    /// Remove and return up to `limit` dead letters, oldest first.
    pub fn drain(&self, limit: usize) -> Vec<DeadLetter> {
        self.queue.dead_letters().drain(limit)
    }

    /// Send a dead letter back through the pipeline with a fresh attempt budget.
    ///
    /// The message is requeued first; the upload record is only reset to
    /// Pending once the queue has taken it, so a failed redrive leaves both the
    /// dead letter and the record as they were. A record that is not Failed is
    /// left to the worker: Processing records are claimable as they are, and a
    /// Done record makes the worker acknowledge the redelivery as a duplicate.
    #[tracing::instrument(skip(self))]
    pub async fn redrive(&self, message_id: MessageId) -> Result<MessageId, DeadLetterError> {
        let dead_letter = self
            .queue
            .dead_letters()
            .get(message_id)
            .ok_or(DeadLetterError::NotFound(message_id))?;
        let fingerprint = dead_letter.message.fingerprint.as_str();

        let id = self.queue.redrive(message_id).await.map_err(|err| match err {
            QueueError::DeadLetterNotFound(id) => DeadLetterError::NotFound(id),
            other => DeadLetterError::Queue(other),
        })?;

        let requeue = StatusUpdate::Requeue { at: Utc::now() };
        match self
            .store
            .transition(fingerprint, &[UploadStatus::Failed], requeue)
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict { actual, .. }) => {
                tracing::info!(fingerprint = %fingerprint, status = %actual, "Record not Failed, redriven without reset");
            }
            Err(StoreError::NotFound(_)) => {
                tracing::warn!(fingerprint = %fingerprint, "Dead letter has no upload record");
            }
            Err(err) => return Err(err.into()),
        }

        Ok(id)
    }

    /// Redrive up to `limit` dead letters, oldest first. Returns how many were redriven.
    pub async fn redrive_all(&self, limit: usize) -> Result<usize, DeadLetterError> {
        let mut redriven = 0;
        for dead_letter in self.list(limit) {
            match self.redrive(dead_letter.message.id).await {
                Ok(_) => redriven += 1,
                // Redriven concurrently.
                Err(DeadLetterError::NotFound(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(redriven)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use csvtrack_core::models::{DeadLetterReason, UploadNotification, UploadRecord};
    use csvtrack_db::InMemoryRecordStore;
    use csvtrack_queue::QueueConfig;

    /// A record marked Failed whose single delivery has been dead-lettered.
    async fn dead_lettered(store: &InMemoryRecordStore, queue: &DeliveryQueue) -> UploadRecord {
        let notification = UploadNotification {
            bucket: "uploads".to_string(),
            name: "a.csv".to_string(),
            size: 0,
            created_at: None,
        };
        let record = UploadRecord::pending(&notification, Utc::now());
        store.create_if_absent(&record).await.unwrap();
        store
            .transition(
                &record.fingerprint,
                &[UploadStatus::Pending],
                StatusUpdate::Fail {
                    at: Utc::now(),
                    error_message: "CSV file is empty".to_string(),
                },
            )
            .await
            .unwrap();

        queue
            .publish(record.fingerprint.clone(), record.source.clone())
            .await
            .unwrap();
        let delivery = queue.consume().await.unwrap();
        assert!(delivery.reject("CSV file is empty"));
        record
    }

    fn single_attempt_queue() -> DeliveryQueue {
        DeliveryQueue::new(QueueConfig {
            max_delivery_attempts: 1,
            ..QueueConfig::default()
        })
    }

    #[tokio::test]
    async fn test_redrive_resets_failed_record() {
        let store = InMemoryRecordStore::new();
        let queue = single_attempt_queue();
        let record = dead_lettered(&store, &queue).await;
        let service = DeadLetterService::new(Arc::new(store.clone()), queue.clone());

        let dead = service.list(10);
        assert_eq!(dead[0].reason, DeadLetterReason::NonRetryable);
        service.redrive(dead[0].message.id).await.unwrap();

        let stored = store.get(&record.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Pending);
        assert!(stored.error_message.is_none());
        assert_eq!(queue.stats().ready, 1);
        assert!(service.list(10).is_empty());
    }

    #[tokio::test]
    async fn test_failed_redrive_leaves_record_and_dead_letter() {
        let store = InMemoryRecordStore::new();
        let queue = single_attempt_queue();
        let record = dead_lettered(&store, &queue).await;
        let service = DeadLetterService::new(Arc::new(store.clone()), queue.clone());
        let message_id = service.list(10)[0].message.id;

        queue.close();
        let err = service.redrive(message_id).await.unwrap_err();
        assert!(matches!(err, DeadLetterError::Queue(QueueError::Closed)));

        let stored = store.get(&record.fingerprint).await.unwrap().unwrap();
        assert_eq!(stored.status, UploadStatus::Failed);
        assert_eq!(stored.error_message.as_deref(), Some("CSV file is empty"));
        assert_eq!(service.list(10).len(), 1);
        assert_eq!(service.list(10)[0].message.id, message_id);
    }

    #[tokio::test]
    async fn test_redrive_unknown_message_is_not_found() {
        let service = DeadLetterService::new(
            Arc::new(InMemoryRecordStore::new()),
            single_attempt_queue(),
        );
        let id = MessageId::new_v4();
        assert!(matches!(
            service.redrive(id).await,
            Err(DeadLetterError::NotFound(missing)) if missing == id
        ));
    }
}
