//! End-to-end pipeline tests over the in-memory record store and storage.
//!
//! Run with: `cargo test -p csvtrack-services --test pipeline_test`

mod helpers;

use std::sync::Arc;

use chrono::Utc;
use csvtrack_core::models::{DeadLetterReason, UploadStatus};
use csvtrack_core::PipelineConfig;
use csvtrack_services::{DispatchOutcome, DispatchPolicy, IngestionDispatcher};
use helpers::{csv_with_rows, start_pipeline, test_config};

#[tokio::test(start_paused = true)]
async fn test_valid_csv_is_processed_to_done() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("orders.csv", &csv_with_rows(100));

    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Queued { .. }));
    let fingerprint = outcome.fingerprint().unwrap().to_string();

    t.pipeline.wait_until_drained().await;

    let record = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(record.status, UploadStatus::Done);
    assert_eq!(record.lines_processed, Some(100));
    assert!(record.queued_at.is_some());
    assert!(record.processing_started_at.is_some());
    assert!(record.processing_completed_at.is_some());
    assert!(record.error_message.is_none());
    assert_eq!(t.pipeline.stats().dead_lettered, 0);

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_empty_csv_exhausts_attempts_then_dead_letters() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("empty.csv", "");

    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    let fingerprint = outcome.fingerprint().unwrap().to_string();

    t.pipeline.wait_until_drained().await;

    assert_eq!(t.storage.download_count(), 5);

    let dead = t.pipeline.dead_letters().list(10);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].message.fingerprint, fingerprint);
    assert_eq!(dead[0].message.delivery_attempt, 5);
    assert_eq!(dead[0].reason, DeadLetterReason::MaxAttemptsExceeded);
    assert_eq!(dead[0].last_error.as_deref(), Some("CSV file is empty"));

    let record = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(record.status, UploadStatus::Failed);
    assert_eq!(record.error_message.as_deref(), Some("CSV file is empty"));
    assert!(record.failed_at.is_some());

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_non_retryable_validation_dead_letters_immediately() {
    let config = PipelineConfig {
        validation_errors_retryable: false,
        ..test_config()
    };
    let t = start_pipeline(&config);
    let notification = t.upload("header-only.csv", "id,name\n");

    t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    t.pipeline.wait_until_drained().await;

    assert_eq!(t.storage.download_count(), 1);
    let dead = t.pipeline.dead_letters().list(10);
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].reason, DeadLetterReason::NonRetryable);
    assert_eq!(dead[0].message.delivery_attempt, 1);

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_notification_after_done_is_noop() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("orders.csv", &csv_with_rows(3));

    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    let fingerprint = outcome.fingerprint().unwrap().to_string();
    t.pipeline.wait_until_drained().await;
    let before = t.pipeline.status().get_status(&fingerprint).await.unwrap();

    let again = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    assert_eq!(
        again,
        DispatchOutcome::Duplicate {
            fingerprint: fingerprint.clone()
        }
    );
    assert!(t.pipeline.stats().is_drained());
    t.pipeline.wait_until_drained().await;

    let after = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(before, after);
    assert_eq!(t.storage.download_count(), 1);

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_notifications_process_once() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("orders.csv", &csv_with_rows(10));
    let dispatcher = t.pipeline.dispatcher();

    let (a, b, c, d) = tokio::join!(
        dispatcher.on_upload(&notification),
        dispatcher.on_upload(&notification),
        dispatcher.on_upload(&notification),
        dispatcher.on_upload(&notification),
    );
    let queued = [a, b, c, d]
        .into_iter()
        .map(|outcome| outcome.unwrap())
        .filter(|outcome| outcome.is_enqueued())
        .count();
    assert_eq!(queued, 1);

    t.pipeline.wait_until_drained().await;
    assert_eq!(t.storage.download_count(), 1);

    let fingerprint = notification.fingerprint();
    let record = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(record.lines_processed, Some(10));

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_deliveries_settle_once() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("orders.csv", &csv_with_rows(3));

    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    let fingerprint = outcome.fingerprint().unwrap().to_string();

    // At-least-once delivery: the same upload arrives as a second message.
    t.pipeline
        .queue()
        .publish(fingerprint.clone(), notification.source())
        .await
        .unwrap();

    t.pipeline.wait_until_drained().await;

    let record = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(record.status, UploadStatus::Done);
    assert_eq!(record.lines_processed, Some(3));
    assert_eq!(t.pipeline.stats().dead_lettered, 0);

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_transient_storage_failures_are_retried() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("orders.csv", &csv_with_rows(5));
    t.storage.fail_next_downloads(3);

    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    let fingerprint = outcome.fingerprint().unwrap().to_string();
    t.pipeline.wait_until_drained().await;

    assert_eq!(t.storage.download_count(), 4);
    let record = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(record.status, UploadStatus::Done);
    assert_eq!(record.lines_processed, Some(5));

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_redrive_after_fixing_content() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("late.csv", "");

    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    let fingerprint = outcome.fingerprint().unwrap().to_string();
    t.pipeline.wait_until_drained().await;

    let dead = t.pipeline.dead_letters().list(10);
    assert_eq!(dead.len(), 1);

    // The object is rewritten in place; the notification fingerprint stays the same.
    t.storage.put(helpers::BUCKET, "late.csv", csv_with_rows(2));
    let message_id = t
        .pipeline
        .dead_letters()
        .redrive(dead[0].message.id)
        .await
        .unwrap();
    assert_eq!(message_id, dead[0].message.id);
    assert!(t.pipeline.dead_letters().list(10).is_empty());

    t.pipeline.wait_until_drained().await;

    let record = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(record.status, UploadStatus::Done);
    assert_eq!(record.lines_processed, Some(2));
    assert!(record.failed_at.is_none());
    assert!(record.error_message.is_none());

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_redrive_all_then_drain_remaining_dead_letters() {
    let t = start_pipeline(&test_config());
    let fixed = t.upload("fixed.csv", "");
    let broken = t.upload("broken.csv", "");
    let fixed_fp = fixed.fingerprint();
    let broken_fp = broken.fingerprint();

    t.pipeline.dispatcher().on_upload(&fixed).await.unwrap();
    t.pipeline.dispatcher().on_upload(&broken).await.unwrap();
    t.pipeline.wait_until_drained().await;
    assert_eq!(t.pipeline.dead_letters().list(10).len(), 2);

    // Only one object gets repaired before both are redriven.
    t.storage.put(helpers::BUCKET, "fixed.csv", csv_with_rows(3));
    let redriven = t.pipeline.dead_letters().redrive_all(10).await.unwrap();
    assert_eq!(redriven, 2);
    assert!(t.pipeline.dead_letters().list(10).is_empty());

    t.pipeline.wait_until_drained().await;

    let record = t.pipeline.status().get_status(&fixed_fp).await.unwrap();
    assert_eq!(record.status, UploadStatus::Done);
    assert_eq!(record.lines_processed, Some(3));

    let remaining = t.pipeline.dead_letters().list(10);
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message.fingerprint, broken_fp);

    let drained = t.pipeline.dead_letters().drain(10);
    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0].message.fingerprint, broken_fp);
    assert!(t.pipeline.dead_letters().list(10).is_empty());
    assert_eq!(t.pipeline.stats().dead_lettered, 0);

    let record = t.pipeline.status().get_status(&broken_fp).await.unwrap();
    assert_eq!(record.status, UploadStatus::Failed);

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_upload_renotified_is_redispatched() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("retry.csv", "");

    t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    t.pipeline.wait_until_drained().await;
    assert_eq!(t.pipeline.stats().dead_lettered, 1);

    t.storage.put(helpers::BUCKET, "retry.csv", csv_with_rows(1));
    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    assert!(matches!(
        outcome,
        DispatchOutcome::Redispatched {
            previous: UploadStatus::Failed,
            ..
        }
    ));
    t.pipeline.wait_until_drained().await;

    let record = t
        .pipeline
        .status()
        .get_status(outcome.fingerprint().unwrap())
        .await
        .unwrap();
    assert_eq!(record.status, UploadStatus::Done);

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lost_publish_is_recovered_by_reconcile() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("orphan.csv", &csv_with_rows(4));

    // A dispatcher whose queue is already closed: the record is written, the publish fails.
    let closed = csvtrack_services::DeliveryQueue::new(Default::default());
    closed.close();
    let broken = IngestionDispatcher::new(
        Arc::new(t.store.clone()),
        Arc::new(closed),
        DispatchPolicy::default(),
    );
    assert!(broken.on_upload(&notification).await.is_err());

    let fingerprint = notification.fingerprint();
    let record = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(record.status, UploadStatus::Pending);

    // A repeated notification does not publish for a Pending record...
    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    assert!(!outcome.is_enqueued());

    // ...the sweep does.
    let cutoff = Utc::now() + chrono::Duration::seconds(1);
    let republished = t.pipeline.dispatcher().reconcile(cutoff).await.unwrap();
    assert_eq!(republished, 1);

    t.pipeline.wait_until_drained().await;
    let record = t.pipeline.status().get_status(&fingerprint).await.unwrap();
    assert_eq!(record.status, UploadStatus::Done);
    assert_eq!(record.lines_processed, Some(4));

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_reconcile_once_respects_grace_period() {
    let config = PipelineConfig {
        reconcile_grace_secs: 300,
        ..test_config()
    };
    let t = start_pipeline(&config);
    let notification = t.upload("fresh.csv", &csv_with_rows(2));

    let closed = csvtrack_services::DeliveryQueue::new(Default::default());
    closed.close();
    let broken = IngestionDispatcher::new(
        Arc::new(t.store.clone()),
        Arc::new(closed),
        DispatchPolicy::default(),
    );
    assert!(broken.on_upload(&notification).await.is_err());

    // Queued moments ago, so not stale yet.
    assert_eq!(t.pipeline.reconcile_once().await.unwrap(), 0);
    assert!(t.pipeline.stats().is_drained());

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_non_csv_objects_are_ignored() {
    let t = start_pipeline(&test_config());
    let notification = t.upload("image.png", "not a csv");

    let outcome = t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    assert!(matches!(outcome, DispatchOutcome::Ignored { .. }));
    assert!(t.store.is_empty().await);
    assert!(t.pipeline.stats().is_drained());

    t.pipeline.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_list_uploads_orders_by_recent_update() {
    let t = start_pipeline(&test_config());
    for name in ["a.csv", "b.csv", "c.csv"] {
        let notification = t.upload(name, &csv_with_rows(1));
        t.pipeline.dispatcher().on_upload(&notification).await.unwrap();
    }
    t.pipeline.wait_until_drained().await;

    let done = t
        .pipeline
        .status()
        .list_uploads(Some(UploadStatus::Done), None)
        .await
        .unwrap();
    assert_eq!(done.len(), 3);
    assert!(done
        .windows(2)
        .all(|w| w[0].updated_at >= w[1].updated_at));

    t.pipeline.shutdown().await;
}
