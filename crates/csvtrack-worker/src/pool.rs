//! Worker pool: concurrent consumers over the delivery queue.
//!
//! Shutdown: [`WorkerPool::shutdown`] stops leasing new deliveries and waits
//! for the ones already being processed. Deliveries still waiting in the queue
//! stay there.

use anyhow::anyhow;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;

use csvtrack_core::{ErrorMetadata, LogLevel, PipelineConfig, ProcessingError};
use csvtrack_queue::{DeliveryHandle, DeliveryQueue};

use crate::handler::{HandleOutcome, MessageHandler};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Deliveries processed at once.
    pub worker_count: usize,
    /// Upper bound for one handler call. Kept below the queue ack deadline so a
    /// slow delivery is nacked before its lease is reclaimed.
    pub processing_timeout: Duration,
    /// Interval between expired-lease sweeps; zero disables the sweep.
    pub lease_reap_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            processing_timeout: Duration::from_secs(50),
            lease_reap_interval: Duration::from_secs(1),
        }
    }
}

impl From<&PipelineConfig> for WorkerConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            worker_count: config.worker_count,
            processing_timeout: config.processing_timeout(),
            lease_reap_interval: config.lease_reap_interval(),
        }
    }
}

pub struct WorkerPool {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl WorkerPool {
    /// Spawn the consumer loop.
    pub fn start(
        queue: DeliveryQueue,
        handler: Arc<dyn MessageHandler>,
        config: WorkerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(Self::run(queue, handler, config, shutdown_rx));
        Self {
            shutdown_tx,
            handle,
        }
    }

    /// Whether the consumer loop has exited (after shutdown or queue close).
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Stop leasing deliveries and wait for in-flight ones to be settled.
    pub async fn shutdown(self) {
        tracing::info!("Initiating worker pool shutdown");
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Worker pool task failed");
        }
    }

    /// Wait for the consumer loop to exit on its own, e.g. after the queue is closed.
    pub async fn join(self) {
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Worker pool task failed");
        }
    }

    async fn run(
        queue: DeliveryQueue,
        handler: Arc<dyn MessageHandler>,
        config: WorkerConfig,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) {
        let worker_count = config.worker_count.max(1);
        tracing::info!(
            worker_count,
            processing_timeout_ms = config.processing_timeout.as_millis() as u64,
            lease_reap_interval_ms = config.lease_reap_interval.as_millis() as u64,
            "Worker pool started"
        );

        let semaphore = Arc::new(Semaphore::new(worker_count));

        let (reaper_shutdown_tx, mut reaper_shutdown_rx) = mpsc::channel::<()>(1);
        if !config.lease_reap_interval.is_zero() {
            let reaper_queue = queue.clone();
            let reap_interval = config.lease_reap_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(reap_interval);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = interval.tick() => {
                            let reclaimed = reaper_queue.reap_expired();
                            if reclaimed > 0 {
                                tracing::warn!(reclaimed, "Reclaimed expired delivery leases");
                            }
                        }
                        _ = reaper_shutdown_rx.recv() => break,
                    }
                }
            });
        }

        loop {
            let permit = tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Worker pool shutting down");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            let delivery = tokio::select! {
                _ = shutdown_rx.recv() => {
                    tracing::info!("Worker pool shutting down");
                    break;
                }
                delivery = queue.consume() => delivery,
            };

            let Some(delivery) = delivery else {
                tracing::info!("Delivery queue closed, worker pool stopping");
                break;
            };

            let handler = handler.clone();
            let timeout = config.processing_timeout;
            tokio::spawn(async move {
                let _permit = permit;
                process_delivery(delivery, handler, timeout).await;
            });
        }

        let _ = reaper_shutdown_tx.send(()).await;

        // Every permit back means every spawned delivery has been settled.
        let _ = semaphore.acquire_many(worker_count as u32).await;
        tracing::info!("Worker pool stopped");
    }
}

#[tracing::instrument(
    skip_all,
    fields(
        message_id = %delivery.message().id,
        fingerprint = %delivery.message().fingerprint,
        delivery_attempt = delivery.delivery_attempt()
    )
)]
async fn process_delivery(
    delivery: DeliveryHandle,
    handler: Arc<dyn MessageHandler>,
    timeout: Duration,
) {
    let result = tokio::time::timeout(timeout, handler.handle(delivery.message())).await;

    match result {
        Ok(Ok(outcome)) => {
            match outcome {
                HandleOutcome::Processed { lines } => {
                    tracing::info!(lines_processed = lines, "Delivery processed")
                }
                HandleOutcome::AlreadyDone => tracing::info!("Duplicate delivery acknowledged"),
                HandleOutcome::Superseded => {
                    tracing::info!("Delivery superseded by a concurrent one")
                }
            }
            delivery.ack();
        }
        Ok(Err(err)) => settle_failure(delivery, err),
        Err(_) => {
            let err = ProcessingError::transient(anyhow!(
                "Processing timed out after {}ms",
                timeout.as_millis()
            ));
            settle_failure(delivery, err);
        }
    }
}

/// Nack retryable failures, dead-letter the rest.
fn settle_failure(delivery: DeliveryHandle, err: ProcessingError) {
    let retryable = err.is_retryable();
    let message = err.to_string();

    match err.log_level() {
        LogLevel::Debug => tracing::debug!(
            error = %message,
            error_code = err.error_code(),
            retryable,
            "Delivery failed"
        ),
        LogLevel::Warn => tracing::warn!(
            error = %message,
            error_code = err.error_code(),
            retryable,
            "Delivery failed"
        ),
        LogLevel::Error => tracing::error!(
            error = %message,
            error_code = err.error_code(),
            retryable,
            "Delivery failed"
        ),
    }

    if retryable {
        delivery.nack(&message);
    } else {
        delivery.reject(&message);
    }
}
