//! In-process pipeline: dispatcher, queue, worker pool and reconciler wired
//! from one [`PipelineConfig`].

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use csvtrack_core::PipelineConfig;
use csvtrack_db::RecordStore;
use csvtrack_queue::{DeliveryQueue, QueueConfig, QueueStats};
use csvtrack_storage::Storage;
use csvtrack_worker::{ProcessingWorker, WorkerConfig, WorkerPool};

use crate::dead_letters::DeadLetterService;
use crate::dispatcher::{DispatchError, DispatchPolicy, IngestionDispatcher};
use crate::reconcile::Reconciler;
use crate::status::StatusService;

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

pub struct Pipeline {
    queue: DeliveryQueue,
    dispatcher: Arc<IngestionDispatcher>,
    status: StatusService,
    dead_letters: DeadLetterService,
    pool: WorkerPool,
    reconciler: Arc<Reconciler>,
    sweep: Option<JoinHandle<()>>,
}

impl Pipeline {
    /// Build every component and start the worker pool (and the reconciliation
    /// sweep when `reconcile_interval_secs > 0`). Must run inside a Tokio runtime.
    pub fn start(
        store: Arc<dyn RecordStore>,
        storage: Arc<dyn Storage>,
        config: &PipelineConfig,
    ) -> Self {
        let queue = DeliveryQueue::new(QueueConfig::from(config));

        let dispatcher = Arc::new(IngestionDispatcher::new(
            store.clone(),
            Arc::new(queue.clone()),
            DispatchPolicy::from(config),
        ));

        let worker = ProcessingWorker::new(store.clone(), storage)
            .with_validation_errors_retryable(config.validation_errors_retryable);
        let pool = WorkerPool::start(queue.clone(), Arc::new(worker), WorkerConfig::from(config));

        let reconciler = Arc::new(Reconciler::new(dispatcher.clone(), config.reconcile_grace()));
        let sweep = config
            .reconcile_interval()
            .map(|every| reconciler.clone().start(every));

        tracing::info!(
            worker_count = config.worker_count,
            reconcile = sweep.is_some(),
            "Pipeline started"
        );

        Self {
            status: StatusService::new(store.clone()),
            dead_letters: DeadLetterService::new(store, queue.clone()),
            queue,
            dispatcher,
            pool,
            reconciler,
            sweep,
        }
    }

    pub fn dispatcher(&self) -> &IngestionDispatcher {
        &self.dispatcher
    }

    pub fn queue(&self) -> &DeliveryQueue {
        &self.queue
    }

    pub fn status(&self) -> &StatusService {
        &self.status
    }

    pub fn dead_letters(&self) -> &DeadLetterService {
        &self.dead_letters
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Republish stale Pending records now, independent of the background sweep.
    pub async fn reconcile_once(&self) -> Result<usize, DispatchError> {
        self.reconciler.run_once().await
    }

    /// Wait until no message is ready, delayed or in flight.
    pub async fn wait_until_drained(&self) {
        while !self.queue.stats().is_drained() {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Stop the sweep and the workers, then close the queue.
    pub async fn shutdown(self) {
        if let Some(sweep) = self.sweep {
            sweep.abort();
        }
        self.pool.shutdown().await;
        self.queue.close();
        tracing::info!("Pipeline stopped");
    }
}
