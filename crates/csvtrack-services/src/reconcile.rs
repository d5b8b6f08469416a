use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

use crate::dispatcher::{DispatchError, IngestionDispatcher};

/// Periodic sweep that republishes Pending records whose message was lost.
pub struct Reconciler {
    dispatcher: Arc<IngestionDispatcher>,
    grace: Duration,
}

impl Reconciler {
    /// `grace` is how long a record may stay Pending before it counts as stale.
    pub fn new(dispatcher: Arc<IngestionDispatcher>, grace: Duration) -> Self {
        Self { dispatcher, grace }
    }

    pub async fn run_once(&self) -> Result<usize, DispatchError> {
        let grace = chrono::Duration::from_std(self.grace).unwrap_or(chrono::Duration::MAX);
        let older_than = Utc::now()
            .checked_sub_signed(grace)
            .unwrap_or(chrono::DateTime::<Utc>::MIN_UTC);
        self.dispatcher.reconcile(older_than).await
    }

    /// Start the background sweep, once per `every`. Abort the returned handle to stop it.
    pub fn start(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut sweep_interval = interval(every);
            // The first tick completes immediately; nothing can be stale yet.
            sweep_interval.tick().await;

            loop {
                sweep_interval.tick().await;

                match self.run_once().await {
                    Ok(republished) => {
                        tracing::debug!(republished, "Reconciliation sweep completed")
                    }
                    Err(e) => tracing::error!(error = %e, "Reconciliation sweep failed"),
                }
            }
        })
    }
}
