//! Message handler trait
//!
//! The worker pool calls `handle` for every leased delivery and settles the
//! delivery from the result: `Ok` acks, a retryable error nacks and any other
//! error rejects.

use async_trait::async_trait;

use csvtrack_core::models::DeliveryMessage;
use csvtrack_core::ProcessingError;

/// How a delivery ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The upload was validated and recorded as Done.
    Processed { lines: u64 },
    /// The record was already Done before this delivery started.
    AlreadyDone,
    /// Another delivery settled the record first; this result was discarded.
    Superseded,
}

#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &DeliveryMessage) -> Result<HandleOutcome, ProcessingError>;
}
