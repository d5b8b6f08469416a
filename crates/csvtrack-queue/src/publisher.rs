use async_trait::async_trait;

use csvtrack_core::models::{MessageId, SourceLocation};
use csvtrack_core::Fingerprint;

use crate::error::QueueError;

/// Publishing side of a delivery queue.
///
/// The dispatcher only ever needs to enqueue, so it depends on this trait
/// rather than on a concrete queue.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        fingerprint: Fingerprint,
        source: SourceLocation,
    ) -> Result<MessageId, QueueError>;
}
