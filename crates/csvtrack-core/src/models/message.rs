use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::upload::SourceLocation;
use crate::fingerprint::Fingerprint;

pub type MessageId = Uuid;

/// Queue message asking a worker to process one upload.
///
/// Wire shape: `{id, fingerprint, source, delivery_attempt}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeliveryMessage {
    pub id: MessageId,
    pub fingerprint: Fingerprint,
    pub source: SourceLocation,
    /// Starts at 1 and is incremented by the queue on every redelivery.
    pub delivery_attempt: u32,
}

impl DeliveryMessage {
    pub fn new(fingerprint: Fingerprint, source: SourceLocation) -> Self {
        Self {
            id: Uuid::new_v4(),
            fingerprint,
            source,
            delivery_attempt: 1,
        }
    }
}
