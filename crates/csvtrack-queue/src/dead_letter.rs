use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use csvtrack_core::models::{DeadLetter, MessageId};

/// Append-only holding area for messages that left the queue unacknowledged.
///
/// Entries are kept oldest first. Cloning shares the same entries.
#[derive(Clone, Default)]
pub struct DeadLetterSink {
    entries: Arc<Mutex<VecDeque<DeadLetter>>>,
}

impl DeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<DeadLetter>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn push(&self, dead_letter: DeadLetter) {
        tracing::warn!(
            message_id = %dead_letter.message.id,
            fingerprint = %dead_letter.message.fingerprint,
            delivery_attempt = dead_letter.message.delivery_attempt,
            reason = %dead_letter.reason,
            last_error = dead_letter.last_error.as_deref().unwrap_or(""),
            "Message dead-lettered"
        );
        self.lock().push_back(dead_letter);
    }

    pub(crate) fn push_front(&self, dead_letter: DeadLetter) {
        self.lock().push_front(dead_letter);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Remove and return up to `limit` entries, oldest first.
    pub fn drain(&self, limit: usize) -> Vec<DeadLetter> {
        let mut entries = self.lock();
        let count = limit.min(entries.len());
        entries.drain(..count).collect()
    }

    /// Return up to `limit` entries, oldest first, without removing them.
    pub fn peek(&self, limit: usize) -> Vec<DeadLetter> {
        self.lock().iter().take(limit).cloned().collect()
    }

    pub fn get(&self, message_id: MessageId) -> Option<DeadLetter> {
        self.lock()
            .iter()
            .find(|d| d.message.id == message_id)
            .cloned()
    }

    /// Remove a single entry by message id.
    pub fn take(&self, message_id: MessageId) -> Option<DeadLetter> {
        let mut entries = self.lock();
        let index = entries.iter().position(|d| d.message.id == message_id)?;
        entries.remove(index)
    }
}
