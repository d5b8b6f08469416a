//! Delivery queue: leases, redelivery with backoff, and dead-lettering.
//!
//! State lives behind one mutex that is never held across an `.await`, so a
//! handle dropped without being settled can give its lease back synchronously.
//! Deadlines use `tokio::time::Instant` and follow a paused test clock.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tokio::time::Instant;

use csvtrack_core::models::{
    DeadLetter, DeadLetterReason, DeliveryMessage, MessageId, SourceLocation,
};
use csvtrack_core::Fingerprint;

use crate::config::QueueConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::QueueError;
use crate::publisher::MessagePublisher;

const ACK_DEADLINE_EXCEEDED: &str = "ack deadline exceeded";
const HANDLE_DROPPED: &str = "delivery handle dropped without being settled";

struct Lease {
    message: DeliveryMessage,
    token: u64,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<DeliveryMessage>,
    /// Keyed by due time; the sequence number keeps equal instants apart.
    delayed: BTreeMap<(Instant, u64), DeliveryMessage>,
    in_flight: HashMap<MessageId, Lease>,
    sequence: u64,
    closed: bool,
}

impl QueueState {
    fn len(&self) -> usize {
        self.ready.len() + self.delayed.len() + self.in_flight.len()
    }

    fn next_sequence(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    fn schedule(&mut self, due: Instant, message: DeliveryMessage) {
        let sequence = self.next_sequence();
        self.delayed.insert((due, sequence), message);
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(entry) = self.delayed.first_entry() {
            if entry.key().0 > now {
                break;
            }
            let message = entry.remove();
            self.ready.push_back(message);
        }
    }

    /// Earliest instant at which a delayed message becomes due or a lease expires.
    fn next_wakeup(&self) -> Option<Instant> {
        let next_due = self.delayed.keys().next().map(|(due, _)| *due);
        let next_expiry = self.in_flight.values().map(|lease| lease.deadline).min();
        match (next_due, next_expiry) {
            (Some(due), Some(expiry)) => Some(due.min(expiry)),
            (due, expiry) => due.or(expiry),
        }
    }
}

enum Settlement<'a> {
    Ack,
    Nack(&'a str),
    Reject(&'a str),
}

struct Inner {
    config: QueueConfig,
    state: Mutex<QueueState>,
    message_available: Notify,
    space_available: Notify,
    dead_letters: DeadLetterSink,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Schedule the next attempt of a failed delivery, or dead-letter it once
    /// the attempt budget is spent.
    fn fail_delivery(
        &self,
        state: &mut QueueState,
        mut message: DeliveryMessage,
        error: &str,
        now: Instant,
    ) {
        let failed_attempt = message.delivery_attempt;
        if failed_attempt >= self.config.max_delivery_attempts {
            self.dead_letter(message, DeadLetterReason::MaxAttemptsExceeded, error);
            return;
        }

        let delay = self.config.backoff.delay_for(failed_attempt);
        tracing::info!(
            message_id = %message.id,
            fingerprint = %message.fingerprint,
            delivery_attempt = failed_attempt + 1,
            max_delivery_attempts = self.config.max_delivery_attempts,
            backoff_ms = delay.as_millis() as u64,
            error = %error,
            "Scheduling redelivery"
        );
        message.delivery_attempt = failed_attempt + 1;
        state.schedule(now + delay, message);
        self.message_available.notify_one();
    }

    fn dead_letter(&self, message: DeliveryMessage, reason: DeadLetterReason, error: &str) {
        self.dead_letters.push(DeadLetter {
            message,
            reason,
            last_error: Some(error.to_string()),
            dead_lettered_at: Utc::now(),
        });
        self.space_available.notify_one();
    }

    fn reap_locked(&self, state: &mut QueueState, now: Instant) -> usize {
        let expired: Vec<MessageId> = state
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(lease) = state.in_flight.remove(id) {
                tracing::warn!(
                    message_id = %id,
                    fingerprint = %lease.message.fingerprint,
                    delivery_attempt = lease.message.delivery_attempt,
                    "Ack deadline exceeded, reclaiming delivery"
                );
                self.fail_delivery(state, lease.message, ACK_DEADLINE_EXCEEDED, now);
            }
        }
        expired.len()
    }

    /// Returns false when the lease was already reclaimed.
    fn settle(&self, id: MessageId, token: u64, settlement: Settlement<'_>) -> bool {
        let mut state = self.lock();
        let lease = match state.in_flight.remove(&id) {
            Some(lease) if lease.token == token => lease,
            Some(newer) => {
                state.in_flight.insert(id, newer);
                tracing::debug!(message_id = %id, "Stale lease settled, ignoring");
                return false;
            }
            None => {
                tracing::debug!(message_id = %id, "Lease no longer held, ignoring settlement");
                return false;
            }
        };

        match settlement {
            Settlement::Ack => {
                tracing::debug!(
                    message_id = %id,
                    fingerprint = %lease.message.fingerprint,
                    delivery_attempt = lease.message.delivery_attempt,
                    "Message acknowledged"
                );
                self.space_available.notify_one();
            }
            Settlement::Nack(error) => {
                self.fail_delivery(&mut state, lease.message, error, Instant::now());
            }
            Settlement::Reject(error) => {
                self.dead_letter(lease.message, DeadLetterReason::NonRetryable, error);
            }
        }
        true
    }
}

/// Point-in-time message counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub ready: usize,
    pub delayed: usize,
    pub in_flight: usize,
    pub dead_lettered: usize,
    pub closed: bool,
}

impl QueueStats {
    /// Messages that still await a successful delivery.
    pub fn outstanding(&self) -> usize {
        self.ready + self.delayed + self.in_flight
    }

    pub fn is_drained(&self) -> bool {
        self.outstanding() == 0
    }
}

/// Bounded in-process delivery queue. Cloning shares the same queue.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<Inner>,
}

impl DeliveryQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self::with_dead_letter_sink(config, DeadLetterSink::new())
    }

    pub fn with_dead_letter_sink(config: QueueConfig, dead_letters: DeadLetterSink) -> Self {
        tracing::info!(
            max_delivery_attempts = config.max_delivery_attempts,
            backoff_base_ms = config.backoff.base.as_millis() as u64,
            backoff_max_ms = config.backoff.max.as_millis() as u64,
            ack_deadline_secs = config.ack_deadline.as_secs(),
            capacity = config.capacity,
            "Delivery queue created"
        );
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(QueueState::default()),
                message_available: Notify::new(),
                space_available: Notify::new(),
                dead_letters,
            }),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.inner.dead_letters
    }

    /// Enqueue a new message for `fingerprint`, waiting up to `publish_timeout`
    /// for free capacity.
    #[tracing::instrument(skip(self, source), fields(bucket = %source.bucket, object_name = %source.object_name))]
    pub async fn publish(
        &self,
        fingerprint: Fingerprint,
        source: SourceLocation,
    ) -> Result<MessageId, QueueError> {
        self.enqueue(DeliveryMessage::new(fingerprint, source)).await
    }

    async fn enqueue(&self, message: DeliveryMessage) -> Result<MessageId, QueueError> {
        let deadline = Instant::now() + self.inner.config.publish_timeout;
        loop {
            let space = self.inner.space_available.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if state.closed {
                    return Err(QueueError::Closed);
                }
                if state.len() < self.inner.config.capacity {
                    let id = message.id;
                    tracing::debug!(
                        message_id = %id,
                        fingerprint = %message.fingerprint,
                        delivery_attempt = message.delivery_attempt,
                        "Message enqueued"
                    );
                    state.ready.push_back(message);
                    drop(state);
                    self.inner.message_available.notify_one();
                    return Ok(id);
                }
            }

            if tokio::time::timeout_at(deadline, space).await.is_err() {
                tracing::warn!(
                    fingerprint = %message.fingerprint,
                    capacity = self.inner.config.capacity,
                    "Timed out waiting for queue capacity"
                );
                return Err(QueueError::PublishTimeout(self.inner.config.publish_timeout));
            }
        }
    }

    /// Wait for the next eligible message and lease it to the caller.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn consume(&self) -> Option<DeliveryHandle> {
        loop {
            let available = self.inner.message_available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            let wake_at = {
                let mut state = self.inner.lock();
                if state.closed {
                    return None;
                }

                let now = Instant::now();
                self.inner.reap_locked(&mut state, now);
                state.promote_due(now);

                if let Some(message) = state.ready.pop_front() {
                    let token = state.next_sequence();
                    state.in_flight.insert(
                        message.id,
                        Lease {
                            message: message.clone(),
                            token,
                            deadline: now + self.inner.config.ack_deadline,
                        },
                    );
                    tracing::debug!(
                        message_id = %message.id,
                        fingerprint = %message.fingerprint,
                        delivery_attempt = message.delivery_attempt,
                        "Message leased"
                    );
                    return Some(DeliveryHandle {
                        inner: Arc::clone(&self.inner),
                        message,
                        token,
                        settled: false,
                    });
                }

                state.next_wakeup()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut available => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => available.await,
            }
        }
    }

    /// Reclaim every lease whose ack deadline has passed. Returns how many were reclaimed.
    pub fn reap_expired(&self) -> usize {
        let mut state = self.inner.lock();
        self.inner.reap_locked(&mut state, Instant::now())
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        let delayed = state.delayed.len();
        QueueStats {
            ready: state.ready.len(),
            delayed,
            in_flight: state.in_flight.len(),
            dead_lettered: self.inner.dead_letters.len(),
            closed: state.closed,
        }
    }

    /// Stop handing out messages and wake every waiting consumer and publisher.
    ///
    /// Outstanding handles can still be settled.
    pub fn close(&self) {
        self.inner.lock().closed = true;
        self.inner.message_available.notify_waiters();
        self.inner.space_available.notify_waiters();
        tracing::info!("Delivery queue closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Move a dead letter back into the queue with its attempt counter reset.
    ///
    /// The message keeps its id. If the queue cannot take it, the dead letter is restored.
    #[tracing::instrument(skip(self))]
    pub async fn redrive(&self, message_id: MessageId) -> Result<MessageId, QueueError> {
        let dead_letter = self
            .inner
            .dead_letters
            .take(message_id)
            .ok_or(QueueError::DeadLetterNotFound(message_id))?;

        let mut message = dead_letter.message.clone();
        message.delivery_attempt = 1;

        match self.enqueue(message).await {
            Ok(id) => {
                tracing::info!(
                    message_id = %id,
                    fingerprint = %dead_letter.message.fingerprint,
                    reason = %dead_letter.reason,
                    "Dead letter redriven"
                );
                Ok(id)
            }
            Err(err) => {
                self.inner.dead_letters.push_front(dead_letter);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl MessagePublisher for DeliveryQueue {
    async fn publish(
        &self,
        fingerprint: Fingerprint,
        source: SourceLocation,
    ) -> Result<MessageId, QueueError> {
        DeliveryQueue::publish(self, fingerprint, source).await
    }
}

/// A leased delivery. Settle it with [`ack`](Self::ack), [`nack`](Self::nack)
/// or [`reject`](Self::reject); dropping it unsettled counts as a nack.
pub struct DeliveryHandle {
    inner: Arc<Inner>,
    message: DeliveryMessage,
    token: u64,
    settled: bool,
}

impl DeliveryHandle {
    pub fn message(&self) -> &DeliveryMessage {
        &self.message
    }

    pub fn delivery_attempt(&self) -> u32 {
        self.message.delivery_attempt
    }

    /// Remove the message for good. A late ack of a reclaimed lease is a no-op
    /// and returns false.
    pub fn ack(mut self) -> bool {
        self.settled = true;
        self.inner
            .settle(self.message.id, self.token, Settlement::Ack)
    }

    /// Hand the message back for redelivery after backoff.
    pub fn nack(mut self, error: &str) -> bool {
        self.settled = true;
        self.inner
            .settle(self.message.id, self.token, Settlement::Nack(error))
    }

    /// Send the message straight to the dead-letter sink.
    pub fn reject(mut self, error: &str) -> bool {
        self.settled = true;
        self.inner
            .settle(self.message.id, self.token, Settlement::Reject(error))
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle")
            .field("message", &self.message)
            .field("settled", &self.settled)
            .finish()
    }
}

impl Drop for DeliveryHandle {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!(
                message_id = %self.message.id,
                fingerprint = %self.message.fingerprint,
                "Delivery handle dropped unsettled, treating as nack"
            );
            self.inner
                .settle(self.message.id, self.token, Settlement::Nack(HANDLE_DROPPED));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffPolicy;
    use std::time::Duration;

    fn config() -> QueueConfig {
        QueueConfig {
            max_delivery_attempts: 5,
            backoff: BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60)),
            ack_deadline: Duration::from_secs(30),
            publish_timeout: Duration::from_secs(2),
            capacity: 100,
        }
    }

    fn source(name: &str) -> SourceLocation {
        SourceLocation {
            bucket: "uploads".to_string(),
            object_name: name.to_string(),
            size: 42,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_consume_ack() {
        let queue = DeliveryQueue::new(config());
        let id = queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();

        let handle = queue.consume().await.unwrap();
        assert_eq!(handle.message().id, id);
        assert_eq!(handle.delivery_attempt(), 1);
        assert_eq!(queue.stats().in_flight, 1);

        assert!(handle.ack());
        assert!(queue.stats().is_drained());
        assert_eq!(queue.stats().dead_lettered, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_message_is_dead_lettered_once() {
        let queue = DeliveryQueue::new(config());
        let id = queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();

        let mut attempts = Vec::new();
        let mut delivered_at = Vec::new();
        for _ in 0..5 {
            let handle = queue.consume().await.unwrap();
            attempts.push(handle.delivery_attempt());
            delivered_at.push(Instant::now());
            assert!(handle.nack("empty file"));
        }

        assert_eq!(attempts, vec![1, 2, 3, 4, 5]);
        for (i, pair) in delivered_at.windows(2).enumerate() {
            let expected = config().backoff.delay_for(i as u32 + 1);
            assert!(pair[1] - pair[0] >= expected);
        }

        let stats = queue.stats();
        assert!(stats.is_drained());
        assert_eq!(stats.dead_lettered, 1);

        let dead = queue.dead_letters().peek(10);
        assert_eq!(dead[0].message.id, id);
        assert_eq!(dead[0].message.delivery_attempt, 5);
        assert_eq!(dead[0].reason, DeadLetterReason::MaxAttemptsExceeded);
        assert_eq!(dead[0].last_error.as_deref(), Some("empty file"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_goes_straight_to_dead_letters() {
        let queue = DeliveryQueue::new(config());
        queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();

        let handle = queue.consume().await.unwrap();
        assert!(handle.reject("unknown record"));

        let dead = queue.dead_letters().peek(10);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].reason, DeadLetterReason::NonRetryable);
        assert_eq!(dead[0].message.delivery_attempt, 1);
        assert!(queue.stats().is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_is_redelivered() {
        let queue = DeliveryQueue::new(config());
        queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();

        drop(queue.consume().await.unwrap());
        assert_eq!(queue.stats().delayed, 1);

        let handle = queue.consume().await.unwrap();
        assert_eq!(handle.delivery_attempt(), 2);
        assert!(handle.ack());
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_reclaimed_and_late_ack_ignored() {
        let queue = DeliveryQueue::new(config());
        queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();

        let stale = queue.consume().await.unwrap();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(queue.reap_expired(), 1);
        assert_eq!(queue.stats().in_flight, 0);

        let fresh = queue.consume().await.unwrap();
        assert_eq!(fresh.message().id, stale.message().id);
        assert_eq!(fresh.delivery_attempt(), 2);

        assert!(!stale.ack());
        assert_eq!(queue.stats().in_flight, 1);
        assert!(fresh.ack());
        assert!(queue.stats().is_drained());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_consumer_reclaims_expired_lease() {
        let queue = DeliveryQueue::new(config());
        queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();

        let stale = queue.consume().await.unwrap();
        // Nothing else is ready: consume sleeps past the ack deadline and the backoff.
        let fresh = queue.consume().await.unwrap();
        assert_eq!(fresh.delivery_attempt(), 2);
        assert!(!stale.ack());
        assert!(fresh.ack());
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_times_out_when_full() {
        let queue = DeliveryQueue::new(QueueConfig {
            capacity: 1,
            ..config()
        });
        queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();

        let err = queue
            .publish("fp-b".to_string(), source("b.csv"))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::PublishTimeout(Duration::from_secs(2)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_publish_waits_for_space() {
        let queue = DeliveryQueue::new(QueueConfig {
            capacity: 1,
            ..config()
        });
        queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();

        let publisher = queue.clone();
        let pending = tokio::spawn(async move {
            publisher.publish("fp-b".to_string(), source("b.csv")).await
        });
        tokio::task::yield_now().await;

        let handle = queue.consume().await.unwrap();
        assert!(handle.ack());
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(queue.stats().ready, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_wakes_consumers_and_rejects_publish() {
        let queue = DeliveryQueue::new(config());
        let consumer = queue.clone();
        let waiting = tokio::spawn(async move { consumer.consume().await.is_none() });
        tokio::task::yield_now().await;

        queue.close();
        assert!(waiting.await.unwrap());
        assert!(queue.is_closed());

        let err = queue
            .publish("fp-a".to_string(), source("a.csv"))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_redrive_resets_attempts() {
        let queue = DeliveryQueue::new(config());
        let id = queue.publish("fp-a".to_string(), source("a.csv")).await.unwrap();
        queue.consume().await.unwrap().reject("bad");

        assert_eq!(queue.redrive(id).await.unwrap(), id);
        assert!(queue.dead_letters().is_empty());

        let handle = queue.consume().await.unwrap();
        assert_eq!(handle.message().id, id);
        assert_eq!(handle.delivery_attempt(), 1);
        handle.ack();

        let missing = MessageId::new_v4();
        assert_eq!(
            queue.redrive(missing).await.unwrap_err(),
            QueueError::DeadLetterNotFound(missing)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_publisher_trait_object() {
        let queue = DeliveryQueue::new(config());
        let publisher: Arc<dyn MessagePublisher> = Arc::new(queue.clone());
        publisher
            .publish("fp-a".to_string(), source("a.csv"))
            .await
            .unwrap();
        assert_eq!(queue.stats().ready, 1);
    }
}
