//! csvtrack delivery queue
//!
//! At-least-once delivery of processing messages. Every delivery is leased to
//! one consumer until it is acknowledged, negatively acknowledged, rejected or
//! its ack deadline passes. Failed deliveries come back after an exponential
//! backoff; once the attempt budget is spent the message moves to the
//! dead-letter sink, from where operators can drain or redrive it.

pub mod backoff;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod publisher;
pub mod queue;

pub use backoff::BackoffPolicy;
pub use config::QueueConfig;
pub use dead_letter::DeadLetterSink;
pub use error::QueueError;
pub use publisher::MessagePublisher;
pub use queue::{DeliveryHandle, DeliveryQueue, QueueStats};
