use std::time::Duration;

use csvtrack_core::PipelineConfig;

use crate::backoff::BackoffPolicy;

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Deliveries per message before it is dead-lettered.
    pub max_delivery_attempts: u32,
    pub backoff: BackoffPolicy,
    /// A lease not settled within this window is reclaimed as a nack.
    pub ack_deadline: Duration,
    /// How long `publish` waits for free capacity.
    pub publish_timeout: Duration,
    /// Messages held at once: ready, delayed and in flight. Dead letters do not count.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_delivery_attempts: 5,
            backoff: BackoffPolicy::default(),
            ack_deadline: Duration::from_secs(60),
            publish_timeout: Duration::from_secs(5),
            capacity: 10_000,
        }
    }
}

impl From<&PipelineConfig> for QueueConfig {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_delivery_attempts: config.max_delivery_attempts,
            backoff: BackoffPolicy::new(config.backoff_base(), config.backoff_max()),
            ack_deadline: config.ack_deadline(),
            publish_timeout: config.publish_timeout(),
            capacity: config.queue_capacity,
        }
    }
}
