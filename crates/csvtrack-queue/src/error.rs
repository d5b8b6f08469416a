use std::time::Duration;

use csvtrack_core::models::MessageId;
use csvtrack_core::{ErrorMetadata, LogLevel};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Delivery queue is closed")]
    Closed,

    #[error("Timed out after {0:?} waiting for queue capacity")]
    PublishTimeout(Duration),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(MessageId),
}

impl ErrorMetadata for QueueError {
    fn error_code(&self) -> &'static str {
        match self {
            QueueError::Closed => "QUEUE_CLOSED",
            QueueError::PublishTimeout(_) => "QUEUE_PUBLISH_TIMEOUT",
            QueueError::DeadLetterNotFound(_) => "DEAD_LETTER_NOT_FOUND",
        }
    }

    fn is_retryable(&self) -> bool {
        matches!(self, QueueError::PublishTimeout(_))
    }

    fn log_level(&self) -> LogLevel {
        match self {
            QueueError::Closed => LogLevel::Warn,
            QueueError::PublishTimeout(_) => LogLevel::Error,
            QueueError::DeadLetterNotFound(_) => LogLevel::Debug,
        }
    }
}
