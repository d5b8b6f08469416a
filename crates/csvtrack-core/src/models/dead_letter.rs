use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter, Result as FmtResult};

use super::message::DeliveryMessage;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    /// Redelivered until the attempt budget ran out.
    MaxAttemptsExceeded,
    /// The handler classified the failure as not worth retrying.
    NonRetryable,
}

impl Display for DeadLetterReason {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            DeadLetterReason::MaxAttemptsExceeded => write!(f, "max_attempts_exceeded"),
            DeadLetterReason::NonRetryable => write!(f, "non_retryable"),
        }
    }
}

/// A message that left the active queue without being acknowledged.
///
/// `message` is kept verbatim, including the attempt number of its last delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DeadLetter {
    pub message: DeliveryMessage,
    pub reason: DeadLetterReason,
    pub last_error: Option<String>,
    pub dead_lettered_at: DateTime<Utc>,
}
