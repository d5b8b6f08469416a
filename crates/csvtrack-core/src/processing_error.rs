//! Processing error types
//!
//! A processing failure always propagates back to the delivery queue. The queue
//! uses the `retryable` flag to decide between redelivering the message and
//! moving it straight to the dead-letter sink.

use std::fmt;

use crate::error::{ErrorMetadata, LogLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingErrorKind {
    /// I/O or backend unavailability; the record is left in Processing.
    Transient,
    /// The uploaded content is empty or malformed; the record is marked Failed.
    Validation,
    /// Nothing a retry can fix (e.g. the message references an unknown record).
    NonRetryable,
}

/// Error returned by a message handler.
#[derive(Debug)]
pub struct ProcessingError {
    inner: anyhow::Error,
    kind: ProcessingErrorKind,
    retryable: bool,
}

impl ProcessingError {
    /// Transient failure, always redelivered while attempts remain.
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            kind: ProcessingErrorKind::Transient,
            retryable: true,
        }
    }

    /// Content validation failure. Whether it is worth redelivering is a
    /// deployment choice, so the caller decides.
    pub fn validation(err: impl Into<anyhow::Error>, retryable: bool) -> Self {
        Self {
            inner: err.into(),
            kind: ProcessingErrorKind::Validation,
            retryable,
        }
    }

    /// Failure that goes straight to the dead-letter sink.
    pub fn non_retryable(err: impl Into<anyhow::Error>) -> Self {
        Self {
            inner: err.into(),
            kind: ProcessingErrorKind::NonRetryable,
            retryable: false,
        }
    }

    pub fn kind(&self) -> ProcessingErrorKind {
        self.kind
    }
}

impl fmt::Display for ProcessingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

impl std::error::Error for ProcessingError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner.source()
    }
}

impl From<anyhow::Error> for ProcessingError {
    /// Unclassified errors are treated as transient
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err)
    }
}

impl ErrorMetadata for ProcessingError {
    fn error_code(&self) -> &'static str {
        match self.kind {
            ProcessingErrorKind::Transient => "TRANSIENT_PROCESSING_ERROR",
            ProcessingErrorKind::Validation => "VALIDATION_ERROR",
            ProcessingErrorKind::NonRetryable => "NON_RETRYABLE_ERROR",
        }
    }

    fn is_retryable(&self) -> bool {
        self.retryable
    }

    fn log_level(&self) -> LogLevel {
        match self.kind {
            ProcessingErrorKind::Transient => LogLevel::Warn,
            ProcessingErrorKind::Validation => LogLevel::Warn,
            ProcessingErrorKind::NonRetryable => LogLevel::Error,
        }
    }
}

/// Extension trait for classifying a `Result`'s error
pub trait ProcessingResultExt<T> {
    /// Mark this result as transient on error
    fn transient(self) -> Result<T, ProcessingError>;

    /// Mark this result as non-retryable on error
    fn non_retryable(self) -> Result<T, ProcessingError>;
}

impl<T, E: Into<anyhow::Error>> ProcessingResultExt<T> for Result<T, E> {
    fn transient(self) -> Result<T, ProcessingError> {
        self.map_err(|e| ProcessingError::transient(e.into()))
    }

    fn non_retryable(self) -> Result<T, ProcessingError> {
        self.map_err(|e| ProcessingError::non_retryable(e.into()))
    }
}
