//! csvtrack core library
//!
//! This crate provides the domain models, upload fingerprinting, error types and
//! configuration shared by every csvtrack component.

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod models;
pub mod processing_error;

// Re-export commonly used types
pub use config::PipelineConfig;
pub use error::{ErrorMetadata, LogLevel, StoreError, StoreResult};
pub use fingerprint::{compute_fingerprint, Fingerprint};
pub use processing_error::{ProcessingError, ProcessingErrorKind, ProcessingResultExt};
