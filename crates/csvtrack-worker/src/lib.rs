//! csvtrack processing worker
//!
//! [`ProcessingWorker`] turns one delivery into a record status change:
//! it claims the upload record, downloads the object, validates the CSV and
//! records Done or Failed. [`WorkerPool`] runs it over a [`DeliveryQueue`]
//! with bounded concurrency and settles each delivery according to how the
//! handler's error is classified.
//!
//! [`DeliveryQueue`]: csvtrack_queue::DeliveryQueue

pub mod handler;
pub mod pool;
pub mod processor;
pub mod validator;

pub use handler::{HandleOutcome, MessageHandler};
pub use pool::{WorkerConfig, WorkerPool};
pub use processor::ProcessingWorker;
pub use validator::{CsvSummary, CsvValidationError, CsvValidator};
