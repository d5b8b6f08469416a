//! csvtrack services layer
//!
//! Orchestration on top of the record store, delivery queue and worker:
//! turning upload notifications into queued work, sweeping Pending records
//! that never got a message, redriving dead letters and answering status
//! queries. [`Pipeline`] wires all of it together for an in-process run.

pub mod dead_letters;
pub mod dispatcher;
pub mod pipeline;
pub mod reconcile;
pub mod status;

pub use dead_letters::{DeadLetterError, DeadLetterService};
pub use dispatcher::{DispatchError, DispatchOutcome, DispatchPolicy, IngestionDispatcher};
pub use pipeline::Pipeline;
pub use reconcile::Reconciler;
pub use status::{StatusError, StatusService, DEFAULT_LIST_LIMIT};

pub use csvtrack_queue::{DeliveryQueue, QueueStats};
pub use csvtrack_storage::{LocalStorage, MemoryStorage, Storage};
