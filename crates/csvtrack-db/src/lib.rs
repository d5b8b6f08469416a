//! csvtrack record store
//!
//! The record store is the single source of truth for upload processing state.
//! It is shared by the dispatcher and every worker, so all mutations are
//! single-record conditional writes: a transition only applies when the record
//! is currently in one of the caller's expected states. A Done record is never
//! modified.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod store;

pub use memory::InMemoryRecordStore;
#[cfg(feature = "postgres")]
pub use postgres::{connect_pool, PgRecordStore};
pub use store::{RecordStore, MAX_LIST_LIMIT};
