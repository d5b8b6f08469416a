//! Data models for the pipeline
//!
//! Upload records are owned by the record store, delivery messages and dead
//! letters by the delivery queue.

mod dead_letter;
mod message;
mod upload;

pub use dead_letter::*;
pub use message::*;
pub use upload::*;
