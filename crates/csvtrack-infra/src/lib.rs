//! csvtrack infrastructure
//!
//! Process-level setup shared by csvtrack binaries.

pub mod telemetry;

pub use telemetry::{default_filter, init_telemetry, shutdown_telemetry, LogFormat};
