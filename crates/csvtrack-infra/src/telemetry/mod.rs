//! Tracing subscriber initialization
//!
//! Logs go to stderr, either human-readable or one JSON object per line, so
//! stdout stays free for command output.
//! `RUST_LOG` overrides the default filter.

mod init_basic;

pub use init_basic::{default_filter, init_telemetry, shutdown_telemetry, LogFormat};
