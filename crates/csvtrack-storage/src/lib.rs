//! csvtrack storage library
//!
//! Read-side access to the buckets uploads land in. Objects are addressed by
//! `(bucket, object_name)`; object names may contain `/` but never `..` or a
//! leading `/`.
//!
//! `LocalStorage` maps buckets to directories under a root. `MemoryStorage`
//! keeps objects in memory and can inject transient failures, for tests and
//! dry runs.

#[cfg(feature = "storage-local")]
pub mod local;
pub mod memory;
pub mod traits;

// Re-export commonly used types
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use memory::MemoryStorage;
pub use traits::{ObjectMetadata, Storage, StorageBackend, StorageError, StorageResult};
