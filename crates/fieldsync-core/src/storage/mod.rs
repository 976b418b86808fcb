//! Storage layer
//!
//! All durable local state goes through the [`KeyValueStore`] trait. The
//! engine never touches files or databases directly, so it runs the same
//! against the in-memory fake used in tests and the on-disk backends.
//!
//! ## Backends
//!
//! - [`MemoryStore`]: process-local, optional byte quota
//! - [`FileStore`]: one JSON file per key, atomic writes
//! - [`SqliteStore`]: embedded SQLite table

mod error;
mod file;
mod memory;
pub mod schema;
mod sqlite;

use serde_json::Value;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Fixed, versioned storage keys
///
/// Bump the version suffix when the stored shape changes so old data can be
/// detected and migrated instead of misread.
pub mod keys {
    /// JSON array of pending mutations
    pub const QUEUE: &str = "fieldsync/queue/v1";
    /// Next LocalId to hand out
    pub const QUEUE_SEQ: &str = "fieldsync/queue-seq/v1";
    /// JSON map of cached reads
    pub const CACHE: &str = "fieldsync/cache/v1";
}

/// Synchronous durable key-value persistence
///
/// `set` may fail with [`StorageError::QuotaExceeded`]; callers treat that as
/// terminal for the operation and do not retry it.
pub trait KeyValueStore: Send + Sync {
    /// Read a value, `None` if the key was never written or was deleted
    fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    /// Write a value, replacing any previous one
    fn set(&self, key: &str, value: &Value) -> StorageResult<()>;

    /// Remove a value; removing a missing key is not an error
    fn delete(&self, key: &str) -> StorageResult<()>;
}
