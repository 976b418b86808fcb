//! fieldsync core library
//!
//! Offline-first mutation sync: field workers keep recording while
//! disconnected, writes are queued durably, likely duplicates are caught
//! before they are queued, reads fall back to a cache, and the queue is
//! replayed against the server in order once connectivity returns.
//!
//! # Architecture
//!
//! - **NetworkMonitor**: one transition event per real connectivity change
//! - **MutationQueue**: durable FIFO of pending writes
//! - **DuplicateGuard**: heuristic pre-submit check (`duplicate`)
//! - **SyncCoordinator**: serial drain with backoff
//! - **ReadCache**: TTL cache for GET responses
//! - **StatusIndicator**: read-only view for the UI
//!
//! Everything persists through a [`KeyValueStore`].
//!
//! # Quick Start
//!
//! ```text
//! let engine = Engine::open(&Config::load()?)?;
//! engine.init().await;
//!
//! engine.submit(EntityKind::Attendee, json!({ "name": "Sara", "session_id": "s-1" }), false)?;
//! let status = engine.status().current();
//! ```
//!
//! # Modules
//!
//! - `engine`: service object wiring everything together (main entry point)
//! - `models`: queued mutation records
//! - `queue`, `cache`, `network`, `duplicate`, `status`: the components
//! - `sync`: remote API client and coordinator
//! - `storage`: key-value backends
//! - `config`: application configuration

pub mod cache;
pub mod clock;
pub mod config;
pub mod duplicate;
pub mod engine;
pub mod models;
pub mod network;
pub mod queue;
pub mod status;
pub mod storage;
pub mod sync;

pub use cache::{CacheError, ReadCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Config, StorageBackend};
pub use duplicate::{is_likely_duplicate, PersonRecord};
pub use engine::{open_store, Engine, SubmitError};
pub use models::{EntityKind, LocalId, MutationStatus, PendingMutation};
pub use network::{ConnectivityProbe, ConnectivityState, HttpProbe, NetworkMonitor};
pub use queue::{MutationQueue, QueueError, QueueSummary};
pub use status::{StatusIndicator, SyncStatus};
pub use storage::{FileStore, KeyValueStore, MemoryStore, SqliteStore, StorageError};
pub use sync::{DrainReport, HttpRemote, RemoteApi, RemoteError, SessionContext, SyncEvent};
