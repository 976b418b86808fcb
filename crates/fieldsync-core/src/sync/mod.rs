//! Replaying queued mutations against the server
//!
//! - [`RemoteApi`] / [`HttpRemote`]: one `POST` endpoint per entity kind
//! - [`BackoffPolicy`]: delay between retries of transient failures
//! - [`SyncCoordinator`]: serial, oldest-first drain of the queue
//!
//! ## Usage
//!
//! ```ignore
//! let coordinator = Arc::new(SyncCoordinator::new(queue, remote, network, session, config));
//! let handle = spawn_coordinator(coordinator);
//! handle.request_drain().await;
//! handle.shutdown().await;
//! ```

mod backoff;
mod coordinator;
mod remote;

pub use backoff::BackoffPolicy;
pub use coordinator::{
    spawn_coordinator, CoordinatorConfig, CoordinatorHandle, CoordinatorState, DrainReport,
    SkipReason, SyncCommand, SyncCoordinator, SyncEvent, DEFAULT_SUBMIT_TIMEOUT,
};
pub use remote::{HttpRemote, RemoteApi, RemoteError, SessionContext, IDEMPOTENCY_HEADER};
