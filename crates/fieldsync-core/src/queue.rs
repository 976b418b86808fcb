//! Durable mutation queue
//!
//! Writes made while offline (or before the coordinator gets to them) are
//! appended here and persisted through the [`KeyValueStore`] as one JSON
//! array under [`keys::QUEUE`].
//!
//! ## Ordering
//!
//! The stored array is append-only with respect to order: records are only
//! ever pushed to the end, updated in place, or removed. `LocalId`s come from
//! a persisted counter under [`keys::QUEUE_SEQ`], so ids increase in enqueue
//! order even when several writes land in the same millisecond.
//!
//! Every read-modify-write of the array runs under one synchronous lock with
//! no await point inside, so two forms submitted back to back cannot lose an
//! append.

use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::models::{EntityKind, LocalId, MutationStatus, PendingMutation};
use crate::storage::{keys, KeyValueStore, StorageError};

/// Errors from queue operations
#[derive(Error, Debug)]
pub enum QueueError {
    /// Payload rejected before queueing; never retried
    #[error("Invalid payload: {0}")]
    Validation(String),

    #[error("No queued mutation with id {0}")]
    NotFound(LocalId),

    #[error("Cannot {action} mutation {id} while it is {from}")]
    InvalidTransition {
        id: LocalId,
        from: MutationStatus,
        action: &'static str,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type QueueResult<T> = Result<T, QueueError>;

/// Counts by status, published after every queue write
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueSummary {
    pub pending: usize,
    pub syncing: usize,
    pub failed: usize,
}

impl QueueSummary {
    fn of(items: &[PendingMutation]) -> Self {
        let mut summary = Self::default();
        for item in items {
            match item.status {
                MutationStatus::Pending => summary.pending += 1,
                MutationStatus::Syncing => summary.syncing += 1,
                MutationStatus::Failed => summary.failed += 1,
                MutationStatus::Synced => {}
            }
        }
        summary
    }

    /// Items that still have to reach the server (pending or in flight)
    pub fn outstanding(&self) -> usize {
        self.pending + self.syncing
    }

    pub fn total(&self) -> usize {
        self.pending + self.syncing + self.failed
    }
}

/// Ordered, durable queue of writes awaiting submission
pub struct MutationQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    write_lock: Mutex<()>,
    summary_tx: watch::Sender<QueueSummary>,
}

impl MutationQueue {
    /// Open the queue stored in `store`
    ///
    /// Items left `Syncing` by an interrupted run are returned to `Pending`.
    pub fn open(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>) -> QueueResult<Self> {
        let (summary_tx, _) = watch::channel(QueueSummary::default());
        let queue = Self {
            store,
            clock,
            write_lock: Mutex::new(()),
            summary_tx,
        };

        let recovered = queue.recover_interrupted()?;
        if recovered > 0 {
            warn!(
                "{} mutation(s) were in flight when the last run stopped; they will be resent",
                recovered
            );
        }

        let items = queue.load()?;
        queue.publish(&items);
        info!("Opened mutation queue with {} item(s)", items.len());
        Ok(queue)
    }

    /// Append a new `Pending` mutation and return its id
    ///
    /// Never touches the network. Fails with `Validation` if the payload is
    /// not a JSON object, or with `Storage(QuotaExceeded)` if the backing
    /// store is full; in both cases nothing is queued.
    pub fn enqueue(&self, entity_type: EntityKind, payload: Value) -> QueueResult<LocalId> {
        if !payload.is_object() {
            return Err(QueueError::Validation(format!(
                "{} payload must be a JSON object",
                entity_type
            )));
        }

        let _guard = self.lock();
        let mut items = self.load()?;

        let id = self.next_id(&items)?;
        let mutation = PendingMutation::new(id, entity_type, payload, self.clock.now());
        items.push(mutation);
        self.save(&items)?;

        debug!("Enqueued {} mutation {}", entity_type, id);
        Ok(id)
    }

    /// The oldest mutation still waiting to be submitted
    ///
    /// `None` when the oldest non-failed item is `Syncing`: nothing newer may
    /// be sent ahead of an item that is still in flight.
    pub fn peek_oldest_pending(&self) -> QueueResult<Option<PendingMutation>> {
        Ok(self
            .load()?
            .into_iter()
            .find(|m| !m.is_failed())
            .filter(|m| m.is_pending()))
    }

    /// All queued mutations in enqueue order, re-read from storage
    pub fn list(&self) -> QueueResult<Vec<PendingMutation>> {
        self.load()
    }

    /// Look up a single mutation
    pub fn get(&self, id: LocalId) -> QueueResult<Option<PendingMutation>> {
        Ok(self.load()?.into_iter().find(|m| m.id == id))
    }

    pub fn summary(&self) -> QueueResult<QueueSummary> {
        Ok(QueueSummary::of(&self.load()?))
    }

    /// Watch the status counts; updated after every write
    pub fn subscribe(&self) -> watch::Receiver<QueueSummary> {
        self.summary_tx.subscribe()
    }

    /// `Pending → Syncing`, just before submission
    pub fn mark_syncing(&self, id: LocalId) -> QueueResult<()> {
        self.update(id, "start syncing", |m| {
            if m.status != MutationStatus::Pending {
                return false;
            }
            m.status = MutationStatus::Syncing;
            true
        })
    }

    /// `Syncing → Synced`; the record is removed permanently
    pub fn mark_synced(&self, id: LocalId) -> QueueResult<()> {
        let _guard = self.lock();
        let mut items = self.load()?;
        let pos = position(&items, id)?;
        if items[pos].status != MutationStatus::Syncing {
            return Err(QueueError::InvalidTransition {
                id,
                from: items[pos].status,
                action: "mark synced",
            });
        }
        items.remove(pos);
        self.save(&items)?;
        debug!("Mutation {} synced and removed", id);
        Ok(())
    }

    /// Terminal failure; the record stays until the user retries or discards it
    pub fn mark_failed(&self, id: LocalId, reason: &str) -> QueueResult<()> {
        self.update(id, "mark failed", |m| {
            if !matches!(m.status, MutationStatus::Syncing | MutationStatus::Pending) {
                return false;
            }
            m.status = MutationStatus::Failed;
            m.last_error = Some(reason.to_string());
            true
        })
    }

    /// `Syncing → Pending` after a transient failure
    pub fn mark_pending(&self, id: LocalId, reason: &str) -> QueueResult<()> {
        self.update(id, "return to pending", |m| {
            if m.status != MutationStatus::Syncing {
                return false;
            }
            m.status = MutationStatus::Pending;
            m.retry_count = m.retry_count.saturating_add(1);
            m.last_error = Some(reason.to_string());
            true
        })
    }

    /// `Syncing → Pending` with every other field untouched
    ///
    /// Used when the outcome of a submission could not be recorded; the
    /// stored record does not grow, so it succeeds where `mark_pending` hit
    /// a full store.
    pub fn release(&self, id: LocalId) -> QueueResult<()> {
        self.update(id, "release", |m| {
            if m.status != MutationStatus::Syncing {
                return false;
            }
            m.status = MutationStatus::Pending;
            true
        })
    }

    /// User-requested retry of a failed mutation; it keeps its place in line
    pub fn retry_failed(&self, id: LocalId) -> QueueResult<()> {
        self.update(id, "retry", |m| {
            if m.status != MutationStatus::Failed {
                return false;
            }
            m.status = MutationStatus::Pending;
            m.retry_count = 0;
            m.last_error = None;
            true
        })
    }

    /// User-requested removal of a mutation that is not in flight
    pub fn discard(&self, id: LocalId) -> QueueResult<PendingMutation> {
        let _guard = self.lock();
        let mut items = self.load()?;
        let pos = position(&items, id)?;
        if items[pos].status == MutationStatus::Syncing {
            return Err(QueueError::InvalidTransition {
                id,
                from: MutationStatus::Syncing,
                action: "discard",
            });
        }
        let removed = items.remove(pos);
        self.save(&items)?;
        info!("Discarded {} mutation {}", removed.entity_type, id);
        Ok(removed)
    }

    /// Return every `Syncing` item to `Pending`; returns how many changed
    pub fn recover_interrupted(&self) -> QueueResult<usize> {
        let _guard = self.lock();
        let mut items = self.load()?;
        let mut recovered = 0;
        for item in items.iter_mut().filter(|m| m.status == MutationStatus::Syncing) {
            item.status = MutationStatus::Pending;
            recovered += 1;
        }
        if recovered > 0 {
            self.save(&items)?;
        }
        Ok(recovered)
    }

    fn update<F>(&self, id: LocalId, action: &'static str, apply: F) -> QueueResult<()>
    where
        F: FnOnce(&mut PendingMutation) -> bool,
    {
        let _guard = self.lock();
        let mut items = self.load()?;
        let pos = position(&items, id)?;
        let from = items[pos].status;
        if !apply(&mut items[pos]) {
            return Err(QueueError::InvalidTransition { id, from, action });
        }
        self.save(&items)
    }

    fn next_id(&self, items: &[PendingMutation]) -> QueueResult<LocalId> {
        let stored = self
            .store
            .get(keys::QUEUE_SEQ)?
            .and_then(|v| v.as_u64())
            .unwrap_or(1);
        let after_existing = items.iter().map(|m| m.id.0 + 1).max().unwrap_or(1);
        let id = stored.max(after_existing);

        self.store.set(keys::QUEUE_SEQ, &Value::from(id + 1))?;
        Ok(LocalId(id))
    }

    fn load(&self) -> QueueResult<Vec<PendingMutation>> {
        match self.store.get(keys::QUEUE)? {
            Some(value) => serde_json::from_value(value).map_err(|e| {
                StorageError::InvalidFormat {
                    key: keys::QUEUE.to_string(),
                    details: e.to_string(),
                }
                .into()
            }),
            None => Ok(Vec::new()),
        }
    }

    fn save(&self, items: &[PendingMutation]) -> QueueResult<()> {
        let value = serde_json::to_value(items).map_err(StorageError::from)?;
        self.store.set(keys::QUEUE, &value)?;
        self.publish(items);
        Ok(())
    }

    fn publish(&self, items: &[PendingMutation]) {
        let summary = QueueSummary::of(items);
        self.summary_tx.send_if_modified(|current| {
            let changed = *current != summary;
            *current = summary;
            changed
        });
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn position(items: &[PendingMutation], id: LocalId) -> QueueResult<usize> {
    items
        .iter()
        .position(|m| m.id == id)
        .ok_or(QueueError::NotFound(id))
}
