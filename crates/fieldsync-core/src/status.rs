//! Read-only sync status for display

use serde::Serialize;
use tokio::sync::watch;

use crate::network::{ConnectivityState, NetworkMonitor};
use crate::queue::{MutationQueue, QueueSummary};
use crate::sync::CoordinatorState;

/// What the UI shows: connectivity and queue counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub is_online: bool,
    /// Waiting or in flight
    pub pending_count: usize,
    pub failed_count: usize,
    pub is_syncing: bool,
}

/// Projection of [`NetworkMonitor`], [`MutationQueue`] and coordinator state
///
/// Holds only watch receivers, so it can be cloned freely and rendered at
/// any rate without affecting the engine.
#[derive(Debug, Clone)]
pub struct StatusIndicator {
    network_rx: watch::Receiver<ConnectivityState>,
    queue_rx: watch::Receiver<QueueSummary>,
    coordinator_rx: Option<watch::Receiver<CoordinatorState>>,
}

impl StatusIndicator {
    pub fn new(network: &NetworkMonitor, queue: &MutationQueue) -> Self {
        Self {
            network_rx: network.subscribe(),
            queue_rx: queue.subscribe(),
            coordinator_rx: None,
        }
    }

    /// Also report `is_syncing` while the coordinator is draining
    pub fn with_coordinator(mut self, state_rx: watch::Receiver<CoordinatorState>) -> Self {
        self.coordinator_rx = Some(state_rx);
        self
    }

    pub fn current(&self) -> SyncStatus {
        let connectivity = *self.network_rx.borrow();
        let summary = *self.queue_rx.borrow();
        let draining = self
            .coordinator_rx
            .as_ref()
            .is_some_and(|rx| rx.borrow().is_draining());

        SyncStatus {
            is_online: connectivity.is_online,
            pending_count: summary.outstanding(),
            failed_count: summary.failed,
            is_syncing: draining || summary.syncing > 0,
        }
    }

    /// Wait for any source to change, then return the new status
    ///
    /// Returns `None` once the engine behind it has been dropped.
    pub async fn changed(&mut self) -> Option<SyncStatus> {
        let Self {
            network_rx,
            queue_rx,
            coordinator_rx,
        } = self;
        let coordinator_changed = async {
            match coordinator_rx.as_mut() {
                Some(rx) => rx.changed().await,
                None => std::future::pending().await,
            }
        };

        let result = tokio::select! {
            r = network_rx.changed() => r,
            r = queue_rx.changed() => r,
            r = coordinator_changed => r,
        };
        result.ok()?;

        self.network_rx.borrow_and_update();
        self.queue_rx.borrow_and_update();
        if let Some(rx) = self.coordinator_rx.as_mut() {
            rx.borrow_and_update();
        }
        Some(self.current())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::models::EntityKind;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::sync::Arc;

    fn queue() -> MutationQueue {
        MutationQueue::open(Arc::new(MemoryStore::new()), Arc::new(SystemClock)).unwrap()
    }

    #[test]
    fn test_counts_follow_queue() {
        let network = NetworkMonitor::new(false);
        let queue = queue();
        let status = StatusIndicator::new(&network, &queue);

        let a = queue.enqueue(EntityKind::Session, json!({})).unwrap();
        queue.enqueue(EntityKind::Session, json!({})).unwrap();
        queue.mark_syncing(a).unwrap();
        queue.mark_failed(a, "rejected").unwrap();

        assert_eq!(
            status.current(),
            SyncStatus {
                is_online: false,
                pending_count: 1,
                failed_count: 1,
                is_syncing: false,
            }
        );
    }

    #[test]
    fn test_in_flight_item_counts_as_syncing() {
        let network = NetworkMonitor::new(true);
        let queue = queue();
        let status = StatusIndicator::new(&network, &queue);

        let id = queue.enqueue(EntityKind::Attendee, json!({ "name": "Sara" })).unwrap();
        queue.mark_syncing(id).unwrap();

        let current = status.current();
        assert!(current.is_syncing);
        assert_eq!(current.pending_count, 1);
    }

    #[test]
    fn test_coordinator_state_drives_is_syncing() {
        let network = NetworkMonitor::new(true);
        let queue = queue();
        let (state_tx, state_rx) = watch::channel(CoordinatorState::Idle);
        let status = StatusIndicator::new(&network, &queue).with_coordinator(state_rx);

        assert!(!status.current().is_syncing);
        state_tx.send(CoordinatorState::Draining).unwrap();
        assert!(status.current().is_syncing);
    }

    #[tokio::test]
    async fn test_changed_wakes_on_connectivity() {
        let network = NetworkMonitor::new(false);
        let queue = queue();
        let mut status = StatusIndicator::new(&network, &queue);

        network.report(true);
        let next = status.changed().await.unwrap();
        assert!(next.is_online);
    }

    #[tokio::test]
    async fn test_changed_wakes_on_enqueue() {
        let network = NetworkMonitor::new(false);
        let queue = queue();
        let mut status = StatusIndicator::new(&network, &queue);

        queue.enqueue(EntityKind::Session, json!({})).unwrap();
        let next = status.changed().await.unwrap();
        assert_eq!(next.pending_count, 1);
    }
}
