//! Queue draining
//!
//! [`SyncCoordinator::drain`] walks the queue oldest-first and submits one
//! mutation at a time. It stops at the first transient failure so nothing
//! newer overtakes an item that is still waiting to be retried.
//!
//! [`spawn_coordinator`] runs draining in the background, triggered by
//! connectivity coming back, new enqueues, backoff expiry and explicit
//! [`SyncCommand::Drain`] requests.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::BackoffPolicy;
use super::remote::{RemoteApi, RemoteError, SessionContext};
use crate::models::{EntityKind, LocalId, PendingMutation};
use crate::network::NetworkMonitor;
use crate::queue::{MutationQueue, QueueResult};

/// Default deadline for a single submission
pub const DEFAULT_SUBMIT_TIMEOUT: Duration = Duration::from_secs(15);

/// What the coordinator is doing right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    Draining,
    /// Waiting out a transient failure before retrying
    Backoff { attempt: u32, delay: Duration },
}

impl CoordinatorState {
    pub fn is_draining(&self) -> bool {
        matches!(self, CoordinatorState::Draining)
    }
}

/// Why a drain did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Offline,
    Unauthenticated,
    /// Another drain holds the lock
    AlreadyRunning,
}

/// Outcome of one [`SyncCoordinator::drain`] pass
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DrainReport {
    /// Submitted and removed from the queue, in submission order
    pub synced: Vec<LocalId>,
    /// Terminally rejected during this pass
    pub failed: Vec<LocalId>,
    /// Set when the pass stopped on a transient failure
    pub backoff: Option<Duration>,
    pub skipped: Option<SkipReason>,
}

impl DrainReport {
    fn skipped(reason: SkipReason) -> Self {
        Self {
            skipped: Some(reason),
            ..Self::default()
        }
    }
}

/// Events emitted while draining
#[derive(Debug, Clone)]
pub enum SyncEvent {
    StateChanged(CoordinatorState),
    Synced {
        id: LocalId,
        entity_type: EntityKind,
        response: Value,
    },
    Failed {
        id: LocalId,
        entity_type: EntityKind,
        reason: String,
    },
    Retrying {
        id: LocalId,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
}

/// Tunables for draining
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub backoff: BackoffPolicy,
    pub submit_timeout: Duration,
    /// Give up on a mutation after this many transient failures; `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffPolicy::default(),
            submit_timeout: DEFAULT_SUBMIT_TIMEOUT,
            max_attempts: None,
        }
    }
}

/// Drains the [`MutationQueue`] into a [`RemoteApi`]
pub struct SyncCoordinator<R: RemoteApi> {
    queue: Arc<MutationQueue>,
    remote: R,
    network: Arc<NetworkMonitor>,
    session: Arc<dyn SessionContext>,
    config: CoordinatorConfig,
    state_tx: watch::Sender<CoordinatorState>,
    event_tx: mpsc::UnboundedSender<SyncEvent>,
    event_rx: StdMutex<Option<mpsc::UnboundedReceiver<SyncEvent>>>,
    drain_lock: Mutex<()>,
    consecutive_failures: AtomicU32,
}

impl<R: RemoteApi> SyncCoordinator<R> {
    pub fn new(
        queue: Arc<MutationQueue>,
        remote: R,
        network: Arc<NetworkMonitor>,
        session: Arc<dyn SessionContext>,
        config: CoordinatorConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(CoordinatorState::Idle);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            queue,
            remote,
            network,
            session,
            config,
            state_tx,
            event_tx,
            event_rx: StdMutex::new(Some(event_rx)),
            drain_lock: Mutex::new(()),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn state(&self) -> CoordinatorState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<CoordinatorState> {
        self.state_tx.subscribe()
    }

    /// Take the event receiver (can only be called once)
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SyncEvent>> {
        self.event_rx.lock().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// Submit pending mutations oldest-first until the queue is empty, a
    /// transient failure forces a backoff, or connectivity drops
    ///
    /// Only one drain runs at a time; a concurrent call returns immediately
    /// with [`SkipReason::AlreadyRunning`].
    pub async fn drain(&self) -> QueueResult<DrainReport> {
        let Ok(_guard) = self.drain_lock.try_lock() else {
            debug!("Drain already in progress");
            return Ok(DrainReport::skipped(SkipReason::AlreadyRunning));
        };
        if !self.network.is_online() {
            return Ok(DrainReport::skipped(SkipReason::Offline));
        }
        if !self.session.is_authenticated() {
            debug!("Not authenticated, leaving queue untouched");
            return Ok(DrainReport::skipped(SkipReason::Unauthenticated));
        }

        let result = self.drain_locked().await;
        if result.is_err() {
            self.set_state(CoordinatorState::Idle);
        }
        result
    }

    async fn drain_locked(&self) -> QueueResult<DrainReport> {
        // Holding the drain lock, nothing of ours is in flight
        let stuck = self.queue.recover_interrupted()?;
        if stuck > 0 {
            info!("Returned {} unsettled mutation(s) to pending", stuck);
        }

        let mut report = DrainReport::default();

        loop {
            let Some(mutation) = self.queue.peek_oldest_pending()? else {
                self.set_state(CoordinatorState::Idle);
                break;
            };
            if !self.network.is_online() {
                info!("Went offline mid-drain; {} left pending", mutation.id);
                self.set_state(CoordinatorState::Idle);
                report.skipped = Some(SkipReason::Offline);
                break;
            }
            self.set_state(CoordinatorState::Draining);

            self.queue.mark_syncing(mutation.id)?;
            let outcome = self.submit(&mutation).await;
            match self.settle(&mutation, outcome, &mut report) {
                Ok(Step::Continue) => {}
                Ok(Step::Stop) => break,
                Err(e) => {
                    // Never leave it Syncing, or the next drain would pass it
                    if let Err(revert) = self.queue.release(mutation.id) {
                        warn!("Could not release {}: {}", mutation.id, revert);
                    }
                    warn!("Could not record outcome of {}: {}", mutation.id, e);
                    return Err(e);
                }
            }
        }

        Ok(report)
    }

    /// Record the result of one submission
    fn settle(
        &self,
        mutation: &PendingMutation,
        outcome: Result<Value, RemoteError>,
        report: &mut DrainReport,
    ) -> QueueResult<Step> {
        match outcome {
            Ok(response) => {
                self.queue.mark_synced(mutation.id)?;
                self.consecutive_failures.store(0, Ordering::SeqCst);
                info!("Synced {} {}", mutation.entity_type, mutation.id);
                report.synced.push(mutation.id);
                self.emit(SyncEvent::Synced {
                    id: mutation.id,
                    entity_type: mutation.entity_type,
                    response,
                });
                Ok(Step::Continue)
            }
            Err(e) if !e.is_transient() => {
                warn!("{} {} rejected: {}", mutation.entity_type, mutation.id, e);
                self.fail(mutation, e.to_string(), report)?;
                Ok(Step::Continue)
            }
            Err(e) => {
                let attempts = mutation.retry_count.saturating_add(1);
                if self.config.max_attempts.is_some_and(|max| attempts >= max.max(1)) {
                    warn!(
                        "Giving up on {} {} after {} attempts: {}",
                        mutation.entity_type, mutation.id, attempts, e
                    );
                    let reason = format!("gave up after {} attempts: {}", attempts, e);
                    self.fail(mutation, reason, report)?;
                    return Ok(Step::Continue);
                }

                self.queue.mark_pending(mutation.id, &e.to_string())?;
                let attempt = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                let delay = self.config.backoff.delay(attempt);
                warn!(
                    "Submitting {} {} failed ({}); retrying in {:?}",
                    mutation.entity_type, mutation.id, e, delay
                );
                self.set_state(CoordinatorState::Backoff { attempt, delay });
                self.emit(SyncEvent::Retrying {
                    id: mutation.id,
                    attempt,
                    delay,
                    reason: e.to_string(),
                });
                report.backoff = Some(delay);
                Ok(Step::Stop)
            }
        }
    }

    async fn submit(&self, mutation: &PendingMutation) -> Result<Value, RemoteError> {
        match tokio::time::timeout(self.config.submit_timeout, self.remote.submit(mutation)).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Timeout),
        }
    }

    fn fail(
        &self,
        mutation: &PendingMutation,
        reason: String,
        report: &mut DrainReport,
    ) -> QueueResult<()> {
        self.queue.mark_failed(mutation.id, &reason)?;
        report.failed.push(mutation.id);
        self.emit(SyncEvent::Failed {
            id: mutation.id,
            entity_type: mutation.entity_type,
            reason,
        });
        Ok(())
    }

    fn set_state(&self, state: CoordinatorState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state;
            true
        });
        if changed {
            self.emit(SyncEvent::StateChanged(state));
        }
    }

    fn emit(&self, event: SyncEvent) {
        // Nobody listening is fine
        let _ = self.event_tx.send(event);
    }
}

/// Whether a drain moves on after settling one item
enum Step {
    Continue,
    Stop,
}

/// Commands sent to the coordinator task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncCommand {
    /// Drain now, skipping any remaining backoff
    Drain,
    Shutdown,
}

/// Handle to the background coordinator task
pub struct CoordinatorHandle {
    /// Send commands to the task
    pub command_tx: mpsc::Sender<SyncCommand>,
    /// Drain events; `None` if they were already taken from the coordinator
    pub event_rx: Option<mpsc::UnboundedReceiver<SyncEvent>>,
    /// Watch coordinator state
    pub state_rx: watch::Receiver<CoordinatorState>,
    task: JoinHandle<()>,
}

impl CoordinatorHandle {
    /// Ask for an immediate drain
    pub async fn request_drain(&self) -> bool {
        self.command_tx.send(SyncCommand::Drain).await.is_ok()
    }

    /// Stop the task and wait for it to exit
    ///
    /// A submission in flight is allowed to finish first.
    pub async fn shutdown(self) {
        let _ = self.command_tx.send(SyncCommand::Shutdown).await;
        if let Err(e) = self.task.await {
            if !e.is_cancelled() {
                warn!("Coordinator task ended abnormally: {}", e);
            }
        }
    }
}

/// Spawn the background drain task
///
/// Drains once at startup, then again whenever connectivity comes back, a
/// mutation is enqueued while idle, a backoff delay runs out, or a
/// [`SyncCommand::Drain`] arrives.
pub fn spawn_coordinator<R: RemoteApi>(coordinator: Arc<SyncCoordinator<R>>) -> CoordinatorHandle {
    let (command_tx, command_rx) = mpsc::channel(16);
    let state_rx = coordinator.subscribe_state();
    let event_rx = coordinator.take_events();
    let task = tokio::spawn(coordinator_loop(coordinator, command_rx));
    CoordinatorHandle {
        command_tx,
        event_rx,
        state_rx,
        task,
    }
}

async fn coordinator_loop<R: RemoteApi>(
    coordinator: Arc<SyncCoordinator<R>>,
    mut command_rx: mpsc::Receiver<SyncCommand>,
) {
    let mut network_rx = coordinator.network.subscribe();
    let mut queue_rx = coordinator.queue.subscribe();
    network_rx.borrow_and_update();

    loop {
        let backoff = match coordinator.drain().await {
            Ok(report) => report.backoff,
            Err(e) => {
                warn!("Drain failed: {}", e);
                Some(coordinator.config.backoff.max)
            }
        };
        // Our own status updates are not new work
        queue_rx.borrow_and_update();

        let deadline = backoff.map(|delay| Instant::now() + delay);
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    break;
                }
                changed = network_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    if network_rx.borrow_and_update().is_online {
                        break;
                    }
                }
                changed = queue_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    queue_rx.borrow_and_update();
                    if deadline.is_none() {
                        break;
                    }
                }
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(SyncCommand::Drain) => break,
                        Some(SyncCommand::Shutdown) | None => {
                            coordinator.set_state(CoordinatorState::Idle);
                            debug!("Coordinator task stopped");
                            return;
                        }
                    }
                }
            }
        }
    }
}
