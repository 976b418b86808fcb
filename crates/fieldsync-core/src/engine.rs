//! The sync engine
//!
//! [`Engine`] is constructed once at application start and owns every
//! long-lived piece: the store, [`NetworkMonitor`], [`MutationQueue`],
//! [`ReadCache`] and [`SyncCoordinator`]. Consumers get it by reference.
//!
//! ## Lifecycle
//!
//! ```ignore
//! let engine = Engine::open(&config)?;
//! engine.init().await;          // probe once, start polling and draining
//! engine.submit(EntityKind::Attendee, payload, false)?;
//! let sessions = engine.fetch("/api/sessions").await?;
//! engine.dispose().await;       // stop background work
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDate, Utc};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::{CacheError, ReadCache};
use crate::clock::{Clock, SystemClock};
use crate::config::{Config, StorageBackend};
use crate::duplicate::{find_duplicate, PersonRecord};
use crate::models::{EntityKind, LocalId};
use crate::network::{ConnectivityProbe, HttpProbe, NetworkMonitor};
use crate::queue::{MutationQueue, QueueError, QueueResult};
use crate::status::StatusIndicator;
use crate::storage::{FileStore, KeyValueStore, MemoryStore, SqliteStore};
use crate::sync::{
    spawn_coordinator, CoordinatorConfig, CoordinatorHandle, DrainReport, HttpRemote, RemoteApi,
    SessionContext, SyncCommand, SyncCoordinator, SyncEvent,
};

/// Deadline for a single connectivity probe
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from [`Engine::submit`]
#[derive(Error, Debug)]
pub enum SubmitError {
    /// Looks like a repeat of an existing record; resubmit with `force` to
    /// record it anyway
    #[error("Likely duplicate of existing record '{}' (guardian '{}')", .existing.name, .existing.guardian)]
    LikelyDuplicate { existing: PersonRecord },

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Calendar day of `at` where the device is
fn local_day(at: DateTime<Utc>) -> NaiveDate {
    at.with_timezone(&Local).date_naive()
}

/// Open the configured [`KeyValueStore`]
pub fn open_store(config: &Config) -> Result<Arc<dyn KeyValueStore>> {
    let store: Arc<dyn KeyValueStore> = match config.storage_backend {
        StorageBackend::Sqlite => {
            config.ensure_data_dir()?;
            let path = config.sqlite_path();
            Arc::new(
                SqliteStore::open(&path)
                    .with_context(|| format!("Failed to open database: {:?}", path))?,
            )
        }
        StorageBackend::File => {
            let dir = config.store_dir();
            Arc::new(
                FileStore::open(&dir)
                    .with_context(|| format!("Failed to open store directory: {:?}", dir))?,
            )
        }
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };
    debug!("Using {} storage", config.storage_backend);
    Ok(store)
}

/// Offline-first write queue and read cache in front of a [`RemoteApi`]
pub struct Engine<R: RemoteApi = HttpRemote, P: ConnectivityProbe = HttpProbe> {
    clock: Arc<dyn Clock>,
    network: Arc<NetworkMonitor>,
    queue: Arc<MutationQueue>,
    cache: ReadCache,
    coordinator: Arc<SyncCoordinator<R>>,
    probe: Option<P>,
    handle: Mutex<Option<CoordinatorHandle>>,
}

impl Engine<HttpRemote, HttpProbe> {
    /// Build an engine from configuration
    ///
    /// Starts offline; [`Engine::init`] runs the first probe.
    pub fn open(config: &Config) -> Result<Self> {
        let api_url = config.api_url.as_deref().context(
            "No API URL configured. Set one with: fieldsync config set api_url <url>",
        )?;

        let store = open_store(config)?;
        let remote = HttpRemote::new(api_url, config.submit_timeout())
            .context("Failed to create HTTP client")?
            .with_auth_token(config.auth_token.clone());
        let probe = match config.probe_url() {
            Some(url) => Some(HttpProbe::new(url, PROBE_TIMEOUT).context("Failed to create probe")?),
            None => None,
        };
        let network = Arc::new(NetworkMonitor::with_poll_interval(
            false,
            config.poll_interval(),
        ));
        let session: Arc<dyn SessionContext> = Arc::new(config.auth_token.is_some());

        let engine = Engine::new(
            store,
            remote,
            network,
            session,
            Arc::new(SystemClock),
            config.coordinator_config(),
        )
        .context("Failed to open mutation queue")?
        .with_probe(probe)
        .with_cache_ttl(config.cache_ttl());
        Ok(engine)
    }
}

impl<R: RemoteApi, P: ConnectivityProbe + Clone> Engine<R, P> {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        remote: R,
        network: Arc<NetworkMonitor>,
        session: Arc<dyn SessionContext>,
        clock: Arc<dyn Clock>,
        config: CoordinatorConfig,
    ) -> QueueResult<Self> {
        let queue = Arc::new(MutationQueue::open(store.clone(), clock.clone())?);
        let cache = ReadCache::new(store, network.clone(), clock.clone());
        let coordinator = Arc::new(SyncCoordinator::new(
            queue.clone(),
            remote,
            network.clone(),
            session,
            config,
        ));

        Ok(Self {
            clock,
            network,
            queue,
            cache,
            coordinator,
            probe: None,
            handle: Mutex::new(None),
        })
    }

    /// Poll `probe` for connectivity once [`Engine::init`] runs
    pub fn with_probe(mut self, probe: Option<P>) -> Self {
        self.probe = probe;
        self
    }

    /// Default TTL for cached reads
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache = self.cache.with_default_ttl(ttl);
        self
    }

    /// Check connectivity now, then start polling and background draining
    ///
    /// Calling it again restarts polling and leaves the running drain task
    /// in place.
    pub async fn init(&self) {
        if let Some(probe) = self.probe.clone() {
            let online = probe.is_reachable().await;
            self.network.report(online);
            self.network.init(probe);
        }

        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if handle.is_none() {
            *handle = Some(spawn_coordinator(self.coordinator.clone()));
            info!("Sync engine started");
        }
    }

    /// Stop polling and draining; an in-flight submission finishes first
    pub async fn dispose(&self) {
        self.network.dispose();
        let handle = self.handle.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            handle.shutdown().await;
            info!("Sync engine stopped");
        }
    }

    /// One probe, without starting the poll task
    pub async fn refresh_connectivity(&self) -> bool {
        match self.probe.as_ref() {
            Some(probe) => {
                let online = probe.is_reachable().await;
                self.network.report(online);
                online
            }
            None => self.network.is_online(),
        }
    }

    /// Queue a write after checking it against queued items of the same kind
    pub fn submit(&self, kind: EntityKind, payload: Value, force: bool) -> Result<LocalId, SubmitError> {
        self.submit_checked(kind, payload, &[], force)
    }

    /// Queue a write after checking it against `known` records and queued
    /// items of the same kind
    ///
    /// With `force` the duplicate check is skipped entirely.
    pub fn submit_checked(
        &self,
        kind: EntityKind,
        payload: Value,
        known: &[PersonRecord],
        force: bool,
    ) -> Result<LocalId, SubmitError> {
        if !force {
            if let Some(existing) = self.find_duplicate(kind, &payload, known)? {
                info!("Holding back likely duplicate {} '{}'", kind, existing.name);
                return Err(SubmitError::LikelyDuplicate { existing });
            }
        }
        Ok(self.queue.enqueue(kind, payload)?)
    }

    /// The record `payload` likely repeats, if any
    pub fn find_duplicate(
        &self,
        kind: EntityKind,
        payload: &Value,
        known: &[PersonRecord],
    ) -> QueueResult<Option<PersonRecord>> {
        let Some(candidate) = PersonRecord::from_payload(kind, payload, self.today()) else {
            return Ok(None);
        };

        let mut existing: Vec<PersonRecord> = known.to_vec();
        existing.extend(
            self.queue
                .list()?
                .iter()
                .filter(|m| m.entity_type == kind)
                .filter_map(|m| {
                    PersonRecord::from_payload(kind, &m.payload, local_day(m.created_at))
                }),
        );
        Ok(find_duplicate(&candidate, &existing).cloned())
    }

    /// The local calendar day duplicate checks compare against
    ///
    /// Records built outside the engine (e.g. from a server listing) should
    /// use this as their fallback day so both sides agree.
    pub fn today(&self) -> NaiveDate {
        local_day(self.clock.now())
    }

    /// Read `path` through the cache
    pub async fn fetch(&self, path: &str) -> Result<Value, CacheError> {
        let remote = self.coordinator.remote();
        self.cache.get_or_fetch(path, || remote.fetch(path)).await
    }

    /// Drain the queue now, in the caller's task
    pub async fn drain(&self) -> QueueResult<DrainReport> {
        self.coordinator.drain().await
    }

    /// Ask the background task to drain; `false` if it is not running
    pub async fn request_drain(&self) -> bool {
        let command_tx = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| h.command_tx.clone());
        match command_tx {
            Some(tx) => tx.send(SyncCommand::Drain).await.is_ok(),
            None => false,
        }
    }

    /// Take the drain event stream (once)
    pub fn take_events(&self) -> Option<tokio::sync::mpsc::UnboundedReceiver<SyncEvent>> {
        self.coordinator.take_events()
    }

    pub fn status(&self) -> StatusIndicator {
        StatusIndicator::new(&self.network, &self.queue)
            .with_coordinator(self.coordinator.subscribe_state())
    }

    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    pub fn cache(&self) -> &ReadCache {
        &self.cache
    }

    pub fn network(&self) -> &Arc<NetworkMonitor> {
        &self.network
    }

    pub fn coordinator(&self) -> &Arc<SyncCoordinator<R>> {
        &self.coordinator
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }
}
