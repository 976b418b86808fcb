//! Read cache for GET responses
//!
//! Keeps the last successful response per resource key under
//! [`keys::CACHE`] as one JSON map. Entries are valid while
//! `now - fetched_at < ttl`; an expired entry is treated as absent and is
//! purged the first time it is read.
//!
//! ## Behavior of `get_or_fetch`
//!
//! - Online: always call the fetcher. On success the entry is refreshed; on
//!   failure a valid cached entry is returned instead, otherwise the fetch
//!   error is propagated.
//! - Offline: the fetcher is never called. A valid entry is returned, or
//!   the call fails with [`CacheError::NoCachedData`].

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::network::NetworkMonitor;
use crate::storage::{keys, KeyValueStore, StorageError};
use crate::sync::RemoteError;

/// Default time-to-live of a cached read
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60);

/// Errors from cached reads
#[derive(Error, Debug)]
pub enum CacheError {
    /// Offline and nothing valid cached for this key
    #[error("No cached data for '{key}' while offline")]
    NoCachedData { key: String },

    /// Online fetch failed and nothing valid was cached to fall back to
    #[error("Fetch failed: {0}")]
    Fetch(#[from] RemoteError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// A cached GET response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub payload: Value,
    pub fetched_at: DateTime<Utc>,
    /// Missing on entries written before millisecond TTLs; those read as expired
    #[serde(default)]
    pub ttl_ms: u64,
}

impl CacheEntry {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    /// Whether the entry may still be served at `now`
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.fetched_at);
        match chrono::Duration::from_std(self.ttl()) {
            Ok(ttl) => age < ttl,
            Err(_) => true,
        }
    }
}

type CacheMap = BTreeMap<String, CacheEntry>;

/// TTL-bounded cache of last-known GET responses
pub struct ReadCache {
    store: Arc<dyn KeyValueStore>,
    network: Arc<NetworkMonitor>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
    ttl_overrides: Mutex<HashMap<String, Duration>>,
    write_lock: Mutex<()>,
}

impl ReadCache {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        network: Arc<NetworkMonitor>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            network,
            clock,
            default_ttl: DEFAULT_TTL,
            ttl_overrides: Mutex::new(HashMap::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Use `ttl` for keys without their own override
    pub fn with_default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Override the TTL for one key; applies to entries stored from now on
    pub fn set_ttl(&self, key: impl Into<String>, ttl: Duration) {
        self.ttl_overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into(), ttl);
    }

    pub fn ttl_for(&self, key: &str) -> Duration {
        self.ttl_overrides
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .copied()
            .unwrap_or(self.default_ttl)
    }

    /// Serve `key` from the network when online, from the cache otherwise
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetcher: F) -> Result<Value, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, RemoteError>>,
    {
        if !self.network.is_online() {
            debug!("Offline; serving '{}' from cache", key);
            return self
                .get(key)?
                .ok_or_else(|| CacheError::NoCachedData {
                    key: key.to_string(),
                });
        }

        match fetcher().await {
            Ok(payload) => {
                if let Err(e) = self.put(key, payload.clone()) {
                    // The fresh value is still correct; it just won't be
                    // available offline
                    warn!("Could not cache '{}': {}", key, e);
                }
                Ok(payload)
            }
            Err(fetch_error) => match self.get(key) {
                Ok(Some(cached)) => {
                    warn!("Fetch of '{}' failed ({}); serving cached copy", key, fetch_error);
                    Ok(cached)
                }
                Ok(None) => Err(CacheError::Fetch(fetch_error)),
                Err(storage_error) => {
                    warn!("Cache read for '{}' failed: {}", key, storage_error);
                    Err(CacheError::Fetch(fetch_error))
                }
            },
        }
    }

    /// The cached payload for `key`, if present and still valid
    pub fn get(&self, key: &str) -> Result<Option<Value>, StorageError> {
        Ok(self.entry(key)?.map(|e| e.payload))
    }

    /// The full cache entry for `key`, if present and still valid
    pub fn entry(&self, key: &str) -> Result<Option<CacheEntry>, StorageError> {
        let now = self.clock.now();
        let _guard = self.lock();
        let mut map = self.load()?;

        match map.get(key) {
            Some(entry) if entry.is_valid_at(now) => Ok(Some(entry.clone())),
            Some(_) => {
                debug!("Cache entry '{}' expired; purging", key);
                map.remove(key);
                self.save(&map)?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Store or refresh the entry for `key`
    pub fn put(&self, key: &str, payload: Value) -> Result<(), StorageError> {
        let entry = CacheEntry {
            key: key.to_string(),
            payload,
            fetched_at: self.clock.now(),
            ttl_ms: u64::try_from(self.ttl_for(key).as_millis()).unwrap_or(u64::MAX),
        };

        let _guard = self.lock();
        let mut map = self.load()?;
        map.insert(key.to_string(), entry);
        self.save(&map)
    }

    pub fn invalidate(&self, key: &str) -> Result<(), StorageError> {
        let _guard = self.lock();
        let mut map = self.load()?;
        if map.remove(key).is_some() {
            self.save(&map)?;
        }
        Ok(())
    }

    /// Drop every expired entry; returns how many were removed
    pub fn purge_expired(&self) -> Result<usize, StorageError> {
        let now = self.clock.now();
        let _guard = self.lock();
        let mut map = self.load()?;
        let before = map.len();
        map.retain(|_, entry| entry.is_valid_at(now));
        let removed = before - map.len();
        if removed > 0 {
            self.save(&map)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<(), StorageError> {
        let _guard = self.lock();
        self.store.delete(keys::CACHE)
    }

    /// Number of stored entries, expired ones included
    pub fn len(&self) -> Result<usize, StorageError> {
        Ok(self.load()?.len())
    }

    pub fn is_empty(&self) -> Result<bool, StorageError> {
        Ok(self.len()? == 0)
    }

    fn load(&self) -> Result<CacheMap, StorageError> {
        match self.store.get(keys::CACHE)? {
            Some(value) => serde_json::from_value(value).map_err(|e| StorageError::InvalidFormat {
                key: keys::CACHE.to_string(),
                details: e.to_string(),
            }),
            None => Ok(CacheMap::new()),
        }
    }

    fn save(&self, map: &CacheMap) -> Result<(), StorageError> {
        self.store.set(keys::CACHE, &serde_json::to_value(map)?)
    }

    fn lock(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock().unwrap_or_else(|e| e.into_inner())
    }
}
