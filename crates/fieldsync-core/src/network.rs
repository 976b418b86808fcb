//! Connectivity monitoring
//!
//! [`NetworkMonitor`] owns the process-wide [`ConnectivityState`]. The host
//! feeds it platform online/offline signals through [`NetworkMonitor::report`],
//! and a poll task started by [`NetworkMonitor::init`] re-checks a
//! [`ConnectivityProbe`] on a fixed interval to correct missed or unreliable
//! signals.
//!
//! Listeners see exactly one notification per actual transition; repeated
//! "online" reports while already online are swallowed.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Default interval between connectivity probes
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Current connectivity, as last observed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectivityState {
    pub is_online: bool,
    /// Last moment the monitor saw the network come up (or start up online)
    pub last_online_at: Option<DateTime<Utc>>,
}

/// The polled connectivity primitive
pub trait ConnectivityProbe: Send + Sync + 'static {
    /// Whether the remote side is reachable right now
    fn is_reachable(&self) -> impl Future<Output = bool> + Send;
}

/// Probe that issues a `HEAD` request against a health URL
///
/// Any HTTP response, whatever its status, means the network is up.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpProbe {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl ConnectivityProbe for HttpProbe {
    async fn is_reachable(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(_) => true,
            Err(e) => {
                debug!("Connectivity probe to {} failed: {}", self.url, e);
                false
            }
        }
    }
}

type Listener = Arc<dyn Fn(ConnectivityState) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    callbacks: BTreeMap<u64, Listener>,
}

/// Handle returned by [`NetworkMonitor::on_change`]
///
/// Dropping it unsubscribes, so a listener cannot outlive its owner.
#[must_use = "dropping the subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    listeners: Weak<Mutex<Listeners>>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(listeners) = self.listeners.upgrade() {
            let mut listeners = listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners.callbacks.remove(&self.id);
        }
    }
}

/// Tracks whether the device is online
pub struct NetworkMonitor {
    state_tx: watch::Sender<ConnectivityState>,
    listeners: Arc<Mutex<Listeners>>,
    poll_task: Mutex<Option<JoinHandle<()>>>,
    poll_interval: Duration,
}

impl NetworkMonitor {
    /// Create a monitor with a known starting state
    pub fn new(initially_online: bool) -> Self {
        Self::with_poll_interval(initially_online, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_poll_interval(initially_online: bool, poll_interval: Duration) -> Self {
        let initial = ConnectivityState {
            is_online: initially_online,
            last_online_at: initially_online.then(Utc::now),
        };
        let (state_tx, _) = watch::channel(initial);
        Self {
            state_tx,
            listeners: Arc::new(Mutex::new(Listeners::default())),
            poll_task: Mutex::new(None),
            poll_interval,
        }
    }

    pub fn is_online(&self) -> bool {
        self.state_tx.borrow().is_online
    }

    pub fn state(&self) -> ConnectivityState {
        *self.state_tx.borrow()
    }

    /// Watch connectivity from async code
    pub fn subscribe(&self) -> watch::Receiver<ConnectivityState> {
        self.state_tx.subscribe()
    }

    /// Register a callback invoked once per connectivity transition
    pub fn on_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectivityState) + Send + Sync + 'static,
    {
        let mut listeners = self.lock_listeners();
        let id = listeners.next_id;
        listeners.next_id += 1;
        listeners.callbacks.insert(id, Arc::new(callback));
        Subscription {
            id,
            listeners: Arc::downgrade(&self.listeners),
        }
    }

    /// Record an observed connectivity value
    ///
    /// Returns `true` if this was a transition. Listeners are only notified
    /// on transitions.
    pub fn report(&self, online: bool) -> bool {
        let changed = self.state_tx.send_if_modified(|state| {
            if state.is_online == online {
                return false;
            }
            state.is_online = online;
            if online {
                state.last_online_at = Some(Utc::now());
            }
            true
        });

        if changed {
            let state = self.state();
            info!(
                "Connectivity changed: {}",
                if online { "online" } else { "offline" }
            );
            // Call outside the lock so a callback may (un)subscribe
            let callbacks: Vec<Listener> = self.lock_listeners().callbacks.values().cloned().collect();
            for callback in callbacks {
                callback(state);
            }
        }
        changed
    }

    /// Start polling `probe`; replaces any poll task already running
    pub fn init<P: ConnectivityProbe>(self: &Arc<Self>, probe: P) {
        let weak = Arc::downgrade(self);
        let interval = self.poll_interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let online = probe.is_reachable().await;
                let Some(monitor) = weak.upgrade() else {
                    break;
                };
                monitor.report(online);
            }
        });

        let previous = self
            .poll_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        debug!("Connectivity polling every {:?}", interval);
    }

    /// Stop polling and drop every listener
    pub fn dispose(&self) {
        if let Some(handle) = self
            .poll_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }
        self.lock_listeners().callbacks.clear();
    }

    pub fn listener_count(&self) -> usize {
        self.lock_listeners().callbacks.len()
    }

    fn lock_listeners(&self) -> std::sync::MutexGuard<'_, Listeners> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for NetworkMonitor {
    fn drop(&mut self) {
        if let Ok(mut task) = self.poll_task.lock() {
            if let Some(handle) = task.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[test]
    fn test_initial_state() {
        let online = NetworkMonitor::new(true);
        assert!(online.is_online());
        assert!(online.state().last_online_at.is_some());

        let offline = NetworkMonitor::new(false);
        assert!(!offline.is_online());
        assert!(offline.state().last_online_at.is_none());
    }

    #[test]
    fn test_one_event_per_transition() {
        let monitor = NetworkMonitor::new(false);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let _sub = monitor.on_change(move |s| sink.lock().unwrap().push(s.is_online));

        assert!(monitor.report(true));
        assert!(!monitor.report(true));
        assert!(!monitor.report(true));
        assert!(monitor.report(false));
        assert!(!monitor.report(false));
        assert!(monitor.report(true));

        assert_eq!(*events.lock().unwrap(), vec![true, false, true]);
    }

    #[test]
    fn test_last_online_at_tracks_transitions() {
        let monitor = NetworkMonitor::new(false);
        monitor.report(true);
        let first = monitor.state().last_online_at.unwrap();

        monitor.report(false);
        assert_eq!(monitor.state().last_online_at, Some(first));
    }

    #[test]
    fn test_unsubscribe_stops_callbacks() {
        let monitor = NetworkMonitor::new(false);
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let sub = monitor.on_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(monitor.listener_count(), 1);

        monitor.report(true);
        sub.unsubscribe();
        assert_eq!(monitor.listener_count(), 0);
        monitor.report(false);

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dispose_clears_listeners() {
        let monitor = NetworkMonitor::new(true);
        let _a = monitor.on_change(|_| {});
        let _b = monitor.on_change(|_| {});
        monitor.dispose();
        assert_eq!(monitor.listener_count(), 0);
    }

    #[tokio::test]
    async fn test_watch_receiver_sees_transition() {
        let monitor = NetworkMonitor::new(false);
        let mut rx = monitor.subscribe();

        monitor.report(true);
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_online);
    }

    struct FlagProbe(Arc<AtomicBool>);

    impl ConnectivityProbe for FlagProbe {
        async fn is_reachable(&self) -> bool {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_corrects_missed_signal() {
        let monitor = Arc::new(NetworkMonitor::with_poll_interval(
            false,
            Duration::from_secs(30),
        ));
        let reachable = Arc::new(AtomicBool::new(true));
        let mut rx = monitor.subscribe();

        monitor.init(FlagProbe(reachable.clone()));

        // First tick fires immediately
        rx.changed().await.unwrap();
        assert!(monitor.is_online());

        reachable.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(!monitor.is_online());

        monitor.dispose();
    }
}
