//! Per-connection observers: proxy-reported errors and proxy usage.
//!
//! Both are keyed by isolation key. The connection manager registers the
//! key of every descriptor it installs, so reports for keys it never
//! handed out are dropped here.

use crate::descriptor::IsolationKey;
use crate::events::{EventBus, Subscription, lock};
use crate::router::ProxiedRequest;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Severity the network layer attaches to a proxy failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyErrorLevel {
    /// The connection is unusable
    Error,
    /// Recoverable
    Warning,
}

/// A proxy-side failure reported by the network layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyErrorEvent {
    pub isolation_key: IsolationKey,
    pub level: ProxyErrorLevel,
    pub http_status: u16,
}

impl ProxyErrorEvent {
    pub fn new(isolation_key: IsolationKey, level: ProxyErrorLevel, http_status: u16) -> Self {
        Self {
            isolation_key,
            level,
            http_status,
        }
    }

    pub fn is_auth_rejected(&self) -> bool {
        self.http_status == 401
    }
}

/// Dispatches proxy errors for registered isolation keys
pub struct ProxyErrorMonitor {
    active: AtomicBool,
    keys: Mutex<HashSet<IsolationKey>>,
    events: EventBus<ProxyErrorEvent>,
}

impl ProxyErrorMonitor {
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(false),
            keys: Mutex::new(HashSet::new()),
            events: EventBus::new(),
        }
    }

    pub fn start(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            debug!("Proxy error monitor started");
        }
    }

    /// Stop dispatching and forget every key
    pub fn stop(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            lock(&self.keys).clear();
            debug!("Proxy error monitor stopped");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn add_isolation_key(&self, key: IsolationKey) {
        lock(&self.keys).insert(key);
    }

    /// Entry point for the network layer. Returns whether the event was
    /// dispatched.
    pub fn report(&self, event: ProxyErrorEvent) -> bool {
        if !self.is_active() || !lock(&self.keys).contains(&event.isolation_key) {
            trace!("Ignoring proxy error for unknown key {}", event.isolation_key);
            return false;
        }
        self.events.emit(&event);
        true
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&ProxyErrorEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }
}

impl Default for ProxyErrorMonitor {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts proxied requests per isolation key
pub struct UsageObserver {
    counts: Arc<Mutex<HashMap<IsolationKey, u64>>>,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl UsageObserver {
    pub fn new() -> Self {
        Self {
            counts: Arc::new(Mutex::new(HashMap::new())),
            task: Mutex::new(None),
        }
    }

    /// Consume `requests` in the background until it ends or
    /// [`UsageObserver::stop`] is called
    pub fn start(&self, requests: BoxStream<'static, ProxiedRequest>) {
        let cancel = CancellationToken::new();
        let counts = self.counts.clone();
        let token = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut requests = Box::pin(requests.take_until(token.cancelled_owned()));
            while let Some(proxied) = requests.next().await {
                if let Some(count) = lock(&counts).get_mut(&proxied.isolation_key) {
                    *count += 1;
                }
            }
            trace!("Usage observer stream ended");
        });

        if let Some((previous, _)) = lock(&self.task).replace((cancel, handle)) {
            previous.cancel();
        }
        debug!("Usage observer started");
    }

    pub fn stop(&self) {
        if let Some((cancel, _)) = lock(&self.task).take() {
            cancel.cancel();
            debug!("Usage observer stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.task)
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Start counting for `key`
    pub fn add_isolation_key(&self, key: IsolationKey) {
        lock(&self.counts).entry(key).or_insert(0);
    }

    pub fn count(&self, key: &IsolationKey) -> u64 {
        lock(&self.counts).get(key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        lock(&self.counts).values().sum()
    }
}

impl Default for UsageObserver {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for UsageObserver {
    fn drop(&mut self) {
        self.stop();
    }
}
