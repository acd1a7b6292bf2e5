//! Request Router
//!
//! Decides, for every outgoing request, whether it goes through the proxy
//! tunnel or directly to its destination.
//!
//! Flow:
//! 1. Router not registered with the platform → direct
//! 2. Mode filter (full / private browsing / tracker) → direct on mismatch
//! 3. Non-http(s) or malformed URL → direct
//! 4. Essential origin while no descriptor exists → direct
//! 5. Excluded origin → direct
//! 6. No descriptor yet → queued until [`RequestRouter::initialize`]
//! 7. Otherwise → proxied with the current descriptor snapshot
//!
//! Mode and exclusions are read on every decision, never cached.

use crate::config::{IppConfig, RouterMode};
use crate::descriptor::{IsolationKey, ProxyDescriptor};
use crate::events::lock;
use crate::serverlist::Server;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

/// Buffered proxied-request notifications per stream consumer
const PROXIED_CHANNEL_CAPACITY: usize = 256;

/// Router errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RouterError {
    #[error("Request cancelled, router stopped")]
    Cancelled,

    #[error("Router already initialized")]
    AlreadyInitialized,

    #[error("Router not initialized")]
    NotInitialized,

    #[error("Server {0} advertises no protocols")]
    NoProtocols(String),
}

/// An outgoing request, as much of it as routing needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub url: String,
    /// Issued from a private browsing context
    pub private_browsing: bool,
    /// Triggered by a classified third-party tracker
    pub third_party_tracker: bool,
}

impl RouteRequest {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            private_browsing: false,
            third_party_tracker: false,
        }
    }

    pub fn private_browsing(mut self) -> Self {
        self.private_browsing = true;
        self
    }

    pub fn tracker(mut self) -> Self {
        self.third_party_tracker = true;
        self
    }

    /// `scheme://host[:port]`, only for http(s)
    pub fn origin(&self) -> Option<String> {
        http_origin(&self.url)
    }
}

/// Final routing decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Direct,
    Proxy(Arc<ProxyDescriptor>),
}

impl Decision {
    pub fn is_proxied(&self) -> bool {
        matches!(self, Decision::Proxy(_))
    }
}

/// What [`RequestRouter::decide`] returns
#[derive(Debug)]
pub enum Routing {
    Direct,
    Proxy(Arc<ProxyDescriptor>),
    /// Held until a descriptor exists or the router stops
    Queued(PendingRoute),
}

/// A queued decision. Resolves in arrival order once the router is
/// initialized, or with [`RouterError::Cancelled`] when it stops.
#[derive(Debug)]
pub struct PendingRoute {
    rx: oneshot::Receiver<Result<Decision, RouterError>>,
}

impl Future for PendingRoute {
    type Output = Result<Decision, RouterError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RouterError::Cancelled)))
    }
}

/// A request that went through the proxy
#[derive(Debug, Clone)]
pub struct ProxiedRequest {
    pub request: RouteRequest,
    pub isolation_key: IsolationKey,
}

/// Origins that bypass the proxy
#[derive(Debug, Clone, Default)]
pub struct ExclusionSet {
    excluded: HashSet<String>,
    /// Only honoured while no descriptor exists
    essential: HashSet<String>,
}

impl ExclusionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Guardian and account endpoints plus the configured lists
    pub fn from_config(config: &IppConfig) -> Self {
        let mut set = Self::new();
        for url in config.default_exclusions() {
            set.add_excluded(&url);
        }
        for url in &config.essential_origins {
            set.add_essential(url);
        }
        set
    }

    /// Returns false for entries that are not http(s) URLs
    pub fn add_excluded(&mut self, url: &str) -> bool {
        insert_origin(&mut self.excluded, url)
    }

    pub fn add_essential(&mut self, url: &str) -> bool {
        insert_origin(&mut self.essential, url)
    }

    pub fn is_excluded(&self, origin: &str) -> bool {
        self.excluded.contains(origin)
    }

    pub fn is_essential(&self, origin: &str) -> bool {
        self.essential.contains(origin)
    }

    pub fn len(&self) -> usize {
        self.excluded.len() + self.essential.len()
    }

    pub fn is_empty(&self) -> bool {
        self.excluded.is_empty() && self.essential.is_empty()
    }
}

fn insert_origin(set: &mut HashSet<String>, url: &str) -> bool {
    match http_origin(url) {
        Some(origin) => {
            set.insert(origin);
            true
        }
        None => {
            debug!("Ignoring bad exclusion entry: {}", url);
            false
        }
    }
}

fn http_origin(url: &str) -> Option<String> {
    let url = Url::parse(url).ok()?;
    match url.scheme() {
        "http" | "https" => Some(url.origin().ascii_serialization()),
        _ => None,
    }
}

/// Something that can make a routing decision for a request
pub trait RequestFilter: Send + Sync {
    fn route(&self, request: RouteRequest) -> Routing;
}

/// The platform's request interception point
pub trait FilterHost: Send + Sync {
    /// Register a filter, returning a handle for unregistering it
    fn register_filter(&self, filter: Arc<dyn RequestFilter>) -> u64;

    fn unregister_filter(&self, handle: u64);
}

/// In-process interception point: the first registered filter decides,
/// requests go direct when none is registered
#[derive(Default)]
pub struct FilterChain {
    next_handle: AtomicU64,
    filters: Mutex<BTreeMap<u64, Arc<dyn RequestFilter>>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, request: RouteRequest) -> Routing {
        let filter = lock(&self.filters).values().next().cloned();
        match filter {
            Some(filter) => filter.route(request),
            None => Routing::Direct,
        }
    }

    /// Number of registered filters
    pub fn len(&self) -> usize {
        lock(&self.filters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl FilterHost for FilterChain {
    fn register_filter(&self, filter: Arc<dyn RequestFilter>) -> u64 {
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        lock(&self.filters).insert(handle, filter);
        handle
    }

    fn unregister_filter(&self, handle: u64) {
        lock(&self.filters).remove(&handle);
    }
}

/// Routing statistics
#[derive(Debug, Default)]
pub struct RouterStats {
    pub total_requests: AtomicU64,
    pub proxied_requests: AtomicU64,
    pub queued_requests: AtomicU64,
    pub cancelled_requests: AtomicU64,
}

struct Queued {
    request: RouteRequest,
    tx: oneshot::Sender<Result<Decision, RouterError>>,
}

#[derive(Default)]
struct RouterState {
    descriptor: Option<Arc<ProxyDescriptor>>,
    server: Option<Server>,
    pending: VecDeque<Queued>,
    registration: Option<u64>,
}

/// Per-request proxy decision engine
pub struct RequestRouter {
    mode: RwLock<RouterMode>,
    exclusions: RwLock<ExclusionSet>,
    state: Mutex<RouterState>,
    host: Arc<dyn FilterHost>,
    active: AtomicBool,
    /// Cancelled on stop, replaced on the next start
    cancel: Mutex<CancellationToken>,
    proxied: broadcast::Sender<ProxiedRequest>,
    stats: RouterStats,
}

impl RequestRouter {
    pub fn new(mode: RouterMode, exclusions: ExclusionSet, host: Arc<dyn FilterHost>) -> Self {
        let (proxied, _) = broadcast::channel(PROXIED_CHANNEL_CAPACITY);
        debug!(
            "Request router created (mode: {}, {} exclusions)",
            mode,
            exclusions.len()
        );

        Self {
            mode: RwLock::new(mode),
            exclusions: RwLock::new(exclusions),
            state: Mutex::new(RouterState::default()),
            host,
            active: AtomicBool::new(false),
            cancel: Mutex::new(CancellationToken::new()),
            proxied,
            stats: RouterStats::default(),
        }
    }

    pub fn from_config(config: &IppConfig, host: Arc<dyn FilterHost>) -> Self {
        Self::new(config.mode, ExclusionSet::from_config(config), host)
    }

    pub fn mode(&self) -> RouterMode {
        *self.mode.read().unwrap_or_else(|p| p.into_inner())
    }

    /// Takes effect for the next decision
    pub fn set_mode(&self, mode: RouterMode) {
        info!("Routing mode set to {}", mode);
        *self.mode.write().unwrap_or_else(|p| p.into_inner()) = mode;
    }

    pub fn add_page_exclusion(&self, url: &str) -> bool {
        self.exclusions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .add_excluded(url)
    }

    pub fn add_essential_exclusion(&self, url: &str) -> bool {
        self.exclusions
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .add_essential(url)
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Current descriptor snapshot
    pub fn descriptor(&self) -> Option<Arc<ProxyDescriptor>> {
        lock(&self.state).descriptor.clone()
    }

    pub fn isolation_key(&self) -> Option<IsolationKey> {
        lock(&self.state)
            .descriptor
            .as_ref()
            .map(|d| d.isolation_key.clone())
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn stats(&self) -> &RouterStats {
        &self.stats
    }

    /// Register with the platform
    pub fn start(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if state.registration.is_some() {
            return;
        }

        {
            let mut cancel = lock(&self.cancel);
            if cancel.is_cancelled() {
                *cancel = CancellationToken::new();
            }
        }

        let filter: Arc<dyn RequestFilter> = self.clone();
        state.registration = Some(self.host.register_filter(filter));
        self.active.store(true, Ordering::SeqCst);
        info!("Request router started (mode: {})", self.mode());
    }

    /// Unregister from the platform, fail queued requests and end every
    /// proxied-request stream
    pub fn stop(&self) {
        let (registration, pending) = {
            let mut state = lock(&self.state);
            (state.registration.take(), std::mem::take(&mut state.pending))
        };
        let Some(handle) = registration else {
            return;
        };

        self.active.store(false, Ordering::SeqCst);
        self.host.unregister_filter(handle);

        if !pending.is_empty() {
            warn!("Cancelling {} queued requests", pending.len());
        }
        for queued in pending {
            self.stats.cancelled_requests.fetch_add(1, Ordering::Relaxed);
            let _ = queued.tx.send(Err(RouterError::Cancelled));
        }

        lock(&self.cancel).cancel();
        info!("Request router stopped");
    }

    /// Build the descriptor for `server` and replay queued requests in
    /// arrival order
    pub fn initialize(&self, token: &str, server: &Server) -> Result<Arc<ProxyDescriptor>, RouterError> {
        let (descriptor, pending) = {
            let mut state = lock(&self.state);
            if state.descriptor.is_some() {
                return Err(RouterError::AlreadyInitialized);
            }

            let descriptor =
                ProxyDescriptor::from_server(token, server, &IsolationKey::generate())
                    .map(Arc::new)
                    .ok_or_else(|| RouterError::NoProtocols(server.hostname.clone()))?;
            state.descriptor = Some(descriptor.clone());
            state.server = Some(server.clone());
            (descriptor, std::mem::take(&mut state.pending))
        };

        info!("Request router initialized: {}", descriptor);
        if !pending.is_empty() {
            debug!("Replaying {} queued requests", pending.len());
        }
        for queued in pending {
            let decision = if self.is_active() {
                self.resolve(&queued.request, &descriptor)
            } else {
                Decision::Direct
            };
            let _ = queued.tx.send(Ok(decision));
        }

        Ok(descriptor)
    }

    /// Swap in a new descriptor with `token` and a fresh isolation key.
    ///
    /// Requests that already hold the old descriptor keep it.
    pub fn replace_auth_token(&self, token: &str) -> Result<Arc<ProxyDescriptor>, RouterError> {
        let mut state = lock(&self.state);
        let server = state.server.as_ref().ok_or(RouterError::NotInitialized)?;

        let descriptor = ProxyDescriptor::from_server(token, server, &IsolationKey::generate())
            .map(Arc::new)
            .ok_or_else(|| RouterError::NoProtocols(server.hostname.clone()))?;
        state.descriptor = Some(descriptor.clone());

        debug!("Auth token replaced, isolation key {}", descriptor.isolation_key);
        Ok(descriptor)
    }

    /// Decide how `request` is routed
    pub fn decide(&self, request: RouteRequest) -> Routing {
        self.stats.total_requests.fetch_add(1, Ordering::Relaxed);
        if !self.is_active() {
            return Routing::Direct;
        }

        let mut state = lock(&self.state);
        let descriptor = state.descriptor.clone();
        match descriptor {
            Some(descriptor) => {
                drop(state);
                match self.resolve(&request, &descriptor) {
                    Decision::Direct => Routing::Direct,
                    Decision::Proxy(descriptor) => Routing::Proxy(descriptor),
                }
            }
            None if self.bypasses(&request, false) => Routing::Direct,
            None => {
                trace!("Queueing request until initialized: {}", request.url);
                self.stats.queued_requests.fetch_add(1, Ordering::Relaxed);
                let (tx, rx) = oneshot::channel();
                state.pending.push_back(Queued { request, tx });
                Routing::Queued(PendingRoute { rx })
            }
        }
    }

    fn resolve(&self, request: &RouteRequest, descriptor: &Arc<ProxyDescriptor>) -> Decision {
        if self.bypasses(request, true) {
            return Decision::Direct;
        }

        self.stats.proxied_requests.fetch_add(1, Ordering::Relaxed);
        let _ = self.proxied.send(ProxiedRequest {
            request: request.clone(),
            isolation_key: descriptor.isolation_key.clone(),
        });
        Decision::Proxy(descriptor.clone())
    }

    /// Mode first, then exclusions
    fn bypasses(&self, request: &RouteRequest, initialized: bool) -> bool {
        let matches_mode = match self.mode() {
            RouterMode::Full => true,
            RouterMode::PrivateBrowsingOnly => request.private_browsing,
            RouterMode::TrackerOnly => request.third_party_tracker,
        };
        if !matches_mode {
            return true;
        }

        let Some(origin) = request.origin() else {
            return true;
        };
        let exclusions = self.exclusions.read().unwrap_or_else(|p| p.into_inner());
        if !initialized && exclusions.is_essential(&origin) {
            return true;
        }
        exclusions.is_excluded(&origin)
    }

    /// Stream of every request routed through the proxy from now on.
    ///
    /// Ends when the router stops or `cancel` fires. Each call returns an
    /// independent stream.
    pub fn proxied_requests(&self, cancel: CancellationToken) -> BoxStream<'static, ProxiedRequest> {
        if !self.is_active() {
            return stream::empty().boxed();
        }

        let rx = self.proxied.subscribe();
        let stopped = lock(&self.cancel).clone();

        stream::unfold((rx, stopped, cancel), |(mut rx, stopped, cancel)| async move {
            loop {
                tokio::select! {
                    biased;
                    _ = stopped.cancelled() => return None,
                    _ = cancel.cancelled() => return None,
                    next = rx.recv() => match next {
                        Ok(proxied) => return Some((proxied, (rx, stopped, cancel))),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Proxied request stream lagged, {} skipped", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => return None,
                    },
                }
            }
        })
        .boxed()
    }
}

impl RequestFilter for RequestRouter {
    fn route(&self, request: RouteRequest) -> Routing {
        self.decide(request)
    }
}
