//! Connection Manager
//!
//! Owns one proxy connection end to end: pass, server, router, observers.
//!
//! # States
//!
//! ```text
//!  NotReady ──account READY──▶ Ready ──start()──▶ Activating ──▶ Active
//!      ▲                         ▲                    │            │
//!      └──account not READY──────┼────────────────────┤◀──stop()───┘
//!                                └── silent failure ──┘
//!                                       Error ◀── any failure
//! ```
//!
//! `start()` and pass rotation are single-flight. `stop()` waits for an
//! in-flight activation before tearing anything down.

use crate::account::{AccountStatus, ServiceState};
use crate::config::{IppConfig, RouterMode};
use crate::error::{ErrorHistory, ErrorKind, IppError};
use crate::events::{EventBus, StateChange, Subscription, lock};
use crate::guardian::GuardianBackend;
use crate::observers::{ProxyErrorEvent, ProxyErrorLevel, ProxyErrorMonitor, UsageObserver};
use crate::pass::ProxyPass;
use crate::router::{ExclusionSet, FilterHost, RequestRouter};
use crate::serverlist::ServerDirectory;
use crate::single_flight::SingleFlight;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// The account is not ready for a connection
    NotReady,
    /// Can be started
    Ready,
    /// start() in progress
    Activating,
    /// Requests are being proxied
    Active,
    /// Last attempt failed
    Error,
}

impl ConnectionState {
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionState::NotReady => write!(f, "not-ready"),
            ConnectionState::Ready => write!(f, "ready"),
            ConnectionState::Activating => write!(f, "activating"),
            ConnectionState::Active => write!(f, "active"),
            ConnectionState::Error => write!(f, "error"),
        }
    }
}

struct Connection {
    state: ConnectionState,
    pass: Option<ProxyPass>,
    router: Option<Arc<RequestRouter>>,
    activated_at: Option<Instant>,
    /// Proxy error subscription for the current connection
    error_subscription: Option<Subscription>,
    /// Ends the usage stream of the current connection
    usage_cancel: Option<CancellationToken>,
}

/// Proxy connection lifecycle
pub struct ConnectionManager {
    guardian: Arc<dyn GuardianBackend>,
    servers: Arc<dyn ServerDirectory>,
    host: Arc<dyn FilterHost>,
    account: Weak<dyn AccountStatus>,
    mode: Mutex<RouterMode>,
    exclusions: Mutex<ExclusionSet>,
    connection: Mutex<Connection>,
    usage: UsageObserver,
    error_monitor: Arc<ProxyErrorMonitor>,
    errors: Mutex<ErrorHistory>,
    events: EventBus<StateChange<ConnectionState>>,
    activation: SingleFlight<Result<ConnectionState, IppError>>,
    rotation: SingleFlight<Result<(), IppError>>,
}

impl ConnectionManager {
    pub fn new(
        config: &IppConfig,
        guardian: Arc<dyn GuardianBackend>,
        servers: Arc<dyn ServerDirectory>,
        host: Arc<dyn FilterHost>,
        account: Weak<dyn AccountStatus>,
    ) -> Self {
        Self {
            guardian,
            servers,
            host,
            account,
            mode: Mutex::new(config.mode),
            exclusions: Mutex::new(ExclusionSet::from_config(config)),
            connection: Mutex::new(Connection {
                state: ConnectionState::NotReady,
                pass: None,
                router: None,
                activated_at: None,
                error_subscription: None,
                usage_cancel: None,
            }),
            usage: UsageObserver::new(),
            error_monitor: Arc::new(ProxyErrorMonitor::new()),
            errors: Mutex::new(ErrorHistory::new()),
            events: EventBus::new(),
            activation: SingleFlight::new(),
            rotation: SingleFlight::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.connection).state
    }

    /// Connected and the router holds a descriptor
    pub fn is_active(&self) -> bool {
        self.router()
            .is_some_and(|router| router.is_active() && router.descriptor().is_some())
    }

    pub fn router(&self) -> Option<Arc<RequestRouter>> {
        lock(&self.connection).router.clone()
    }

    pub fn has_valid_proxy_pass(&self) -> bool {
        lock(&self.connection)
            .pass
            .as_ref()
            .is_some_and(ProxyPass::is_valid)
    }

    pub fn activated_at(&self) -> Option<Instant> {
        lock(&self.connection).activated_at
    }

    /// Where the network layer reports proxy failures
    pub fn error_monitor(&self) -> &Arc<ProxyErrorMonitor> {
        &self.error_monitor
    }

    pub fn usage(&self) -> &UsageObserver {
        &self.usage
    }

    pub fn errors(&self) -> ErrorHistory {
        lock(&self.errors).clone()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StateChange<ConnectionState>) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Applies to the current router and every future one
    pub fn set_mode(&self, mode: RouterMode) {
        *lock(&self.mode) = mode;
        if let Some(router) = self.router() {
            router.set_mode(mode);
        }
    }

    pub fn add_page_exclusion(&self, url: &str) -> bool {
        let added = lock(&self.exclusions).add_excluded(url);
        if let Some(router) = self.router() {
            router.add_page_exclusion(url);
        }
        added
    }

    pub fn add_essential_exclusion(&self, url: &str) -> bool {
        let added = lock(&self.exclusions).add_essential(url);
        if let Some(router) = self.router() {
            router.add_essential_exclusion(url);
        }
        added
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = {
            let mut connection = lock(&self.connection);
            std::mem::replace(&mut connection.state, state)
        };
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
            self.events.emit(&StateChange { state, previous });
        }
    }

    fn record_error(&self, error: &IppError, context: &str) {
        error!("{}: {}", context, error);
        lock(&self.errors).push(error.kind(), format!("{}: {}", context, error));
    }

    fn account(&self) -> Result<Arc<dyn AccountStatus>, IppError> {
        self.account
            .upgrade()
            .ok_or_else(|| IppError::generic("account gate is gone"))
    }

    /// Activate the connection.
    ///
    /// Concurrent callers share one attempt. Resolves to `Active`, or
    /// `Ready` when activation finished without a descriptor.
    pub async fn start(self: &Arc<Self>) -> Result<ConnectionState, IppError> {
        let this = self.clone();
        self.activation
            .run(move || async move { this.activate().await })
            .await
    }

    async fn activate(self: &Arc<Self>) -> Result<ConnectionState, IppError> {
        let previous = self.state();
        self.set_state(ConnectionState::Activating);
        info!("Starting proxy connection");

        match self.try_activate(previous).await {
            Ok(true) => {
                lock(&self.connection).activated_at = Some(Instant::now());
                self.set_state(ConnectionState::Active);
                info!("Proxy connection active");
                Ok(ConnectionState::Active)
            }
            Ok(false) => {
                warn!("Proxy connection did not become active");
                self.set_state(ConnectionState::Ready);
                Ok(ConnectionState::Ready)
            }
            Err(e) => {
                self.record_error(&e, "Proxy activation failed");
                self.teardown();
                self.set_state(match e {
                    IppError::NotReady(_) => ConnectionState::NotReady,
                    _ => ConnectionState::Error,
                });
                Err(e)
            }
        }
    }

    async fn try_activate(self: &Arc<Self>, previous: ConnectionState) -> Result<bool, IppError> {
        if let Err(e) = self.servers.maybe_fetch_list(false).await {
            warn!("Server list refresh failed: {}", e);
        }

        let account = self.account()?;
        account.ensure_enrolled().await?;

        if previous == ConnectionState::Error {
            debug!("Rechecking account after a failed attempt");
            account.recheck().await;
        }
        let service = account.service_state();
        if service != ServiceState::Ready {
            return Err(IppError::NotReady(service.to_string()));
        }

        lock(&self.errors).clear();

        let router = self.ensure_router();
        router.start();

        let stored = lock(&self.connection).pass.clone();
        let pass = match stored.filter(ProxyPass::is_valid) {
            Some(pass) => pass,
            None => {
                let pass = self.fetch_pass().await?;
                lock(&self.connection).pass = Some(pass.clone());
                pass
            }
        };

        // The account may have changed while the pass was in flight.
        let service = account.service_state();
        if service != ServiceState::Ready {
            return Err(IppError::NotReady(service.to_string()));
        }

        let location = self.servers.default_location();
        let server = self
            .servers
            .select_server(location.as_ref().map(|l| &l.city))
            .ok_or(IppError::NoServer)?;
        debug!("Server: {}", server.hostname);

        let descriptor = router
            .initialize(&pass.as_bearer_token(), &server)
            .map_err(IppError::generic)?;
        let key = descriptor.isolation_key.clone();

        let usage_cancel = CancellationToken::new();
        self.usage.add_isolation_key(key.clone());
        self.usage
            .start(router.proxied_requests(usage_cancel.clone()));

        self.error_monitor.start();
        self.error_monitor.add_isolation_key(key);
        self.watch_proxy_errors();

        {
            let mut connection = lock(&self.connection);
            connection.usage_cancel = Some(usage_cancel);
        }

        Ok(router.is_active() && router.descriptor().is_some())
    }

    fn ensure_router(&self) -> Arc<RequestRouter> {
        let mut connection = lock(&self.connection);
        if let Some(router) = &connection.router {
            return router.clone();
        }

        let router = Arc::new(RequestRouter::new(
            *lock(&self.mode),
            lock(&self.exclusions).clone(),
            self.host.clone(),
        ));
        connection.router = Some(router.clone());
        router
    }

    async fn fetch_pass(&self) -> Result<ProxyPass, IppError> {
        let response = self.guardian.fetch_proxy_pass().await;
        debug!(
            "Proxy pass response (status: {:?}, error: {:?})",
            response.status, response.error
        );
        response.into_pass()
    }

    /// Stop proxying. Returns the session duration, or `None` when there
    /// was no active connection.
    pub async fn stop(&self) -> Option<Duration> {
        if let Some(activation) = self.activation.in_flight() {
            debug!("Waiting for activation before stopping");
            let _ = activation.await;
        }

        if self.state() != ConnectionState::Active {
            if lock(&self.connection).router.is_some() {
                self.teardown();
                debug!("Dropped router of an inactive connection");
            }
            return None;
        }

        let duration = self.teardown();
        self.set_state(ConnectionState::Ready);
        info!("Proxy connection stopped after {:?}", duration);
        Some(duration)
    }

    /// A router is registered or an activation is running
    pub fn has_connection(&self) -> bool {
        self.activation.is_running() || lock(&self.connection).router.is_some()
    }

    /// Forget the pass and disconnect. Used when the account changes.
    pub async fn reset(&self) {
        lock(&self.connection).pass = None;
        if self.state() == ConnectionState::Active || self.has_connection() {
            self.stop().await;
        }
        debug!("Connection manager reset");
    }

    /// Drop the router and observers of the current connection
    fn teardown(&self) -> Duration {
        let (router, subscription, usage_cancel, activated_at) = {
            let mut connection = lock(&self.connection);
            (
                connection.router.take(),
                connection.error_subscription.take(),
                connection.usage_cancel.take(),
                connection.activated_at.take(),
            )
        };

        if let Some(router) = router {
            router.stop();
        }
        if let Some(cancel) = usage_cancel {
            cancel.cancel();
        }
        self.usage.stop();
        self.error_monitor.stop();
        drop(subscription);

        activated_at.map(|at| at.elapsed()).unwrap_or_default()
    }

    /// Follow the account gate's state
    pub fn on_service_state_changed(&self, service: ServiceState) {
        let current = self.state();
        match service {
            ServiceState::Ready | ServiceState::Active => {
                if current == ConnectionState::NotReady {
                    self.set_state(ConnectionState::Ready);
                }
            }
            // Keep the failure visible until the next start()
            ServiceState::Error if current == ConnectionState::Error => {}
            _ => {
                if current == ConnectionState::Active {
                    let duration = self.teardown();
                    info!("Account no longer ready, disconnected after {:?}", duration);
                }
                // An in-flight activation rechecks readiness once its pass
                // arrives.
                if current != ConnectionState::Activating {
                    self.set_state(ConnectionState::NotReady);
                }
            }
        }
    }

    /// Replace the pass. Concurrent callers share one fetch.
    pub async fn rotate_proxy_pass(self: &Arc<Self>) -> Result<(), IppError> {
        let this = self.clone();
        self.rotation
            .run(move || async move { this.rotate().await })
            .await
    }

    async fn rotate(&self) -> Result<(), IppError> {
        match self.try_rotate().await {
            Ok(()) => {
                info!("Proxy pass rotated");
                Ok(())
            }
            Err(e) => {
                let e = IppError::Generic(format!("pass rotation failed: {}", e));
                self.record_error(&e, "Proxy pass rotation");
                // The proxy already rejected the current pass.
                lock(&self.connection).pass = None;
                let duration = self.teardown();
                warn!("Proxy connection dropped after {:?}", duration);
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn try_rotate(&self) -> Result<(), IppError> {
        let pass = self.fetch_pass().await?;

        if let Some(router) = self.router().filter(|r| r.is_active()) {
            let descriptor = router
                .replace_auth_token(&pass.as_bearer_token())
                .map_err(IppError::generic)?;
            self.usage.add_isolation_key(descriptor.isolation_key.clone());
            self.error_monitor
                .add_isolation_key(descriptor.isolation_key.clone());
        }

        lock(&self.connection).pass = Some(pass);
        Ok(())
    }

    /// React to a proxy-reported failure. Returns whether a rotation ran.
    pub async fn handle_proxy_error(self: &Arc<Self>, event: &ProxyErrorEvent) -> Result<bool, IppError> {
        let Some(router) = self.router().filter(|r| r.is_active()) else {
            return Ok(false);
        };
        if router.isolation_key().as_ref() != Some(&event.isolation_key) {
            debug!("Ignoring proxy error for stale key {}", event.isolation_key);
            return Ok(false);
        }
        if !event.is_auth_rejected() {
            debug!("Ignoring proxy error with status {}", event.http_status);
            return Ok(false);
        }

        let should_rotate = lock(&self.connection)
            .pass
            .as_ref()
            .is_some_and(ProxyPass::should_rotate);
        if event.level != ProxyErrorLevel::Error && !should_rotate {
            return Ok(false);
        }

        warn!(
            "{}",
            IppError::AuthRejected(event.isolation_key.to_string())
        );
        lock(&self.errors).push(
            ErrorKind::AuthRejected,
            format!("401 for isolation key {}", event.isolation_key),
        );
        self.rotate_proxy_pass().await?;
        Ok(true)
    }

    /// Dispatch proxy errors of the current connection to
    /// [`ConnectionManager::handle_proxy_error`]
    fn watch_proxy_errors(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let subscription = self.error_monitor.subscribe(move |event| {
            let Some(manager) = weak.upgrade() else {
                return;
            };
            let event = event.clone();
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move {
                        if let Err(e) = manager.handle_proxy_error(&event).await {
                            warn!("Proxy error handling failed: {}", e);
                        }
                    });
                }
                Err(_) => warn!("Proxy error reported outside of a runtime"),
            }
        });
        lock(&self.connection).error_subscription = Some(subscription);
    }
}
