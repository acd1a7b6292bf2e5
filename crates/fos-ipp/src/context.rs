//! Application context
//!
//! One [`IpProtection`] owns the account gate, the connection manager and
//! its observers, the startup cache and the auto-start helpers. Nothing in
//! the crate is process-global; embedders hold the context and hand out
//! references.

use crate::account::{AccountGate, AccountSignals, ServiceState};
use crate::autostart::{AutoRestore, AutoStart};
use crate::cache::EntitlementCache;
use crate::client::{GuardianClient, TokenProvider};
use crate::config::{ConfigError, IppConfig, RouterMode};
use crate::error::IppError;
use crate::events::Subscription;
use crate::guardian::GuardianBackend;
use crate::manager::{ConnectionManager, ConnectionState};
use crate::observers::ProxyErrorEvent;
use crate::router::FilterHost;
use crate::serverlist::{FileSource, ServerDirectory, ServerList, StaticSource};
use crate::startup::StartupCache;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub struct IpProtection {
    config: IppConfig,
    gate: Arc<AccountGate>,
    servers: Arc<dyn ServerDirectory>,
    startup: Arc<StartupCache>,
    autostart: AutoStart,
    restore: AutoRestore,
    _state_subscription: Subscription,
}

impl IpProtection {
    /// Wire the subsystem from explicit collaborators
    pub fn new(
        config: IppConfig,
        guardian: Arc<dyn GuardianBackend>,
        servers: Arc<dyn ServerDirectory>,
        signals: Arc<dyn AccountSignals>,
        host: Arc<dyn FilterHost>,
    ) -> Self {
        let startup = Arc::new(startup_cache(&config));
        Self::assemble(config, guardian, servers, signals, host, startup)
    }

    /// Wire the subsystem with the HTTP guardian client and the configured
    /// server list, seeded with the locations cached by the previous run
    pub fn from_config(
        config: IppConfig,
        tokens: Arc<dyn TokenProvider>,
        signals: Arc<dyn AccountSignals>,
        host: Arc<dyn FilterHost>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let guardian = Arc::new(GuardianClient::new(&config, tokens)?);
        let startup = Arc::new(startup_cache(&config));
        let cached = startup.locations();
        let servers: Arc<dyn ServerDirectory> = match &config.server_list {
            Some(path) => Arc::new(ServerList::with_initial(FileSource::new(path), cached)),
            None => Arc::new(ServerList::with_initial(StaticSource(Vec::new()), cached)),
        };

        info!(
            "IP protection configured (mode: {}, endpoint: {})",
            config.mode, config.guardian_endpoint
        );
        Ok(Self::assemble(config, guardian, servers, signals, host, startup))
    }

    fn assemble(
        config: IppConfig,
        guardian: Arc<dyn GuardianBackend>,
        servers: Arc<dyn ServerDirectory>,
        signals: Arc<dyn AccountSignals>,
        host: Arc<dyn FilterHost>,
        startup: Arc<StartupCache>,
    ) -> Self {
        let cache = Arc::new(match &config.entitlement_cache {
            Some(path) => EntitlementCache::with_file(path),
            None => EntitlementCache::in_memory(),
        });

        let directory = servers.clone();
        let gate = AccountGate::new(
            config.enabled,
            guardian.clone(),
            signals,
            cache,
            |account| ConnectionManager::new(&config, guardian, directory, host, account),
        );

        let sink = startup.clone();
        let state_subscription = gate.subscribe(move |change| sink.store_state(change.state));

        Self {
            autostart: AutoStart::new(&gate),
            restore: AutoRestore::new(&gate),
            config,
            gate,
            servers,
            startup,
            _state_subscription: state_subscription,
        }
    }

    pub fn config(&self) -> &IppConfig {
        &self.config
    }

    pub fn gate(&self) -> &Arc<AccountGate> {
        &self.gate
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        self.gate.manager()
    }

    pub fn servers(&self) -> &Arc<dyn ServerDirectory> {
        &self.servers
    }

    pub fn startup(&self) -> &StartupCache {
        &self.startup
    }

    /// Current state. Before `init` this is the state the previous run
    /// ended in, when one was cached.
    pub fn state(&self) -> ServiceState {
        let state = self.gate.state();
        if state == ServiceState::Uninitialized {
            if let Some(cached) = self.startup.state() {
                return cached;
            }
        }
        state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager().state()
    }

    pub fn will_restore(&self) -> bool {
        self.restore.will_restore()
    }

    pub async fn init(&self) -> ServiceState {
        let has_list = self.servers.has_list();
        self.autostart.init(self.config.autostart, has_list);
        self.restore.init(
            self.config.auto_restore,
            self.config.autostart,
            self.startup.user_enabled(),
            has_list,
        );

        let state = self.gate.init().await;
        self.startup.complete_startup();
        self.remember_locations();
        state
    }

    pub async fn uninit(&self) {
        self.autostart.uninit();
        self.restore.uninit();
        self.gate.uninit().await;
    }

    /// Connect. A user-initiated connection is remembered for auto-restore.
    pub async fn start(&self, user_action: bool) -> Result<ServiceState, IppError> {
        let result = self.gate.start(user_action).await;
        if matches!(result, Ok(ServiceState::Active)) {
            if user_action {
                self.startup.set_user_enabled(true);
            }
            self.remember_locations();
        }
        result
    }

    pub async fn stop(&self, user_action: bool) -> Option<Duration> {
        if user_action {
            self.startup.set_user_enabled(false);
        }
        self.gate.stop(user_action).await
    }

    fn remember_locations(&self) {
        if self.servers.has_list() {
            self.startup.store_locations(self.servers.countries());
        }
    }

    /// Entry point for proxy failures seen by the network layer
    pub fn report_proxy_error(&self, event: ProxyErrorEvent) -> bool {
        self.manager().error_monitor().report(event)
    }

    pub fn set_mode(&self, mode: RouterMode) {
        self.manager().set_mode(mode);
    }

    pub fn add_page_exclusion(&self, url: &str) -> bool {
        self.manager().add_page_exclusion(url)
    }

    pub fn add_essential_exclusion(&self, url: &str) -> bool {
        self.manager().add_essential_exclusion(url)
    }
}

fn startup_cache(config: &IppConfig) -> StartupCache {
    match &config.startup_cache {
        Some(path) => StartupCache::with_file(path),
        None => StartupCache::in_memory(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::SignInState;
    use crate::observers::ProxyErrorLevel;
    use crate::router::{FilterChain, RouteRequest, Routing};
    use crate::testing::{FakeGuardian, FakeTokens, server_list_json, settle, wait_for_state};
    use std::sync::atomic::Ordering;

    struct Context {
        ipp: IpProtection,
        guardian: Arc<FakeGuardian>,
        host: Arc<FilterChain>,
    }

    fn context() -> Context {
        context_with(IppConfig {
            enabled: true,
            ..Default::default()
        })
    }

    fn context_with(config: IppConfig) -> Context {
        let guardian = Arc::new(FakeGuardian::new());
        let host = Arc::new(FilterChain::new());
        let servers = Arc::new(ServerList::from_json(&server_list_json()).unwrap());
        let ipp = IpProtection::new(
            config,
            guardian.clone(),
            servers,
            Arc::new(SignInState::new(true, true)),
            host.clone(),
        );

        Context {
            ipp,
            guardian,
            host,
        }
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let c = context();
        assert_eq!(c.ipp.init().await, ServiceState::Ready);
        assert_eq!(c.ipp.connection_state(), ConnectionState::Ready);

        assert_eq!(c.ipp.start(true).await, Ok(ServiceState::Active));
        assert!(matches!(
            c.host.route(RouteRequest::new("https://a.example/")),
            Routing::Proxy(_)
        ));

        c.ipp.add_page_exclusion("https://a.example/page");
        assert!(matches!(
            c.host.route(RouteRequest::new("https://a.example/other")),
            Routing::Direct
        ));

        assert!(c.ipp.stop(true).await.is_some());
        assert_eq!(c.ipp.state(), ServiceState::Ready);
        assert!(c.host.is_empty());
    }

    #[tokio::test]
    async fn test_reported_401_rotates() {
        let c = context();
        c.ipp.init().await;
        c.ipp.start(false).await.unwrap();

        let key = c.ipp.manager().router().unwrap().isolation_key().unwrap();
        assert!(c
            .ipp
            .report_proxy_error(ProxyErrorEvent::new(key.clone(), ProxyErrorLevel::Error, 401)));

        for _ in 0..20 {
            if c.guardian.pass_fetches.load(Ordering::SeqCst) == 2 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(c.guardian.pass_fetches.load(Ordering::SeqCst), 2);
        assert_ne!(c.ipp.manager().router().unwrap().isolation_key(), Some(key));
    }

    #[tokio::test]
    async fn test_uninit_disconnects() {
        let c = context();
        c.ipp.init().await;
        c.ipp.start(true).await.unwrap();

        c.ipp.uninit().await;
        assert_eq!(c.ipp.state(), ServiceState::Uninitialized);
        assert_eq!(c.ipp.connection_state(), ConnectionState::NotReady);
        assert!(c.host.is_empty());
    }

    #[tokio::test]
    async fn test_autostart_from_config() {
        let c = context_with(IppConfig {
            enabled: true,
            autostart: true,
            ..Default::default()
        });

        assert_eq!(c.ipp.init().await, ServiceState::Ready);
        wait_for_state(c.ipp.gate(), ServiceState::Active).await;
        assert_eq!(c.host.len(), 1);
        assert!(!c.ipp.startup().user_enabled());
    }

    #[tokio::test]
    async fn test_restore_across_restarts() {
        let path = std::env::temp_dir().join(format!("fos-ipp-restore-{}.json", std::process::id()));
        let config = IppConfig {
            enabled: true,
            auto_restore: true,
            startup_cache: Some(path.clone()),
            ..Default::default()
        };

        let first = context_with(config.clone());
        first.ipp.init().await;
        assert!(!first.ipp.will_restore());
        first.ipp.start(true).await.unwrap();
        assert!(first.ipp.startup().user_enabled());

        let second = context_with(config.clone());
        assert_eq!(second.ipp.state(), ServiceState::Ready);
        assert!(second.ipp.startup().user_enabled());
        second.ipp.init().await;
        wait_for_state(second.ipp.gate(), ServiceState::Active).await;
        assert_eq!(second.host.len(), 1);

        second.ipp.stop(true).await;
        let third = context_with(config);
        third.ipp.init().await;
        settle().await;
        assert_eq!(third.ipp.state(), ServiceState::Ready);
        assert!(third.host.is_empty());

        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_locations_seed_next_run() {
        let path = std::env::temp_dir().join(format!("fos-ipp-locations-{}.json", std::process::id()));
        let config = IppConfig {
            enabled: true,
            startup_cache: Some(path.clone()),
            ..Default::default()
        };

        let c = context_with(config.clone());
        c.ipp.init().await;
        assert!(!c.ipp.startup().locations().is_empty());

        let ipp = IpProtection::from_config(
            config,
            Arc::new(FakeTokens::signed_in()),
            Arc::new(SignInState::new(true, true)),
            Arc::new(FilterChain::new()),
        )
        .unwrap();
        assert!(ipp.servers().has_list());
        assert!(ipp.servers().default_location().is_some());

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn test_from_config_validates() {
        let bad = IppConfig {
            guardian_endpoint: "not a url".to_string(),
            ..Default::default()
        };
        let result = IpProtection::from_config(
            bad,
            Arc::new(FakeTokens::signed_in()),
            Arc::new(SignInState::new(false, false)),
            Arc::new(FilterChain::new()),
        );
        assert!(result.is_err());

        let ipp = IpProtection::from_config(
            IppConfig::default(),
            Arc::new(FakeTokens::signed_in()),
            Arc::new(SignInState::new(false, false)),
            Arc::new(FilterChain::new()),
        )
        .unwrap();
        assert_eq!(ipp.state(), ServiceState::Uninitialized);
        assert_eq!(ipp.config().mode, RouterMode::Full);
    }
}
