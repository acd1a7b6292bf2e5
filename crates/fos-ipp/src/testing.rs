//! Fixtures and fakes shared by the unit tests.

use crate::account::{AccountGate, AccountStatus, ServiceState, SignInState};
use crate::cache::EntitlementCache;
use crate::client::TokenProvider;
use crate::config::IppConfig;
use crate::error::IppError;
use crate::events::lock;
use crate::guardian::{
    EnrollResponse, GuardianBackend, GuardianError, ProxyPassResponse, UserInfoResponse,
};
use crate::manager::ConnectionManager;
use crate::pass::{Entitlement, ProxyPass};
use crate::router::FilterChain;
use crate::serverlist::{ServerDirectory, ServerList};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::{Notify, watch};

/// Unsigned JWT with the given validity window
pub fn mint_token(nbf: i64, exp: i64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"none","typ":"JWT"}"#);
    let claims = serde_json::json!({
        "sub": "user-1",
        "aud": "proxy",
        "iat": nbf,
        "nbf": nbf,
        "exp": exp,
        "iss": "guardian",
    });
    let body = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.sig", header, body)
}

/// A pass that is valid now and not due for rotation
pub fn fresh_token() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default();
    mint_token(now - 60, now + 30 * 24 * 3600)
}

pub fn entitlement_json(subscribed: bool) -> String {
    serde_json::json!({
        "autostart": false,
        "created_at": "2024-01-01T00:00:00.000Z",
        "limited_bandwidth": false,
        "location_controls": false,
        "subscribed": subscribed,
        "uid": 42,
        "website_inclusion": false,
    })
    .to_string()
}

pub fn entitlement(subscribed: bool) -> Entitlement {
    Entitlement::from_json(entitlement_json(subscribed).as_bytes()).unwrap()
}

/// One US city with a two-protocol server
pub fn server_list_json() -> String {
    r#"[
      {"name": "United States", "code": "US", "cities": [
        {"name": "New York", "code": "NYC", "servers": [
          {"hostname": "ny1.example", "port": 443, "protocols": [
            {"name": "masque", "host": "ny1.example", "port": 443,
             "templateString": "/.well-known/masque/udp/{target_host}/{target_port}/"},
            {"name": "connect", "host": "ny1.example", "port": 8443}
          ]}
        ]}
      ]},
      {"name": "Germany", "code": "DE", "cities": []}
    ]"#
    .to_string()
}

/// Parks callers until released.
///
/// `wait_for_parked` resolves once at least one caller is parked, so tests
/// can observe an operation mid-flight without sleeping.
pub struct Gate {
    held: AtomicBool,
    open: Notify,
    parked: watch::Sender<usize>,
    parked_rx: watch::Receiver<usize>,
}

impl Gate {
    pub fn new() -> Self {
        let (parked, parked_rx) = watch::channel(0);
        Self {
            held: AtomicBool::new(false),
            open: Notify::new(),
            parked,
            parked_rx,
        }
    }

    pub fn hold(&self) {
        self.parked.send_replace(0);
        self.held.store(true, Ordering::SeqCst);
    }

    pub fn release(&self) {
        self.held.store(false, Ordering::SeqCst);
        self.open.notify_waiters();
    }

    pub async fn pass(&self) {
        if !self.held.load(Ordering::SeqCst) {
            return;
        }
        self.parked.send_modify(|n| *n += 1);
        loop {
            let opened = self.open.notified();
            if !self.held.load(Ordering::SeqCst) {
                break;
            }
            opened.await;
        }
    }

    pub async fn wait_for_parked(&self) {
        let mut rx = self.parked_rx.clone();
        let _ = rx.wait_for(|n| *n > 0).await;
    }
}

pub struct FakeTokens {
    signed_in: bool,
    /// (ids, only visible after a refresh)
    attached: Mutex<(Vec<String>, bool)>,
    refreshes: AtomicUsize,
}

impl FakeTokens {
    pub fn signed_in() -> Self {
        Self {
            signed_in: true,
            attached: Mutex::new((Vec::new(), false)),
            refreshes: AtomicUsize::new(0),
        }
    }

    pub fn signed_out() -> Self {
        Self {
            signed_in: false,
            ..Self::signed_in()
        }
    }

    pub fn set_attached(&self, ids: Vec<String>, after_refresh: bool) {
        *lock(&self.attached) = (ids, after_refresh);
    }

    pub fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenProvider for FakeTokens {
    async fn oauth_token(&self) -> Option<String> {
        self.signed_in.then(|| "oauth-token".to_string())
    }

    async fn release_token(&self, _token: &str) {}

    async fn attached_client_ids(&self, refresh: bool) -> Vec<String> {
        if refresh {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
        }
        let (ids, after_refresh) = lock(&self.attached).clone();
        if after_refresh && !refresh {
            Vec::new()
        } else {
            ids
        }
    }
}

pub struct FakeGuardian {
    pub pass_fetches: AtomicUsize,
    pub enroll_calls: AtomicUsize,
    pub user_info_calls: AtomicUsize,
    pub linked_calls: AtomicUsize,
    fail_pass: AtomicBool,
    linked: AtomicBool,
    user_info_status: Mutex<u16>,
    user_info_error: Mutex<Option<GuardianError>>,
    enroll_response: Mutex<EnrollResponse>,
    pass_gate: Gate,
    enroll_gate: Gate,
}

impl FakeGuardian {
    pub fn new() -> Self {
        Self {
            pass_fetches: AtomicUsize::new(0),
            enroll_calls: AtomicUsize::new(0),
            user_info_calls: AtomicUsize::new(0),
            linked_calls: AtomicUsize::new(0),
            fail_pass: AtomicBool::new(false),
            linked: AtomicBool::new(true),
            user_info_status: Mutex::new(200),
            user_info_error: Mutex::new(None),
            enroll_response: Mutex::new(EnrollResponse::success()),
            pass_gate: Gate::new(),
            enroll_gate: Gate::new(),
        }
    }

    pub fn fail_pass_fetches(&self, fail: bool) {
        self.fail_pass.store(fail, Ordering::SeqCst);
    }

    pub fn hold_pass_fetches(&self) {
        self.pass_gate.hold();
    }

    pub fn release_pass_fetches(&self) {
        self.pass_gate.release();
    }

    pub async fn wait_for_pass_fetch(&self) {
        self.pass_gate.wait_for_parked().await;
    }

    pub fn hold_enrollment(&self) {
        self.enroll_gate.hold();
    }

    pub fn release_enrollment(&self) {
        self.enroll_gate.release();
    }

    pub async fn wait_for_enrollment(&self) {
        self.enroll_gate.wait_for_parked().await;
    }

    pub fn set_linked(&self, linked: bool) {
        self.linked.store(linked, Ordering::SeqCst);
    }

    pub fn set_user_info_status(&self, status: u16) {
        *lock(&self.user_info_status) = status;
    }

    pub fn set_user_info_error(&self, error: Option<GuardianError>) {
        *lock(&self.user_info_error) = error;
    }

    pub fn set_enroll_response(&self, response: EnrollResponse) {
        *lock(&self.enroll_response) = response;
    }
}

#[async_trait]
impl GuardianBackend for FakeGuardian {
    async fn fetch_proxy_pass(&self) -> ProxyPassResponse {
        self.pass_fetches.fetch_add(1, Ordering::SeqCst);
        self.pass_gate.pass().await;

        if self.fail_pass.load(Ordering::SeqCst) {
            return ProxyPassResponse {
                status: Some(500),
                ..Default::default()
            };
        }
        ProxyPassResponse {
            status: Some(200),
            error: None,
            pass: ProxyPass::parse(&fresh_token()).ok(),
        }
    }

    async fn enroll(&self) -> EnrollResponse {
        self.enroll_calls.fetch_add(1, Ordering::SeqCst);
        self.enroll_gate.pass().await;
        lock(&self.enroll_response).clone()
    }

    async fn fetch_user_info(&self) -> UserInfoResponse {
        self.user_info_calls.fetch_add(1, Ordering::SeqCst);

        let error = lock(&self.user_info_error).clone();
        if let Some(error) = error {
            return UserInfoResponse {
                error: Some(error),
                ..Default::default()
            };
        }
        let status = *lock(&self.user_info_status);
        UserInfoResponse {
            status: Some(status),
            entitlement: (status == 200).then(|| entitlement(false)),
            error: None,
        }
    }

    async fn is_linked_to_guardian(&self, _only_cached: bool) -> bool {
        self.linked_calls.fetch_add(1, Ordering::SeqCst);
        self.linked.load(Ordering::SeqCst)
    }
}

pub struct FakeAccount {
    state: Mutex<ServiceState>,
    fail_enrollment: AtomicBool,
    pub rechecks: AtomicUsize,
}

impl FakeAccount {
    pub fn ready() -> Self {
        Self {
            state: Mutex::new(ServiceState::Ready),
            fail_enrollment: AtomicBool::new(false),
            rechecks: AtomicUsize::new(0),
        }
    }

    pub fn set_state(&self, state: ServiceState) {
        *lock(&self.state) = state;
    }

    pub fn fail_enrollment(&self, fail: bool) {
        self.fail_enrollment.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AccountStatus for FakeAccount {
    fn service_state(&self) -> ServiceState {
        *lock(&self.state)
    }

    async fn ensure_enrolled(&self) -> Result<(), IppError> {
        if self.service_state() != ServiceState::Enrolling {
            return Ok(());
        }
        if self.fail_enrollment.load(Ordering::SeqCst) {
            return Err(IppError::Generic("enrollment failed".into()));
        }
        self.set_state(ServiceState::Ready);
        Ok(())
    }

    async fn recheck(&self) -> ServiceState {
        self.rechecks.fetch_add(1, Ordering::SeqCst);
        self.service_state()
    }
}

/// Let spawned tasks run
pub async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

/// Yield until the gate reaches `state`
pub async fn wait_for_state(gate: &AccountGate, state: ServiceState) {
    for _ in 0..200 {
        if gate.state() == state {
            return;
        }
        tokio::task::yield_now().await;
    }
    panic!("gate stuck in {} waiting for {}", gate.state(), state);
}

/// A connection manager wired to fakes
pub struct Harness {
    pub manager: Arc<ConnectionManager>,
    pub guardian: Arc<FakeGuardian>,
    pub account: Arc<FakeAccount>,
    pub host: Arc<FilterChain>,
}

impl Harness {
    pub fn new() -> Self {
        Self::build(Arc::new(FakeGuardian::new()), Arc::new(FakeAccount::ready()), None)
    }

    pub fn with_server_list(json: &str) -> Self {
        Self::build(
            Arc::new(FakeGuardian::new()),
            Arc::new(FakeAccount::ready()),
            Some(json),
        )
    }

    pub fn build(guardian: Arc<FakeGuardian>, account: Arc<FakeAccount>, servers: Option<&str>) -> Self {
        let servers: Arc<dyn ServerDirectory> = Arc::new(
            ServerList::from_json(servers.unwrap_or(&server_list_json())).unwrap(),
        );
        let host = Arc::new(FilterChain::new());
        let status: Arc<dyn AccountStatus> = account.clone();
        let manager = Arc::new(ConnectionManager::new(
            &IppConfig::default(),
            guardian.clone(),
            servers,
            host.clone(),
            Arc::downgrade(&status),
        ));
        manager.on_service_state_changed(account.service_state());

        Self {
            manager,
            guardian,
            account,
            host,
        }
    }
}

/// An account gate and its connection manager wired to fakes
pub struct GateHarness {
    pub gate: Arc<AccountGate>,
    pub guardian: Arc<FakeGuardian>,
    pub signals: Arc<SignInState>,
    pub host: Arc<FilterChain>,
}

impl GateHarness {
    pub fn builder() -> GateHarnessBuilder {
        GateHarnessBuilder {
            enabled: true,
            signed_in: true,
            eligible: true,
            linked: true,
            cached: false,
        }
    }
}

pub struct GateHarnessBuilder {
    enabled: bool,
    signed_in: bool,
    eligible: bool,
    linked: bool,
    cached: bool,
}

impl GateHarnessBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn signed_in(mut self, signed_in: bool) -> Self {
        self.signed_in = signed_in;
        self
    }

    pub fn eligible(mut self, eligible: bool) -> Self {
        self.eligible = eligible;
        self
    }

    pub fn linked(mut self, linked: bool) -> Self {
        self.linked = linked;
        self
    }

    pub fn cached_entitlement(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn build(self) -> GateHarness {
        let guardian = Arc::new(FakeGuardian::new());
        guardian.set_linked(self.linked);
        let signals = Arc::new(SignInState::new(self.signed_in, self.eligible));
        let host = Arc::new(FilterChain::new());

        let cache = Arc::new(EntitlementCache::in_memory());
        if self.cached {
            cache.store(entitlement(false));
        }

        let config = IppConfig::default();
        let servers: Arc<dyn ServerDirectory> =
            Arc::new(ServerList::from_json(&server_list_json()).unwrap());
        let gate = AccountGate::new(
            self.enabled,
            guardian.clone(),
            signals.clone(),
            cache,
            |account: Weak<dyn AccountStatus>| {
                ConnectionManager::new(&config, guardian.clone(), servers, host.clone(), account)
            },
        );

        GateHarness {
            gate,
            guardian,
            signals,
            host,
        }
    }
}
