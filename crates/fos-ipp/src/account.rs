//! Account Gate
//!
//! Folds sign-in status, eligibility and entitlement into one
//! [`ServiceState`] that the UI and the connection manager react to, and
//! runs enrollment.
//!
//! State is recomputed top to bottom, first match wins:
//!
//! 1. Feature disabled → `Uninitialized`
//! 2. Signed out → `Unauthenticated` if eligible, else `Unavailable`
//! 3. Connection active → `Active`
//! 4. Cached entitlement → `Ready`
//! 5. Not linked to the service → `Enrolling` if eligible, else `Unavailable`
//! 6. Entitlement lookup → `Unavailable` if not entitled and not eligible,
//!    else `Ready`
//!
//! Steps 5 and 6 are remote and skipped whenever step 4 answers.

use crate::cache::EntitlementCache;
use crate::error::{ErrorHistory, IppError};
use crate::events::{EventBus, StateChange, Subscription, lock};
use crate::guardian::GuardianBackend;
use crate::manager::{ConnectionManager, ConnectionState};
use crate::pass::Entitlement;
use crate::single_flight::SingleFlight;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Coarse service state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceState {
    Uninitialized,
    /// Not offered to this user
    Unavailable,
    /// Eligible but signed out
    Unauthenticated,
    /// Signed in, enrollment pending
    Enrolling,
    Ready,
    Active,
    Error,
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Uninitialized => write!(f, "uninitialized"),
            ServiceState::Unavailable => write!(f, "unavailable"),
            ServiceState::Unauthenticated => write!(f, "unauthenticated"),
            ServiceState::Enrolling => write!(f, "enrolling"),
            ServiceState::Ready => write!(f, "ready"),
            ServiceState::Active => write!(f, "active"),
            ServiceState::Error => write!(f, "error"),
        }
    }
}

/// Sign-in and eligibility signals from the host application
pub trait AccountSignals: Send + Sync {
    fn is_signed_in(&self) -> bool;

    /// Whether the user may be offered the service
    fn is_eligible(&self) -> bool;

    /// Called whenever either signal changes
    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) -> Subscription;
}

/// Settable [`AccountSignals`]
pub struct SignInState {
    signed_in: AtomicBool,
    eligible: AtomicBool,
    changes: EventBus<()>,
}

impl SignInState {
    pub fn new(signed_in: bool, eligible: bool) -> Self {
        Self {
            signed_in: AtomicBool::new(signed_in),
            eligible: AtomicBool::new(eligible),
            changes: EventBus::new(),
        }
    }

    pub fn set_signed_in(&self, signed_in: bool) {
        if self.signed_in.swap(signed_in, Ordering::SeqCst) != signed_in {
            self.changes.emit(&());
        }
    }

    pub fn set_eligible(&self, eligible: bool) {
        if self.eligible.swap(eligible, Ordering::SeqCst) != eligible {
            self.changes.emit(&());
        }
    }
}

impl AccountSignals for SignInState {
    fn is_signed_in(&self) -> bool {
        self.signed_in.load(Ordering::SeqCst)
    }

    fn is_eligible(&self) -> bool {
        self.eligible.load(Ordering::SeqCst)
    }

    fn subscribe(&self, listener: Box<dyn Fn() + Send + Sync>) -> Subscription {
        self.changes.subscribe(move |_| listener())
    }
}

/// What the connection manager needs from the account side
#[async_trait]
pub trait AccountStatus: Send + Sync {
    fn service_state(&self) -> ServiceState;

    /// Enroll and fetch the entitlement unless one is already known
    async fn ensure_enrolled(&self) -> Result<(), IppError>;

    /// Recompute the state, bypassing caches
    async fn recheck(&self) -> ServiceState;
}

/// Top-level orchestrator
pub struct AccountGate {
    this: Weak<AccountGate>,
    enabled: AtomicBool,
    initialized: AtomicBool,
    guardian: Arc<dyn GuardianBackend>,
    signals: Arc<dyn AccountSignals>,
    cache: Arc<EntitlementCache>,
    manager: Arc<ConnectionManager>,
    state: Mutex<ServiceState>,
    errors: Mutex<ErrorHistory>,
    events: EventBus<StateChange<ServiceState>>,
    enrollment: SingleFlight<Result<(), IppError>>,
    signal_subscription: Mutex<Option<Subscription>>,
    connection_subscription: Mutex<Option<Subscription>>,
}

impl AccountGate {
    /// Build the gate together with the connection manager it drives.
    ///
    /// `make_manager` receives the handle the manager uses to reach back
    /// into the gate.
    pub fn new<F>(
        enabled: bool,
        guardian: Arc<dyn GuardianBackend>,
        signals: Arc<dyn AccountSignals>,
        cache: Arc<EntitlementCache>,
        make_manager: F,
    ) -> Arc<Self>
    where
        F: FnOnce(Weak<dyn AccountStatus>) -> ConnectionManager,
    {
        Arc::new_cyclic(|this: &Weak<AccountGate>| {
            let account: Weak<dyn AccountStatus> = this.clone();
            let manager = Arc::new(make_manager(account));

            let weak = this.clone();
            let connection_subscription = manager.subscribe(move |change| {
                if let Some(gate) = weak.upgrade() {
                    gate.on_connection_changed(change);
                }
            });

            Self {
                this: this.clone(),
                enabled: AtomicBool::new(enabled),
                initialized: AtomicBool::new(false),
                guardian,
                signals,
                cache,
                manager,
                state: Mutex::new(ServiceState::Uninitialized),
                errors: Mutex::new(ErrorHistory::new()),
                events: EventBus::new(),
                enrollment: SingleFlight::new(),
                signal_subscription: Mutex::new(None),
                connection_subscription: Mutex::new(Some(connection_subscription)),
            }
        })
    }

    pub fn state(&self) -> ServiceState {
        *lock(&self.state)
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn errors(&self) -> ErrorHistory {
        lock(&self.errors).clone()
    }

    pub fn entitlement(&self) -> Option<Entitlement> {
        self.cache.get()
    }

    pub fn is_enrolled_and_entitled(&self) -> bool {
        self.cache.get().is_some()
    }

    pub fn has_upgraded(&self) -> bool {
        self.cache.has_upgraded()
    }

    pub fn is_alpha(&self) -> bool {
        self.cache.get().is_none_or(|e| e.is_alpha())
    }

    pub fn is_enrolling(&self) -> bool {
        self.enrollment.is_running()
    }

    pub fn subscribe<F>(&self, listener: F) -> Subscription
    where
        F: Fn(&StateChange<ServiceState>) + Send + Sync + 'static,
    {
        self.events.subscribe(listener)
    }

    /// Start observing account signals and compute the first state.
    /// Idempotent.
    pub async fn init(&self) -> ServiceState {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return self.state();
        }

        let weak = self.this.clone();
        let subscription = self.signals.subscribe(Box::new(move || {
            let Some(gate) = weak.upgrade() else {
                return;
            };
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn(async move { gate.on_signals_changed().await });
                }
                Err(_) => warn!("Account signal changed outside of a runtime"),
            }
        }));
        *lock(&self.signal_subscription) = Some(subscription);

        info!("Account gate initialized");
        self.check_state(false).await
    }

    /// Drop signal subscriptions, disconnect and return to
    /// `Uninitialized`
    pub async fn uninit(&self) {
        if !self.initialized.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(subscription) = lock(&self.signal_subscription).take() {
            subscription.unsubscribe();
        }
        self.manager.stop().await;
        self.set_state(ServiceState::Uninitialized);
        info!("Account gate uninitialized");
    }

    /// Feature flag
    pub async fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
        if !enabled {
            self.uninit().await;
        } else if self.initialized.load(Ordering::SeqCst) {
            self.check_state(false).await;
        } else {
            self.init().await;
        }
    }

    /// Leave `Active` when the connection drops without going through
    /// [`AccountGate::stop`]
    fn on_connection_changed(&self, change: &StateChange<ConnectionState>) {
        if change.previous != ConnectionState::Active || self.state() != ServiceState::Active {
            return;
        }

        if change.state == ConnectionState::Error {
            let e = IppError::generic("proxy connection failed");
            self.record_error(&e, "Connection lost");
            self.set_state(ServiceState::Error);
        } else {
            self.set_state(ServiceState::Ready);
        }
    }

    async fn on_signals_changed(&self) {
        if !self.signals.is_signed_in() {
            debug!("Signed out, dropping entitlement");
            self.cache.clear();
            self.manager.reset().await;
        }
        self.check_state(false).await;
    }

    /// Recompute and publish the state
    pub async fn check_state(&self, force: bool) -> ServiceState {
        self.update_state(force).await.0
    }

    /// Returns the new state and whether it changed
    async fn update_state(&self, force: bool) -> (ServiceState, bool) {
        let state = match self.compute_state(force).await {
            Ok(state) => state,
            Err(e) => {
                self.record_error(&e, "Account check failed");
                ServiceState::Error
            }
        };
        (state, self.set_state(state))
    }

    async fn compute_state(&self, force: bool) -> Result<ServiceState, IppError> {
        if !self.enabled.load(Ordering::SeqCst) {
            return Ok(ServiceState::Uninitialized);
        }

        let eligible = self.signals.is_eligible();
        if !self.signals.is_signed_in() {
            return Ok(if eligible {
                ServiceState::Unauthenticated
            } else {
                ServiceState::Unavailable
            });
        }

        if self.manager.state() == ConnectionState::Active {
            return Ok(ServiceState::Active);
        }

        if !force && self.cache.get().is_some() {
            return Ok(ServiceState::Ready);
        }

        if !self.guardian.is_linked_to_guardian(!force).await {
            self.cache.clear();
            return Ok(if eligible {
                ServiceState::Enrolling
            } else {
                ServiceState::Unavailable
            });
        }

        let response = self.guardian.fetch_user_info().await;
        debug!(
            "Entitlement response (status: {:?}, error: {:?})",
            response.status, response.error
        );
        if response.status == Some(404) {
            self.cache.clear();
            return Ok(if eligible {
                ServiceState::Ready
            } else {
                ServiceState::Unavailable
            });
        }

        let entitlement = response.into_entitlement().inspect_err(|_| self.cache.clear())?;
        self.cache.store(entitlement);
        Ok(ServiceState::Ready)
    }

    /// Returns whether the state changed
    fn set_state(&self, state: ServiceState) -> bool {
        let previous = std::mem::replace(&mut *lock(&self.state), state);
        if previous == state {
            return false;
        }

        info!("Service state {} -> {}", previous, state);
        self.events.emit(&StateChange { state, previous });
        self.manager.on_service_state_changed(state);
        true
    }

    fn record_error(&self, error: &IppError, context: &str) {
        error!("{}: {}", context, error);
        lock(&self.errors).push(error.kind(), format!("{}: {}", context, error));
    }

    /// Connect. Waits for a running enrollment and requires `Ready`.
    pub async fn start(&self, user_action: bool) -> Result<ServiceState, IppError> {
        if let Some(enrollment) = self.enrollment.in_flight() {
            let _ = enrollment.await;
        }

        if self.state() == ServiceState::Error {
            self.check_state(true).await;
        }
        match self.state() {
            ServiceState::Active => return Ok(ServiceState::Active),
            ServiceState::Ready => {}
            other => {
                let e = IppError::Generic(format!("cannot start while {}", other));
                self.record_error(&e, "Start refused");
                return Err(e);
            }
        }

        info!("Starting (user action: {})", user_action);
        match self.manager.start().await {
            Ok(ConnectionState::Active) if self.manager.state().is_active() => {
                self.set_state(ServiceState::Active);
                Ok(ServiceState::Active)
            }
            Ok(_) => Ok(self.state()),
            Err(e) => {
                self.record_error(&e, "Connection failed");
                Err(e)
            }
        }
    }

    /// Disconnect. Returns the session duration when there was a connection.
    pub async fn stop(&self, user_action: bool) -> Option<Duration> {
        if self.state() != ServiceState::Active
            && !self.manager.state().is_active()
            && !self.manager.has_connection()
        {
            return None;
        }

        info!("Stopping (user action: {})", user_action);
        let duration = self.manager.stop().await;
        if self.state() == ServiceState::Active {
            self.set_state(ServiceState::Ready);
        }
        duration
    }

    /// Enroll the signed-in account. Only valid while `Enrolling`;
    /// concurrent callers share one attempt.
    pub async fn maybe_enroll(&self) -> Result<(), IppError> {
        let state = self.state();
        if state != ServiceState::Enrolling && !self.enrollment.is_running() {
            return Err(IppError::Generic(format!("cannot enroll while {}", state)));
        }

        match self.enroll_once().await {
            Ok(()) => {
                self.check_state(false).await;
                Ok(())
            }
            Err(e) => {
                self.record_error(&e, "Enrollment failed");
                self.set_state(ServiceState::Error);
                Err(e)
            }
        }
    }

    fn enroll_once(&self) -> crate::single_flight::Flight<Result<(), IppError>> {
        let this = self.this.clone();
        self.enrollment.run(move || async move {
            match this.upgrade() {
                Some(gate) => gate.enroll_and_entitle().await,
                None => Err(IppError::Cancelled),
            }
        })
    }

    async fn enroll_and_entitle(&self) -> Result<(), IppError> {
        if self.cache.get().is_some() {
            return Ok(());
        }

        let enrollment = self.guardian.enroll().await;
        if !enrollment.ok {
            self.cache.clear();
            return Err(IppError::Generic(
                enrollment.error.unwrap_or_else(|| "enrollment failed".to_string()),
            ));
        }

        match self.guardian.fetch_user_info().await.into_entitlement() {
            Ok(entitlement) => {
                info!("Enrolled (uid: {})", entitlement.uid);
                self.cache.store(entitlement);
                Ok(())
            }
            Err(e) => {
                self.cache.clear();
                Err(e)
            }
        }
    }

    /// Drop the cached entitlement and recheck remotely. Always notifies
    /// listeners, since entitlement fields can change without the state
    /// changing.
    pub async fn refetch_entitlement(&self) -> ServiceState {
        self.cache.clear();
        let (state, changed) = self.update_state(true).await;
        if !changed {
            self.events.emit(&StateChange {
                state,
                previous: state,
            });
        }
        state
    }
}

#[async_trait]
impl AccountStatus for AccountGate {
    fn service_state(&self) -> ServiceState {
        self.state()
    }

    async fn ensure_enrolled(&self) -> Result<(), IppError> {
        match self.state() {
            ServiceState::Enrolling => self.maybe_enroll().await,
            _ if self.cache.get().is_some() => Ok(()),
            _ => match self.enroll_once().await {
                Ok(()) => Ok(()),
                Err(e) => {
                    self.record_error(&e, "Enrollment failed");
                    Err(e)
                }
            },
        }
    }

    async fn recheck(&self) -> ServiceState {
        self.check_state(true).await
    }
}

impl Drop for AccountGate {
    fn drop(&mut self) {
        if let Some(subscription) = lock(&self.signal_subscription).take() {
            subscription.unsubscribe();
        }
        if let Some(subscription) = lock(&self.connection_subscription).take() {
            subscription.unsubscribe();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::guardian::{EnrollResponse, GuardianError};
    use crate::observers::{ProxyErrorEvent, ProxyErrorLevel};
    use crate::testing::GateHarness;
    use std::sync::atomic::Ordering;

    #[tokio::test]
    async fn test_disabled_is_uninitialized() {
        let h = GateHarness::builder().enabled(false).build();
        assert_eq!(h.gate.init().await, ServiceState::Uninitialized);
    }

    #[tokio::test]
    async fn test_signed_out_states() {
        let h = GateHarness::builder().signed_in(false).build();
        assert_eq!(h.gate.init().await, ServiceState::Unauthenticated);

        h.signals.set_eligible(false);
        assert_eq!(h.gate.check_state(false).await, ServiceState::Unavailable);
        assert_eq!(h.guardian.linked_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let h = GateHarness::builder().build();
        assert_eq!(h.gate.init().await, ServiceState::Ready);
        assert_eq!(h.gate.init().await, ServiceState::Ready);
        assert_eq!(h.guardian.user_info_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cached_entitlement_skips_remote_checks() {
        let h = GateHarness::builder().cached_entitlement().build();

        assert_eq!(h.gate.init().await, ServiceState::Ready);
        assert_eq!(h.guardian.linked_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.guardian.user_info_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_not_linked_enrolls() {
        let h = GateHarness::builder().linked(false).build();
        assert_eq!(h.gate.init().await, ServiceState::Enrolling);

        h.guardian.set_linked(true);
        h.gate.maybe_enroll().await.unwrap();

        assert_eq!(h.gate.state(), ServiceState::Ready);
        assert!(h.gate.is_enrolled_and_entitled());
        assert_eq!(h.guardian.enroll_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_not_linked_not_eligible() {
        let h = GateHarness::builder().linked(false).eligible(false).build();
        assert_eq!(h.gate.init().await, ServiceState::Unavailable);
    }

    #[tokio::test]
    async fn test_not_entitled() {
        let h = GateHarness::builder().build();
        h.guardian.set_user_info_status(404);
        assert_eq!(h.gate.init().await, ServiceState::Ready);

        h.signals.set_eligible(false);
        assert_eq!(h.gate.check_state(true).await, ServiceState::Unavailable);
    }

    #[tokio::test]
    async fn test_remote_failure_sets_error() {
        let h = GateHarness::builder().build();
        h.guardian
            .set_user_info_error(Some(GuardianError::Network("offline".into())));

        assert_eq!(h.gate.init().await, ServiceState::Error);
        assert_eq!(h.gate.errors().len(), 1);

        h.guardian.set_user_info_error(None);
        assert_eq!(h.gate.start(true).await, Ok(ServiceState::Active));
    }

    #[tokio::test]
    async fn test_maybe_enroll_only_while_enrolling() {
        let h = GateHarness::builder().build();
        h.gate.init().await;
        assert!(h.gate.maybe_enroll().await.is_err());
        assert_eq!(h.guardian.enroll_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_maybe_enroll_single_flight() {
        let h = GateHarness::builder().linked(false).build();
        h.gate.init().await;
        h.guardian.hold_enrollment();

        let a = tokio::spawn({
            let gate = h.gate.clone();
            async move { gate.maybe_enroll().await }
        });
        let b = tokio::spawn({
            let gate = h.gate.clone();
            async move { gate.maybe_enroll().await }
        });
        h.guardian.wait_for_enrollment().await;
        tokio::task::yield_now().await;
        assert!(h.gate.is_enrolling());
        h.guardian.release_enrollment();

        assert!(a.await.unwrap().is_ok());
        assert!(b.await.unwrap().is_ok());
        assert_eq!(h.guardian.enroll_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_enrollment_failure() {
        let h = GateHarness::builder().linked(false).build();
        h.gate.init().await;
        h.guardian
            .set_enroll_response(EnrollResponse::failure("not_eligible"));

        assert_eq!(
            h.gate.maybe_enroll().await,
            Err(IppError::Generic("not_eligible".into()))
        );
        assert_eq!(h.gate.state(), ServiceState::Error);
        assert!(h.gate.entitlement().is_none());
        assert_eq!(h.gate.errors().last().unwrap().context, "Enrollment failed: not_eligible");
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let h = GateHarness::builder().build();
        h.gate.init().await;

        assert_eq!(h.gate.start(true).await, Ok(ServiceState::Active));
        assert_eq!(h.gate.manager().state(), ConnectionState::Active);
        assert_eq!(h.host.len(), 1);

        assert!(h.gate.stop(true).await.is_some());
        assert_eq!(h.gate.state(), ServiceState::Ready);
        assert_eq!(h.gate.manager().state(), ConnectionState::Ready);
        assert!(h.host.is_empty());

        assert!(h.gate.stop(true).await.is_none());
    }

    #[tokio::test]
    async fn test_start_requires_ready() {
        let h = GateHarness::builder().signed_in(false).build();
        h.gate.init().await;

        assert!(matches!(h.gate.start(true).await, Err(IppError::Generic(_))));
        assert_eq!(h.guardian.pass_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_start_failure_is_reported() {
        let h = GateHarness::builder().build();
        h.gate.init().await;
        h.guardian.fail_pass_fetches(true);

        assert!(h.gate.start(true).await.is_err());
        assert_eq!(h.gate.state(), ServiceState::Ready);
        assert_eq!(h.gate.manager().state(), ConnectionState::Error);
        assert_eq!(h.gate.errors().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_rotation_surfaces_error() {
        let h = GateHarness::builder().build();
        h.gate.init().await;
        h.gate.start(true).await.unwrap();

        let key = h.gate.manager().router().unwrap().isolation_key().unwrap();
        h.guardian.fail_pass_fetches(true);
        let event = ProxyErrorEvent::new(key, ProxyErrorLevel::Error, 401);
        assert!(h.gate.manager().handle_proxy_error(&event).await.is_err());

        assert_eq!(h.gate.state(), ServiceState::Error);
        assert_eq!(h.gate.manager().state(), ConnectionState::Error);
        assert!(h.host.is_empty());
        assert_eq!(h.gate.errors().last().unwrap().context, "Connection lost: proxy connection failed");

        assert!(h.gate.stop(true).await.is_none());
        assert!(h.host.is_empty());

        h.guardian.fail_pass_fetches(false);
        assert_eq!(h.gate.start(true).await, Ok(ServiceState::Active));
        assert_eq!(h.host.len(), 1);
    }

    #[tokio::test]
    async fn test_connection_stopped_elsewhere() {
        let h = GateHarness::builder().build();
        h.gate.init().await;
        h.gate.start(true).await.unwrap();

        h.gate.manager().stop().await;
        assert_eq!(h.gate.state(), ServiceState::Ready);
        assert!(h.host.is_empty());
    }

    #[tokio::test]
    async fn test_refetch_always_notifies() {
        let h = GateHarness::builder().build();
        h.gate.init().await;

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _sub = h.gate.subscribe(move |change| lock(&sink).push(*change));

        assert_eq!(h.gate.refetch_entitlement().await, ServiceState::Ready);
        assert_eq!(
            *lock(&seen),
            vec![StateChange {
                state: ServiceState::Ready,
                previous: ServiceState::Ready
            }]
        );
        assert_eq!(h.guardian.user_info_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sign_out_resets_connection() {
        let h = GateHarness::builder().build();
        h.gate.init().await;
        h.gate.start(true).await.unwrap();

        h.signals.set_signed_in(false);
        for _ in 0..20 {
            if h.gate.state() == ServiceState::Unauthenticated {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert_eq!(h.gate.state(), ServiceState::Unauthenticated);
        assert_eq!(h.gate.manager().state(), ConnectionState::NotReady);
        assert!(h.gate.entitlement().is_none());
        assert!(h.host.is_empty());
    }

    #[tokio::test]
    async fn test_uninit() {
        let h = GateHarness::builder().build();
        h.gate.init().await;
        h.gate.start(false).await.unwrap();

        h.gate.uninit().await;
        assert_eq!(h.gate.state(), ServiceState::Uninitialized);
        assert!(h.host.is_empty());

        h.signals.set_signed_in(false);
        tokio::task::yield_now().await;
        assert_eq!(h.gate.state(), ServiceState::Uninitialized);
    }

    #[tokio::test]
    async fn test_set_enabled() {
        let h = GateHarness::builder().enabled(false).build();
        h.gate.init().await;

        h.gate.set_enabled(true).await;
        assert_eq!(h.gate.state(), ServiceState::Ready);

        h.gate.set_enabled(false).await;
        assert_eq!(h.gate.state(), ServiceState::Uninitialized);
    }

    #[tokio::test]
    async fn test_set_enabled_checks_once() {
        let h = GateHarness::builder().enabled(false).build();
        h.guardian.set_user_info_status(404);

        h.gate.set_enabled(true).await;
        assert_eq!(h.gate.state(), ServiceState::Ready);
        assert_eq!(h.guardian.linked_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.guardian.user_info_calls.load(Ordering::SeqCst), 1);
    }
}
