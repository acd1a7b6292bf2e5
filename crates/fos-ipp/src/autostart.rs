//! Automatic connection
//!
//! Both helpers watch the account gate and call `start(false)` on its
//! behalf:
//!
//! - [`AutoStart`] connects whenever the service becomes `Ready` after
//!   having been unavailable. A `Ready` that follows `Active` is the user
//!   switching off and is left alone.
//! - [`AutoRestore`] reconnects once at startup when the user left the
//!   proxy on, and gives up as soon as the account cannot connect.
//!
//! Neither runs without a location list; there would be nothing to
//! connect to.

use crate::account::{AccountGate, ServiceState};
use crate::events::{Subscription, lock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

pub struct AutoStart {
    gate: Weak<AccountGate>,
    armed: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription>>,
}

impl AutoStart {
    pub fn new(gate: &Arc<AccountGate>) -> Self {
        Self {
            gate: Arc::downgrade(gate),
            armed: Arc::new(AtomicBool::new(false)),
            subscription: Mutex::new(None),
        }
    }

    /// Start watching. Returns whether auto-start is in effect.
    pub fn init(&self, enabled: bool, has_list: bool) -> bool {
        if !enabled || !has_list {
            debug!("Auto-start off (enabled: {}, server list: {})", enabled, has_list);
            return false;
        }
        let Some(gate) = self.gate.upgrade() else {
            return false;
        };

        let mut subscription = lock(&self.subscription);
        if subscription.is_some() {
            return true;
        }

        self.armed.store(true, Ordering::SeqCst);
        let armed = self.armed.clone();
        let weak = self.gate.clone();
        *subscription = Some(gate.subscribe(move |change| match change.state {
            ServiceState::Uninitialized
            | ServiceState::Unavailable
            | ServiceState::Unauthenticated => armed.store(true, Ordering::SeqCst),
            ServiceState::Ready => {
                if armed.swap(false, Ordering::SeqCst) {
                    spawn_start(&weak, "Auto-start");
                }
            }
            _ => {}
        }));
        info!("Auto-start enabled");
        true
    }

    pub fn uninit(&self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.unsubscribe();
        }
        self.armed.store(false, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        lock(&self.subscription).is_some()
    }
}

pub struct AutoRestore {
    gate: Weak<AccountGate>,
    pending: Arc<AtomicBool>,
    subscription: Mutex<Option<Subscription>>,
}

impl AutoRestore {
    pub fn new(gate: &Arc<AccountGate>) -> Self {
        Self {
            gate: Arc::downgrade(gate),
            pending: Arc::new(AtomicBool::new(false)),
            subscription: Mutex::new(None),
        }
    }

    /// Arm the restore. Returns whether a restore is pending.
    ///
    /// Skipped when auto-start already covers it or the user's last action
    /// switched the proxy off.
    pub fn init(&self, enabled: bool, autostart: bool, user_enabled: bool, has_list: bool) -> bool {
        if !enabled || autostart || !user_enabled || !has_list {
            return false;
        }
        let Some(gate) = self.gate.upgrade() else {
            return false;
        };

        let mut subscription = lock(&self.subscription);
        if subscription.is_some() {
            return self.will_restore();
        }

        self.pending.store(true, Ordering::SeqCst);
        let pending = self.pending.clone();
        let weak = self.gate.clone();
        *subscription = Some(gate.subscribe(move |change| match change.state {
            ServiceState::Ready => {
                if pending.swap(false, Ordering::SeqCst) {
                    spawn_start(&weak, "Auto-restore");
                }
            }
            ServiceState::Unavailable | ServiceState::Unauthenticated => {
                if pending.swap(false, Ordering::SeqCst) {
                    debug!("Auto-restore abandoned ({})", change.state);
                }
            }
            _ => {}
        }));
        info!("Restoring the proxy once the service is ready");
        true
    }

    pub fn uninit(&self) {
        if let Some(subscription) = lock(&self.subscription).take() {
            subscription.unsubscribe();
        }
        self.pending.store(false, Ordering::SeqCst);
    }

    pub fn will_restore(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }
}

fn spawn_start(gate: &Weak<AccountGate>, reason: &'static str) {
    let Some(gate) = gate.upgrade() else {
        return;
    };
    match tokio::runtime::Handle::try_current() {
        Ok(runtime) => {
            runtime.spawn(async move {
                match gate.start(false).await {
                    Ok(state) => info!("{}: {}", reason, state),
                    Err(e) => warn!("{} failed: {}", reason, e),
                }
            });
        }
        Err(_) => warn!("{} requested outside of a runtime", reason),
    }
}
