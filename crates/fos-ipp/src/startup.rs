//! Startup cache
//!
//! Persists what the next start needs before any remote check answers: the
//! last service state, the location list and whether the user left the
//! proxy switched on. The cached state is only served until startup
//! completes; after that the live state is authoritative.

use crate::account::ServiceState;
use crate::events::lock;
use crate::serverlist::Country;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    state: Option<ServiceState>,
    #[serde(default)]
    locations: Vec<Country>,
    #[serde(default)]
    user_enabled: bool,
}

pub struct StartupCache {
    path: Option<PathBuf>,
    snapshot: Mutex<Snapshot>,
    /// State left by the previous run
    previous_state: Option<ServiceState>,
    startup_completed: AtomicBool,
}

impl StartupCache {
    pub fn in_memory() -> Self {
        Self::from_snapshot(None, Snapshot::default())
    }

    /// Cache backed by `path`, seeded from it when it holds a valid snapshot
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let snapshot = load(&path).unwrap_or_default();
        Self::from_snapshot(Some(path), snapshot)
    }

    fn from_snapshot(path: Option<PathBuf>, snapshot: Snapshot) -> Self {
        Self {
            path,
            previous_state: snapshot.state,
            snapshot: Mutex::new(snapshot),
            startup_completed: AtomicBool::new(false),
        }
    }

    /// The state the previous run ended in, until startup completes
    pub fn state(&self) -> Option<ServiceState> {
        if self.is_startup_completed() {
            return None;
        }
        self.previous_state
    }

    /// Remember a state for the next run. A connection never survives a
    /// restart, so `Active` is kept as `Ready`; transient states are skipped.
    pub fn store_state(&self, state: ServiceState) {
        let state = match state {
            ServiceState::Uninitialized | ServiceState::Error => return,
            ServiceState::Active => ServiceState::Ready,
            other => other,
        };
        self.update(|snapshot| snapshot.state = Some(state));
    }

    pub fn locations(&self) -> Vec<Country> {
        lock(&self.snapshot).locations.clone()
    }

    pub fn store_locations(&self, locations: Vec<Country>) {
        self.update(|snapshot| snapshot.locations = locations);
    }

    /// Whether the user's last explicit action switched the proxy on
    pub fn user_enabled(&self) -> bool {
        lock(&self.snapshot).user_enabled
    }

    pub fn set_user_enabled(&self, enabled: bool) {
        self.update(|snapshot| snapshot.user_enabled = enabled);
    }

    pub fn complete_startup(&self) {
        if !self.startup_completed.swap(true, Ordering::SeqCst) {
            debug!("Startup completed, cached state dropped");
        }
    }

    pub fn is_startup_completed(&self) -> bool {
        self.startup_completed.load(Ordering::SeqCst)
    }

    fn update(&self, apply: impl FnOnce(&mut Snapshot)) {
        let snapshot = {
            let mut snapshot = lock(&self.snapshot);
            let before = snapshot.clone();
            apply(&mut snapshot);
            if *snapshot == before {
                return;
            }
            snapshot.clone()
        };

        let Some(path) = &self.path else {
            return;
        };
        match serde_json::to_vec_pretty(&snapshot) {
            Ok(bytes) => {
                if let Err(e) = std::fs::write(path, bytes) {
                    warn!("Failed to persist startup cache to {}: {}", path.display(), e);
                }
            }
            Err(e) => warn!("Failed to serialize startup cache: {}", e),
        }
    }
}

impl Default for StartupCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn load(path: &Path) -> Option<Snapshot> {
    let bytes = std::fs::read(path).ok()?;
    match serde_json::from_slice(&bytes) {
        Ok(snapshot) => {
            debug!("Loaded startup cache from {}", path.display());
            Some(snapshot)
        }
        Err(e) => {
            warn!("Ignoring invalid startup cache {}: {}", path.display(), e);
            None
        }
    }
}
