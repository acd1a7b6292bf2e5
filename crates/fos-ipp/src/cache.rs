//! Entitlement cache
//!
//! Keeps the last known entitlement so the account gate can reach READY
//! without a remote round-trip. Optionally persisted as a JSON file so the
//! answer survives restarts.

use crate::events::lock;
use crate::pass::Entitlement;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, warn};

pub struct EntitlementCache {
    path: Option<PathBuf>,
    current: Mutex<Option<Entitlement>>,
}

impl EntitlementCache {
    /// Cache that lives only as long as the process
    pub fn in_memory() -> Self {
        Self {
            path: None,
            current: Mutex::new(None),
        }
    }

    /// Cache backed by `path`, seeded from it if it holds a valid entry
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let current = load(&path);
        if current.is_some() {
            debug!("Loaded cached entitlement from {}", path.display());
        }

        Self {
            path: Some(path),
            current: Mutex::new(current),
        }
    }

    pub fn get(&self) -> Option<Entitlement> {
        lock(&self.current).clone()
    }

    pub fn has_upgraded(&self) -> bool {
        lock(&self.current).as_ref().is_some_and(Entitlement::has_upgraded)
    }

    pub fn store(&self, entitlement: Entitlement) {
        if let Some(path) = &self.path {
            match serde_json::to_vec_pretty(&entitlement) {
                Ok(bytes) => {
                    if let Err(e) = std::fs::write(path, bytes) {
                        warn!("Failed to persist entitlement to {}: {}", path.display(), e);
                    }
                }
                Err(e) => warn!("Failed to serialize entitlement: {}", e),
            }
        }
        *lock(&self.current) = Some(entitlement);
    }

    pub fn clear(&self) {
        if let Some(path) = &self.path {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(path) {
                    warn!("Failed to remove entitlement cache {}: {}", path.display(), e);
                }
            }
        }
        *lock(&self.current) = None;
    }
}

impl Default for EntitlementCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

fn load(path: &Path) -> Option<Entitlement> {
    let bytes = std::fs::read(path).ok()?;
    match Entitlement::from_json(&bytes) {
        Ok(entitlement) => Some(entitlement),
        Err(e) => {
            warn!("Ignoring invalid entitlement cache {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::entitlement_json;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("fos-ipp-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_in_memory() {
        let cache = EntitlementCache::in_memory();
        assert!(cache.get().is_none());

        cache.store(Entitlement::from_json(entitlement_json(true).as_bytes()).unwrap());
        assert!(cache.has_upgraded());

        cache.clear();
        assert!(cache.get().is_none());
        assert!(!cache.has_upgraded());
    }

    #[test]
    fn test_file_survives_reload() {
        let path = temp_path("reload");
        let entitlement = Entitlement::from_json(entitlement_json(false).as_bytes()).unwrap();

        EntitlementCache::with_file(&path).store(entitlement.clone());
        assert_eq!(EntitlementCache::with_file(&path).get(), Some(entitlement));

        EntitlementCache::with_file(&path).clear();
        assert!(!path.exists());
        assert!(EntitlementCache::with_file(&path).get().is_none());
    }

    #[test]
    fn test_corrupt_file_ignored() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"{\"uid\": \"nope\"}").unwrap();

        assert!(EntitlementCache::with_file(&path).get().is_none());
        std::fs::remove_file(&path).unwrap();
    }
}
