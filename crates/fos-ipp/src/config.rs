//! IP Protection Configuration
//!
//! Configuration consumed (never owned) by the proxy orchestration core.
//! Loaded from TOML or JSON, the same way region profiles are loaded for the
//! VPN crate.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

/// Seconds the network layer waits on one proxy before failing over to the
/// next entry of the descriptor chain.
pub const FAILOVER_TIMEOUT_SECS: u32 = 10;

/// Maximum number of error records kept per component.
pub const ERROR_HISTORY_CAP: usize = 50;

/// Length of a connection isolation key.
pub const ISOLATION_KEY_LEN: usize = 16;

/// A pass should be rotated this long before it expires.
pub const PASS_ROTATION_WINDOW: Duration = Duration::from_secs(10 * 60);

/// Which requests are routed through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouterMode {
    /// Every http(s) request
    #[default]
    Full,
    /// Only requests from private browsing contexts
    PrivateBrowsingOnly,
    /// Only requests triggered by classified third-party trackers
    TrackerOnly,
}

impl std::fmt::Display for RouterMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterMode::Full => write!(f, "full"),
            RouterMode::PrivateBrowsingOnly => write!(f, "private-browsing-only"),
            RouterMode::TrackerOnly => write!(f, "tracker-only"),
        }
    }
}

impl std::str::FromStr for RouterMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "full" => Ok(RouterMode::Full),
            "private_browsing_only" | "pb" => Ok(RouterMode::PrivateBrowsingOnly),
            "tracker_only" | "tracker" => Ok(RouterMode::TrackerOnly),
            _ => Err(ConfigError::InvalidMode(s.to_string())),
        }
    }
}

/// Complete IP protection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IppConfig {
    /// Feature flag
    #[serde(default)]
    pub enabled: bool,
    /// Routing mode
    #[serde(default)]
    pub mode: RouterMode,
    /// Enrollment backend base URL
    #[serde(default = "default_guardian_endpoint")]
    pub guardian_endpoint: String,
    /// Account server origin (allowed during enrollment redirects)
    #[serde(default = "default_fxa_origin")]
    pub fxa_origin: String,
    /// Origins that always bypass the proxy
    #[serde(default)]
    pub excluded_origins: Vec<String>,
    /// Origins that bypass the proxy until a descriptor exists
    #[serde(default)]
    pub essential_origins: Vec<String>,
    /// Where the last known entitlement is persisted
    #[serde(default)]
    pub entitlement_cache: Option<PathBuf>,
    /// Server list override file
    #[serde(default)]
    pub server_list: Option<PathBuf>,
    /// Where the last state, the location list and the user's on/off choice
    /// are kept between runs
    #[serde(default)]
    pub startup_cache: Option<PathBuf>,
    /// Connect whenever the service becomes ready
    #[serde(default)]
    pub autostart: bool,
    /// Reconnect at startup if the user left the proxy on
    #[serde(default)]
    pub auto_restore: bool,
    /// Verbose logging
    #[serde(default)]
    pub log: bool,
}

fn default_guardian_endpoint() -> String {
    "https://vpn.mozilla.com".to_string()
}

fn default_fxa_origin() -> String {
    "https://accounts.firefox.com".to_string()
}

impl Default for IppConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: RouterMode::Full,
            guardian_endpoint: default_guardian_endpoint(),
            fxa_origin: default_fxa_origin(),
            excluded_origins: Vec::new(),
            essential_origins: Vec::new(),
            entitlement_cache: None,
            server_list: None,
            startup_cache: None,
            autostart: false,
            auto_restore: false,
            log: false,
        }
    }
}

impl IppConfig {
    /// Load from a TOML or JSON file, picked by extension
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        match path.extension().and_then(|e| e.to_str()).unwrap_or("") {
            "toml" => Self::from_toml(&content),
            "json" => Self::from_json(&content),
            other => Err(ConfigError::UnsupportedFormat(other.to_string())),
        }
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Endpoints the proxy must never carry: the enrollment backend and the
    /// account server, followed by the configured exclusions.
    pub fn default_exclusions(&self) -> Vec<String> {
        let mut urls = vec![self.guardian_endpoint.clone(), self.fxa_origin.clone()];
        urls.extend(self.excluded_origins.iter().cloned());
        urls
    }

    /// Guardian endpoint as a parsed URL
    pub fn guardian_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.guardian_endpoint)
            .map_err(|_| ConfigError::InvalidEndpoint(self.guardian_endpoint.clone()))
    }

    /// Account server origin as a parsed URL
    pub fn fxa_url(&self) -> Result<Url, ConfigError> {
        Url::parse(&self.fxa_origin)
            .map_err(|_| ConfigError::InvalidEndpoint(self.fxa_origin.clone()))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.guardian_url()?;
        self.fxa_url()?;
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid routing mode: {0}")]
    InvalidMode(String),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),
}
