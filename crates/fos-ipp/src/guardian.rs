//! Enrollment / entitlement backend contract.
//!
//! The orchestration core never talks HTTP itself. It sees the backend
//! through [`GuardianBackend`]; [`crate::client::GuardianClient`] is the
//! production implementation.

use crate::error::IppError;
use crate::pass::{Entitlement, ProxyPass};
use async_trait::async_trait;

/// Why a backend call did not produce a usable answer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GuardianError {
    /// No account token available
    #[error("login_needed")]
    LoginNeeded,

    #[error("invalid_response")]
    InvalidResponse,

    #[error("parse_error")]
    Parse,

    /// Transport failure (offline, DNS, TLS, timeout)
    #[error("network: {0}")]
    Network(String),

    #[error("{0}")]
    Other(String),
}

impl From<GuardianError> for IppError {
    fn from(error: GuardianError) -> Self {
        match error {
            GuardianError::Network(msg) => IppError::Network(msg),
            other => IppError::Generic(other.to_string()),
        }
    }
}

/// Result of a proxy pass request
#[derive(Debug, Clone, Default)]
pub struct ProxyPassResponse {
    pub status: Option<u16>,
    pub error: Option<GuardianError>,
    pub pass: Option<ProxyPass>,
}

impl ProxyPassResponse {
    /// The pass, if the request fully succeeded
    pub fn into_pass(self) -> Result<ProxyPass, IppError> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        match (self.status, self.pass) {
            (Some(200), Some(pass)) => Ok(pass),
            (status, _) => Err(IppError::Generic(format!("Status: {:?}", status))),
        }
    }
}

/// Result of an enrollment attempt
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnrollResponse {
    pub ok: bool,
    pub error: Option<String>,
}

impl EnrollResponse {
    pub fn success() -> Self {
        Self { ok: true, error: None }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: Some(error.into()),
        }
    }
}

/// Result of an entitlement lookup
#[derive(Debug, Clone, Default)]
pub struct UserInfoResponse {
    pub status: Option<u16>,
    pub entitlement: Option<Entitlement>,
    pub error: Option<GuardianError>,
}

impl UserInfoResponse {
    /// The entitlement, if the request fully succeeded
    pub fn into_entitlement(self) -> Result<Entitlement, IppError> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        match (self.status, self.entitlement) {
            (Some(200), Some(entitlement)) => Ok(entitlement),
            (status, _) => Err(IppError::Generic(format!("Status: {:?}", status))),
        }
    }
}

/// The remote enrollment / entitlement service
#[async_trait]
pub trait GuardianBackend: Send + Sync {
    /// Fetch a fresh proxy pass
    async fn fetch_proxy_pass(&self) -> ProxyPassResponse;

    /// Enroll the signed-in account
    async fn enroll(&self) -> EnrollResponse;

    /// Fetch the account's entitlement
    async fn fetch_user_info(&self) -> UserInfoResponse;

    /// Whether the account is linked to the service at all.
    ///
    /// Linked does not mean enrolled; callers follow up with
    /// [`GuardianBackend::fetch_user_info`].
    async fn is_linked_to_guardian(&self, only_cached: bool) -> bool;
}
