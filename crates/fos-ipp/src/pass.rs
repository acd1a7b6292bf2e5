//! Proxy Pass and Entitlement
//!
//! A [`ProxyPass`] is the bearer credential presented to the proxy. Its token
//! is a three-part JWT; only the claims needed for the validity window are
//! read, the signature is the proxy's business.
//!
//! Passes are immutable. Rotation replaces the whole pass.

use crate::config::PASS_ROTATION_WINDOW;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Proxy pass parsing errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum PassError {
    #[error("Invalid token format: {0}")]
    InvalidFormat(String),

    #[error("Token body does not match schema: {0}")]
    InvalidClaims(String),

    #[error("Missing or invalid token in response")]
    MissingToken,
}

/// Claims the pass must carry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PassClaims {
    pub sub: String,
    pub aud: String,
    pub iat: i64,
    /// Not before (seconds since epoch)
    pub nbf: i64,
    /// Expiration (seconds since epoch)
    pub exp: i64,
    pub iss: String,
}

#[derive(Deserialize)]
struct PassResponse {
    token: Option<String>,
}

/// Bearer credential with a validity window
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyPass {
    token: String,
    claims: PassClaims,
}

impl ProxyPass {
    /// Parse a JWT into a pass
    pub fn parse(token: &str) -> Result<Self, PassError> {
        let parts: Vec<&str> = token.split('.').collect();
        if parts.len() != 3 {
            return Err(PassError::InvalidFormat(format!(
                "expected 3 segments, got {}",
                parts.len()
            )));
        }

        let body = URL_SAFE_NO_PAD
            .decode(parts[1].trim_end_matches('='))
            .map_err(|e| PassError::InvalidFormat(e.to_string()))?;
        let claims: PassClaims = serde_json::from_slice(&body)
            .map_err(|e| PassError::InvalidClaims(e.to_string()))?;

        Ok(Self {
            token: token.to_string(),
            claims,
        })
    }

    /// Parse the `{"token": "..."}` body returned by the token endpoint
    pub fn from_response_body(body: &[u8]) -> Result<Self, PassError> {
        let response: PassResponse =
            serde_json::from_slice(body).map_err(|_| PassError::MissingToken)?;
        match response.token {
            Some(token) if !token.is_empty() => Self::parse(&token),
            _ => Err(PassError::MissingToken),
        }
    }

    /// Raw token
    pub fn token(&self) -> &str {
        &self.token
    }

    pub fn claims(&self) -> &PassClaims {
        &self.claims
    }

    /// Value for an `Authorization` header
    pub fn as_bearer_token(&self) -> String {
        format!("Bearer {}", self.token)
    }

    pub fn valid_from(&self) -> SystemTime {
        epoch_seconds(self.claims.nbf)
    }

    pub fn valid_until(&self) -> SystemTime {
        epoch_seconds(self.claims.exp)
    }

    /// Point in time after which the pass should be replaced
    pub fn rotation_time_point(&self) -> SystemTime {
        self.valid_until()
            .checked_sub(PASS_ROTATION_WINDOW)
            .unwrap_or(UNIX_EPOCH)
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }

    /// `nbf <= now < exp`
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        now >= self.valid_from() && now < self.valid_until()
    }

    pub fn should_rotate(&self) -> bool {
        self.should_rotate_at(SystemTime::now())
    }

    /// True once the pass is invalid or within the rotation window
    pub fn should_rotate_at(&self, now: SystemTime) -> bool {
        !self.is_valid_at(now) || now >= self.rotation_time_point()
    }
}

impl std::fmt::Debug for ProxyPass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log the token itself.
        f.debug_struct("ProxyPass")
            .field("sub", &self.claims.sub)
            .field("nbf", &self.claims.nbf)
            .field("exp", &self.claims.exp)
            .finish()
    }
}

fn epoch_seconds(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH
    }
}

/// The user's entitlement to the proxy service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlement {
    /// May use the autostart feature
    pub autostart: bool,
    /// When the entitlement was added (`YYYY-MM-DDTHH:MM:SS.mmmZ`)
    pub created_at: String,
    pub limited_bandwidth: bool,
    pub location_controls: bool,
    /// Has a paid VPN subscription
    pub subscribed: bool,
    pub uid: i64,
    pub website_inclusion: bool,
}

impl Entitlement {
    /// Parse and validate the status endpoint body
    pub fn from_json(body: &[u8]) -> Result<Self, PassError> {
        let entitlement: Entitlement = serde_json::from_slice(body)
            .map_err(|e| PassError::InvalidClaims(e.to_string()))?;
        if !is_iso_timestamp(&entitlement.created_at) {
            return Err(PassError::InvalidClaims(format!(
                "created_at is not a valid date: {}",
                entitlement.created_at
            )));
        }
        Ok(entitlement)
    }

    pub fn has_upgraded(&self) -> bool {
        self.subscribed
    }

    /// Alpha cohort: none of the optional features are unlocked
    pub fn is_alpha(&self) -> bool {
        !self.autostart && !self.website_inclusion && !self.location_controls
    }
}

/// Matches `YYYY-MM-DDTHH:MM:SS.mmmZ`
fn is_iso_timestamp(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.len() != 24 {
        return false;
    }
    const LAYOUT: &[u8; 24] = b"dddd-dd-ddTdd:dd:dd.dddZ";
    bytes.iter().zip(LAYOUT.iter()).all(|(b, l)| match l {
        b'd' => b.is_ascii_digit(),
        _ => b == l,
    })
}
