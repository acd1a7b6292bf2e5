//! Error taxonomy and bounded error history.

use crate::config::ERROR_HISTORY_CAP;
use std::collections::VecDeque;
use std::time::SystemTime;

/// Coarse error classes surfaced to callers and telemetry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Opaque failure in enrollment, entitlement, server selection or activation
    Generic,
    /// Transport or offline failure
    Network,
    /// The proxy rejected the active credential (HTTP 401)
    AuthRejected,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::Generic => write!(f, "generic"),
            ErrorKind::Network => write!(f, "network"),
            ErrorKind::AuthRejected => write!(f, "auth-rejected"),
        }
    }
}

/// Errors produced by the orchestration core.
///
/// `Clone` because single-flight operations hand the same result to every
/// caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IppError {
    #[error("{0}")]
    Generic(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Proxy rejected credential for isolation key {0}")]
    AuthRejected(String),

    #[error("Service not ready (state: {0})")]
    NotReady(String),

    #[error("No server found")]
    NoServer,

    #[error("Operation cancelled")]
    Cancelled,
}

impl IppError {
    /// Build a generic error from anything displayable
    pub fn generic(msg: impl std::fmt::Display) -> Self {
        IppError::Generic(msg.to_string())
    }

    /// Map onto the coarse taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            IppError::Network(_) => ErrorKind::Network,
            IppError::AuthRejected(_) => ErrorKind::AuthRejected,
            IppError::Generic(_)
            | IppError::NotReady(_)
            | IppError::NoServer
            | IppError::Cancelled => ErrorKind::Generic,
        }
    }
}

/// One entry of an error history
#[derive(Debug, Clone)]
pub struct ErrorRecord {
    pub kind: ErrorKind,
    pub context: String,
    pub at: SystemTime,
}

/// FIFO of the most recent errors, oldest evicted first
#[derive(Debug, Clone)]
pub struct ErrorHistory {
    records: VecDeque<ErrorRecord>,
    cap: usize,
}

impl ErrorHistory {
    /// Create a history with the standard cap
    pub fn new() -> Self {
        Self::with_capacity(ERROR_HISTORY_CAP)
    }

    /// Create a history holding at most `cap` records
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(cap),
            cap: cap.max(1),
        }
    }

    /// Append a record, evicting the oldest on overflow
    pub fn push(&mut self, kind: ErrorKind, context: impl Into<String>) {
        if self.records.len() == self.cap {
            self.records.pop_front();
        }
        self.records.push_back(ErrorRecord {
            kind,
            context: context.into(),
            at: SystemTime::now(),
        });
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    /// Most recent record
    pub fn last(&self) -> Option<&ErrorRecord> {
        self.records.back()
    }

    /// Records, oldest first
    pub fn iter(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.records.iter()
    }
}

impl Default for ErrorHistory {
    fn default() -> Self {
        Self::new()
    }
}
