//! Proxy Descriptor Construction
//!
//! A descriptor tells the network layer how to reach the tunnel for one
//! connection. It is a chain: the first protocol a server advertises is the
//! primary entry and every following protocol becomes the fallback of the
//! one before it.
//!
//! ```text
//! Masque(ny1:443) ──fallback──▶ Connect(ny1:8443) ──fallback──▶ None
//!      └──────────── shared isolation key, 10 s failover ───────┘
//! ```
//!
//! Construction is pure. A descriptor is never modified after it is built;
//! token rotation or a server change produces a new one.

use crate::config::{FAILOVER_TIMEOUT_SECS, ISOLATION_KEY_LEN};
use crate::serverlist::{Protocol, Server};
use rand::Rng;
use std::fmt;

const KEY_ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Opaque per-connection token correlating proxy errors and usage to the
/// connection that produced them
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IsolationKey(String);

impl IsolationKey {
    /// Random 16 character key
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let key: String = (0..ISOLATION_KEY_LEN)
            .map(|_| KEY_ALPHABET[rng.gen_range(0..KEY_ALPHABET.len())] as char)
            .collect();
        Self(key)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IsolationKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for IsolationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Transport used by one descriptor entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyKind {
    Masque { template: String },
    Connect { scheme: String },
}

impl ProxyKind {
    pub fn name(&self) -> &'static str {
        match self {
            ProxyKind::Masque { .. } => "masque",
            ProxyKind::Connect { .. } => "connect",
        }
    }
}

/// One entry of the fallback chain, with the rest of the chain behind it
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyDescriptor {
    pub kind: ProxyKind,
    pub host: String,
    pub port: u16,
    pub token: String,
    pub isolation_key: IsolationKey,
    pub failover_timeout_secs: u32,
    pub fallback: Option<Box<ProxyDescriptor>>,
}

impl ProxyDescriptor {
    /// Build the descriptor for one protocol
    pub fn from_protocol(
        token: &str,
        isolation_key: &IsolationKey,
        protocol: &Protocol,
        fallback: Option<ProxyDescriptor>,
    ) -> Self {
        let kind = match protocol {
            Protocol::Masque { template_string, .. } => ProxyKind::Masque {
                template: template_string.clone(),
            },
            Protocol::Connect { scheme, .. } => ProxyKind::Connect {
                scheme: scheme.clone(),
            },
        };

        Self {
            kind,
            host: protocol.host().to_string(),
            port: protocol.port(),
            token: token.to_string(),
            isolation_key: isolation_key.clone(),
            failover_timeout_secs: FAILOVER_TIMEOUT_SECS,
            fallback: fallback.map(Box::new),
        }
    }

    /// Build the whole chain for a server.
    ///
    /// Returns `None` only for a server without protocols.
    pub fn from_server(token: &str, server: &Server, isolation_key: &IsolationKey) -> Option<Self> {
        server
            .protocols
            .iter()
            .rev()
            .fold(None, |fallback, protocol| {
                Some(Self::from_protocol(token, isolation_key, protocol, fallback))
            })
    }

    /// Entries, primary first
    pub fn chain(&self) -> Chain<'_> {
        Chain { next: Some(self) }
    }

    /// Number of entries in the chain (at least one)
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.chain().count()
    }
}

impl fmt::Debug for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The token is a credential: keep it out of logs.
        f.debug_struct("ProxyDescriptor")
            .field("kind", &self.kind)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("isolation_key", &self.isolation_key)
            .field("failover_timeout_secs", &self.failover_timeout_secs)
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl fmt::Display for ProxyDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hops: Vec<String> = self
            .chain()
            .map(|d| format!("{}://{}:{}", d.kind.name(), d.host, d.port))
            .collect();
        write!(f, "{} [{}]", hops.join(" -> "), self.isolation_key)
    }
}

/// Iterator over a descriptor chain
pub struct Chain<'a> {
    next: Option<&'a ProxyDescriptor>,
}

impl<'a> Iterator for Chain<'a> {
    type Item = &'a ProxyDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        let current = self.next?;
        self.next = current.fallback.as_deref();
        Some(current)
    }
}
