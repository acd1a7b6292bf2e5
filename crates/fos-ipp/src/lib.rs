//! fOS IPP - IP Protection Proxy Orchestration
//!
//! Decides per request whether traffic goes through a privacy proxy, keeps
//! the credentials and server selection for that proxy fresh, and recovers
//! when the proxy, its credentials or the network fail. The tunnel itself
//! is the platform's job; this crate hands it proxy descriptors.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        IpProtection                           │
//! │                                                               │
//! │  ┌─────────────┐    ┌───────────────────┐    ┌─────────────┐  │
//! │  │ AccountGate │───▶│ ConnectionManager │───▶│RequestRouter│──┼──▶ FilterHost
//! │  │ (state)     │    │ (pass, server)    │    │ (per request)│  │   (network stack)
//! │  └──────┬──────┘    └─────────┬─────────┘    └──────┬──────┘  │
//! │         │                     │  ▲ 401              │         │
//! │         ▼                     ▼  │                  ▼         │
//! │   GuardianBackend       ServerDirectory   ProxyErrorMonitor   │
//! │                                           UsageObserver       │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **Single-flight**: one activation, one pass rotation, one enrollment
//!   at a time; concurrent callers share the result
//! - **Queued decisions**: requests seen before the proxy is ready wait and
//!   replay in arrival order
//! - **Fallback chains**: MASQUE first, CONNECT as fallback, 10 s failover
//! - **Credential rotation**: a 401 for the live isolation key swaps the
//!   pass without reconnecting
//! - **Auto-start / auto-restore**: connect when the service becomes ready,
//!   or once at startup when the user left the proxy on
//! - **Startup cache**: last state and location list survive restarts

mod account;
mod autostart;
mod cache;
mod client;
mod config;
mod context;
mod descriptor;
mod error;
mod events;
mod guardian;
mod manager;
mod observers;
mod pass;
mod router;
mod serverlist;
mod single_flight;
mod startup;

#[cfg(test)]
mod testing;

pub use account::{AccountGate, AccountSignals, AccountStatus, ServiceState, SignInState};
pub use autostart::{AutoRestore, AutoStart};
pub use cache::EntitlementCache;
pub use client::{GuardianClient, HttpClient, HttpClientConfig, HttpError, TokenProvider};
pub use config::{
    ConfigError, ERROR_HISTORY_CAP, FAILOVER_TIMEOUT_SECS, ISOLATION_KEY_LEN, IppConfig,
    PASS_ROTATION_WINDOW, RouterMode,
};
pub use context::IpProtection;
pub use descriptor::{IsolationKey, ProxyDescriptor, ProxyKind};
pub use error::{ErrorHistory, ErrorKind, ErrorRecord, IppError};
pub use events::{EventBus, StateChange, Subscription};
pub use guardian::{
    EnrollResponse, GuardianBackend, GuardianError, ProxyPassResponse, UserInfoResponse,
};
pub use manager::{ConnectionManager, ConnectionState};
pub use observers::{ProxyErrorEvent, ProxyErrorLevel, ProxyErrorMonitor, UsageObserver};
pub use pass::{Entitlement, PassClaims, PassError, ProxyPass};
pub use router::{
    Decision, ExclusionSet, FilterChain, FilterHost, PendingRoute, ProxiedRequest,
    RequestFilter, RequestRouter, RouteRequest, RouterError, RouterStats, Routing,
};
pub use serverlist::{
    City, Country, FileSource, Location, Protocol, Server, ServerDirectory, ServerList,
    ServerListError, ServerListSource, StaticSource, parse_list,
};
pub use single_flight::{Flight, SingleFlight};
pub use startup::StartupCache;
