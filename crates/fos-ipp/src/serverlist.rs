//! Proxy Server Directory
//!
//! Countries contain cities, cities contain servers, servers advertise the
//! protocols they speak. The directory only answers two questions for the
//! connection manager: where do we connect by default, and which concrete
//! server in that city.
//!
//! # Server list format
//!
//! ```json
//! [{"name": "United States", "code": "US", "cities": [
//!   {"name": "New York", "code": "NYC", "servers": [
//!     {"hostname": "ny1.example", "port": 443, "protocols": [
//!       {"name": "masque", "host": "ny1.example", "port": 443,
//!        "templateString": "/.well-known/masque/udp/{target_host}/{target_port}/"},
//!       {"name": "connect", "host": "ny1.example", "port": 8443}
//!     ]}
//!   ]}
//! ]}]
//! ```

use crate::single_flight::SingleFlight;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Country code used for the default location
const DEFAULT_COUNTRY: &str = "US";

/// A protocol a server can be reached with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Protocol {
    /// MASQUE (HTTP/3 CONNECT-UDP)
    Masque {
        #[serde(default)]
        host: String,
        #[serde(default)]
        port: u16,
        #[serde(default, rename = "templateString")]
        template_string: String,
    },
    /// HTTP CONNECT
    Connect {
        #[serde(default)]
        host: String,
        #[serde(default)]
        port: u16,
        #[serde(default = "default_scheme")]
        scheme: String,
    },
}

fn default_scheme() -> String {
    "https".to_string()
}

fn default_port() -> u16 {
    443
}

impl Protocol {
    pub fn host(&self) -> &str {
        match self {
            Protocol::Masque { host, .. } | Protocol::Connect { host, .. } => host,
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Protocol::Masque { port, .. } | Protocol::Connect { port, .. } => *port,
        }
    }
}

#[derive(Deserialize)]
struct ServerData {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    hostname: String,
    #[serde(default)]
    quarantined: bool,
    #[serde(default)]
    protocols: Vec<Protocol>,
}

/// A proxy server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "ServerData")]
pub struct Server {
    pub port: u16,
    pub hostname: String,
    /// Quarantined servers must not be used
    pub quarantined: bool,
    /// Supported protocols, most preferred first. Never empty.
    pub protocols: Vec<Protocol>,
}

impl Server {
    /// Create a server that only speaks CONNECT on its own host and port
    pub fn connect(hostname: &str, port: u16) -> Self {
        Self::from(ServerData {
            port,
            hostname: hostname.to_string(),
            quarantined: false,
            protocols: Vec::new(),
        })
    }
}

impl From<ServerData> for Server {
    fn from(data: ServerData) -> Self {
        let protocols = if data.protocols.is_empty() {
            vec![Protocol::Connect {
                host: data.hostname.clone(),
                port: data.port,
                scheme: default_scheme(),
            }]
        } else {
            data.protocols
        };

        Self {
            port: data.port,
            hostname: data.hostname,
            quarantined: data.quarantined,
            protocols,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct City {
    #[serde(default)]
    pub name: String,
    /// Stable identifier (usually a Wikidata id)
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub servers: Vec<Server>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Country {
    #[serde(default)]
    pub name: String,
    /// ISO 3166-1 alpha-2
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub cities: Vec<City>,
}

/// A preferred place to connect from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub country: Country,
    pub city: City,
}

/// Server list errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ServerListError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}

/// Parse a server list document
pub fn parse_list(content: &str) -> Result<Vec<Country>, ServerListError> {
    serde_json::from_str(content).map_err(|e| ServerListError::Parse(e.to_string()))
}

/// The directory of proxy servers, as seen by the connection manager
#[async_trait]
pub trait ServerDirectory: Send + Sync {
    /// Refresh the list if it is empty, or always when `force` is set
    async fn maybe_fetch_list(&self, force: bool) -> Result<(), ServerListError>;

    /// Preferred location, if the list has one
    fn default_location(&self) -> Option<Location>;

    /// Pick a usable server in `city`
    fn select_server(&self, city: Option<&City>) -> Option<Server>;

    fn has_list(&self) -> bool;

    /// Snapshot of the whole list
    fn countries(&self) -> Vec<Country>;
}

/// Where a [`ServerList`] gets its data from
#[async_trait]
pub trait ServerListSource: Send + Sync + 'static {
    async fn fetch(&self) -> Result<Vec<Country>, ServerListError>;
}

/// A fixed, in-memory list
pub struct StaticSource(pub Vec<Country>);

#[async_trait]
impl ServerListSource for StaticSource {
    async fn fetch(&self) -> Result<Vec<Country>, ServerListError> {
        Ok(self.0.clone())
    }
}

/// A JSON file on disk (the override list)
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ServerListSource for FileSource {
    async fn fetch(&self) -> Result<Vec<Country>, ServerListError> {
        let content = std::fs::read_to_string(&self.path)
            .map_err(|e| ServerListError::Io(format!("{}: {}", self.path.display(), e)))?;
        parse_list(&content)
    }
}

/// Server list backed by a [`ServerListSource`]
pub struct ServerList<S: ServerListSource> {
    source: Arc<S>,
    list: Arc<RwLock<Vec<Country>>>,
    fetch: SingleFlight<Result<(), ServerListError>>,
}

impl<S: ServerListSource> ServerList<S> {
    pub fn new(source: S) -> Self {
        Self::with_initial(source, Vec::new())
    }

    /// Start from a previously cached list
    pub fn with_initial(source: S, initial: Vec<Country>) -> Self {
        Self {
            source: Arc::new(source),
            list: Arc::new(RwLock::new(initial)),
            fetch: SingleFlight::new(),
        }
    }

}

impl ServerList<StaticSource> {
    /// Build a ready-to-use list from a JSON document
    pub fn from_json(content: &str) -> Result<Self, ServerListError> {
        let countries = parse_list(content)?;
        Ok(Self::with_initial(StaticSource(countries.clone()), countries))
    }
}

#[async_trait]
impl<S: ServerListSource> ServerDirectory for ServerList<S> {
    async fn maybe_fetch_list(&self, force: bool) -> Result<(), ServerListError> {
        if !force && self.has_list() {
            return Ok(());
        }

        let source = self.source.clone();
        let list = self.list.clone();
        self.fetch
            .run(move || async move {
                let countries = source.fetch().await.map_err(|e| {
                    warn!("Server list fetch failed: {}", e);
                    e
                })?;
                info!("Server list updated ({} countries)", countries.len());
                *list.write().unwrap_or_else(|p| p.into_inner()) = countries;
                Ok(())
            })
            .await
    }

    fn default_location(&self) -> Option<Location> {
        let list = read(&self.list);
        let country = list.iter().find(|c| c.code == DEFAULT_COUNTRY)?;
        let city = country.cities.iter().find(|c| !c.servers.is_empty())?;

        Some(Location {
            country: country.clone(),
            city: city.clone(),
        })
    }

    fn select_server(&self, city: Option<&City>) -> Option<Server> {
        let city = city?;
        let servers: Vec<&Server> = city.servers.iter().filter(|s| !s.quarantined).collect();

        let server = match servers.len() {
            0 => None,
            1 => Some(servers[0]),
            _ => servers.choose(&mut rand::thread_rng()).copied(),
        };

        if let Some(server) = server {
            debug!("Selected server {} in {}", server.hostname, city.name);
        }
        server.cloned()
    }

    fn has_list(&self) -> bool {
        !read(&self.list).is_empty()
    }

    fn countries(&self) -> Vec<Country> {
        read(&self.list).clone()
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|p| p.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::server_list_json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_parse_protocols() {
        let list = parse_list(&server_list_json()).unwrap();
        let server = &list[0].cities[0].servers[0];

        assert_eq!(server.protocols.len(), 2);
        assert!(matches!(
            &server.protocols[0],
            Protocol::Masque { template_string, .. } if template_string.contains("masque")
        ));
        assert!(matches!(
            &server.protocols[1],
            Protocol::Connect { scheme, port: 8443, .. } if scheme == "https"
        ));
    }

    #[test]
    fn test_server_defaults_to_connect() {
        let list = parse_list(
            r#"[{"code":"US","cities":[{"name":"X","servers":[{"hostname":"h.example"}]}]}]"#,
        )
        .unwrap();
        let server = &list[0].cities[0].servers[0];

        assert_eq!(server.port, 443);
        assert_eq!(
            server.protocols,
            vec![Protocol::Connect {
                host: "h.example".into(),
                port: 443,
                scheme: "https".into()
            }]
        );
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let result = parse_list(
            r#"[{"code":"US","cities":[{"servers":[{"hostname":"h","protocols":[{"name":"wireguard"}]}]}]}]"#,
        );
        assert!(matches!(result, Err(ServerListError::Parse(_))));
    }

    #[test]
    fn test_default_location_prefers_us_city_with_servers() {
        let list = ServerList::from_json(&server_list_json()).unwrap();
        let location = list.default_location().unwrap();

        assert_eq!(location.country.code, "US");
        assert_eq!(location.city.code, "NYC");
    }

    #[test]
    fn test_no_default_location_without_us() {
        let list = ServerList::from_json(r#"[{"code":"DE","cities":[]}]"#).unwrap();
        assert!(list.default_location().is_none());
    }

    #[test]
    fn test_select_server_skips_quarantined() {
        let city = City {
            name: "Test".into(),
            code: "T".into(),
            servers: vec![
                Server {
                    quarantined: true,
                    ..Server::connect("bad.example", 443)
                },
                Server::connect("good.example", 443),
            ],
        };
        let list = ServerList::new(StaticSource(Vec::new()));

        for _ in 0..10 {
            assert_eq!(list.select_server(Some(&city)).unwrap().hostname, "good.example");
        }
        assert!(list.select_server(None).is_none());
    }

    #[test]
    fn test_select_server_all_quarantined() {
        let city = City {
            name: "Test".into(),
            code: "T".into(),
            servers: vec![Server {
                quarantined: true,
                ..Server::connect("bad.example", 443)
            }],
        };
        let list = ServerList::new(StaticSource(Vec::new()));
        assert!(list.select_server(Some(&city)).is_none());
    }

    struct CountingSource {
        calls: Arc<AtomicUsize>,
        countries: Vec<Country>,
    }

    #[async_trait]
    impl ServerListSource for CountingSource {
        async fn fetch(&self) -> Result<Vec<Country>, ServerListError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            Ok(self.countries.clone())
        }
    }

    #[tokio::test]
    async fn test_maybe_fetch_list_is_lazy_and_single_flight() {
        let calls = Arc::new(AtomicUsize::new(0));
        let list = ServerList::new(CountingSource {
            calls: calls.clone(),
            countries: parse_list(&server_list_json()).unwrap(),
        });
        assert!(!list.has_list());

        let (a, b) = tokio::join!(list.maybe_fetch_list(false), list.maybe_fetch_list(false));
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(list.has_list());

        list.maybe_fetch_list(false).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        list.maybe_fetch_list(true).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
