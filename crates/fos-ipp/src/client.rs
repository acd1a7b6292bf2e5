//! Guardian HTTP Client
//!
//! Talks to the enrollment / entitlement backend over hyper + rustls.
//! Every call borrows an account OAuth token from a [`TokenProvider`] and
//! hands it back when done.
//!
//! Endpoints (relative to the configured guardian endpoint):
//! - `GET /api/v1/fpn/token`  - proxy pass (`{"token": "<jwt>"}`)
//! - `GET /api/v1/fpn/status` - entitlement (200) or not a proxy user (404)
//! - `GET /api/v1/fpn/auth?experiment=<type>` - enrollment, which redirects
//!   to `/oauth/success?code=..` or `/api/v1/fpn/error?error=..`

use crate::config::{ConfigError, IppConfig};
use crate::guardian::{
    EnrollResponse, GuardianBackend, GuardianError, ProxyPassResponse, UserInfoResponse,
};
use crate::pass::{Entitlement, ProxyPass};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full, LengthLimitError, Limited};
use hyper::body::Bytes;
use hyper::header::{AUTHORIZATION, CONTENT_TYPE, HOST, HeaderMap, LOCATION, USER_AGENT};
use hyper::{Method, Request, StatusCode};
use rustls::ClientConfig;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};
use url::Url;

const TOKEN_PATH: &str = "/api/v1/fpn/token";
const STATUS_PATH: &str = "/api/v1/fpn/status";
const AUTH_PATH: &str = "/api/v1/fpn/auth";
const SUCCESS_PATH: &str = "/oauth/success";
const ENROLL_ERROR_PATH: &str = "/api/v1/fpn/error";

/// Enrollment gives up after this many redirects
const MAX_REDIRECTS: usize = 10;

/// OAuth client id of the proxy service, per guardian deployment
const CLIENT_ID_MAP: &[(&str, &str)] = &[
    ("http://localhost:3000", "6089c54fdc970aed"),
    ("https://guardian-dev.herokuapp.com", "64ef9b544a31bca8"),
    ("https://stage.guardian.nonprod.cloudops.mozgcp.net", "e6eb0d1e856335fc"),
    ("https://fpn.firefox.com", "e6eb0d1e856335fc"),
    ("https://vpn.mozilla.org", "e6eb0d1e856335fc"),
];

/// HTTP client errors
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Request timeout")]
    Timeout,

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Body read error: {0}")]
    BodyError(String),
}

impl From<HttpError> for GuardianError {
    fn from(error: HttpError) -> Self {
        match error {
            HttpError::ConnectionFailed(_) | HttpError::Timeout | HttpError::TlsError(_) => {
                GuardianError::Network(error.to_string())
            }
            other => GuardianError::Other(other.to_string()),
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Whole request timeout
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    pub user_agent: String,
    /// Maximum response body size
    pub max_body_size: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            user_agent: "fos-ipp/0.1".to_string(),
            max_body_size: 1024 * 1024,
        }
    }
}

/// HTTP response
#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// URL the response was received from
    pub url: Url,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Absolute redirect target, if this is a redirect
    pub fn redirect_target(&self) -> Option<Url> {
        if !self.status.is_redirection() {
            return None;
        }
        let location = self.headers.get(LOCATION)?.to_str().ok()?;
        self.url.join(location).ok()
    }
}

/// Minimal one-shot HTTP/1.1 client
pub struct HttpClient {
    config: HttpClientConfig,
    tls: TlsConnector,
    requests_made: AtomicU64,
    bytes_downloaded: AtomicU64,
}

impl HttpClient {
    pub fn new(config: HttpClientConfig) -> Self {
        let mut root_store = rustls::RootCertStore::empty();
        root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        let tls_config = ClientConfig::builder()
            .with_root_certificates(root_store)
            .with_no_client_auth();

        debug!("HTTP client initialized (timeout: {:?})", config.timeout);

        Self {
            config,
            tls: TlsConnector::from(Arc::new(tls_config)),
            requests_made: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(HttpClientConfig::default())
    }

    /// GET `url`, optionally with a bearer token. Redirects are not followed.
    pub async fn get(&self, url: &Url, bearer: Option<&str>) -> Result<Response, HttpError> {
        tokio::time::timeout(self.config.timeout, self.send(url, bearer))
            .await
            .map_err(|_| HttpError::Timeout)?
    }

    async fn send(&self, url: &Url, bearer: Option<&str>) -> Result<Response, HttpError> {
        let start = Instant::now();
        self.requests_made.fetch_add(1, Ordering::Relaxed);

        let host = url
            .host_str()
            .ok_or_else(|| HttpError::InvalidUrl("No host in URL".to_string()))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| HttpError::InvalidUrl(format!("No port for {}", url.scheme())))?;
        let host_header = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        let mut builder = Request::builder()
            .method(Method::GET)
            .uri(&url[url::Position::BeforePath..])
            .header(HOST, host_header)
            .header(USER_AGENT, &self.config.user_agent)
            .header(CONTENT_TYPE, "application/json");
        if let Some(token) = bearer {
            builder = builder.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = builder
            .body(Full::new(Bytes::new()))
            .map_err(|e| HttpError::HttpError(e.to_string()))?;

        let stream = tokio::time::timeout(
            self.config.connect_timeout,
            tokio::net::TcpStream::connect((host, port)),
        )
        .await
        .map_err(|_| HttpError::Timeout)?
        .map_err(|e| HttpError::ConnectionFailed(e.to_string()))?;

        let response = match url.scheme() {
            "https" => {
                let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
                    .map_err(|_| HttpError::TlsError("Invalid server name".to_string()))?;
                let tls_stream = self
                    .tls
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| HttpError::TlsError(e.to_string()))?;
                exchange(tls_stream, request).await?
            }
            "http" => exchange(stream, request).await?,
            other => return Err(HttpError::InvalidUrl(format!("Unsupported scheme {}", other))),
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = read_body(response.into_body(), self.config.max_body_size).await?;
        self.bytes_downloaded
            .fetch_add(body.len() as u64, Ordering::Relaxed);

        debug!(
            "HTTP GET {} -> {} ({} bytes, {:?})",
            url.path(),
            status,
            body.len(),
            start.elapsed()
        );

        Ok(Response {
            status,
            headers,
            body: body.to_vec(),
            url: url.clone(),
        })
    }

    /// (requests made, bytes downloaded)
    pub fn stats(&self) -> (u64, u64) {
        (
            self.requests_made.load(Ordering::Relaxed),
            self.bytes_downloaded.load(Ordering::Relaxed),
        )
    }
}

async fn exchange<IO>(
    io: IO,
    request: Request<Full<Bytes>>,
) -> Result<hyper::Response<hyper::body::Incoming>, HttpError>
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = hyper_util::rt::TokioIo::new(io);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| HttpError::HttpError(e.to_string()))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            warn!("Connection error: {}", e);
        }
    });

    sender
        .send_request(request)
        .await
        .map_err(|e| HttpError::HttpError(e.to_string()))
}

/// Buffer a response body, failing as soon as it grows past `limit`
async fn read_body<B>(body: B, limit: usize) -> Result<Bytes, HttpError>
where
    B: hyper::body::Body,
    B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    match Limited::new(body, limit).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => Err(HttpError::BodyError(
            format!("body exceeds limit of {} bytes", limit),
        )),
        Err(e) => Err(HttpError::BodyError(e.to_string())),
    }
}

/// Source of account OAuth tokens and attached-client information
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A token scoped for the proxy service, `None` when signed out
    async fn oauth_token(&self) -> Option<String>;

    /// Drop a token from the provider's cache once it has been used
    async fn release_token(&self, token: &str);

    /// OAuth client ids attached to the account. `refresh` bypasses the
    /// provider's cache.
    async fn attached_client_ids(&self, refresh: bool) -> Vec<String>;
}

/// Production [`GuardianBackend`]
pub struct GuardianClient {
    http: HttpClient,
    endpoint: Url,
    fxa_origin: Url,
    experiment: String,
    tokens: Arc<dyn TokenProvider>,
}

impl GuardianClient {
    pub fn new(config: &IppConfig, tokens: Arc<dyn TokenProvider>) -> Result<Self, ConfigError> {
        Ok(Self {
            http: HttpClient::with_defaults(),
            endpoint: config.guardian_url()?,
            fxa_origin: config.fxa_url()?,
            experiment: "alpha".to_string(),
            tokens,
        })
    }

    /// Enrollment experiment (`alpha`, `beta`, ...)
    pub fn with_experiment(mut self, experiment: &str) -> Self {
        self.experiment = experiment.to_string();
        self
    }

    fn url(&self, path: &str) -> Url {
        let mut url = self.endpoint.clone();
        url.set_path(path);
        url.set_query(None);
        url
    }

    fn login_url(&self) -> Url {
        let mut url = self.url(AUTH_PATH);
        url.query_pairs_mut().append_pair("experiment", &self.experiment);
        url
    }

    /// OAuth client id for the configured endpoint, if it is a known one
    pub fn client_id(&self) -> Option<&'static str> {
        let origin = self.endpoint.origin().ascii_serialization();
        CLIENT_ID_MAP
            .iter()
            .find(|(endpoint, _)| *endpoint == origin)
            .map(|(_, id)| *id)
    }

    /// Enrollment redirects may only visit the guardian and account origins
    fn is_allowed_origin(&self, url: &Url) -> bool {
        let origin = url.origin();
        origin == self.endpoint.origin() || origin == self.fxa_origin.origin()
    }

    /// `/oauth/success` or `/api/v1/fpn/error` on the guardian origin
    fn is_finalizer(&self, url: &Url) -> bool {
        url.origin() == self.endpoint.origin()
            && (url.path() == SUCCESS_PATH || url.path() == ENROLL_ERROR_PATH)
    }

    /// GET a guardian endpoint with a borrowed OAuth token.
    ///
    /// `Ok(None)` means there was no token to borrow.
    async fn with_token(&self, url: &Url) -> Result<Option<Response>, HttpError> {
        let Some(token) = self.tokens.oauth_token().await else {
            return Ok(None);
        };
        let result = self.http.get(url, Some(&token)).await;
        self.tokens.release_token(&token).await;
        result.map(Some)
    }
}

/// Turn the URL enrollment ended on into a result
pub fn parse_success_url(url: Option<&Url>) -> EnrollResponse {
    let Some(url) = url else {
        return EnrollResponse::failure("timeout");
    };

    let param = |name: &str| {
        url.query_pairs()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.into_owned())
    };

    if let Some(error) = param("error") {
        return EnrollResponse::failure(error);
    }
    if param("code").is_none() {
        return EnrollResponse::failure("missing_code");
    }
    EnrollResponse::success()
}

#[async_trait]
impl GuardianBackend for GuardianClient {
    async fn fetch_proxy_pass(&self) -> ProxyPassResponse {
        let response = match self.with_token(&self.url(TOKEN_PATH)).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                return ProxyPassResponse {
                    error: Some(GuardianError::LoginNeeded),
                    ..Default::default()
                };
            }
            Err(e) => {
                warn!("Proxy pass request failed: {}", e);
                return ProxyPassResponse {
                    error: Some(e.into()),
                    ..Default::default()
                };
            }
        };

        let status = Some(response.status.as_u16());
        if !response.is_success() {
            warn!("Failed to fetch proxy pass: {}", response.status);
            return ProxyPassResponse {
                status,
                error: Some(GuardianError::InvalidResponse),
                pass: None,
            };
        }

        match ProxyPass::from_response_body(&response.body) {
            Ok(pass) => ProxyPassResponse {
                status,
                error: None,
                pass: Some(pass),
            },
            Err(e) => {
                warn!("Error creating proxy pass: {}", e);
                ProxyPassResponse {
                    status,
                    error: Some(GuardianError::Parse),
                    pass: None,
                }
            }
        }
    }

    async fn enroll(&self) -> EnrollResponse {
        let Some(token) = self.tokens.oauth_token().await else {
            return EnrollResponse::failure(GuardianError::LoginNeeded.to_string());
        };

        let mut url = self.login_url();
        let mut finished = None;
        for _ in 0..MAX_REDIRECTS {
            if !self.is_allowed_origin(&url) {
                warn!("Enrollment redirected to a foreign origin: {}", url.origin().ascii_serialization());
                break;
            }
            if self.is_finalizer(&url) {
                finished = Some(url);
                break;
            }

            let response = match self.http.get(&url, Some(&token)).await {
                Ok(response) => response,
                Err(e) => {
                    warn!("Enrollment request failed: {}", e);
                    break;
                }
            };
            match response.redirect_target() {
                Some(next) => url = next,
                None => {
                    debug!("Enrollment stopped at {} ({})", url.path(), response.status);
                    break;
                }
            }
        }
        self.tokens.release_token(&token).await;

        let result = parse_success_url(finished.as_ref());
        info!("Enrollment finished (ok: {})", result.ok);
        result
    }

    async fn fetch_user_info(&self) -> UserInfoResponse {
        let response = match self.with_token(&self.url(STATUS_PATH)).await {
            Ok(Some(response)) => response,
            Ok(None) => {
                return UserInfoResponse {
                    error: Some(GuardianError::LoginNeeded),
                    ..Default::default()
                };
            }
            Err(e) => {
                warn!("Entitlement request failed: {}", e);
                return UserInfoResponse {
                    error: Some(e.into()),
                    ..Default::default()
                };
            }
        };

        let status = Some(response.status.as_u16());
        let entitlement = if response.is_success() {
            Entitlement::from_json(&response.body).ok()
        } else {
            None
        };

        match entitlement {
            Some(entitlement) => UserInfoResponse {
                status,
                entitlement: Some(entitlement),
                error: None,
            },
            None => UserInfoResponse {
                status,
                entitlement: None,
                error: Some(GuardianError::Parse),
            },
        }
    }

    async fn is_linked_to_guardian(&self, only_cached: bool) -> bool {
        let Some(client_id) = self.client_id() else {
            debug!("No OAuth client id for {}", self.endpoint);
            return false;
        };

        if self
            .tokens
            .attached_client_ids(false)
            .await
            .iter()
            .any(|id| id == client_id)
        {
            return true;
        }
        if only_cached {
            return false;
        }

        self.tokens
            .attached_client_ids(true)
            .await
            .iter()
            .any(|id| id == client_id)
    }
}
