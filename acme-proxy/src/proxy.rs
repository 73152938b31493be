//! Reverse proxy to the single upstream

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode, Uri, Version},
    response::IntoResponse,
    Router,
};
use hyper::upgrade::OnUpgrade;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::{TokioExecutor, TokioIo},
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};

use crate::access_log::AccessLogger;
use crate::config::UpstreamConfig;
use crate::error::{ProxyError, Result};

/// HTTP client type for forwarding requests
type HttpClient = Client<HttpConnector, Body>;

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// The upstream all requests are forwarded to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyTarget {
    scheme: String,
    authority: String,
    base_path: String,
    base_query: Option<String>,
}

impl ProxyTarget {
    /// Parse an upstream URL such as `http://localhost:3000/app?x=1`
    pub fn parse(target: &str) -> Result<Self> {
        let url = url::Url::parse(target).map_err(|e| {
            ProxyError::Config(format!("Invalid upstream target '{}': {}", target, e))
        })?;

        if url.scheme() != "http" {
            return Err(ProxyError::Config(format!(
                "Unsupported upstream scheme '{}': only http is supported",
                url.scheme()
            )));
        }

        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProxyError::Config(format!("Upstream target '{}' has no host", target)))?;

        let authority = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };

        Ok(Self {
            scheme: url.scheme().to_string(),
            authority,
            base_path: url.path().to_string(),
            base_query: url.query().filter(|q| !q.is_empty()).map(str::to_string),
        })
    }

    /// `host[:port]` as sent in the Host header
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Upstream URI for an incoming request URI
    pub fn rewrite(&self, uri: &Uri) -> Result<Uri> {
        let path = join_path(&self.base_path, uri.path());
        let query = match (self.base_query.as_deref(), uri.query()) {
            (Some(base), Some(q)) if !q.is_empty() => Some(format!("{}&{}", base, q)),
            (Some(base), _) => Some(base.to_string()),
            (None, Some(q)) if !q.is_empty() => Some(q.to_string()),
            _ => None,
        };

        let forward = match query {
            Some(q) => format!("{}://{}{}?{}", self.scheme, self.authority, path, q),
            None => format!("{}://{}{}", self.scheme, self.authority, path),
        };

        forward
            .parse()
            .map_err(|e| ProxyError::BackendConnection(format!("Invalid forward URI {}: {}", forward, e)))
    }
}

impl std::fmt::Display for ProxyTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.base_path)
    }
}

/// Join two path segments with exactly one slash between them
fn join_path(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// Remove hop-by-hop headers, including those listed in `Connection`
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

/// Protocol named in `Upgrade`, if `Connection` asks for an upgrade
fn upgrade_type(headers: &HeaderMap) -> Option<HeaderValue> {
    let requested = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));
    if requested {
        headers.get(header::UPGRADE).cloned()
    } else {
        None
    }
}

fn set_upgrade(headers: &mut HeaderMap, protocol: HeaderValue) {
    headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
    headers.insert(header::UPGRADE, protocol);
}

/// Append the client IP to X-Forwarded-For
fn append_forwarded_for(headers: &mut HeaderMap, client: SocketAddr) {
    let ip = client.ip().to_string();
    let prior: Vec<&str> = headers
        .get_all("x-forwarded-for")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .collect();

    let value = if prior.is_empty() {
        ip
    } else {
        format!("{}, {}", prior.join(", "), ip)
    };

    if let Ok(value) = HeaderValue::from_str(&value) {
        headers.insert("x-forwarded-for", value);
    }
}

/// Forwards requests to the upstream over a pooled client
#[derive(Clone)]
pub struct ReverseProxy {
    target: Arc<ProxyTarget>,
    client: HttpClient,
    timeout: Option<Duration>,
}

impl ReverseProxy {
    /// Create a proxy for `target` using the pool settings in `config`
    pub fn new(target: ProxyTarget, config: &UpstreamConfig) -> Self {
        let client: HttpClient = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_connections)
            .pool_idle_timeout(config.idle_timeout())
            .build_http();

        Self {
            target: Arc::new(target),
            client,
            timeout: config.timeout(),
        }
    }

    pub fn target(&self) -> &ProxyTarget {
        &self.target
    }

    /// Router serving every path through the proxy, wrapped in the access log
    pub fn router(self, logger: &AccessLogger) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(self)
            .layer(TraceLayer::new_for_http())
            .layer(logger.layer())
    }

    /// Forward one request; upstream failures become 502
    ///
    /// Protocol upgrades (e.g. WebSocket) are passed through: once the
    /// upstream answers 101, bytes are copied both ways until either side
    /// closes.
    pub async fn forward(&self, mut req: Request<Body>) -> Response<Body> {
        let client_addr = req
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let upgrade = upgrade_type(req.headers());
        let client_upgrade = upgrade.is_some().then(|| hyper::upgrade::on(&mut req));

        let (mut parts, body) = req.into_parts();

        let uri = match self.target.rewrite(&parts.uri) {
            Ok(uri) => uri,
            Err(e) => {
                error!("{}", e);
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };
        debug!("Forwarding {} {} to {}", parts.method, parts.uri, uri);

        parts.uri = uri;
        parts.version = Version::HTTP_11;
        strip_hop_by_hop(&mut parts.headers);
        if let Some(protocol) = &upgrade {
            set_upgrade(&mut parts.headers, protocol.clone());
        }
        if let Ok(host) = HeaderValue::from_str(self.target.authority()) {
            parts.headers.insert(header::HOST, host);
        }
        if let Some(addr) = client_addr {
            append_forwarded_for(&mut parts.headers, addr);
        }

        let request = self.client.request(Request::from_parts(parts, body));
        let result = match self.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, request).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Upstream {} timed out after {:?}", self.target, timeout);
                    return StatusCode::BAD_GATEWAY.into_response();
                }
            },
            None => request.await,
        };

        match result {
            Ok(response) if response.status() == StatusCode::SWITCHING_PROTOCOLS => {
                match (upgrade, client_upgrade) {
                    (Some(requested), Some(client)) => {
                        self.switch_protocols(requested, client, response)
                    }
                    _ => {
                        error!("Upstream {} switched protocols without being asked", self.target);
                        StatusCode::BAD_GATEWAY.into_response()
                    }
                }
            }
            Ok(response) => {
                let (mut parts, body) = response.into_parts();
                strip_hop_by_hop(&mut parts.headers);
                Response::from_parts(parts, Body::new(body))
            }
            Err(e) => {
                error!("Upstream {} error: {}", self.target, e);
                StatusCode::BAD_GATEWAY.into_response()
            }
        }
    }

    /// Answer 101 to the client and splice both upgraded connections
    fn switch_protocols(
        &self,
        requested: HeaderValue,
        client: OnUpgrade,
        mut response: Response<hyper::body::Incoming>,
    ) -> Response<Body> {
        let accepted = match upgrade_type(response.headers()) {
            Some(protocol) if protocol.as_bytes().eq_ignore_ascii_case(requested.as_bytes()) => {
                protocol
            }
            other => {
                error!(
                    "Upstream {} switched to {:?}, client asked for {:?}",
                    self.target, other, requested
                );
                return StatusCode::BAD_GATEWAY.into_response();
            }
        };

        let upstream = hyper::upgrade::on(&mut response);
        let target = Arc::clone(&self.target);
        tokio::spawn(async move {
            let (client, upstream) = match tokio::try_join!(client, upstream) {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Upgrade through {} failed: {}", target, e);
                    return;
                }
            };
            let mut client = TokioIo::new(client);
            let mut upstream = TokioIo::new(upstream);
            match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
                Ok((sent, received)) => {
                    debug!(sent, received, "Upgraded connection to {} closed", target)
                }
                Err(e) => debug!("Upgraded connection to {} failed: {}", target, e),
            }
        });

        let (mut parts, _) = response.into_parts();
        strip_hop_by_hop(&mut parts.headers);
        set_upgrade(&mut parts.headers, accepted);
        Response::from_parts(parts, Body::empty())
    }
}

async fn proxy_handler(State(proxy): State<ReverseProxy>, req: Request<Body>) -> Response<Body> {
    proxy.forward(req).await
}
