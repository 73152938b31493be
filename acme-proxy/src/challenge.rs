//! ACME HTTP-01 challenge handling
//!
//! Pending tokens live in a [`ChallengeStore`] shared between the issuer,
//! which registers them, and the plaintext listeners, which serve them at
//! `/.well-known/acme-challenge/{token}`.

use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, Method, Response, StatusCode, Uri},
    response::IntoResponse,
    routing::any,
    Router,
};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::manager::HostPolicy;

/// HTTP-01 challenge path prefix
pub const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

/// Token -> key authorization for in-flight authorizations
#[derive(Debug, Default)]
pub struct ChallengeStore {
    challenges: RwLock<HashMap<String, String>>,
}

impl ChallengeStore {
    /// Create an empty challenge store
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a challenge response
    pub fn add_challenge(&self, token: &str, key_authorization: &str) {
        let mut challenges = self.challenges.write().unwrap_or_else(|e| e.into_inner());
        challenges.insert(token.to_string(), key_authorization.to_string());
        debug!(token = %token, "Added ACME challenge");
    }

    /// Get a challenge response
    pub fn get_challenge(&self, token: &str) -> Option<String> {
        let challenges = self.challenges.read().unwrap_or_else(|e| e.into_inner());
        challenges.get(token).cloned()
    }

    /// Remove a challenge (after validation)
    pub fn remove_challenge(&self, token: &str) {
        let mut challenges = self.challenges.write().unwrap_or_else(|e| e.into_inner());
        if challenges.remove(token).is_some() {
            debug!(token = %token, "Removed ACME challenge");
        }
    }

    /// Number of tokens currently served
    pub fn pending_count(&self) -> usize {
        self.challenges.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Register a token for as long as the returned guard lives
    pub fn register(self: &Arc<Self>, token: &str, key_authorization: &str) -> ChallengeGuard {
        self.add_challenge(token, key_authorization);
        ChallengeGuard {
            store: Arc::clone(self),
            token: token.to_string(),
        }
    }
}

/// Removes its token from the store when dropped
#[derive(Debug)]
pub struct ChallengeGuard {
    store: Arc<ChallengeStore>,
    token: String,
}

impl Drop for ChallengeGuard {
    fn drop(&mut self) {
        self.store.remove_challenge(&self.token);
    }
}

#[derive(Clone)]
struct ChallengeState {
    policy: HostPolicy,
    store: Arc<ChallengeStore>,
}

/// Router for the plaintext challenge listeners
///
/// Challenge tokens are answered for the whitelisted host only; every other
/// GET/HEAD is redirected to HTTPS and everything else gets 400.
pub fn challenge_router(policy: HostPolicy, store: Arc<ChallengeStore>) -> Router {
    Router::new()
        .route("/.well-known/acme-challenge/:token", any(challenge_handler))
        .fallback(redirect_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(ChallengeState { policy, store })
}

async fn challenge_handler(
    State(state): State<ChallengeState>,
    Path(token): Path<String>,
    method: Method,
    headers: HeaderMap,
    uri: Uri,
) -> Response<Body> {
    if method != Method::GET && method != Method::HEAD {
        return use_https();
    }

    let Some(host) = request_host(&headers, &uri) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };

    if let Err(e) = state.policy.check(&host) {
        warn!(host = %host, "Rejected ACME challenge request: {}", e);
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    }

    match state.store.get_challenge(&token) {
        Some(key_authorization) => {
            debug!(token = %token, "Serving ACME challenge");
            (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "text/plain")],
                key_authorization,
            )
                .into_response()
        }
        None => {
            debug!(token = %token, "Unknown ACME challenge token");
            (StatusCode::NOT_FOUND, "Not Found").into_response()
        }
    }
}

async fn redirect_handler(method: Method, headers: HeaderMap, uri: Uri) -> Response<Body> {
    if method != Method::GET && method != Method::HEAD {
        return use_https();
    }

    let Some(host) = request_host(&headers, &uri) else {
        return (StatusCode::BAD_REQUEST, "Missing Host header").into_response();
    };

    let path = uri
        .path_and_query()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    let location = if host.contains(':') {
        format!("https://[{}]{}", host, path)
    } else {
        format!("https://{}{}", host, path)
    };

    (StatusCode::FOUND, [(header::LOCATION, location)]).into_response()
}

fn use_https() -> Response<Body> {
    (StatusCode::BAD_REQUEST, "Use HTTPS").into_response()
}

/// Request host without port, from the Host header or an absolute URI
fn request_host(headers: &HeaderMap, uri: &Uri) -> Option<String> {
    let raw = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.host())?;

    let host = strip_port(raw);
    if host.is_empty() {
        None
    } else {
        Some(host.to_string())
    }
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}
