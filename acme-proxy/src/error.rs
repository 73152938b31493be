//! Error types for acme-proxy

use thiserror::Error;

/// Result type alias for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Proxy error types
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Listener could not be bound
    #[error("Failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Backend connection error
    #[error("Backend connection error: {0}")]
    BackendConnection(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(String),

    /// Server name rejected by the host whitelist
    #[error("Host {0:?} is not allowed")]
    HostNotAllowed(String),

    /// ACME protocol failure
    #[error("ACME error: {0}")]
    Acme(String),

    /// Certificate store failure
    #[error("Certificate store error: {0}")]
    Store(#[from] StoreError),

    /// Shared issuance outcome that failed for another waiter
    #[error("Certificate issuance failed: {0}")]
    Issuance(String),
}

/// Certificate store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// Nothing cached for this key
    #[error("No cached entry for {0}")]
    NotFound(String),

    /// Cached files exist but cannot be used
    #[error("Invalid cached certificate for {domain}: {reason}")]
    InvalidRecord { domain: String, reason: String },

    /// Persisting failed
    #[error("Failed to write {path}: {source}")]
    Write {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Reading or removing failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// True when the entry simply does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }
}
