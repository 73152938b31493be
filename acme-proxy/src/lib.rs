//! acme-proxy: single-upstream HTTPS reverse proxy with automatic TLS
//!
//! Terminates TLS for one domain with certificates obtained on demand from an
//! ACME directory (HTTP-01), forwards every request to one fixed upstream and
//! writes one access log line per request. Listens on IPv4 and IPv6.
//!
//! # Features
//!
//! - Certificates issued on the first handshake, cached on disk and renewed
//!   in the background
//! - Single-flight issuance shared by concurrent handshakes
//! - ACME HTTP-01 challenge listeners redirecting everything else to HTTPS
//! - Pooled HTTP/1.1 upstream client with hop-by-hop header handling
//! - Access log emitted after the response body has been sent
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! http_addr = "0.0.0.0:80"
//! http6_addr = "[::]:80"
//! https_addr = "0.0.0.0:443"
//! https6_addr = "[::]:443"
//!
//! [tls]
//! domain = "openbsd.app"
//! cert_dir = "/var/lib/acme-proxy/certs"
//! acme_email = "admin@openbsd.app"
//!
//! [upstream]
//! target = "http://localhost:3000"
//! ```

pub mod access_log;
pub mod acme;
pub mod challenge;
pub mod config;
pub mod error;
pub mod manager;
pub mod proxy;
pub mod server;
pub mod store;
pub mod tls;

pub use access_log::{AccessLogRecord, AccessLogger};
pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use manager::{CertificateManager, HostPolicy};
pub use proxy::{ProxyTarget, ReverseProxy};
pub use server::Server;
