//! Configuration for acme-proxy

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ProxyError, Result};
use crate::proxy::ProxyTarget;

/// Let's Encrypt production directory
pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";

/// Let's Encrypt staging directory
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// Main proxy configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxyConfig {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Certificate management configuration
    #[serde(default)]
    pub tls: TlsConfig,
    /// Upstream configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Listen addresses, one plaintext and one TLS listener per address family
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// ACME challenge listener, IPv4
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// ACME challenge listener, IPv6
    #[serde(default = "default_http6_addr")]
    pub http6_addr: String,
    /// HTTPS listener, IPv4
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// HTTPS listener, IPv6
    #[serde(default = "default_https6_addr")]
    pub https6_addr: String,
}

/// Certificate management configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TlsConfig {
    /// The single domain certificates are issued for
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Certificate cache directory
    #[serde(default = "default_cert_dir")]
    pub cert_dir: PathBuf,
    /// ACME directory URL
    #[serde(default = "default_acme_directory")]
    pub acme_directory: String,
    /// Contact email registered with the ACME account
    #[serde(default)]
    pub acme_email: Option<String>,
    /// Renew once fewer than this many days of validity remain
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u64,
    /// How often the renewal task checks the certificate
    #[serde(default = "default_renew_check_interval")]
    pub renew_check_interval_seconds: u64,
    /// Upper bound for one complete issuance
    #[serde(default = "default_issuance_timeout")]
    pub issuance_timeout_seconds: u64,
    /// After a failed issuance, handshakes fail fast for this many seconds
    #[serde(default = "default_issuance_retry_after")]
    pub issuance_retry_after_seconds: u64,
}

/// Upstream configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UpstreamConfig {
    /// Backend URL (e.g., "http://localhost:3000")
    #[serde(default = "default_target")]
    pub target: String,
    /// Idle connections kept in the pool
    #[serde(default = "default_max_idle_connections")]
    pub max_idle_connections: usize,
    /// Idle connections are closed after this many seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Deadline for the upstream response head
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
    /// "pretty", "compact" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Send access log lines to the local syslog daemon instead of `tracing`
    #[serde(default)]
    pub syslog: bool,
}

/// Parsed listen addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenAddrs {
    pub http: SocketAddr,
    pub http6: SocketAddr,
    pub https: SocketAddr,
    pub https6: SocketAddr,
}

fn default_http_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_http6_addr() -> String {
    "[::1]:8080".to_string()
}

fn default_https_addr() -> String {
    "127.0.0.1:4343".to_string()
}

fn default_https6_addr() -> String {
    "[::1]:4343".to_string()
}

fn default_domain() -> String {
    "openbsd.app".to_string()
}

fn default_cert_dir() -> PathBuf {
    PathBuf::from("certs")
}

fn default_acme_directory() -> String {
    LETS_ENCRYPT_PRODUCTION.to_string()
}

fn default_renew_before_days() -> u64 {
    30
}

fn default_renew_check_interval() -> u64 {
    60 * 60
}

fn default_issuance_timeout() -> u64 {
    5 * 60
}

fn default_issuance_retry_after() -> u64 {
    60
}

fn default_target() -> String {
    "http://localhost:3000".to_string()
}

fn default_max_idle_connections() -> usize {
    10
}

fn default_idle_timeout() -> u64 {
    5
}

fn default_log_level() -> String {
    "acme_proxy=info,access_log=info".to_string()
}

fn default_log_format() -> String {
    "compact".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            http6_addr: default_http6_addr(),
            https_addr: default_https_addr(),
            https6_addr: default_https6_addr(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            domain: default_domain(),
            cert_dir: default_cert_dir(),
            acme_directory: default_acme_directory(),
            acme_email: None,
            renew_before_days: default_renew_before_days(),
            renew_check_interval_seconds: default_renew_check_interval(),
            issuance_timeout_seconds: default_issuance_timeout(),
            issuance_retry_after_seconds: default_issuance_retry_after(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            target: default_target(),
            max_idle_connections: default_max_idle_connections(),
            idle_timeout_seconds: default_idle_timeout(),
            timeout_seconds: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            syslog: false,
        }
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            upstream: UpstreamConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl TlsConfig {
    pub fn renew_before(&self) -> Duration {
        Duration::from_secs(self.renew_before_days * 24 * 60 * 60)
    }

    pub fn renew_check_interval(&self) -> Duration {
        Duration::from_secs(self.renew_check_interval_seconds)
    }

    pub fn issuance_timeout(&self) -> Duration {
        Duration::from_secs(self.issuance_timeout_seconds)
    }

    pub fn issuance_retry_after(&self) -> Duration {
        Duration::from_secs(self.issuance_retry_after_seconds)
    }
}

impl UpstreamConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::Config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Parse the four listen addresses
    pub fn listen_addrs(&self) -> Result<ListenAddrs> {
        Ok(ListenAddrs {
            http: parse_addr("http", &self.server.http_addr)?,
            http6: parse_addr("http6", &self.server.http6_addr)?,
            https: parse_addr("https", &self.server.https_addr)?,
            https6: parse_addr("https6", &self.server.https6_addr)?,
        })
    }

    /// Parse the upstream target
    pub fn proxy_target(&self) -> Result<ProxyTarget> {
        ProxyTarget::parse(&self.upstream.target)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.listen_addrs()?;
        self.proxy_target()?;

        let domain = self.tls.domain.trim();
        if domain.is_empty() {
            return Err(ProxyError::Config("Domain must not be empty".to_string()));
        }
        if domain.contains(['/', ':', ' ']) || domain.starts_with('*') {
            return Err(ProxyError::Config(format!(
                "Invalid domain '{}': expected a plain hostname",
                domain
            )));
        }

        url::Url::parse(&self.tls.acme_directory).map_err(|e| {
            ProxyError::Config(format!(
                "Invalid ACME directory URL '{}': {}",
                self.tls.acme_directory, e
            ))
        })?;

        if self.upstream.max_idle_connections == 0 {
            return Err(ProxyError::Config(
                "upstream.max_idle_connections must be at least 1".to_string(),
            ));
        }
        if self.tls.renew_check_interval_seconds == 0 {
            return Err(ProxyError::Config(
                "tls.renew_check_interval_seconds must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_addr(name: &str, value: &str) -> Result<SocketAddr> {
    value.parse().map_err(|e| {
        ProxyError::Config(format!("Invalid {} listen address '{}': {}", name, value, e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tls.domain, "openbsd.app");

        let addrs = config.listen_addrs().unwrap();
        assert!(addrs.http.is_ipv4());
        assert!(addrs.http6.is_ipv6());
        assert_eq!(addrs.https.port(), 4343);
        assert_eq!(addrs.https6.port(), 4343);
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
https_addr = "0.0.0.0:443"
https6_addr = "[::]:443"

[tls]
domain = "example.com"
acme_email = "admin@example.com"

[upstream]
target = "http://127.0.0.1:8080"
"#;
        let config: ProxyConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.server.https_addr, "0.0.0.0:443");
        assert_eq!(config.server.http_addr, "127.0.0.1:8080");
        assert_eq!(config.tls.acme_email.as_deref(), Some("admin@example.com"));
        assert_eq!(config.upstream.max_idle_connections, 10);
        assert_eq!(config.tls.issuance_retry_after(), Duration::from_secs(60));
        assert!(!config.logging.syslog);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_listen_address() {
        let mut config = ProxyConfig::default();
        config.server.https6_addr = "::1:4343".to_string();
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_invalid_target() {
        let mut config = ProxyConfig::default();
        config.upstream.target = "not a url".to_string();
        assert!(matches!(config.validate(), Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_invalid_domain() {
        let mut config = ProxyConfig::default();
        config.tls.domain = "*.example.com".to_string();
        assert!(config.validate().is_err());

        config.tls.domain = "  ".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_durations() {
        let config = TlsConfig::default();
        assert_eq!(config.renew_before(), Duration::from_secs(30 * 24 * 3600));
        assert_eq!(UpstreamConfig::default().idle_timeout(), Duration::from_secs(5));
        assert_eq!(UpstreamConfig::default().timeout(), None);
    }
}
