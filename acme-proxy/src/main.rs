//! acme-proxy: HTTPS reverse proxy with automatic Let's Encrypt certificates
//!
//! ```bash
//! acme-proxy --domain openbsd.app --target http://localhost:3000 \
//!     --http 0.0.0.0:80 --https 0.0.0.0:443 --email admin@openbsd.app
//! ```

#[cfg(unix)]
use acme_proxy::access_log::{SyslogSink, SYSLOG_SOCKET};
use acme_proxy::acme::{AcmeIssuer, CertificateIssuer, SelfSignedIssuer};
use acme_proxy::challenge::ChallengeStore;
use acme_proxy::config::{LoggingConfig, LETS_ENCRYPT_STAGING};
use acme_proxy::manager::ManagerSettings;
use acme_proxy::store::CertificateStore;
use acme_proxy::{
    AccessLogger, CertificateManager, HostPolicy, ProxyConfig, ReverseProxy, Server,
};
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "acme-proxy", version)]
#[command(about = "HTTPS reverse proxy with automatic ACME certificates", long_about = None)]
struct Cli {
    /// TOML configuration file; flags override its values
    #[arg(short, long, env = "ACME_PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Upstream URL requests are forwarded to [default: http://localhost:3000]
    #[arg(long)]
    target: Option<String>,

    /// Domain to obtain a certificate for [default: openbsd.app]
    #[arg(long)]
    domain: Option<String>,

    /// IPv4 ACME challenge listener [default: 127.0.0.1:8080]
    #[arg(long)]
    http: Option<String>,

    /// IPv6 ACME challenge listener [default: [::1]:8080]
    #[arg(long)]
    http6: Option<String>,

    /// IPv4 HTTPS listener [default: 127.0.0.1:4343]
    #[arg(long)]
    https: Option<String>,

    /// IPv6 HTTPS listener [default: [::1]:4343]
    #[arg(long)]
    https6: Option<String>,

    /// Certificate cache directory [default: certs]
    #[arg(long)]
    cert_dir: Option<PathBuf>,

    /// ACME directory URL [default: Let's Encrypt production]
    #[arg(long, conflicts_with = "staging")]
    acme_directory: Option<String>,

    /// Use the Let's Encrypt staging directory
    #[arg(long)]
    staging: bool,

    /// Contact email for the ACME account
    #[arg(long)]
    email: Option<String>,

    /// Issue certificates from a local CA instead of ACME (development only)
    #[arg(long)]
    self_signed: bool,

    /// Send access log lines to syslog (facility daemon)
    #[arg(long)]
    syslog: bool,
}

impl Cli {
    /// Load the config file, if any, and apply flag overrides
    fn into_config(self) -> anyhow::Result<(ProxyConfig, bool)> {
        let mut config = match &self.config {
            Some(path) => ProxyConfig::from_file(path)
                .with_context(|| format!("Failed to load {}", path.display()))?,
            None => ProxyConfig::default(),
        };

        if let Some(target) = self.target {
            config.upstream.target = target;
        }
        if let Some(domain) = self.domain {
            config.tls.domain = domain;
        }
        if let Some(addr) = self.http {
            config.server.http_addr = addr;
        }
        if let Some(addr) = self.http6 {
            config.server.http6_addr = addr;
        }
        if let Some(addr) = self.https {
            config.server.https_addr = addr;
        }
        if let Some(addr) = self.https6 {
            config.server.https6_addr = addr;
        }
        if let Some(dir) = self.cert_dir {
            config.tls.cert_dir = dir;
        }
        if let Some(url) = self.acme_directory {
            config.tls.acme_directory = url;
        }
        if self.staging {
            config.tls.acme_directory = LETS_ENCRYPT_STAGING.to_string();
        }
        if let Some(email) = self.email {
            config.tls.acme_email = Some(email);
        }
        if self.syslog {
            config.logging.syslog = true;
        }

        Ok((config, self.self_signed))
    }
}

fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    match config.format.as_str() {
        "json" => registry.with(fmt::layer().json()).init(),
        "pretty" => registry.with(fmt::layer().pretty()).init(),
        _ => registry.with(fmt::layer().compact()).init(),
    }
}

#[cfg(unix)]
fn access_logger(config: &LoggingConfig) -> anyhow::Result<AccessLogger> {
    if !config.syslog {
        return Ok(AccessLogger::tracing());
    }
    let sink = SyslogSink::connect(SYSLOG_SOCKET, "acme-proxy")
        .with_context(|| format!("Failed to connect to {}", SYSLOG_SOCKET))?;
    info!("Access log: syslog via {}", SYSLOG_SOCKET);
    Ok(AccessLogger::new(Arc::new(sink)))
}

#[cfg(not(unix))]
fn access_logger(config: &LoggingConfig) -> anyhow::Result<AccessLogger> {
    if config.syslog {
        anyhow::bail!("syslog access logging is only available on unix");
    }
    Ok(AccessLogger::tracing())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (config, self_signed) = Cli::parse().into_config()?;
    init_logging(&config.logging);

    info!("Starting acme-proxy v{}", env!("CARGO_PKG_VERSION"));
    config.validate()?;

    let addrs = config.listen_addrs()?;
    let target = config.proxy_target()?;
    info!("Domain: {}", config.tls.domain);
    info!("Upstream: {}", target);
    info!("Certificate cache: {}", config.tls.cert_dir.display());

    let store = CertificateStore::new(config.tls.cert_dir.clone());
    let challenges = Arc::new(ChallengeStore::new());

    let issuer: Arc<dyn CertificateIssuer> = if self_signed {
        let issuer = SelfSignedIssuer::new(90)?;
        let ca_path = config.tls.cert_dir.join("local-ca.pem");
        std::fs::create_dir_all(&config.tls.cert_dir)
            .and_then(|_| std::fs::write(&ca_path, issuer.ca_pem()))
            .with_context(|| format!("Failed to write {}", ca_path.display()))?;
        warn!("Self-signed mode: trust {} in clients", ca_path.display());
        Arc::new(issuer)
    } else {
        info!("ACME directory: {}", config.tls.acme_directory);
        Arc::new(AcmeIssuer::new(
            config.tls.acme_directory.clone(),
            config.tls.acme_email.clone(),
            store.clone(),
            Arc::clone(&challenges),
        ))
    };

    let manager = CertificateManager::new(
        HostPolicy::whitelist(&config.tls.domain),
        store,
        issuer,
        ManagerSettings {
            renew_before: config.tls.renew_before(),
            check_interval: config.tls.renew_check_interval(),
            issuance_timeout: config.tls.issuance_timeout(),
            retry_after: config.tls.issuance_retry_after(),
        },
    );

    let proxy = ReverseProxy::new(target, &config.upstream);
    let logger = access_logger(&config.logging)?;
    let server = Server::new(addrs, manager, challenges, proxy, logger);

    server.run(shutdown_signal()).await?;

    info!("acme-proxy stopped");
    Ok(())
}
