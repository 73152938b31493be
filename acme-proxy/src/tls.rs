//! TLS termination
//!
//! Each connection is accepted lazily: the ClientHello is read first, the
//! certificate is resolved for its server name through a
//! [`CertificateResolver`], and only then is the handshake completed.
//! A rejected or failed resolution drops the connection, which the client
//! sees as a handshake failure.

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::server::{Acceptor, ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::LazyConfigAcceptor;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::error::{ProxyError, Result};
use crate::manager::CertificateResolver;
use crate::store::CertificateRecord;

/// Pause after a failed accept so a persistent error such as EMFILE does not spin
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Convert a stored record into the form rustls signs with
pub fn certified_key(record: &CertificateRecord) -> Result<CertifiedKey> {
    let mut certs = Vec::new();
    let mut key = None;

    let items = rustls_pemfile::read_all(&mut record.cert_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("Failed to read certificates: {}", e)))?;
    for item in items {
        if let rustls_pemfile::Item::X509Certificate(der) = item {
            certs.push(rustls::Certificate(der));
        }
    }

    let items = rustls_pemfile::read_all(&mut record.key_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("Failed to read private key: {}", e)))?;
    for item in items {
        match item {
            rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::ECKey(der) => {
                key = Some(rustls::PrivateKey(der));
                break;
            }
            _ => {}
        }
    }

    if certs.is_empty() {
        return Err(ProxyError::Tls(format!(
            "No certificates found for {}",
            record.domain
        )));
    }
    let key = key.ok_or_else(|| {
        ProxyError::Tls(format!("No private key found for {}", record.domain))
    })?;

    let signing_key = rustls::sign::any_supported_type(&key)
        .map_err(|e| ProxyError::Tls(format!("Unsupported private key: {}", e)))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

/// Serves one already-resolved certificate
struct ResolvedCert(Arc<CertifiedKey>);

impl ResolvesServerCert for ResolvedCert {
    fn resolve(&self, _client_hello: ClientHello) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.0))
    }
}

/// Build the server config serving one certificate
pub fn server_config(key: Arc<CertifiedKey>) -> Arc<ServerConfig> {
    let mut config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(ResolvedCert(key)));
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Arc::new(config)
}

/// HTTPS listener bound to one address
pub struct TlsListener {
    name: &'static str,
    listener: TcpListener,
    resolver: Arc<dyn CertificateResolver>,
    app: Router,
}

impl TlsListener {
    /// Wrap an already bound listener
    pub fn new(
        name: &'static str,
        listener: TcpListener,
        resolver: Arc<dyn CertificateResolver>,
        app: Router,
    ) -> Self {
        Self {
            name,
            listener,
            resolver,
            app,
        }
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until `shutdown` flips to true
    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(listener = self.name, addr = %self.local_addr()?, "HTTPS listener started");

        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            // Per-connection errors (e.g. EMFILE, aborted) must not stop the listener.
                            warn!(listener = self.name, "Failed to accept connection: {}", e);
                            tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                            continue;
                        }
                    };
                    let resolver = Arc::clone(&self.resolver);
                    let app = self.app.clone();
                    tokio::spawn(handle_connection(stream, addr, resolver, app));
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!(listener = self.name, "HTTPS listener stopped");
        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    resolver: Arc<dyn CertificateResolver>,
    app: Router,
) {
    let start = match LazyConfigAcceptor::new(Acceptor::default(), stream).await {
        Ok(start) => start,
        Err(e) => {
            debug!("Failed to read ClientHello from {}: {}", addr, e);
            return;
        }
    };

    let server_name = start
        .client_hello()
        .server_name()
        .unwrap_or_default()
        .to_string();

    let config = match resolver.resolve(&server_name).await {
        Ok(config) => config,
        Err(ProxyError::HostNotAllowed(name)) => {
            warn!("Rejected TLS handshake from {} for {:?}", addr, name);
            return;
        }
        Err(e) => {
            error!("No certificate for {:?} (client {}): {}", server_name, addr, e);
            return;
        }
    };

    let tls_stream = match start.into_stream(config).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!("TLS handshake failed from {}: {}", addr, e);
            return;
        }
    };

    let io = TokioIo::new(tls_stream);
    let service = service_fn(move |mut req: hyper::Request<hyper::body::Incoming>| {
        req.extensions_mut().insert(ConnectInfo(addr));
        app.clone().oneshot(req)
    });

    if let Err(e) = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
    {
        debug!("Error serving connection from {}: {}", addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acme::SelfSignedIssuer;
    use crate::manager::{CertificateManager, HostPolicy, ManagerSettings};
    use crate::store::CertificateStore;
    use crate::test_support::{read_until_close, tls_connect, CountingIssuer, DOMAIN};
    use axum::routing::get;
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_certified_key_from_record() {
        let issuer = SelfSignedIssuer::new(90).unwrap();
        let issued = issuer.sign(DOMAIN, 90).unwrap();
        let record = CertificateRecord::from_pem(DOMAIN, issued.cert_pem, issued.key_pem).unwrap();

        let key = certified_key(&record).unwrap();
        assert_eq!(key.cert.len(), 1);
    }

    #[test]
    fn test_certified_key_requires_private_key() {
        let issuer = SelfSignedIssuer::new(90).unwrap();
        let issued = issuer.sign(DOMAIN, 90).unwrap();
        let mut record =
            CertificateRecord::from_pem(DOMAIN, issued.cert_pem, issued.key_pem).unwrap();
        record.key_pem = String::new();

        assert!(matches!(certified_key(&record), Err(ProxyError::Tls(_))));
    }

    async fn start_listener(
        issuer: Arc<CountingIssuer>,
    ) -> (SocketAddr, watch::Sender<bool>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(
            HostPolicy::whitelist(DOMAIN),
            CertificateStore::new(dir.path()),
            issuer,
            ManagerSettings::default(),
        );
        let app = Router::new().route("/", get(|| async { "hello" }));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tls = TlsListener::new("test", listener, Arc::new(manager), app);
        let addr = tls.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(tls.serve(shutdown_rx));
        (addr, shutdown_tx, dir)
    }

    #[tokio::test]
    async fn test_handshake_serves_issued_certificate() {
        let issuer = Arc::new(CountingIssuer::new(90));
        let (addr, _shutdown, _dir) = start_listener(issuer.clone()).await;

        let mut stream = tls_connect(addr, DOMAIN, &issuer.ca_pem()).await.unwrap();
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: openbsd.app\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let response = read_until_close(&mut stream).await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("hello"));
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn test_handshake_rejected_for_other_names() {
        let issuer = Arc::new(CountingIssuer::new(90));
        let (addr, _shutdown, _dir) = start_listener(issuer.clone()).await;

        let result = tls_connect(addr, "evil.example", &issuer.ca_pem()).await;
        assert!(result.is_err());
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn test_listener_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let manager = CertificateManager::new(
            HostPolicy::whitelist(DOMAIN),
            CertificateStore::new(dir.path()),
            Arc::new(CountingIssuer::new(90)),
            ManagerSettings::default(),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let tls = TlsListener::new("test", listener, Arc::new(manager), Router::new());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(tls.serve(shutdown_rx));
        shutdown_tx.send(true).unwrap();

        assert!(task.await.unwrap().is_ok());
    }
}
