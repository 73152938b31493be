//! Listener topology and supervision
//!
//! Two plaintext challenge listeners and two HTTPS listeners (one per address
//! family) plus the renewal task. The challenge listeners are independent of
//! each other: one failing to bind is logged, both failing is fatal. Either
//! HTTPS listener failing to bind, or stopping while serving, is fatal.

use axum::Router;
use futures_util::future::select_all;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::access_log::AccessLogger;
use crate::challenge::{challenge_router, ChallengeStore};
use crate::config::ListenAddrs;
use crate::error::{ProxyError, Result};
use crate::manager::CertificateManager;
use crate::proxy::ReverseProxy;
use crate::tls::TlsListener;

/// Everything the listeners share
pub struct Server {
    addrs: ListenAddrs,
    manager: CertificateManager,
    challenges: Arc<ChallengeStore>,
    proxy: ReverseProxy,
    logger: AccessLogger,
}

/// Server whose sockets are bound but not yet serving
pub struct BoundServer {
    manager: CertificateManager,
    challenge_listeners: Vec<(&'static str, TcpListener)>,
    challenge_app: Router,
    tls_listeners: Vec<TlsListener>,
    http_addrs: Vec<SocketAddr>,
    https_addrs: Vec<SocketAddr>,
}

impl Server {
    pub fn new(
        addrs: ListenAddrs,
        manager: CertificateManager,
        challenges: Arc<ChallengeStore>,
        proxy: ReverseProxy,
        logger: AccessLogger,
    ) -> Self {
        Self {
            addrs,
            manager,
            challenges,
            proxy,
            logger,
        }
    }

    /// Bind all listeners and load any cached certificate
    pub async fn bind(self) -> Result<BoundServer> {
        if !self.manager.load_cached() {
            info!(
                domain = %self.manager.domain(),
                "No cached certificate, issuing on first handshake"
            );
        }

        let challenge_listeners =
            bind_challenge_listeners(&[("http", self.addrs.http), ("http6", self.addrs.http6)])
                .await?;

        let app = self.proxy.router(&self.logger);
        let mut tls_listeners = Vec::new();
        for (name, addr) in [("https", self.addrs.https), ("https6", self.addrs.https6)] {
            let listener = TcpListener::bind(addr)
                .await
                .map_err(|source| ProxyError::Bind { name, addr, source })?;
            tls_listeners.push(TlsListener::new(
                name,
                listener,
                Arc::new(self.manager.clone()),
                app.clone(),
            ));
        }

        let http_addrs = challenge_listeners
            .iter()
            .map(|(_, l)| l.local_addr())
            .collect::<std::io::Result<Vec<_>>>()?;
        let https_addrs = tls_listeners
            .iter()
            .map(TlsListener::local_addr)
            .collect::<Result<Vec<_>>>()?;

        Ok(BoundServer {
            challenge_app: challenge_router(self.manager.policy().clone(), self.challenges),
            manager: self.manager,
            challenge_listeners,
            tls_listeners,
            http_addrs,
            https_addrs,
        })
    }

    /// Bind and serve until `shutdown` resolves
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        self.bind().await?.run(shutdown).await
    }
}

async fn bind_challenge_listeners(
    addrs: &[(&'static str, SocketAddr)],
) -> Result<Vec<(&'static str, TcpListener)>> {
    let mut bound = Vec::new();
    let mut last_error = None;

    for &(name, addr) in addrs {
        match TcpListener::bind(addr).await {
            Ok(listener) => bound.push((name, listener)),
            Err(source) => {
                warn!(listener = name, addr = %addr, "Failed to bind challenge listener: {}", source);
                last_error = Some(ProxyError::Bind { name, addr, source });
            }
        }
    }

    match (bound.is_empty(), last_error) {
        (true, Some(e)) => Err(e),
        _ => Ok(bound),
    }
}

impl BoundServer {
    /// Addresses of the challenge listeners that are bound
    pub fn http_addrs(&self) -> &[SocketAddr] {
        &self.http_addrs
    }

    /// Addresses of the HTTPS listeners
    pub fn https_addrs(&self) -> &[SocketAddr] {
        &self.https_addrs
    }

    /// Serve until `shutdown` resolves or an HTTPS listener stops
    ///
    /// HTTPS listeners are stopped first, then the challenge listeners and
    /// the renewal task.
    pub async fn run(self, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let (tls_shutdown, tls_rx) = watch::channel(false);
        let (background_shutdown, background_rx) = watch::channel(false);

        let mut tls_tasks: Vec<JoinHandle<Result<()>>> = self
            .tls_listeners
            .into_iter()
            .map(|listener| tokio::spawn(listener.serve(tls_rx.clone())))
            .collect();

        let mut background_tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
        for (name, listener) in self.challenge_listeners {
            let addr = listener.local_addr()?;
            let app = self.challenge_app.clone();
            let mut rx = background_rx.clone();
            background_tasks.push((
                name,
                tokio::spawn(async move {
                    info!(listener = name, addr = %addr, "Challenge listener started");
                    let service = app.into_make_service_with_connect_info::<SocketAddr>();
                    let result = axum::serve(listener, service)
                        .with_graceful_shutdown(async move {
                            let _ = rx.wait_for(|stop| *stop).await;
                        })
                        .await;
                    match result {
                        Ok(()) => info!(listener = name, "Challenge listener stopped"),
                        Err(e) => error!(listener = name, "Challenge listener failed: {}", e),
                    }
                }),
            ));
        }

        background_tasks.push((
            "renewal",
            tokio::spawn(self.manager.clone().run_renewal(background_rx.clone())),
        ));

        let stopped = tokio::select! {
            _ = shutdown => None,
            (joined, index, _) = select_all(tls_tasks.iter_mut()) => Some((index, joined)),
        };

        let outcome = match stopped {
            None => {
                info!("Shutting down");
                Ok(())
            }
            Some((index, joined)) => {
                tls_tasks.remove(index);
                match joined {
                    Ok(Err(e)) => Err(e),
                    Ok(Ok(())) => Err(ProxyError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        "HTTPS listener stopped unexpectedly",
                    ))),
                    Err(e) => Err(ProxyError::Io(std::io::Error::new(
                        std::io::ErrorKind::Other,
                        format!("HTTPS listener task failed: {}", e),
                    ))),
                }
            }
        };

        let _ = tls_shutdown.send(true);
        for task in tls_tasks {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("HTTPS listener error during shutdown: {}", e),
                Err(e) => error!("HTTPS listener task failed: {}", e),
            }
        }

        let _ = background_shutdown.send(true);
        for (name, task) in background_tasks {
            if let Err(e) = task.await {
                error!(task = name, "Task failed: {}", e);
            }
        }

        if let Err(ref e) = outcome {
            error!("Server stopped: {}", e);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UpstreamConfig;
    use crate::manager::{HostPolicy, ManagerSettings};
    use crate::proxy::ProxyTarget;
    use crate::store::CertificateStore;
    use crate::test_support::{CountingIssuer, DOMAIN};
    use std::time::Duration;
    use tempfile::tempdir;

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn addrs(http: SocketAddr, http6: SocketAddr, https: SocketAddr) -> ListenAddrs {
        ListenAddrs {
            http,
            http6,
            https,
            https6: loopback(),
        }
    }

    fn server(addrs: ListenAddrs, dir: &std::path::Path) -> Server {
        let challenges = Arc::new(ChallengeStore::new());
        let manager = CertificateManager::new(
            HostPolicy::whitelist(DOMAIN),
            CertificateStore::new(dir),
            Arc::new(CountingIssuer::new(90)),
            ManagerSettings::default(),
        );
        let proxy = ReverseProxy::new(
            ProxyTarget::parse("http://127.0.0.1:9").unwrap(),
            &UpstreamConfig::default(),
        );
        Server::new(addrs, manager, challenges, proxy, AccessLogger::tracing())
    }

    #[tokio::test]
    async fn test_binds_all_listeners() {
        let dir = tempdir().unwrap();
        let bound = server(addrs(loopback(), loopback(), loopback()), dir.path())
            .bind()
            .await
            .unwrap();

        assert_eq!(bound.http_addrs().len(), 2);
        assert_eq!(bound.https_addrs().len(), 2);
        assert!(bound.https_addrs().iter().all(|a| a.port() != 0));
    }

    #[tokio::test]
    async fn test_one_challenge_listener_may_fail() {
        let dir = tempdir().unwrap();
        let taken = TcpListener::bind(loopback()).await.unwrap();
        let taken_addr = taken.local_addr().unwrap();

        let bound = server(addrs(taken_addr, loopback(), loopback()), dir.path())
            .bind()
            .await
            .unwrap();
        assert_eq!(bound.http_addrs().len(), 1);
    }

    #[tokio::test]
    async fn test_both_challenge_listeners_failing_is_fatal() {
        let dir = tempdir().unwrap();
        let taken = TcpListener::bind(loopback()).await.unwrap();
        let taken_addr = taken.local_addr().unwrap();

        let result = server(addrs(taken_addr, taken_addr, loopback()), dir.path())
            .bind()
            .await;
        assert!(matches!(result, Err(ProxyError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_https_bind_failure_is_fatal() {
        let dir = tempdir().unwrap();
        let taken = TcpListener::bind(loopback()).await.unwrap();
        let taken_addr = taken.local_addr().unwrap();

        let result = server(addrs(loopback(), loopback(), taken_addr), dir.path())
            .bind()
            .await;
        assert!(matches!(
            result,
            Err(ProxyError::Bind { name: "https", .. })
        ));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = tempdir().unwrap();
        let bound = server(addrs(loopback(), loopback(), loopback()), dir.path())
            .bind()
            .await
            .unwrap();
        let https = bound.https_addrs()[0];

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(bound.run(async move {
            let _ = rx.await;
        }));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tokio::net::TcpStream::connect(https).await.is_ok());

        tx.send(()).unwrap();
        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }
}
