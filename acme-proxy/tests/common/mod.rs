//! Shared helpers for the end-to-end tests
#![allow(dead_code)]

use acme_proxy::access_log::{AccessLogRecord, MemorySink};
use acme_proxy::acme::{CertificateIssuer, IssuedCertificate, SelfSignedIssuer};
use acme_proxy::challenge::ChallengeStore;
use acme_proxy::config::{ListenAddrs, UpstreamConfig};
use acme_proxy::manager::ManagerSettings;
use acme_proxy::store::CertificateStore;
use acme_proxy::{
    AccessLogger, CertificateManager, HostPolicy, ProxyTarget, ReverseProxy, Result, Server,
};
use async_trait::async_trait;
use axum::Router;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

pub const DOMAIN: &str = "openbsd.app";

/// Local-CA issuer counting how often it was asked for a certificate
pub struct CountingIssuer {
    pub ca: SelfSignedIssuer,
    calls: AtomicUsize,
}

impl CountingIssuer {
    pub fn new() -> Self {
        Self {
            ca: SelfSignedIssuer::new(90).expect("local CA"),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CertificateIssuer for CountingIssuer {
    async fn issue(&self, domain: &str) -> Result<IssuedCertificate> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.ca.sign(domain, 90)
    }
}

/// Upstream answering "ok" on every path
pub async fn start_upstream() -> SocketAddr {
    let app = Router::new().fallback(|| async { "ok" });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Address nothing listens on
pub async fn unused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A running proxy with in-memory access log
pub struct TestProxy {
    pub http_addr: SocketAddr,
    pub https_addr: SocketAddr,
    pub challenges: Arc<ChallengeStore>,
    pub sink: Arc<MemorySink>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<Result<()>>>,
}

impl TestProxy {
    pub async fn start(
        upstream: SocketAddr,
        cert_dir: &Path,
        issuer: Arc<dyn CertificateIssuer>,
    ) -> Self {
        let loopback: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let addrs = ListenAddrs {
            http: loopback,
            http6: loopback,
            https: loopback,
            https6: loopback,
        };

        let challenges = Arc::new(ChallengeStore::new());
        let manager = CertificateManager::new(
            HostPolicy::whitelist(DOMAIN),
            CertificateStore::new(cert_dir),
            issuer,
            ManagerSettings::default(),
        );
        let proxy = ReverseProxy::new(
            ProxyTarget::parse(&format!("http://{}", upstream)).unwrap(),
            &UpstreamConfig::default(),
        );
        let sink = Arc::new(MemorySink::new());
        let logger = AccessLogger::new(sink.clone());

        let bound = Server::new(addrs, manager, challenges.clone(), proxy, logger)
            .bind()
            .await
            .unwrap();
        let http_addr = bound.http_addrs()[0];
        let https_addr = bound.https_addrs()[0];

        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(bound.run(async move {
            let _ = rx.await;
        }));

        Self {
            http_addr,
            https_addr,
            challenges,
            sink,
            shutdown: Some(tx),
            task: Some(task),
        }
    }

    /// HTTPS client trusting `ca_pem` with `name` resolved to this proxy
    pub fn https_client(&self, name: &str, ca_pem: &str) -> reqwest::Client {
        reqwest::Client::builder()
            .use_rustls_tls()
            .add_root_certificate(reqwest::Certificate::from_pem(ca_pem.as_bytes()).unwrap())
            .resolve(name, self.https_addr)
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap()
    }

    pub fn https_url(&self, name: &str, path: &str) -> String {
        format!("https://{}:{}{}", name, self.https_addr.port(), path)
    }

    /// Plain HTTP client for the challenge listener, redirects not followed
    pub fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .resolve(DOMAIN, self.http_addr)
            .build()
            .unwrap()
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}:{}{}", DOMAIN, self.http_addr.port(), path)
    }

    /// Wait until `count` records were emitted, then return them
    pub async fn wait_for_records(&self, count: usize) -> Vec<AccessLogRecord> {
        for _ in 0..100 {
            let records = self.sink.records();
            if records.len() >= count {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        self.sink.records()
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let result = tokio::time::timeout(Duration::from_secs(10), task)
                .await
                .expect("server did not stop")
                .unwrap();
            assert!(result.is_ok());
        }
    }
}
