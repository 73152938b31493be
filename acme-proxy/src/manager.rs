//! Certificate lifecycle for the whitelisted domain
//!
//! The manager owns the in-memory certificate and is the only writer to the
//! [`CertificateStore`]. Issuance is single-flight: concurrent handshakes
//! that find no usable certificate share one issuance, including its failure.
//!
//! State per domain:
//!
//! ```text
//! Absent -> Pending -> Valid -> Expiring -> Renewing -> Valid
//!              \-> Failed (retried by the first handshake after retry_after)
//! ```

use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use rustls::ServerConfig;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::acme::CertificateIssuer;
use crate::error::{ProxyError, Result};
use crate::store::{CertificateRecord, CertificateStore};
use crate::tls::{certified_key, server_config};

/// Accepts exactly one server name
#[derive(Debug, Clone)]
pub struct HostPolicy {
    domain: Arc<str>,
}

impl HostPolicy {
    /// Whitelist a single domain
    pub fn whitelist(domain: &str) -> Self {
        Self {
            domain: normalize_name(domain).into(),
        }
    }

    /// The whitelisted domain, lowercased
    pub fn domain(&self) -> &str {
        &self.domain
    }

    /// Reject any name other than the whitelisted one
    pub fn check(&self, name: &str) -> Result<()> {
        if !name.is_empty() && normalize_name(name) == *self.domain {
            Ok(())
        } else {
            Err(ProxyError::HostNotAllowed(name.to_string()))
        }
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Certificate state for the whitelisted domain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertState {
    /// No certificate and no issuance attempted yet
    Absent,
    /// First issuance in progress
    Pending,
    /// Certificate served, outside the renewal window
    Valid,
    /// Certificate served, inside the renewal window
    Expiring,
    /// Renewal in progress while the current certificate keeps being served
    Renewing,
    /// Last issuance failed and no usable certificate exists
    Failed,
}

/// Per-handshake certificate lookup
///
/// Injected into the TLS listeners; [`CertificateManager`] is the
/// production implementation.
#[async_trait]
pub trait CertificateResolver: Send + Sync {
    async fn resolve(&self, server_name: &str) -> Result<Arc<ServerConfig>>;
}

/// A persisted certificate together with the TLS config serving it
///
/// The config is built once per certificate so its session cache outlives
/// individual handshakes.
pub struct CachedCertificate {
    pub record: CertificateRecord,
    pub server_config: Arc<ServerConfig>,
}

impl CachedCertificate {
    pub fn new(record: CertificateRecord) -> Result<Self> {
        let key = certified_key(&record)?;
        Ok(Self {
            record,
            server_config: server_config(Arc::new(key)),
        })
    }
}

/// Manager tuning knobs
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Renew when less validity than this remains
    pub renew_before: Duration,
    /// Renewal task period
    pub check_interval: Duration,
    /// Upper bound for one issuance
    pub issuance_timeout: Duration,
    /// After a failed issuance, handshakes fail fast with the same error
    /// for this long instead of starting a new order
    pub retry_after: Duration,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            renew_before: Duration::from_secs(30 * 24 * 60 * 60),
            check_interval: Duration::from_secs(60 * 60),
            issuance_timeout: Duration::from_secs(5 * 60),
            retry_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlightKind {
    Issue,
    Renew,
}

type FlightResult = std::result::Result<Arc<CachedCertificate>, String>;

struct Flight {
    kind: FlightKind,
    outcome: Shared<BoxFuture<'static, FlightResult>>,
}

struct Failure {
    at: Instant,
    message: String,
}

struct Inner {
    policy: HostPolicy,
    store: CertificateStore,
    issuer: Arc<dyn CertificateIssuer>,
    settings: ManagerSettings,
    current: RwLock<Option<Arc<CachedCertificate>>>,
    flight: Mutex<Option<Flight>>,
    last_failure: Mutex<Option<Failure>>,
}

/// Certificate manager for one domain
#[derive(Clone)]
pub struct CertificateManager {
    inner: Arc<Inner>,
}

impl CertificateManager {
    /// Create a new certificate manager
    pub fn new(
        policy: HostPolicy,
        store: CertificateStore,
        issuer: Arc<dyn CertificateIssuer>,
        settings: ManagerSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                policy,
                store,
                issuer,
                settings,
                current: RwLock::new(None),
                flight: Mutex::new(None),
                last_failure: Mutex::new(None),
            }),
        }
    }

    /// Host policy shared with the challenge listeners
    pub fn policy(&self) -> &HostPolicy {
        &self.inner.policy
    }

    /// The whitelisted domain
    pub fn domain(&self) -> &str {
        self.inner.policy.domain()
    }

    /// Currently served certificate, if any
    pub fn current(&self) -> Option<Arc<CachedCertificate>> {
        self.inner.current()
    }

    /// Current lifecycle state
    pub fn state(&self) -> CertState {
        let flight = self
            .inner
            .flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|f| f.kind);

        match flight {
            Some(FlightKind::Issue) => return CertState::Pending,
            Some(FlightKind::Renew) => return CertState::Renewing,
            None => {}
        }

        let now = Utc::now();
        match self.current() {
            Some(cert) if !cert.record.is_expired_at(now) => {
                if self.inner.needs_renewal(&cert) {
                    CertState::Expiring
                } else {
                    CertState::Valid
                }
            }
            _ if self.inner.recent_failure(None).is_some() => CertState::Failed,
            _ => CertState::Absent,
        }
    }

    /// Load a still-valid certificate from the store into memory
    ///
    /// Returns true when a usable certificate was found.
    pub fn load_cached(&self) -> bool {
        self.inner.load_from_store().is_some()
    }

    /// Certificate for the whitelisted domain, issuing one if needed
    ///
    /// A certificate that has not expired is returned without suspension,
    /// even inside the renewal window. Within `retry_after` of a failed
    /// issuance the same failure is returned without a new attempt.
    pub async fn certificate(&self) -> Result<Arc<CachedCertificate>> {
        if let Some(cert) = self.current() {
            if !cert.record.is_expired_at(Utc::now()) {
                return Ok(cert);
            }
            debug!(domain = %self.domain(), "Cached certificate expired");
        }
        if let Some(message) = self.inner.recent_failure(Some(self.inner.settings.retry_after)) {
            debug!(domain = %self.domain(), "Issuance failed recently, not retrying yet");
            return Err(ProxyError::Issuance(message));
        }
        self.join_flight(FlightKind::Issue).await
    }

    /// Renew now if the certificate is inside the renewal window
    ///
    /// Returns true when a renewal happened. A failed renewal leaves the
    /// current certificate in place until it expires.
    pub async fn check_renewal(&self) -> bool {
        let cert = match self.current() {
            Some(cert) => cert,
            None => match self.inner.load_from_store() {
                Some(cert) => cert,
                None => return false,
            },
        };

        if !self.inner.needs_renewal(&cert) {
            debug!(
                domain = %self.domain(),
                not_after = %cert.record.not_after,
                "Certificate does not need renewal"
            );
            return false;
        }

        info!(
            domain = %self.domain(),
            not_after = %cert.record.not_after,
            "Certificate inside renewal window, renewing"
        );
        match self.join_flight(FlightKind::Renew).await {
            Ok(renewed) => {
                info!(
                    domain = %self.domain(),
                    not_after = %renewed.record.not_after,
                    "Certificate renewed"
                );
                true
            }
            Err(e) => {
                warn!(
                    domain = %self.domain(),
                    not_after = %cert.record.not_after,
                    "Certificate renewal failed, keeping current certificate: {}", e
                );
                false
            }
        }
    }

    /// Periodic renewal until `shutdown` flips to true
    pub async fn run_renewal(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            domain = %self.domain(),
            check_interval_secs = self.inner.settings.check_interval.as_secs(),
            "Starting certificate renewal task"
        );

        let mut interval = tokio::time::interval(self.inner.settings.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.check_renewal().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Certificate renewal task stopped");
    }

    /// Start a flight of `kind`, or wait for the one already running
    async fn join_flight(&self, kind: FlightKind) -> Result<Arc<CachedCertificate>> {
        let outcome = {
            let mut slot = self.inner.flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(flight) => {
                    debug!(domain = %self.domain(), "Joining in-flight issuance");
                    flight.outcome.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    // Detached so the issuance completes even if every waiter goes away.
                    let task = tokio::spawn(async move { inner.fly(kind).await });
                    let outcome = async move {
                        task.await
                            .unwrap_or_else(|e| Err(format!("issuance task failed: {}", e)))
                    }
                    .boxed()
                    .shared();

                    *slot = Some(Flight {
                        kind,
                        outcome: outcome.clone(),
                    });
                    outcome
                }
            }
        };

        outcome.await.map_err(ProxyError::Issuance)
    }
}

impl Inner {
    fn current(&self) -> Option<Arc<CachedCertificate>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn publish(&self, cert: Arc<CachedCertificate>) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(cert);
    }

    /// Message of the last failure, if one happened within `window`
    ///
    /// `None` accepts any age.
    fn recent_failure(&self, window: Option<Duration>) -> Option<String> {
        let failure = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
        failure
            .as_ref()
            .filter(|f| window.map_or(true, |w| f.at.elapsed() < w))
            .map(|f| f.message.clone())
    }

    fn needs_renewal(&self, cert: &CachedCertificate) -> bool {
        let renew_before = chrono::Duration::from_std(self.settings.renew_before)
            .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
        cert.record.remaining_at(Utc::now()) < renew_before
    }

    /// Publish the stored certificate if it is still valid
    fn load_from_store(&self) -> Option<Arc<CachedCertificate>> {
        let domain = self.policy.domain();
        let record = match self.store.get(domain) {
            Ok(record) => record,
            Err(e) if e.is_not_found() => return None,
            Err(e) => {
                warn!(domain = %domain, "Ignoring cached certificate: {}", e);
                return None;
            }
        };

        if record.is_expired_at(Utc::now()) {
            info!(
                domain = %domain,
                not_after = %record.not_after,
                "Cached certificate has expired"
            );
            return None;
        }

        match CachedCertificate::new(record) {
            Ok(cert) => {
                let cert = Arc::new(cert);
                info!(
                    domain = %domain,
                    not_after = %cert.record.not_after,
                    "Using cached certificate"
                );
                self.publish(Arc::clone(&cert));
                Some(cert)
            }
            Err(e) => {
                warn!(domain = %domain, "Ignoring unusable cached certificate: {}", e);
                None
            }
        }
    }

    /// Body of one flight; clears the slot when done
    async fn fly(self: Arc<Self>, kind: FlightKind) -> FlightResult {
        let result = self.obtain(kind).await.map_err(|e| e.to_string());

        {
            let mut last_failure = self.last_failure.lock().unwrap_or_else(|e| e.into_inner());
            match &result {
                Ok(_) => *last_failure = None,
                Err(message) => {
                    error!(domain = %self.policy.domain(), "Certificate issuance failed: {}", message);
                    *last_failure = Some(Failure {
                        at: Instant::now(),
                        message: message.clone(),
                    });
                }
            }
        }

        *self.flight.lock().unwrap_or_else(|e| e.into_inner()) = None;
        result
    }

    async fn obtain(&self, kind: FlightKind) -> Result<Arc<CachedCertificate>> {
        let domain = self.policy.domain();

        if kind == FlightKind::Issue {
            if let Some(cert) = self.current() {
                if !cert.record.is_expired_at(Utc::now()) {
                    return Ok(cert);
                }
            }
            if let Some(cert) = self.load_from_store() {
                return Ok(cert);
            }
        }

        info!(domain = %domain, renewal = kind == FlightKind::Renew, "Issuing certificate");

        let issued = tokio::time::timeout(self.settings.issuance_timeout, self.issuer.issue(domain))
            .await
            .map_err(|_| {
                ProxyError::Acme(format!(
                    "Issuance for {} timed out after {:?}",
                    domain, self.settings.issuance_timeout
                ))
            })??;

        let record = CertificateRecord::from_pem(domain, issued.cert_pem, issued.key_pem)?;
        if record.is_expired_at(Utc::now()) {
            return Err(ProxyError::Acme(format!(
                "Issued certificate for {} is already expired",
                domain
            )));
        }
        let cert = CachedCertificate::new(record)?;

        // Persist before serving: an unpersisted certificate is never published.
        self.store.put(domain, &cert.record)?;

        let cert = Arc::new(cert);
        self.publish(Arc::clone(&cert));
        Ok(cert)
    }
}

#[async_trait]
impl CertificateResolver for CertificateManager {
    async fn resolve(&self, server_name: &str) -> Result<Arc<ServerConfig>> {
        self.inner.policy.check(server_name)?;
        let cert = self.certificate().await?;
        Ok(Arc::clone(&cert.server_config))
    }
}
