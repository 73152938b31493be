//! On-disk certificate cache
//!
//! One file per domain plus the ACME account credentials:
//!
//! ```text
//! certs/
//! ├── account.json          # ACME account credentials
//! └── example.com.pem       # Private key (PKCS#8), then the chain, leaf first
//! ```
//!
//! Key and chain share a file so a replacement lands in a single rename.

use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace};

use crate::error::{ProxyError, StoreError};

const BUNDLE_EXTENSION: &str = "pem";
const ACCOUNT_FILE: &str = "account.json";

/// A certificate chain and its private key for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRecord {
    /// Domain the certificate was issued for
    pub domain: String,
    /// PEM-encoded certificate chain
    pub cert_pem: String,
    /// PEM-encoded private key
    pub key_pem: String,
    /// Start of the leaf certificate's validity
    pub not_before: DateTime<Utc>,
    /// End of the leaf certificate's validity
    pub not_after: DateTime<Utc>,
}

impl CertificateRecord {
    /// Build a record from PEM material, reading validity from the leaf certificate
    ///
    /// Fails when the private key does not belong to the leaf.
    pub fn from_pem(
        domain: &str,
        cert_pem: String,
        key_pem: String,
    ) -> crate::error::Result<Self> {
        let (not_before, not_after) = parse_validity(&cert_pem)?;
        check_key_matches(&cert_pem, &key_pem)?;
        Ok(Self {
            domain: domain.to_string(),
            cert_pem,
            key_pem,
            not_before,
            not_after,
        })
    }

    /// True once `now` is past the end of validity
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.not_after
    }

    /// Validity left at `now`, negative once expired
    pub fn remaining_at(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.not_after - now
    }
}

/// Extract (not_before, not_after) from the first certificate in a PEM chain
pub fn parse_validity(cert_pem: &str) -> crate::error::Result<(DateTime<Utc>, DateTime<Utc>)> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("Failed to parse PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate: {}", e)))?;

    let validity = cert.validity();
    let not_before = DateTime::from_timestamp(validity.not_before.timestamp(), 0)
        .ok_or_else(|| ProxyError::Tls("Invalid not-before timestamp".to_string()))?;
    let not_after = DateTime::from_timestamp(validity.not_after.timestamp(), 0)
        .ok_or_else(|| ProxyError::Tls("Invalid not-after timestamp".to_string()))?;

    Ok((not_before, not_after))
}

fn check_key_matches(cert_pem: &str, key_pem: &str) -> crate::error::Result<()> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| ProxyError::Tls(format!("Failed to parse PEM: {}", e)))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| ProxyError::Tls(format!("Failed to parse certificate: {}", e)))?;
    let key = rcgen::KeyPair::from_pem(key_pem)
        .map_err(|e| ProxyError::Tls(format!("Failed to parse private key: {}", e)))?;

    if cert.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
        return Err(ProxyError::Tls(
            "Private key does not match the certificate".to_string(),
        ));
    }
    Ok(())
}

/// Split a bundle into (key, chain); the key block comes first
fn split_bundle(contents: &str) -> Option<(&str, &str)> {
    let end = contents.find("-----END ")?;
    let line_end = contents[end..]
        .find('\n')
        .map_or(contents.len(), |i| end + i + 1);
    if !contents[end..line_end].contains("PRIVATE KEY-----") {
        return None;
    }
    let (key, chain) = contents.split_at(line_end);
    let chain = chain.trim_start();
    if chain.is_empty() {
        return None;
    }
    Some((key, chain))
}

/// Directory-backed certificate cache
///
/// Reads are safe from any number of tasks. Writes for one domain must be
/// serialized by the caller; the certificate manager is the only writer.
#[derive(Debug, Clone)]
pub struct CertificateStore {
    base_dir: PathBuf,
}

impl CertificateStore {
    /// Create a store rooted at `base_dir`. Directories are created on first write.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Root directory of the cache
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn bundle_path(&self, domain: &str) -> Result<PathBuf, StoreError> {
        if domain.is_empty()
            || domain.starts_with('.')
            || domain.contains(['/', '\\'])
            || domain.contains("..")
        {
            return Err(StoreError::InvalidRecord {
                domain: domain.to_string(),
                reason: "not a valid cache key".to_string(),
            });
        }
        Ok(self
            .base_dir
            .join(format!("{}.{}", domain, BUNDLE_EXTENSION)))
    }

    /// Load the cached certificate for `domain`
    pub fn get(&self, domain: &str) -> Result<CertificateRecord, StoreError> {
        let path = self.bundle_path(domain)?;

        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                trace!(domain = %domain, "No cached certificate");
                return Err(StoreError::NotFound(domain.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        let (key_pem, cert_pem) =
            split_bundle(&contents).ok_or_else(|| StoreError::InvalidRecord {
                domain: domain.to_string(),
                reason: "expected a private key followed by a certificate chain".to_string(),
            })?;

        let record =
            CertificateRecord::from_pem(domain, cert_pem.to_string(), key_pem.to_string())
                .map_err(|e| StoreError::InvalidRecord {
                    domain: domain.to_string(),
                    reason: e.to_string(),
                })?;

        debug!(
            domain = %domain,
            not_after = %record.not_after,
            "Loaded cached certificate"
        );
        Ok(record)
    }

    /// Persist the certificate for `domain`, replacing any previous one
    ///
    /// On failure the previous certificate, if any, is left untouched.
    pub fn put(&self, domain: &str, record: &CertificateRecord) -> Result<(), StoreError> {
        let path = self.bundle_path(domain)?;
        create_private_dir(&self.base_dir)?;

        let mut bundle = String::with_capacity(record.key_pem.len() + record.cert_pem.len() + 1);
        bundle.push_str(&record.key_pem);
        if !bundle.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push_str(&record.cert_pem);
        write_atomic(&path, bundle.as_bytes(), true)?;

        info!(
            domain = %domain,
            path = %path.display(),
            not_after = %record.not_after,
            "Stored certificate"
        );
        Ok(())
    }

    /// Remove the cached certificate for `domain`
    pub fn delete(&self, domain: &str) -> Result<(), StoreError> {
        let path = self.bundle_path(domain)?;
        match fs::remove_file(&path) {
            Ok(()) => {
                info!(domain = %domain, "Deleted cached certificate");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(domain.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Load the serialized ACME account credentials, if any
    pub fn load_account(&self) -> Result<Option<String>, StoreError> {
        match fs::read_to_string(self.base_dir.join(ACCOUNT_FILE)) {
            Ok(json) => {
                debug!("Loaded ACME account credentials");
                Ok(Some(json))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Persist the serialized ACME account credentials
    pub fn save_account(&self, json: &str) -> Result<(), StoreError> {
        create_private_dir(&self.base_dir)?;
        write_atomic(&self.base_dir.join(ACCOUNT_FILE), json.as_bytes(), true)?;
        info!("Saved ACME account credentials");
        Ok(())
    }
}

fn create_private_dir(path: &Path) -> Result<(), StoreError> {
    fs::create_dir_all(path).map_err(|source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o700)).map_err(|source| {
            StoreError::Write {
                path: path.to_path_buf(),
                source,
            }
        })?;
    }

    Ok(())
}

/// Write to a sibling temp file, then rename over the target
fn write_atomic(path: &Path, contents: &[u8], private: bool) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    let to_write_error = |source| StoreError::Write {
        path: path.to_path_buf(),
        source,
    };

    fs::write(&tmp, contents).map_err(to_write_error)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if private {
            fs::set_permissions(&tmp, fs::Permissions::from_mode(0o600))
                .map_err(to_write_error)?;
        }
    }
    #[cfg(not(unix))]
    let _ = private;

    fs::rename(&tmp, path).map_err(to_write_error)
}
