//! Reconcile demanded domains against stored certificates
//!
//! A reconcile pass takes one snapshot of stored expiries, then decides for
//! every demanded domain whether a certificate must be issued. Issuance
//! failures stay with their domain; the rest of the pass carries on.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::acme::{AcmeError, CertificateAuthority, CertificateStore, StorageError};
use crate::domains::DomainSet;
use crate::kv::KvError;

/// Errors that abort a whole reconcile pass
#[derive(Error, Debug)]
pub enum ReconcileError {
    #[error("failed to list catalog services: {0}")]
    Catalog(#[from] KvError),

    #[error("failed to list stored certificates: {0}")]
    Snapshot(#[source] StorageError),
}

/// Outcome of one reconcile pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    /// Domains that received a new certificate
    pub issued: Vec<String>,
    /// Domains whose issuance failed, with the reason
    pub failed: Vec<(String, String)>,
    /// Domains whose stored certificate is still fresh
    pub up_to_date: Vec<String>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.issued.len() + self.failed.len() + self.up_to_date.len()
    }
}

/// Decide whether a certificate must be (re)issued
///
/// A missing certificate always needs issuance; a stored one needs it once
/// fewer than `threshold` remain before it expires.
pub fn needs_issuance(
    expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    threshold: chrono::Duration,
) -> bool {
    match expiry {
        None => true,
        Some(expires) => expires - now < threshold,
    }
}

/// Drives certificate issuance for demanded domains
pub struct ReconcileEngine {
    authority: Arc<dyn CertificateAuthority>,
    certificates: CertificateStore,
    renewal_threshold: chrono::Duration,
    issue_timeout: Duration,
    pass_lock: Mutex<()>,
}

impl ReconcileEngine {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        certificates: CertificateStore,
        renewal_threshold: Duration,
        issue_timeout: Duration,
    ) -> Self {
        Self {
            authority,
            certificates,
            renewal_threshold: chrono::Duration::from_std(renewal_threshold)
                .unwrap_or(chrono::Duration::MAX),
            issue_timeout,
            pass_lock: Mutex::new(()),
        }
    }

    pub fn certificates(&self) -> &CertificateStore {
        &self.certificates
    }

    pub fn renewal_threshold(&self) -> chrono::Duration {
        self.renewal_threshold
    }

    /// Run one reconcile pass over `domains`
    ///
    /// Passes are serialized: a pass waiting for the lock sees every write of
    /// the pass before it.
    pub async fn reconcile(&self, domains: &DomainSet) -> Result<ReconcileReport, ReconcileError> {
        let _pass = self.pass_lock.lock().await;
        let start = Instant::now();

        let expiries = self
            .certificates
            .list_expiries()
            .await
            .map_err(ReconcileError::Snapshot)?;

        let mut report = ReconcileReport::default();

        for domain in domains {
            let expiry = expiries.get(domain).copied();

            if !needs_issuance(expiry, Utc::now(), self.renewal_threshold) {
                debug!(domain = %domain, expires = ?expiry, "Certificate is still valid");
                report.up_to_date.push(domain.clone());
                continue;
            }

            match expiry {
                Some(expires) => info!(domain = %domain, expires = %expires, "Certificate needs renewal"),
                None => info!(domain = %domain, "No certificate stored, issuing"),
            }

            match self.issue(domain).await {
                Ok(()) => report.issued.push(domain.clone()),
                Err(e) => {
                    error!(domain = %domain, error = %e, "Certificate issuance failed");
                    report.failed.push((domain.clone(), e.to_string()));
                }
            }
        }

        info!(
            demanded = domains.len(),
            issued = report.issued.len(),
            failed = report.failed.len(),
            up_to_date = report.up_to_date.len(),
            elapsed_ms = start.elapsed().as_millis(),
            "Reconcile pass completed"
        );
        Ok(report)
    }

    /// Obtain and store a certificate for exactly one domain
    pub async fn issue(&self, domain: &str) -> Result<(), AcmeError> {
        let start = Instant::now();

        let issued = match tokio::time::timeout(self.issue_timeout, self.authority.obtain(domain))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                warn!(
                    domain = %domain,
                    timeout_secs = self.issue_timeout.as_secs(),
                    "Certificate authority exchange timed out"
                );
                return Err(AcmeError::Timeout {
                    domain: domain.to_string(),
                    stage: "issuance",
                    elapsed: start.elapsed(),
                });
            }
        };

        self.certificates
            .put(domain, &issued.private_key_pem, &issued.certificate_pem)
            .await?;

        debug!(
            domain = %domain,
            elapsed_ms = start.elapsed().as_millis(),
            "Issued and stored certificate"
        );
        Ok(())
    }
}

impl std::fmt::Debug for ReconcileEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcileEngine")
            .field("certificates", &self.certificates)
            .field("renewal_threshold", &self.renewal_threshold)
            .field("issue_timeout", &self.issue_timeout)
            .finish()
    }
}
