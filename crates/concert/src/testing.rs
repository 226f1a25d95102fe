//! Helpers shared by unit tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rcgen::{CertificateParams, KeyPair};

use crate::acme::{
    AcmeError, CertificateAuthority, ChallengeProvider, Dns01Record, Enrollment,
    IssuedCertificate,
};
use crate::identity::{AccountKey, IdentityRecord, Registration};

/// A self-signed certificate and its key
pub(crate) struct MintedCertificate {
    pub key_pem: String,
    pub cert_pem: String,
    pub not_after: DateTime<Utc>,
}

/// Self-sign a certificate for `domain` expiring `valid_for` from now
pub(crate) fn mint_certificate(domain: &str, valid_for: time::Duration) -> MintedCertificate {
    let key_pair = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
    let not_after = time::OffsetDateTime::now_utc() + valid_for;
    params.not_before = not_after - time::Duration::days(365);
    params.not_after = not_after;
    let cert = params.self_signed(&key_pair).unwrap();

    MintedCertificate {
        key_pem: key_pair.serialize_pem(),
        cert_pem: cert.pem(),
        not_after: DateTime::from_timestamp(not_after.unix_timestamp(), 0).unwrap(),
    }
}

/// Certificate authority double that self-signs certificates
pub(crate) struct FakeAuthority {
    validity: time::Duration,
    delay: Duration,
    failing: HashSet<String>,
    attempts: Mutex<Vec<String>>,
    registrations: AtomicUsize,
    fail_registration: bool,
    account_key: AccountKey,
}

impl FakeAuthority {
    pub fn new() -> Self {
        Self {
            validity: time::Duration::days(90),
            delay: Duration::ZERO,
            failing: HashSet::new(),
            attempts: Mutex::new(Vec::new()),
            registrations: AtomicUsize::new(0),
            fail_registration: false,
            account_key: AccountKey::generate().unwrap(),
        }
    }

    pub fn failing_for(mut self, domain: &str) -> Self {
        self.failing.insert(domain.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn rejecting_registration(mut self) -> Self {
        self.fail_registration = true;
        self
    }

    /// Domains passed to `obtain`, in call order
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().clone()
    }

    pub fn registrations(&self) -> usize {
        self.registrations.load(Ordering::SeqCst)
    }

    /// Key every account of this authority is registered with
    pub fn account_key(&self) -> &AccountKey {
        &self.account_key
    }
}

#[async_trait]
impl CertificateAuthority for FakeAuthority {
    async fn register(&self, identity: &IdentityRecord) -> Result<Enrollment, AcmeError> {
        if self.fail_registration {
            return Err(AcmeError::Rejected("terms of service not accepted".to_string()));
        }
        let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Enrollment {
            registration: Registration {
                uri: format!("https://ca.test/acct/{n}"),
                body: serde_json::json!({ "contact": [format!("mailto:{}", identity.email())] }),
                credentials: None,
            },
            account_key: self.account_key.clone(),
        })
    }

    async fn resume(&self, identity: &IdentityRecord) -> Result<(), AcmeError> {
        if identity.key() != &self.account_key {
            return Err(AcmeError::Credentials("unknown account key".to_string()));
        }
        Ok(())
    }

    async fn obtain(&self, domain: &str) -> Result<IssuedCertificate, AcmeError> {
        self.attempts.lock().push(domain.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.failing.contains(domain) {
            return Err(AcmeError::Rejected(format!("rate limited: {domain}")));
        }

        let minted = mint_certificate(domain, self.validity);
        Ok(IssuedCertificate {
            domain: domain.to_string(),
            private_key_pem: minted.key_pem.into_bytes(),
            certificate_pem: minted.cert_pem.into_bytes(),
        })
    }
}

/// Challenge provider double that records published and withdrawn records
#[derive(Debug, Default)]
pub(crate) struct RecordingProvider {
    present_delay: Duration,
    presented: Mutex<Vec<String>>,
    withdrawn: Mutex<Vec<String>>,
}

impl RecordingProvider {
    /// Provider whose `present` takes `delay` to return
    pub fn stalling(delay: Duration) -> Self {
        Self {
            present_delay: delay,
            ..Default::default()
        }
    }

    pub fn presented(&self) -> Vec<String> {
        self.presented.lock().clone()
    }

    pub fn withdrawn(&self) -> Vec<String> {
        self.withdrawn.lock().clone()
    }
}

#[async_trait]
impl ChallengeProvider for RecordingProvider {
    fn name(&self) -> &'static str {
        "recording"
    }

    async fn present(&self, _domain: &str, record: &Dns01Record) -> Result<(), AcmeError> {
        if !self.present_delay.is_zero() {
            tokio::time::sleep(self.present_delay).await;
        }
        self.presented.lock().push(record.fqdn.clone());
        Ok(())
    }

    async fn cleanup(&self, _domain: &str, record: &Dns01Record) -> Result<(), AcmeError> {
        self.withdrawn.lock().push(record.fqdn.clone());
        Ok(())
    }
}
