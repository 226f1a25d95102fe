//! Identity and certificate storage
//!
//! Both stores live in the shared key-value backend.
//!
//! # Key Layout
//!
//! ```text
//! <account key>                       # serialized IdentityRecord (JSON)
//! <cert prefix>/
//! ├── example.com-cert.pem            # certificate chain (leaf first)
//! ├── example.com-key.pem             # private key
//! ├── api.example.com-cert.pem
//! └── api.example.com-key.pem
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, trace, warn};
use x509_parser::pem::parse_x509_pem;

use super::error::StorageError;
use crate::identity::IdentityRecord;
use crate::kv::KeyValueStore;

/// Suffix of certificate chain entries
pub const CERT_SUFFIX: &str = "-cert.pem";

/// Suffix of private key entries
pub const KEY_SUFFIX: &str = "-key.pem";

/// Parse the `NotAfter` time of the first certificate in a PEM bundle
pub fn parse_expiry(bundle: &[u8]) -> Result<DateTime<Utc>, StorageError> {
    let (_, pem) = parse_x509_pem(bundle)
        .map_err(|e| StorageError::Certificate(format!("failed to parse PEM: {e}")))?;

    let cert = pem
        .parse_x509()
        .map_err(|e| StorageError::Certificate(format!("failed to parse X.509 certificate: {e}")))?;

    let not_after = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(not_after, 0)
        .ok_or_else(|| StorageError::Certificate(format!("NotAfter out of range: {not_after}")))
}

// =========================================================================
// Identity
// =========================================================================

/// Durable home of the single account identity
pub struct IdentityStore {
    kv: Arc<dyn KeyValueStore>,
    key: String,
}

impl IdentityStore {
    /// Create a store keeping the identity under `key`
    pub fn new(kv: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            kv,
            key: key.into(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Load the stored identity, if any
    pub async fn load(&self) -> Result<Option<IdentityRecord>, StorageError> {
        let Some(bytes) = self.kv.get(&self.key).await? else {
            trace!(key = %self.key, "No stored account identity found");
            return Ok(None);
        };

        let identity = IdentityRecord::decode(&bytes)?;
        debug!(
            key = %self.key,
            email = %identity.email(),
            registered = identity.is_registered(),
            "Loaded account identity"
        );
        Ok(Some(identity))
    }

    /// Persist the identity, replacing any previous one
    pub async fn save(&self, identity: &IdentityRecord) -> Result<(), StorageError> {
        let bytes = identity.encode()?;
        self.kv.put(&self.key, &bytes).await?;

        info!(
            key = %self.key,
            email = %identity.email(),
            registered = identity.is_registered(),
            "Saved account identity"
        );
        Ok(())
    }

    /// Load the identity for `email`, creating and saving a fresh one when
    /// none is stored or the stored one belongs to another email
    pub async fn load_or_create(&self, email: &str) -> Result<IdentityRecord, StorageError> {
        match self.load().await? {
            Some(identity) if identity.email() == email => Ok(identity),
            stored => {
                if let Some(previous) = stored {
                    info!(
                        previous = %previous.email(),
                        email = %email,
                        "Configured email changed, replacing account identity"
                    );
                } else {
                    info!(email = %email, "Creating new account identity");
                }

                let identity = IdentityRecord::generate(email)?;
                self.save(&identity).await?;
                Ok(identity)
            }
        }
    }
}

impl std::fmt::Debug for IdentityStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityStore").field("key", &self.key).finish()
    }
}

// =========================================================================
// Certificates
// =========================================================================

/// Certificate storage keyed by domain
pub struct CertificateStore {
    kv: Arc<dyn KeyValueStore>,
    prefix: String,
}

impl CertificateStore {
    /// Create a store under `prefix`; a trailing `/` is added when missing
    pub fn new(kv: Arc<dyn KeyValueStore>, prefix: &str) -> Self {
        let prefix = if prefix.ends_with('/') {
            prefix.to_string()
        } else {
            format!("{prefix}/")
        };
        Self { kv, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Key of a domain's certificate chain
    pub fn cert_key(&self, domain: &str) -> String {
        format!("{}{}{}", self.prefix, domain, CERT_SUFFIX)
    }

    /// Key of a domain's private key
    pub fn key_key(&self, domain: &str) -> String {
        format!("{}{}{}", self.prefix, domain, KEY_SUFFIX)
    }

    /// Expiry of every stored certificate
    ///
    /// Entries that cannot be parsed are logged and left out.
    pub async fn list_expiries(&self) -> Result<HashMap<String, DateTime<Utc>>, StorageError> {
        let entries = self.kv.list(&self.prefix).await?;
        let mut expiries = HashMap::new();

        for entry in entries {
            let Some(domain) = entry
                .key
                .strip_prefix(&self.prefix)
                .and_then(|name| name.strip_suffix(CERT_SUFFIX))
                .filter(|name| !name.is_empty())
            else {
                continue;
            };

            match parse_expiry(&entry.value) {
                Ok(expires) => {
                    trace!(domain = %domain, expires = %expires, "Found stored certificate");
                    expiries.insert(domain.to_string(), expires);
                }
                Err(e) => {
                    warn!(
                        key = %entry.key,
                        error = %e,
                        "Skipping unreadable stored certificate"
                    );
                }
            }
        }

        debug!(certificates = expiries.len(), "Listed stored certificates");
        Ok(expiries)
    }

    /// Store a domain's private key and certificate chain
    ///
    /// Both entries go through one batched write, which is atomic on backends
    /// with transactions.
    pub async fn put(
        &self,
        domain: &str,
        private_key: &[u8],
        bundle: &[u8],
    ) -> Result<(), StorageError> {
        let key_key = self.key_key(domain);
        let cert_key = self.cert_key(domain);

        self.kv
            .put_many(&[(key_key.as_str(), private_key), (cert_key.as_str(), bundle)])
            .await?;

        info!(domain = %domain, "Saved certificate to storage");
        Ok(())
    }
}

impl std::fmt::Debug for CertificateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateStore")
            .field("prefix", &self.prefix)
            .finish()
    }
}
