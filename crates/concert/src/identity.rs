//! Certificate authority account identity
//!
//! An [`IdentityRecord`] is the operator's account with the CA: the contact
//! email, the account keypair, and the registration handle returned by the CA
//! once the account has been registered.
//!
//! # Stored format
//!
//! ```json
//! {
//!   "Email": "ops@example.com",
//!   "Registration": { "uri": "https://ca/acct/1", "body": {}, "credentials": {} },
//!   "KeyType": "ecdsa",
//!   "Key": "<base64 PKCS#8 DER>"
//! }
//! ```

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rcgen::{KeyPair, PublicKeyData, SignatureAlgorithm, PKCS_ECDSA_P256_SHA256, PKCS_RSA_SHA256};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identity encoding errors
#[derive(Error, Debug)]
pub enum IdentityError {
    #[error("failed to generate account key: {0}")]
    KeyGeneration(#[source] rcgen::Error),

    #[error("unknown account key type {0:?}")]
    UnknownKeyType(String),

    #[error("invalid {kind} account key: {reason}")]
    InvalidKey { kind: KeyKind, reason: String },

    #[error("malformed identity record: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid account key encoding: {0}")]
    Encoding(#[from] base64::DecodeError),
}

/// Algorithm family of an account key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Ecdsa,
    Rsa,
}

impl KeyKind {
    /// Tag written to the stored record
    pub fn tag(self) -> &'static str {
        match self {
            KeyKind::Ecdsa => "ecdsa",
            KeyKind::Rsa => "rsa",
        }
    }

    /// Parse a stored tag
    pub fn from_tag(tag: &str) -> Result<Self, IdentityError> {
        match tag {
            "ecdsa" => Ok(KeyKind::Ecdsa),
            "rsa" => Ok(KeyKind::Rsa),
            other => Err(IdentityError::UnknownKeyType(other.to_string())),
        }
    }

    fn algorithm(self) -> &'static SignatureAlgorithm {
        match self {
            KeyKind::Ecdsa => &PKCS_ECDSA_P256_SHA256,
            KeyKind::Rsa => &PKCS_RSA_SHA256,
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// Account private key, held as PKCS#8 DER
#[derive(Clone, PartialEq, Eq)]
pub struct AccountKey {
    kind: KeyKind,
    pkcs8: Vec<u8>,
}

impl AccountKey {
    /// Generate a fresh ECDSA P-256 key
    pub fn generate() -> Result<Self, IdentityError> {
        let key_pair =
            KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).map_err(IdentityError::KeyGeneration)?;
        Ok(Self {
            kind: KeyKind::Ecdsa,
            pkcs8: key_pair.serialize_der(),
        })
    }

    /// Decode key bytes, checking they hold a key of the tagged kind
    pub fn decode(kind: KeyKind, der: &[u8]) -> Result<Self, IdentityError> {
        let key_pair = KeyPair::try_from(der).map_err(|e| IdentityError::InvalidKey {
            kind,
            reason: e.to_string(),
        })?;

        if key_pair.algorithm() != kind.algorithm() {
            return Err(IdentityError::InvalidKey {
                kind,
                reason: "key material does not match the stored key type".to_string(),
            });
        }

        Ok(Self {
            kind,
            pkcs8: der.to_vec(),
        })
    }

    pub fn kind(&self) -> KeyKind {
        self.kind
    }

    /// PKCS#8 DER encoding of the private key
    pub fn pkcs8_der(&self) -> &[u8] {
        &self.pkcs8
    }

    /// DER encoding of the public half
    pub fn public_key_der(&self) -> Result<Vec<u8>, IdentityError> {
        let key_pair = KeyPair::try_from(self.pkcs8.as_slice()).map_err(|e| {
            IdentityError::InvalidKey {
                kind: self.kind,
                reason: e.to_string(),
            }
        })?;
        Ok(key_pair.subject_public_key_info())
    }
}

impl std::fmt::Debug for AccountKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountKey")
            .field("kind", &self.kind)
            .field("pkcs8", &"<redacted>")
            .finish()
    }
}

/// Registration handle returned by the certificate authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    /// Account URL at the CA
    pub uri: String,
    /// Account resource as returned by the CA
    #[serde(default)]
    pub body: serde_json::Value,
    /// Client-specific credentials needed to resume the account
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<serde_json::Value>,
}

/// The operator's account with the certificate authority
#[derive(Debug, PartialEq)]
pub struct IdentityRecord {
    email: String,
    key: AccountKey,
    registration: Option<Registration>,
}

#[derive(Serialize, Deserialize)]
struct StoredIdentity {
    #[serde(rename = "Email")]
    email: String,
    #[serde(rename = "Registration", default)]
    registration: Option<Registration>,
    #[serde(rename = "KeyType")]
    key_type: String,
    #[serde(rename = "Key")]
    key: String,
}

impl IdentityRecord {
    /// Create an unregistered identity with a fresh key
    pub fn generate(email: &str) -> Result<Self, IdentityError> {
        Ok(Self {
            email: email.to_string(),
            key: AccountKey::generate()?,
            registration: None,
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn key(&self) -> &AccountKey {
        &self.key
    }

    pub fn registration(&self) -> Option<&Registration> {
        self.registration.as_ref()
    }

    pub fn is_registered(&self) -> bool {
        self.registration.is_some()
    }

    /// Attach the handle returned by a successful registration
    ///
    /// `key` is the key the authority registered the account with and
    /// replaces the record's key.
    pub fn attach_registration(&mut self, registration: Registration, key: AccountKey) {
        self.registration = Some(registration);
        self.key = key;
    }

    /// Serialize for storage
    pub fn encode(&self) -> Result<Vec<u8>, IdentityError> {
        let stored = StoredIdentity {
            email: self.email.clone(),
            registration: self.registration.clone(),
            key_type: self.key.kind.tag().to_string(),
            key: BASE64.encode(&self.key.pkcs8),
        };
        Ok(serde_json::to_vec(&stored)?)
    }

    /// Deserialize a stored record
    pub fn decode(bytes: &[u8]) -> Result<Self, IdentityError> {
        let stored: StoredIdentity = serde_json::from_slice(bytes)?;
        let kind = KeyKind::from_tag(&stored.key_type)?;
        let der = BASE64.decode(stored.key.as_bytes())?;

        Ok(Self {
            email: stored.email,
            key: AccountKey::decode(kind, &der)?,
            registration: stored.registration,
        })
    }
}
