//! ACME and storage error types.

use std::time::Duration;

use thiserror::Error;

use crate::identity::IdentityError;
use crate::kv::KvError;

/// Errors from the identity and certificate stores
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("key-value backend error: {0}")]
    Kv(#[from] KvError),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("invalid certificate: {0}")]
    Certificate(String),
}

/// Errors from the certificate authority exchange
#[derive(Error, Debug)]
pub enum AcmeError {
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),

    #[error("account is not registered with the certificate authority")]
    NotRegistered,

    #[error("invalid account credentials: {0}")]
    Credentials(String),

    #[error("no DNS-01 challenge offered for {0}")]
    NoDnsChallenge(String),

    #[error("order for {domain} became invalid: {reason}")]
    OrderInvalid { domain: String, reason: String },

    #[error("timed out after {elapsed:?} waiting for {stage} of {domain}")]
    Timeout {
        domain: String,
        stage: &'static str,
        elapsed: Duration,
    },

    #[error("challenge provider error: {0}")]
    Challenge(String),

    #[error("unknown challenge provider {0:?}")]
    UnknownProvider(String),

    #[error("failed to generate certificate key or CSR: {0}")]
    Csr(#[from] rcgen::Error),

    #[error("certificate authority rejected the request: {0}")]
    Rejected(String),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}
