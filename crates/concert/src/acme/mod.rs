//! ACME certificate management
//!
//! # Architecture
//!
//! - [`AcmeClient`] - Wrapper around `instant-acme` implementing
//!   [`CertificateAuthority`] with DNS-01 challenges
//! - [`ChallengeProvider`] - Publishes `_acme-challenge` TXT records
//! - [`IdentityStore`] - Durable account identity in the key-value backend
//! - [`CertificateStore`] - Issued keys and chains in the key-value backend
//!
//! # Challenge Flow
//!
//! 1. [`AcmeClient`] creates a single-domain order
//! 2. The configured [`ChallengeProvider`] publishes the TXT record
//! 3. [`PropagationCheck`] optionally waits for the record to resolve
//! 4. The CA validates, the order is finalized with a fresh key and CSR
//! 5. [`ChallengeSession`] withdraws the records, also when the order times out
//! 6. [`CertificateStore`] persists key and chain together

mod challenge;
mod client;
mod error;
mod storage;

pub use challenge::{
    provider_by_name, ChallengeProvider, ChallengeSession, Dns01Record, ExecProvider,
    ManualProvider, PropagationCheck, DNS01_LABEL, EXEC_PATH_ENV,
};
pub use client::{
    order_budget, AcmeClient, CertificateAuthority, Enrollment, IssuedCertificate,
    CLEANUP_MARGIN, DEFAULT_ORDER_TIMEOUT,
};
pub use error::{AcmeError, StorageError};
pub use storage::{parse_expiry, CertificateStore, IdentityStore, CERT_SUFFIX, KEY_SUFFIX};
