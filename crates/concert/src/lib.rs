//! Concert keeps ACME certificates valid for domains advertised in the
//! Consul catalog.
//!
//! Services ask for a certificate by carrying a `concert-<domain>` tag.
//! Every reconcile pass compares the demanded domains with the certificates
//! stored under a Consul KV prefix and issues new ones through an ACME
//! certificate authority when a certificate is missing or about to expire.
//!
//! # Modules
//!
//! - [`kv`] - Key-value and catalog backends (Consul, in-memory)
//! - [`identity`] - ACME account identity record
//! - [`domains`] - Domain selection from catalog tags
//! - [`acme`] - Certificate authority client, challenges, storage
//! - [`reconcile`] - Reconcile engine
//! - [`scheduler`] - Periodic and catalog-watch triggers
//! - [`app`] - Application wiring

pub mod acme;
pub mod app;
pub mod domains;
pub mod identity;
pub mod kv;
pub mod reconcile;
pub mod scheduler;
pub mod signals;

#[cfg(test)]
mod testing;

pub use app::{ensure_registered, Concert, StartupError};
pub use domains::{select_domains, select_from_catalog, DomainSet, TAG_PREFIX};
pub use reconcile::{needs_issuance, ReconcileEngine, ReconcileError, ReconcileReport};
pub use scheduler::{ReconcileScheduler, Trigger};
