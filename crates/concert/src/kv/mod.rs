//! Key-value and service catalog backends.
//!
//! The reconciler needs two capabilities from its environment: a flat
//! key-value store for durable state, and a service catalog it can list and
//! watch. Both are traits so the engine can run against Consul in production
//! and against [`MemoryBackend`] in tests or embedded setups.

mod consul;
mod memory;

pub use consul::ConsulClient;
pub use memory::MemoryBackend;

use std::collections::BTreeMap;

use async_trait::async_trait;
use thiserror::Error;

/// Services in the catalog, mapped to their tags
pub type ServiceMap = BTreeMap<String, Vec<String>>;

/// A single stored entry returned by a prefix listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KvPair {
    pub key: String,
    pub value: Vec<u8>,
}

/// Catalog snapshot delivered by a watch, tagged with its change index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogUpdate {
    /// Monotonic change index; a different value means the catalog changed
    pub index: u64,
    pub services: ServiceMap,
}

/// Backend errors
#[derive(Error, Debug)]
pub enum KvError {
    #[error("invalid backend address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("invalid key {0:?}")]
    InvalidKey(String),

    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected status {status} from {path}: {body}")]
    Status {
        status: u16,
        path: String,
        body: String,
    },

    #[error("malformed response: {0}")]
    Decode(String),

    #[error("write rejected for key {0}")]
    Rejected(String),

    #[error("transaction rolled back: {0}")]
    Transaction(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

/// Durable flat key-value storage.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Fetch a value; `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError>;

    /// Write a value, replacing any previous one.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError>;

    /// All entries whose key starts with `prefix`.
    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, KvError>;

    /// Write several entries.
    ///
    /// Backends with transactions apply all entries atomically. The default
    /// writes them one after another, so readers may observe a prefix of the
    /// batch if a later write fails.
    async fn put_many(&self, entries: &[(&str, &[u8])]) -> Result<(), KvError> {
        for (key, value) in entries {
            self.put(key, value).await?;
        }
        Ok(())
    }
}

/// Service discovery catalog.
#[async_trait]
pub trait ServiceCatalog: Send + Sync {
    /// Current services and their tags.
    async fn list_services(&self) -> Result<ServiceMap, KvError>;

    /// Block until the catalog index differs from `last_index`, then return
    /// the new snapshot.
    ///
    /// Implementations may return early with an unchanged index (for example
    /// when a long-poll times out); callers compare indexes to detect change.
    async fn watch_services(&self, last_index: u64) -> Result<CatalogUpdate, KvError>;
}
