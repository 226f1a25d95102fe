//! In-memory backend implementing both the key-value store and the catalog.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{debug, trace};

use super::{CatalogUpdate, KeyValueStore, KvError, KvPair, ServiceCatalog, ServiceMap};

/// In-process backend.
///
/// Batched writes are applied under a single lock, and catalog changes are
/// pushed to watchers through a `tokio::sync::watch` channel. Setting the
/// backend offline makes every call fail, which mimics a lost agent
/// connection.
pub struct MemoryBackend {
    entries: RwLock<BTreeMap<String, Vec<u8>>>,
    catalog: watch::Sender<CatalogUpdate>,
    offline: AtomicBool,
}

impl MemoryBackend {
    /// Create an empty backend with an empty catalog at index 1
    pub fn new() -> Self {
        let (catalog, _) = watch::channel(CatalogUpdate {
            index: 1,
            services: ServiceMap::new(),
        });
        Self {
            entries: RwLock::new(BTreeMap::new()),
            catalog,
            offline: AtomicBool::new(false),
        }
    }

    /// Replace the catalog contents and bump its index
    pub fn set_services(&self, services: ServiceMap) {
        self.catalog.send_modify(|update| {
            update.index += 1;
            update.services = services;
            debug!(
                index = update.index,
                services = update.services.len(),
                "Catalog updated"
            );
        });
    }

    /// Add or replace one service's tags
    pub fn register_service(&self, name: &str, tags: &[&str]) {
        let mut services = self.catalog.borrow().services.clone();
        services.insert(
            name.to_string(),
            tags.iter().map(|t| t.to_string()).collect(),
        );
        self.set_services(services);
    }

    /// Replace the catalog at an explicit index, as a restored agent would
    pub fn restore_catalog(&self, index: u64, services: ServiceMap) {
        self.catalog.send_modify(|update| {
            debug!(from = update.index, to = index, "Catalog restored");
            update.index = index;
            update.services = services;
        });
    }

    /// Current catalog index
    pub fn catalog_index(&self) -> u64 {
        self.catalog.borrow().index
    }

    /// Make every subsequent call fail (or succeed again)
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// All stored keys in order
    pub fn keys(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    fn ensure_online(&self) -> Result<(), KvError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("memory backend is offline".to_string()));
        }
        Ok(())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBackend")
            .field("entries", &self.entries.read().len())
            .field("catalog_index", &self.catalog_index())
            .field("offline", &self.offline.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl KeyValueStore for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, KvError> {
        self.ensure_online()?;
        Ok(self.entries.read().get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), KvError> {
        self.ensure_online()?;
        trace!(key = %key, bytes = value.len(), "Storing entry");
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<KvPair>, KvError> {
        self.ensure_online()?;
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| KvPair {
                key: key.clone(),
                value: value.clone(),
            })
            .collect())
    }

    async fn put_many(&self, batch: &[(&str, &[u8])]) -> Result<(), KvError> {
        self.ensure_online()?;
        let mut entries = self.entries.write();
        for (key, value) in batch {
            entries.insert(key.to_string(), value.to_vec());
        }
        Ok(())
    }
}

#[async_trait]
impl ServiceCatalog for MemoryBackend {
    async fn list_services(&self) -> Result<ServiceMap, KvError> {
        self.ensure_online()?;
        Ok(self.catalog.borrow().services.clone())
    }

    async fn watch_services(&self, last_index: u64) -> Result<CatalogUpdate, KvError> {
        self.ensure_online()?;
        let mut rx = self.catalog.subscribe();
        let update = rx
            .wait_for(|update| update.index != last_index)
            .await
            .map_err(|_| KvError::Unavailable("catalog channel closed".to_string()))?
            .clone();
        Ok(update)
    }
}
