// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Adapter factories and per-site connection caching.
//!
//! - [`AdapterRegistry`] maps an adapter-type tag to the factory that builds
//!   adapters of that type.
//! - [`SiteConnections`] keeps one connected [`SiteAdapter`] per site for the
//!   worker pool, reconnecting when the site record changes.

use super::{AdapterFuture, NodeAdapter, SiteAdapter};
use crate::config::{AdapterTimeouts, Site};
use crate::config_store::ConfigStore;
use crate::error::{ReplicationError, Result};
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Builds adapters for one protocol.
pub trait AdapterFactory: Send + Sync + 'static {
    /// Tag matched against [`Site::adapter_type`].
    fn adapter_type(&self) -> &str;

    /// Connect to the site.
    fn create<'a>(&'a self, site: &'a Site) -> AdapterFuture<'a, Arc<dyn NodeAdapter>>;
}

/// Factory registry keyed by adapter-type tag.
pub struct AdapterRegistry {
    factories: DashMap<String, Arc<dyn AdapterFactory>>,
    timeouts: AdapterTimeouts,
}

impl AdapterRegistry {
    pub fn new(timeouts: AdapterTimeouts) -> Self {
        Self {
            factories: DashMap::new(),
            timeouts,
        }
    }

    /// Register a factory, replacing any previous one for the same tag.
    pub fn register(&self, factory: Arc<dyn AdapterFactory>) {
        let adapter_type = factory.adapter_type().to_string();
        info!(adapter_type = %adapter_type, "Registered adapter factory");
        self.factories.insert(adapter_type, factory);
    }

    pub fn supports(&self, adapter_type: &str) -> bool {
        self.factories.contains_key(adapter_type)
    }

    /// Build a timeout-wrapped adapter for a site.
    pub async fn connect(&self, site: &Site) -> Result<SiteAdapter> {
        let factory = self
            .factories
            .get(&site.adapter_type)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ReplicationError::not_found("adapter type", &site.adapter_type))?;

        let inner = factory.create(site).await?;
        debug!(site = %site.id, adapter_type = %site.adapter_type, "Adapter created");
        Ok(SiteAdapter::new(site.clone(), inner, &self.timeouts))
    }
}

/// Cached per-site adapters, resolved through the configuration boundary.
pub struct SiteConnections {
    registry: Arc<AdapterRegistry>,
    configs: Arc<dyn ConfigStore>,
    adapters: DashMap<String, Arc<SiteAdapter>>,
}

impl SiteConnections {
    pub fn new(registry: Arc<AdapterRegistry>, configs: Arc<dyn ConfigStore>) -> Self {
        Self {
            registry,
            configs,
            adapters: DashMap::new(),
        }
    }

    /// Adapter for a site id, connecting on first use.
    ///
    /// Fails with `NotFound` if the site vanished from the configuration.
    pub async fn get(&self, site_id: &str) -> Result<Arc<SiteAdapter>> {
        let site = self
            .configs
            .site(site_id)
            .ok_or_else(|| ReplicationError::not_found("site", site_id))?;

        let cached = self.adapters.get(site_id).map(|e| Arc::clone(e.value()));
        if let Some(adapter) = cached {
            if adapter.site() == &site && !adapter.is_closed() {
                return Ok(adapter);
            }
            // Site record changed or adapter closed underneath us
            self.invalidate(site_id).await;
        }

        let adapter = Arc::new(self.registry.connect(&site).await?);
        let winner = {
            let entry = self
                .adapters
                .entry(site_id.to_string())
                .or_insert_with(|| Arc::clone(&adapter));
            Arc::clone(entry.value())
        };
        if !Arc::ptr_eq(&winner, &adapter) {
            // Another worker connected first
            adapter.close().await;
        }
        Ok(winner)
    }

    /// Drop and close the cached adapter for a site.
    pub async fn invalidate(&self, site_id: &str) {
        if let Some((_, adapter)) = self.adapters.remove(site_id) {
            adapter.close().await;
        }
    }

    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }

    /// Close every cached adapter.
    pub async fn close_all(&self) {
        let adapters: Vec<Arc<SiteAdapter>> = self
            .adapters
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        self.adapters.clear();
        for adapter in adapters {
            adapter.close().await;
        }
        debug!("All site adapters closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::memory::{MemoryAdapter, MemoryAdapterFactory, MEMORY_ADAPTER_TYPE};
    use crate::config_store::InMemoryConfigStore;

    fn registry() -> Arc<AdapterRegistry> {
        let registry = AdapterRegistry::new(AdapterTimeouts::default());
        registry.register(Arc::new(MemoryAdapterFactory::new()));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_connect_unknown_type_is_not_found() {
        let registry = registry();
        let site = Site::for_testing("a", "csw");
        assert!(!registry.supports("csw"));
        let err = registry.connect(&site).await.err().unwrap();
        assert!(matches!(err, ReplicationError::NotFound { ref kind, .. } if kind == "adapter type"));
    }

    #[tokio::test]
    async fn test_connect_known_type() {
        let registry = registry();
        let adapter = registry
            .connect(&Site::for_testing("a", MEMORY_ADAPTER_TYPE))
            .await
            .unwrap();
        assert_eq!(adapter.system_name().await.unwrap(), "a");
    }

    #[tokio::test]
    async fn test_site_connections_cache() {
        let store = InMemoryConfigStore::new();
        store.put_site(Site::for_testing("a", MEMORY_ADAPTER_TYPE));
        let connections = SiteConnections::new(registry(), store.clone());

        let first = connections.get("a").await.unwrap();
        let second = connections.get("a").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(connections.len(), 1);

        let err = connections.get("missing").await.err().unwrap();
        assert!(matches!(err, ReplicationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_site_connections_reconnect_on_change() {
        let store = InMemoryConfigStore::new();
        store.put_site(Site::for_testing("a", MEMORY_ADAPTER_TYPE));
        let connections = SiteConnections::new(registry(), store.clone());

        let first = connections.get("a").await.unwrap();
        let mut changed = Site::for_testing("a", MEMORY_ADAPTER_TYPE);
        changed.address = "mem://elsewhere".to_string();
        store.put_site(changed);

        let second = connections.get("a").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
    }

    #[tokio::test]
    async fn test_close_all() {
        let store = InMemoryConfigStore::new();
        store.put_site(Site::for_testing("a", MEMORY_ADAPTER_TYPE));
        let factory = MemoryAdapterFactory::new();
        factory.register("a", Arc::new(MemoryAdapter::new("alpha")));
        let registry = AdapterRegistry::new(AdapterTimeouts::default());
        registry.register(Arc::new(factory));
        let connections = SiteConnections::new(Arc::new(registry), store.clone());

        let adapter = connections.get("a").await.unwrap();
        connections.close_all().await;
        assert!(adapter.is_closed());
        assert!(connections.is_empty());
    }
}
