//! Configuration boundary.
//!
//! The engine never owns replication jobs. It reads them, and the sites they
//! reference, through [`ConfigStore`] at the top of every cycle, so edits
//! made by an external administrative surface take effect on the next tick.

use crate::config::{ReplicatorConfig, Site};
use dashmap::DashMap;
use std::sync::Arc;

/// Read-only view of replication jobs and sites.
pub trait ConfigStore: Send + Sync + 'static {
    /// All replication jobs, suspended or not.
    fn configs(&self) -> Vec<ReplicatorConfig>;

    fn config(&self, id: &str) -> Option<ReplicatorConfig>;

    fn site(&self, id: &str) -> Option<Site>;
}

/// Config store held in memory, for embedding and tests.
#[derive(Default)]
pub struct InMemoryConfigStore {
    configs: DashMap<String, ReplicatorConfig>,
    sites: DashMap<String, Site>,
}

impl InMemoryConfigStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn put_site(&self, site: Site) {
        self.sites.insert(site.id.clone(), site);
    }

    pub fn remove_site(&self, id: &str) -> Option<Site> {
        self.sites.remove(id).map(|(_, site)| site)
    }

    pub fn put_config(&self, config: ReplicatorConfig) {
        self.configs.insert(config.id.clone(), config);
    }

    pub fn remove_config(&self, id: &str) -> Option<ReplicatorConfig> {
        self.configs.remove(id).map(|(_, config)| config)
    }

    /// Toggle the suspended flag. Returns false if the config is unknown.
    pub fn set_suspended(&self, id: &str, suspended: bool) -> bool {
        match self.configs.get_mut(id) {
            Some(mut config) => {
                config.suspended = suspended;
                true
            }
            None => false,
        }
    }
}

impl ConfigStore for InMemoryConfigStore {
    fn configs(&self) -> Vec<ReplicatorConfig> {
        let mut configs: Vec<_> = self.configs.iter().map(|e| e.value().clone()).collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    fn config(&self, id: &str) -> Option<ReplicatorConfig> {
        self.configs.get(id).map(|e| e.value().clone())
    }

    fn site(&self, id: &str) -> Option<Site> {
        self.sites.get(id).map(|e| e.value().clone())
    }
}
