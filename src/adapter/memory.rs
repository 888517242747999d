//! In-memory catalog site.
//!
//! A complete [`NodeAdapter`] over a `HashMap`, used for standalone runs and
//! tests. Availability can be toggled to simulate an outage: while
//! unavailable, every call fails with a communication error.

use super::{AdapterFactory, AdapterFuture, NodeAdapter};
use crate::config::Site;
use crate::error::AdapterError;
use crate::model::{
    CreateRequest, CreateStorageRequest, DeleteRequest, Metadata, QueryRequest, QueryResponse,
    Resource, ResourceContent, ResourceRequest, ResourceResponse, UpdateRequest,
    UpdateStorageRequest,
};
use dashmap::DashMap;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Adapter-type tag for [`MemoryAdapter`].
pub const MEMORY_ADAPTER_TYPE: &str = "memory";

#[derive(Default)]
struct Catalog {
    records: HashMap<String, Metadata>,
    resources: HashMap<String, Vec<u8>>,
}

/// A catalog site held in memory.
pub struct MemoryAdapter {
    name: String,
    catalog: RwLock<Catalog>,
    available: AtomicBool,
}

impl MemoryAdapter {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            catalog: RwLock::new(Catalog::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Insert or replace a record.
    pub fn insert(&self, metadata: Metadata) {
        if let Ok(mut catalog) = self.catalog.write() {
            catalog.records.insert(metadata.id.clone(), metadata);
        }
    }

    /// Insert a record together with its resource bytes.
    pub fn insert_with_resource(&self, metadata: Metadata, content: Vec<u8>) {
        if let Ok(mut catalog) = self.catalog.write() {
            catalog.resources.insert(metadata.id.clone(), content);
            catalog.records.insert(metadata.id.clone(), metadata);
        }
    }

    pub fn get(&self, id: &str) -> Option<Metadata> {
        self.catalog.read().ok()?.records.get(id).cloned()
    }

    pub fn resource(&self, id: &str) -> Option<Vec<u8>> {
        self.catalog.read().ok()?.resources.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.catalog.read().map(|c| c.records.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), AdapterError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(AdapterError::communication(&self.name, "site unavailable"))
        }
    }

    fn poisoned(&self) -> AdapterError {
        AdapterError::Protocol {
            site: self.name.clone(),
            message: "catalog lock poisoned".to_string(),
        }
    }

    fn write_records(&self, records: Vec<Metadata>, must_exist: Option<bool>) -> Result<bool, AdapterError> {
        self.check()?;
        let mut catalog = self.catalog.write().map_err(|_| self.poisoned())?;
        if let Some(must_exist) = must_exist {
            if records.iter().any(|m| catalog.records.contains_key(&m.id) != must_exist) {
                return Ok(false);
            }
        }
        for metadata in records {
            catalog.records.insert(metadata.id.clone(), metadata);
        }
        Ok(true)
    }

    async fn store_resources(&self, resources: Vec<Resource>, must_exist: bool) -> Result<bool, AdapterError> {
        self.check()?;
        let mut staged = Vec::with_capacity(resources.len());
        for resource in resources {
            let bytes = resource
                .content
                .read_all()
                .await
                .map_err(|e| AdapterError::communication(&self.name, e.to_string()))?;
            staged.push((resource.metadata, bytes));
        }

        let mut catalog = self.catalog.write().map_err(|_| self.poisoned())?;
        if staged
            .iter()
            .any(|(m, _)| catalog.records.contains_key(&m.id) != must_exist)
        {
            return Ok(false);
        }
        for (metadata, bytes) in staged {
            catalog.resources.insert(metadata.id.clone(), bytes);
            catalog.records.insert(metadata.id.clone(), metadata);
        }
        Ok(true)
    }
}

impl NodeAdapter for MemoryAdapter {
    fn is_available(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        Box::pin(async move { self.available.load(Ordering::SeqCst) })
    }

    fn system_name(&self) -> AdapterFuture<'_, String> {
        Box::pin(async move { Ok(self.name.clone()) })
    }

    /// The predicate matches on `metadata_type`; empty or `*` matches all.
    /// Results are ordered by `metadata_modified`, oldest first. A
    /// `page_size` of 0 returns everything from `start_index` on.
    fn query(&self, request: QueryRequest) -> AdapterFuture<'_, QueryResponse> {
        Box::pin(async move {
            self.check()?;
            let catalog = self.catalog.read().map_err(|_| self.poisoned())?;
            let mut matches: Vec<Metadata> = catalog
                .records
                .values()
                .filter(|m| {
                    request.predicate.is_empty()
                        || request.predicate == "*"
                        || m.metadata_type == request.predicate
                })
                .filter(|m| request.admits(m))
                .cloned()
                .collect();
            matches.sort_by(|a, b| {
                a.metadata_modified
                    .cmp(&b.metadata_modified)
                    .then_with(|| a.id.cmp(&b.id))
            });
            let page_size = match request.page_size {
                0 => usize::MAX,
                n => n,
            };
            let page: Vec<Metadata> = matches
                .into_iter()
                .skip(request.start_index)
                .take(page_size)
                .collect();
            Ok(QueryResponse::from_items(page))
        })
    }

    fn exists<'a>(&'a self, metadata: &'a Metadata) -> AdapterFuture<'a, bool> {
        Box::pin(async move {
            self.check()?;
            let catalog = self.catalog.read().map_err(|_| self.poisoned())?;
            Ok(catalog.records.contains_key(&metadata.id))
        })
    }

    fn create_record(&self, request: CreateRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move { self.write_records(request.metadata, Some(false)) })
    }

    fn update_record(&self, request: UpdateRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move { self.write_records(request.metadata, Some(true)) })
    }

    /// Deleting a record that is already gone succeeds.
    fn delete_record(&self, request: DeleteRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move {
            self.check()?;
            let mut catalog = self.catalog.write().map_err(|_| self.poisoned())?;
            for metadata in &request.metadata {
                catalog.records.remove(&metadata.id);
                catalog.resources.remove(&metadata.id);
            }
            Ok(true)
        })
    }

    fn read_resource(&self, request: ResourceRequest) -> AdapterFuture<'_, ResourceResponse> {
        Box::pin(async move {
            self.check()?;
            let catalog = self.catalog.read().map_err(|_| self.poisoned())?;
            let id = request.metadata.id.clone();
            let bytes = catalog.resources.get(&id).cloned().ok_or_else(|| AdapterError::Protocol {
                site: self.name.clone(),
                message: format!("no resource stored for {}", id),
            })?;
            let uri = request
                .metadata
                .resource_uri
                .clone()
                .unwrap_or_else(|| format!("memory://{}/{}", self.name, id));
            Ok(ResourceResponse {
                resource: Resource {
                    id: id.clone(),
                    name: id,
                    uri,
                    qualifier: None,
                    mime_type: "application/octet-stream".to_string(),
                    size: bytes.len() as u64,
                    metadata: request.metadata,
                    content: ResourceContent::from_bytes(bytes),
                },
            })
        })
    }

    fn create_resource(&self, request: CreateStorageRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move { self.store_resources(request.resources, false).await })
    }

    fn update_resource(&self, request: UpdateStorageRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move { self.store_resources(request.resources, true).await })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// Factory handing out pre-registered [`MemoryAdapter`]s by site id.
///
/// Sites without a registered adapter get a fresh, empty one named after
/// the site.
#[derive(Default)]
pub struct MemoryAdapterFactory {
    adapters: DashMap<String, Arc<MemoryAdapter>>,
}

impl MemoryAdapterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the adapter returned for `site_id`.
    pub fn register(&self, site_id: impl Into<String>, adapter: Arc<MemoryAdapter>) {
        self.adapters.insert(site_id.into(), adapter);
    }

    pub fn adapter(&self, site_id: &str) -> Option<Arc<MemoryAdapter>> {
        self.adapters.get(site_id).map(|e| Arc::clone(e.value()))
    }
}

impl AdapterFactory for MemoryAdapterFactory {
    fn adapter_type(&self) -> &str {
        MEMORY_ADAPTER_TYPE
    }

    fn create<'a>(&'a self, site: &'a Site) -> AdapterFuture<'a, Arc<dyn NodeAdapter>> {
        Box::pin(async move {
            let adapter = self
                .adapters
                .entry(site.id.clone())
                .or_insert_with(|| Arc::new(MemoryAdapter::new(site.name.clone())))
                .value()
                .clone();
            Ok(adapter as Arc<dyn NodeAdapter>)
        })
    }
}
