//! Mock NodeAdapter for testing.
//!
//! Wraps a [`MemoryAdapter`] and records every write. Failures can be
//! injected per record id, and the site can be made to go down after a
//! number of writes.

use catalog_replication::adapter::{AdapterFactory, AdapterFuture, MemoryAdapter, NodeAdapter};
use catalog_replication::model::{
    CreateRequest, CreateStorageRequest, DeleteRequest, Metadata, QueryRequest, QueryResponse,
    ResourceRequest, ResourceResponse, UpdateRequest, UpdateStorageRequest,
};
use catalog_replication::{AdapterError, Site};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// A recorded write call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub operation: &'static str,
    pub id: String,
}

/// Mock adapter that records calls and fails on demand.
///
/// # Example
/// ```rust,ignore
/// let site = MockAdapter::new("B");
/// site.fail_writes("m1", 2);
///
/// // Use in tests...
///
/// assert_eq!(site.writes_for("m1"), 3);
/// ```
pub struct MockAdapter {
    inner: MemoryAdapter,
    name: String,
    /// Remaining injected failures per record id
    failures: Mutex<HashMap<String, u32>>,
    /// Ids whose writes are rejected (`Ok(false)`)
    rejected: Mutex<HashSet<String>>,
    /// Go down once this many writes were attempted
    down_after_writes: AtomicUsize,
    writes: Mutex<Vec<WriteCall>>,
    queries: AtomicUsize,
    /// Delay applied to every write
    write_delay: Mutex<Duration>,
}

impl MockAdapter {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryAdapter::new(name),
            name: name.to_string(),
            failures: Mutex::new(HashMap::new()),
            rejected: Mutex::new(HashSet::new()),
            down_after_writes: AtomicUsize::new(usize::MAX),
            writes: Mutex::new(Vec::new()),
            queries: AtomicUsize::new(0),
            write_delay: Mutex::new(Duration::ZERO),
        })
    }

    /// The underlying catalog.
    pub fn catalog(&self) -> &MemoryAdapter {
        &self.inner
    }

    pub fn insert(&self, metadata: Metadata) {
        self.inner.insert(metadata);
    }

    pub fn set_available(&self, available: bool) {
        self.inner.set_available(available);
    }

    /// Fail the next `times` writes of `id` with a communication error.
    pub fn fail_writes(&self, id: &str, times: u32) {
        self.failures.lock().unwrap().insert(id.to_string(), times);
    }

    /// Reject every write of `id`.
    pub fn reject(&self, id: &str) {
        self.rejected.lock().unwrap().insert(id.to_string());
    }

    /// Become unavailable once `count` writes have been attempted.
    pub fn go_down_after_writes(&self, count: usize) {
        self.down_after_writes.store(count, Ordering::SeqCst);
    }

    /// Slow every write down, to keep a cycle in flight.
    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap() = delay;
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.writes.lock().unwrap().clone()
    }

    pub fn writes_for(&self, id: &str) -> usize {
        self.writes.lock().unwrap().iter().filter(|w| w.id == id).count()
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    async fn delay(&self) {
        let delay = *self.write_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }

    /// Record a write and decide whether it is injected to fail or be
    /// rejected. `None` means pass through to the catalog.
    fn before_write(&self, operation: &'static str, id: &str) -> Option<Result<bool, AdapterError>> {
        let attempted = {
            let mut writes = self.writes.lock().unwrap();
            writes.push(WriteCall {
                operation,
                id: id.to_string(),
            });
            writes.len()
        };
        if attempted > self.down_after_writes.load(Ordering::SeqCst) {
            self.inner.set_available(false);
        }

        if let Some(remaining) = self.failures.lock().unwrap().get_mut(id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Some(Err(AdapterError::communication(&self.name, "injected failure")));
            }
        }
        if self.rejected.lock().unwrap().contains(id) {
            return Some(Ok(false));
        }
        None
    }
}

fn first_id(metadata: &[Metadata]) -> String {
    metadata.first().map(|m| m.id.clone()).unwrap_or_default()
}

impl NodeAdapter for MockAdapter {
    fn is_available(&self) -> Pin<Box<dyn Future<Output = bool> + Send + '_>> {
        self.inner.is_available()
    }

    fn system_name(&self) -> AdapterFuture<'_, String> {
        self.inner.system_name()
    }

    fn query(&self, request: QueryRequest) -> AdapterFuture<'_, QueryResponse> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query(request)
    }

    fn exists<'a>(&'a self, metadata: &'a Metadata) -> AdapterFuture<'a, bool> {
        self.inner.exists(metadata)
    }

    fn create_record(&self, request: CreateRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move {
            self.delay().await;
            if let Some(result) = self.before_write("create", &first_id(&request.metadata)) {
                return result;
            }
            self.inner.create_record(request).await
        })
    }

    fn update_record(&self, request: UpdateRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move {
            self.delay().await;
            if let Some(result) = self.before_write("update", &first_id(&request.metadata)) {
                return result;
            }
            self.inner.update_record(request).await
        })
    }

    fn delete_record(&self, request: DeleteRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move {
            self.delay().await;
            if let Some(result) = self.before_write("delete", &first_id(&request.metadata)) {
                return result;
            }
            self.inner.delete_record(request).await
        })
    }

    fn read_resource(&self, request: ResourceRequest) -> AdapterFuture<'_, ResourceResponse> {
        self.inner.read_resource(request)
    }

    fn create_resource(&self, request: CreateStorageRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move {
            self.delay().await;
            let id = request
                .resources
                .first()
                .map(|r| r.metadata.id.clone())
                .unwrap_or_default();
            if let Some(result) = self.before_write("create_resource", &id) {
                return result;
            }
            self.inner.create_resource(request).await
        })
    }

    fn update_resource(&self, request: UpdateStorageRequest) -> AdapterFuture<'_, bool> {
        Box::pin(async move {
            self.delay().await;
            let id = request
                .resources
                .first()
                .map(|r| r.metadata.id.clone())
                .unwrap_or_default();
            if let Some(result) = self.before_write("update_resource", &id) {
                return result;
            }
            self.inner.update_resource(request).await
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

/// Factory handing out pre-registered mock adapters by site id.
#[derive(Default)]
pub struct MockAdapterFactory {
    adapters: DashMap<String, Arc<MockAdapter>>,
}

pub const MOCK_ADAPTER_TYPE: &str = "mock";

impl MockAdapterFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register(&self, site_id: &str, adapter: Arc<MockAdapter>) {
        self.adapters.insert(site_id.to_string(), adapter);
    }
}

impl AdapterFactory for MockAdapterFactory {
    fn adapter_type(&self) -> &str {
        MOCK_ADAPTER_TYPE
    }

    fn create<'a>(&'a self, site: &'a Site) -> AdapterFuture<'a, Arc<dyn NodeAdapter>> {
        Box::pin(async move {
            self.adapters
                .get(&site.id)
                .map(|e| Arc::clone(e.value()) as Arc<dyn NodeAdapter>)
                .ok_or_else(|| AdapterError::communication(&site.id, "no mock registered"))
        })
    }
}
