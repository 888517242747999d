//! Two-site test harness.
//!
//! Sites `a` (system name "A") and `b` (system name "B") backed by
//! [`MockAdapter`]s, an in-memory config store and ledger, and a channel sink
//! whose events can be drained for assertions.

use super::mock_adapter::{MockAdapter, MockAdapterFactory, MOCK_ADAPTER_TYPE};
use catalog_replication::model::{Metadata, RawPayload};
use catalog_replication::{
    AdapterRegistry, ChannelSink, CompletionEvent, CycleReport, EngineSettings,
    InMemoryConfigStore, MemoryItemLedger, QueueBroker, QueueConfig, ReplicationEngine,
    ReplicationEvent, ReplicatorConfig, Site,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::mpsc;

pub struct Harness {
    pub store: Arc<InMemoryConfigStore>,
    pub registry: Arc<AdapterRegistry>,
    pub ledger: Arc<MemoryItemLedger>,
    pub broker: Arc<QueueBroker>,
    pub a: Arc<MockAdapter>,
    pub b: Arc<MockAdapter>,
    pub sink: ChannelSink,
    pub events: mpsc::UnboundedReceiver<ReplicationEvent>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_queue(QueueConfig::default())
    }

    pub fn with_queue(queue: QueueConfig) -> Self {
        let a = MockAdapter::new("A");
        let b = MockAdapter::new("B");
        let factory = MockAdapterFactory::new();
        factory.register("a", Arc::clone(&a));
        factory.register("b", Arc::clone(&b));

        let registry = Arc::new(AdapterRegistry::new(EngineSettings::for_testing().adapter));
        registry.register(factory);

        let store = InMemoryConfigStore::new();
        store.put_site(Site::for_testing("a", MOCK_ADAPTER_TYPE));
        store.put_site(Site::for_testing("b", MOCK_ADAPTER_TYPE));

        let (sink, events) = ChannelSink::new();
        Self {
            store,
            registry,
            ledger: Arc::new(MemoryItemLedger::new()),
            broker: Arc::new(QueueBroker::new(queue)),
            a,
            b,
            sink,
            events,
        }
    }

    /// Engine over the harness collaborators.
    pub fn engine(&self, settings: EngineSettings) -> ReplicationEngine {
        ReplicationEngine::new(
            settings,
            self.store.clone(),
            Arc::clone(&self.registry),
            self.ledger.clone(),
            Arc::clone(&self.broker),
            Arc::new(self.sink.clone()),
        )
    }

    /// Push job a → b with the given retry limit.
    pub fn push_config(&self, id: &str, retry_limit: u32) -> ReplicatorConfig {
        let mut config = ReplicatorConfig::for_testing(id, "a", "b");
        config.failure_retry_limit = retry_limit;
        self.store.put_config(config.clone());
        config
    }

    /// Drain every event received so far.
    pub fn drain(&mut self) -> Vec<ReplicationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub fn item_events(&mut self) -> Vec<CompletionEvent> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                ReplicationEvent::Item(item) => Some(item),
                _ => None,
            })
            .collect()
    }

    pub fn cycle_reports(&mut self) -> Vec<CycleReport> {
        self.drain()
            .into_iter()
            .filter_map(|e| match e {
                ReplicationEvent::Cycle(report) => Some(report),
                _ => None,
            })
            .collect()
    }
}

/// A small XML record modified at `modified`.
pub fn record_at(id: &str, modified: DateTime<Utc>) -> Metadata {
    Metadata::new(
        id,
        "xml",
        RawPayload::new("text/xml", format!("<record id=\"{}\"/>", id).into_bytes()),
        modified,
    )
}

/// A record modified a little in the past, so it sorts before any ledger
/// `done_time` written by the test.
pub fn record(id: &str) -> Metadata {
    record_at(id, Utc::now() - Duration::seconds(60))
}
