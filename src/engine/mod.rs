// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replication engine.
//!
//! The orchestrator that ties together:
//! - Replication jobs and sites via [`crate::config_store::ConfigStore`]
//! - Site adapters via [`crate::adapter::AdapterRegistry`]
//! - Outcome persistence via [`crate::ledger::ItemLedger`]
//! - Queued execution via [`crate::queue::QueueBroker`] and [`crate::worker::WorkerPool`]
//! - Outcome reporting via [`crate::completion::CompletionSink`]
//!
//! # Architecture
//!
//! 1. A supervisor scans the config store and spawns one scheduler per config
//! 2. Each scheduler runs a reconciliation cycle every period
//! 3. Direct-mode cycles write to the destination inline; queued-mode cycles
//!    hand tasks to the worker pool
//! 4. Shutdown cancels cycles between items, drains workers and closes stores

mod reconcile;
mod scheduler;
mod types;

pub use types::{CycleReport, CycleState, CycleStatus, EngineState};

use crate::adapter::{AdapterRegistry, SiteConnections};
use crate::completion::CompletionSink;
use crate::config::EngineSettings;
use crate::config_store::ConfigStore;
use crate::error::{ReplicationError, Result};
use crate::ledger::{ItemLedger, SqliteItemLedger};
use crate::queue::QueueBroker;
use crate::worker::WorkerPool;
use dashmap::DashMap;
use reconcile::Reconciler;
use scheduler::{slot_for, Schedulers, Slots};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// The catalog replication engine.
///
/// Owns the schedulers and the worker pool. Everything else (config store,
/// adapters, ledger, queues, sink) is injected so the engine can be embedded
/// and tested against in-memory implementations.
pub struct ReplicationEngine {
    settings: EngineSettings,

    /// Engine state (broadcast to watchers)
    state_tx: watch::Sender<EngineState>,
    state_rx: watch::Receiver<EngineState>,

    /// Shutdown signal for the supervisor, schedulers and cycles
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    ledger: Arc<dyn ItemLedger>,
    broker: Arc<QueueBroker>,
    sink: Arc<dyn CompletionSink>,
    connections: Arc<SiteConnections>,
    reconciler: Arc<Reconciler>,
    workers: WorkerPool,

    /// Per-config cycle state, cancel flag and cycle lock
    slots: Slots,
    schedulers: Schedulers,

    /// Supervisor task handle
    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl ReplicationEngine {
    /// Create an engine from its collaborators.
    ///
    /// The engine starts in `Created` state. Call [`start()`](Self::start)
    /// to begin scheduling cycles.
    pub fn new(
        settings: EngineSettings,
        configs: Arc<dyn ConfigStore>,
        registry: Arc<AdapterRegistry>,
        ledger: Arc<dyn ItemLedger>,
        broker: Arc<QueueBroker>,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(EngineState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let connections = Arc::new(SiteConnections::new(Arc::clone(&registry), Arc::clone(&configs)));
        let reconciler = Arc::new(Reconciler::new(
            &settings,
            configs,
            registry,
            Arc::clone(&ledger),
            Arc::clone(&broker),
            Arc::clone(&sink),
            shutdown_rx.clone(),
        ));
        let workers = WorkerPool::new(
            settings.workers.clone(),
            Arc::clone(&broker),
            Arc::clone(&connections),
            Arc::clone(&ledger),
            Arc::clone(&sink),
        );

        Self {
            settings,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            ledger,
            broker,
            sink,
            connections,
            reconciler,
            workers,
            slots: Arc::new(DashMap::new()),
            schedulers: Arc::new(Mutex::new(HashMap::new())),
            handles: RwLock::new(Vec::new()),
        }
    }

    /// Create an engine with the SQLite ledger and queue journal described by
    /// `settings`.
    pub async fn open(
        settings: EngineSettings,
        configs: Arc<dyn ConfigStore>,
        registry: Arc<AdapterRegistry>,
        sink: Arc<dyn CompletionSink>,
    ) -> Result<Self> {
        let ledger = SqliteItemLedger::new(&settings.ledger).await?;
        let broker = QueueBroker::open(settings.queue.clone()).await?;
        info!(
            ledger = %ledger.path(),
            restored_tasks = broker.total_len(),
            "Stores opened"
        );
        Ok(Self::new(settings, configs, registry, Arc::new(ledger), Arc::new(broker), sink))
    }

    /// Get current engine state.
    pub fn state(&self) -> EngineState {
        *self.state_rx.borrow()
    }

    /// Get a receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<EngineState> {
        self.state_rx.clone()
    }

    /// Check if engine is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), EngineState::Running)
    }

    /// Cycle state of a config, if it has ever been scheduled or synced.
    pub fn cycle_state(&self, config_id: &str) -> Option<CycleState> {
        self.slots.get(config_id).map(|slot| slot.state())
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn ledger(&self) -> &Arc<dyn ItemLedger> {
        &self.ledger
    }

    pub fn broker(&self) -> &Arc<QueueBroker> {
        &self.broker
    }

    fn set_state(&self, state: EngineState) {
        let _ = self.state_tx.send(state);
        self.sink.on_engine_state(state);
    }

    /// Start the replication engine.
    ///
    /// 1. Spawns the config supervisor (which spawns schedulers)
    /// 2. Starts the worker pool (if enabled)
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != EngineState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: format!("{:?}", self.state()),
            });
        }

        info!(
            scan_interval_ms = self.settings.scan_interval_duration().as_millis() as u64,
            workers = self.settings.workers.enabled,
            "Starting replication engine"
        );

        if self.settings.workers.enabled {
            if let Err(e) = self.workers.start().await {
                warn!(error = %e, "Worker pool failed to start");
                self.set_state(EngineState::Failed);
                return Err(e);
            }
        }

        let handle = tokio::spawn(scheduler::run_supervisor(
            Arc::clone(&self.reconciler),
            Arc::clone(&self.slots),
            Arc::clone(&self.schedulers),
            self.settings.scan_interval_duration(),
            self.shutdown_rx.clone(),
        ));
        self.handles.write().await.push(handle);

        self.set_state(EngineState::Running);
        info!("Replication engine running");
        Ok(())
    }

    /// Run one cycle for a config now and return its report(s): one per leg,
    /// so two for a `Both` config whose pull succeeded.
    ///
    /// Waits for any cycle of the same config already running. Suspension is
    /// ignored; the caller asked explicitly.
    pub async fn sync_now(&self, config_id: &str) -> Result<Vec<CycleReport>> {
        match self.state() {
            EngineState::Created | EngineState::Running => {}
            other => {
                return Err(ReplicationError::InvalidState {
                    expected: "Created or Running".to_string(),
                    actual: format!("{:?}", other),
                })
            }
        }

        let config = self
            .reconciler
            .configs()
            .config(config_id)
            .ok_or_else(|| ReplicationError::not_found("config", config_id))?;

        let slot = slot_for(&self.slots, config_id);
        let _running = slot.lock().await;
        debug!(config_id, "Manual sync");
        self.reconciler.run_cycle(&config, &slot).await
    }

    /// Stop the running cycle of a config between items. Returns false if no
    /// cycle was running.
    pub fn cancel(&self, config_id: &str) -> bool {
        match self.slots.get(config_id) {
            Some(slot) if slot.is_active() => {
                info!(config_id, "Cancel requested");
                slot.request_cancel();
                true
            }
            _ => false,
        }
    }

    /// Shutdown the engine gracefully.
    ///
    /// Signals every task, waits up to `shutdown_timeout` for each to finish,
    /// drains the worker pool, then closes adapters, the queue journal and the
    /// ledger. Ends in `Failed` if anything had to be abandoned.
    pub async fn shutdown(&mut self) {
        match self.state() {
            EngineState::Stopped | EngineState::Failed | EngineState::ShuttingDown => return,
            _ => {}
        }
        info!("Shutting down replication engine");
        self.set_state(EngineState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);
        let drain_timeout = self.settings.shutdown_timeout_duration();
        let mut clean = true;

        let mut handles: Vec<_> = {
            let mut guard = self.handles.write().await;
            std::mem::take(&mut *guard)
        };
        // Supervisor first, so no scheduler is spawned after we collect them.
        for handle in handles.drain(..) {
            clean &= join_with_timeout("supervisor", handle, drain_timeout).await;
        }

        let schedulers: Vec<_> = {
            let mut guard = self.schedulers.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.drain().collect()
        };
        if !schedulers.is_empty() {
            info!(task_count = schedulers.len(), "Waiting for schedulers to drain");
        }
        for (config_id, handle) in schedulers {
            clean &= join_with_timeout(&config_id, handle, drain_timeout).await;
        }

        self.workers.shutdown(drain_timeout).await;
        self.connections.close_all().await;
        self.broker.close().await;
        self.ledger.close().await;

        if clean {
            self.set_state(EngineState::Stopped);
            info!("Replication engine stopped");
        } else {
            self.set_state(EngineState::Failed);
            warn!("Replication engine stopped with abandoned tasks");
        }
    }
}

/// Await a task for at most `timeout`. Returns false if it panicked or timed out.
async fn join_with_timeout(
    name: &str,
    handle: tokio::task::JoinHandle<()>,
    timeout: std::time::Duration,
) -> bool {
    match tokio::time::timeout(timeout, handle).await {
        Ok(Ok(())) => {
            debug!(task = name, "Task completed gracefully");
            true
        }
        Ok(Err(e)) => {
            warn!(task = name, error = %e, "Task panicked during shutdown");
            false
        }
        Err(_) => {
            warn!(task = name, "Task timed out during shutdown");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{MemoryAdapter, MemoryAdapterFactory};
    use crate::completion::{ChannelSink, NoOpSink, ReplicationEvent};
    use crate::config::{Direction, ExecutionMode, QueueConfig, ReplicatorConfig, Site};
    use crate::config_store::InMemoryConfigStore;
    use crate::ledger::{ItemStatus, MemoryItemLedger};
    use crate::model::{Metadata, RawPayload, DELETED_TAG};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        engine: ReplicationEngine,
        store: Arc<InMemoryConfigStore>,
        a: Arc<MemoryAdapter>,
        b: Arc<MemoryAdapter>,
        ledger: Arc<MemoryItemLedger>,
        events: mpsc::UnboundedReceiver<ReplicationEvent>,
    }

    fn fixture(settings: EngineSettings) -> Fixture {
        let a = Arc::new(MemoryAdapter::new("A"));
        let b = Arc::new(MemoryAdapter::new("B"));
        let factory = Arc::new(MemoryAdapterFactory::new());
        factory.register("a", a.clone());
        factory.register("b", b.clone());
        let registry = Arc::new(AdapterRegistry::new(settings.adapter.clone()));
        registry.register(factory);

        let store = InMemoryConfigStore::new();
        store.put_site(Site::for_testing("a", "memory"));
        store.put_site(Site::for_testing("b", "memory"));

        let ledger = Arc::new(MemoryItemLedger::new());
        let broker = Arc::new(QueueBroker::new(QueueConfig::default()));
        let (sink, events) = ChannelSink::new();
        let engine = ReplicationEngine::new(
            settings,
            store.clone(),
            registry,
            ledger.clone(),
            broker,
            Arc::new(sink),
        );
        Fixture {
            engine,
            store,
            a,
            b,
            ledger,
            events,
        }
    }

    fn record(id: &str) -> Metadata {
        Metadata::new(id, "xml", RawPayload::new("text/xml", b"<r/>".to_vec()), Utc::now())
    }

    #[tokio::test]
    async fn test_engine_start_invalid_state() {
        let mut f = fixture(EngineSettings::for_testing());
        f.engine.start().await.unwrap();
        assert!(f.engine.is_running());

        let err = f.engine.start().await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_engine_shutdown_from_created() {
        let mut f = fixture(EngineSettings::for_testing());
        f.engine.shutdown().await;
        assert_eq!(f.engine.state(), EngineState::Stopped);

        // Idempotent
        f.engine.shutdown().await;
        assert_eq!(f.engine.state(), EngineState::Stopped);
    }

    #[tokio::test]
    async fn test_sync_now_direct() {
        let f = fixture(EngineSettings::for_testing());
        f.store.put_config(ReplicatorConfig::for_testing("cfg", "a", "b"));
        f.a.insert(record("m1"));
        f.a.insert(record("m2"));

        let reports = f.engine.sync_now("cfg").await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, CycleStatus::Success);
        assert_eq!(reports[0].succeeded, 2);
        assert_eq!(f.b.len(), 2);
        assert_eq!(f.ledger.len(), 2);
        assert_eq!(f.engine.cycle_state("cfg"), Some(CycleState::Idle));

        // Nothing changed since the cursor: second cycle is a no-op.
        let reports = f.engine.sync_now("cfg").await.unwrap();
        assert_eq!(reports[0].processed, 0);
    }

    #[tokio::test]
    async fn test_sync_now_unknown_config() {
        let f = fixture(EngineSettings::for_testing());
        let err = f.engine.sync_now("nope").await.unwrap_err();
        assert!(matches!(err, ReplicationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_sync_now_missing_site_is_not_found() {
        let f = fixture(EngineSettings::for_testing());
        f.store.put_config(ReplicatorConfig::for_testing("cfg", "a", "gone"));
        let err = f.engine.sync_now("cfg").await.unwrap_err();
        assert!(matches!(err, ReplicationError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_destination() {
        let f = fixture(EngineSettings::for_testing());
        f.store.put_config(ReplicatorConfig::for_testing("cfg", "a", "b"));
        f.a.insert(record("m1"));
        f.b.set_available(false);

        let reports = f.engine.sync_now("cfg").await.unwrap();
        assert_eq!(reports[0].status, CycleStatus::ConnectionUnavailable);
        assert_eq!(reports[0].processed, 0);
        assert!(f.ledger.is_empty());
    }

    #[tokio::test]
    async fn test_both_directions() {
        let f = fixture(EngineSettings::for_testing());
        let mut config = ReplicatorConfig::for_testing("cfg", "a", "b");
        config.direction = Direction::Both;
        f.store.put_config(config);
        f.a.insert(record("from-a"));
        f.b.insert(record("from-b"));

        let reports = f.engine.sync_now("cfg").await.unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(reports[0].direction, Direction::Pull);
        assert_eq!(reports[1].direction, Direction::Push);
        assert!(f.a.get("from-b").is_some());
        assert!(f.b.get("from-a").is_some());
        // Lineage exclusion stops the pulled record bouncing back.
        assert_eq!(reports[1].processed, 1);
    }

    #[tokio::test]
    async fn test_delete_propagates() {
        let f = fixture(EngineSettings::for_testing());
        f.store.put_config(ReplicatorConfig::for_testing("cfg", "a", "b"));
        f.b.insert(record("m2"));
        f.a.insert(record("m2").with_tag(DELETED_TAG));

        let reports = f.engine.sync_now("cfg").await.unwrap();
        assert_eq!(reports[0].succeeded, 1);
        assert!(f.b.get("m2").is_none());
        let row = f.ledger.get("m2", "A", "B").await.unwrap().unwrap();
        assert_eq!(row.status, ItemStatus::Success);
    }

    #[tokio::test]
    async fn test_queued_mode_enqueues() {
        let f = fixture(EngineSettings::for_testing());
        let mut config = ReplicatorConfig::for_testing("cfg", "a", "b");
        config.mode = ExecutionMode::Queued;
        f.store.put_config(config);
        f.a.insert(record("m1"));

        let reports = f.engine.sync_now("cfg").await.unwrap();
        assert_eq!(reports[0].enqueued, 1);
        assert_eq!(f.engine.broker().get_queue("b").unwrap().len(), 1);
        assert!(f.b.is_empty());

        // Still queued: the next cycle does not enqueue it again.
        let reports = f.engine.sync_now("cfg").await.unwrap();
        assert_eq!(reports[0].enqueued, 0);
        assert_eq!(f.engine.broker().total_len(), 1);
    }

    #[tokio::test]
    async fn test_scheduler_runs_and_sink_sees_states() {
        let mut settings = EngineSettings::for_testing();
        settings.scan_interval = "20ms".to_string();
        let mut f = fixture(settings);
        let mut config = ReplicatorConfig::for_testing("cfg", "a", "b");
        config.period = "50ms".to_string();
        f.store.put_config(config);
        f.a.insert(record("m1"));

        f.engine.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.b.is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        f.engine.shutdown().await;
        assert_eq!(f.engine.state(), EngineState::Stopped);

        let mut states = Vec::new();
        while let Ok(event) = f.events.try_recv() {
            if let ReplicationEvent::Engine(state) = event {
                states.push(state);
            }
        }
        assert_eq!(
            states,
            vec![EngineState::Running, EngineState::ShuttingDown, EngineState::Stopped]
        );
    }

    #[tokio::test]
    async fn test_suspended_config_is_not_run() {
        let mut settings = EngineSettings::for_testing();
        settings.scan_interval = "20ms".to_string();
        let mut f = fixture(settings);
        let mut config = ReplicatorConfig::for_testing("cfg", "a", "b");
        config.period = "20ms".to_string();
        config.suspended = true;
        f.store.put_config(config);
        f.a.insert(record("m1"));

        f.engine.start().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while f.engine.cycle_state("cfg") != Some(CycleState::Suspended) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(f.b.is_empty());
        f.engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_cancel_without_running_cycle() {
        let f = fixture(EngineSettings::for_testing());
        assert!(!f.engine.cancel("cfg"));
    }

    #[tokio::test]
    async fn test_sync_now_after_shutdown_fails() {
        let mut f = fixture(EngineSettings::for_testing());
        f.engine.shutdown().await;
        let err = f.engine.sync_now("cfg").await.unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_open_with_in_memory_ledger() {
        let store = InMemoryConfigStore::new();
        let registry = Arc::new(AdapterRegistry::new(Default::default()));
        let engine = ReplicationEngine::open(
            EngineSettings::for_testing(),
            store,
            registry,
            Arc::new(NoOpSink),
        )
        .await
        .unwrap();
        assert_eq!(engine.state(), EngineState::Created);
    }
}
