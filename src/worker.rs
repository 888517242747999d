// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Worker pool executing queued tasks.
//!
//! # Architecture
//!
//! ```text
//!   QueueBroker ──take──→ worker 1 ─┐
//!   (site queues)   ├──→ worker 2 ─┼─→ transfer::execute ─→ ledger.record ─→ sink
//!                   └──→ worker N ─┘
//! ```
//!
//! Each worker loops: pop the best task from its queue view → resolve the
//! source and destination adapters → transfer → record the outcome in the
//! ledger → resolve the task → report to the sink.
//!
//! # Failure Handling
//!
//! | Failure | Code | Task |
//! |---------|------|------|
//! | destination rejected (`false`) | OPERATION_REJECTED | dropped |
//! | site missing from config | NOT_FOUND | dropped |
//! | transient adapter error | SITE_UNAVAILABLE / SITE_TIMEOUT | requeued until retry limit |
//! | ledger write failed | INTERNAL_ERROR | requeued until retry limit |
//!
//! Shutdown is a drain: each worker finishes the task in hand and exits;
//! tasks still queued stay queued (and journaled).

use crate::adapter::{SiteAdapter, SiteConnections};
use crate::completion::{CompletionEvent, CompletionSink};
use crate::config::WorkerPoolConfig;
use crate::error::{ReplicationError, Result};
use crate::ledger::{ItemLedger, ItemOutcome, ItemStatus};
use crate::queue::{CompositeQueue, Disposition, ErrorCode, QueueBroker, Task, TaskInfo};
use crate::resilience::RateLimiter;
use crate::transfer::{self, TransferOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

/// Where a worker takes tasks from.
#[derive(Clone)]
enum QueueView {
    /// Every deployed queue, including ones deployed later.
    All(Arc<QueueBroker>),
    Sites(CompositeQueue),
}

impl QueueView {
    async fn take(&self) -> Task {
        match self {
            QueueView::All(broker) => broker.take_any().await,
            QueueView::Sites(composite) => composite.take().await,
        }
    }
}

/// Fixed pool of task workers.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    broker: Arc<QueueBroker>,
    connections: Arc<SiteConnections>,
    ledger: Arc<dyn ItemLedger>,
    sink: Arc<dyn CompletionSink>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerPoolConfig,
        broker: Arc<QueueBroker>,
        connections: Arc<SiteConnections>,
        ledger: Arc<dyn ItemLedger>,
        sink: Arc<dyn CompletionSink>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            broker,
            connections,
            ledger,
            sink,
            shutdown_tx,
            shutdown_rx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the workers. Fails if the pool is already running or stopped,
    /// or if a configured site queue cannot be deployed.
    pub async fn start(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if !handles.is_empty() || *self.shutdown_rx.borrow() {
            return Err(ReplicationError::InvalidState {
                expected: "idle pool".to_string(),
                actual: "started".to_string(),
            });
        }

        let view = if self.config.sites.is_empty() {
            QueueView::All(Arc::clone(&self.broker))
        } else {
            QueueView::Sites(self.broker.get_queues(&self.config.sites)?)
        };

        let rate_limiter: Option<Arc<RateLimiter>> = self.config.rate_limit_config().map(|cfg| {
            info!(
                rate_per_sec = cfg.refill_rate,
                burst = cfg.burst_size,
                "Rate limiting enabled for workers"
            );
            Arc::new(RateLimiter::new(cfg))
        });

        let workers = self.config.workers.max(1);
        for worker_id in 0..workers {
            let worker = Worker {
                id: worker_id,
                view: view.clone(),
                connections: Arc::clone(&self.connections),
                ledger: Arc::clone(&self.ledger),
                sink: Arc::clone(&self.sink),
                rate_limiter: rate_limiter.clone(),
            };
            let shutdown_rx = self.shutdown_rx.clone();
            handles.push(tokio::spawn(worker.run(shutdown_rx)));
        }

        info!(
            workers,
            sites = ?self.config.sites,
            "Worker pool started"
        );
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        !self.handles.lock().await.is_empty() && !*self.shutdown_rx.borrow()
    }

    /// Stop taking tasks and wait up to `drain_timeout` per worker for the
    /// task in hand to finish.
    pub async fn shutdown(&self, drain_timeout: Duration) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = {
            let mut guard = self.handles.lock().await;
            std::mem::take(&mut *guard)
        };

        let worker_count = handles.len();
        if worker_count > 0 {
            info!(worker_count, "Waiting for workers to drain");
        }

        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(drain_timeout, handle).await {
                Ok(Ok(())) => debug!(worker = i, "Worker stopped"),
                Ok(Err(e)) => warn!(worker = i, error = %e, "Worker panicked during shutdown"),
                Err(_) => warn!(worker = i, "Worker timed out during shutdown"),
            }
        }

        info!(pending = self.broker.total_len(), "Worker pool stopped");
    }
}

struct Worker {
    id: usize,
    view: QueueView,
    connections: Arc<SiteConnections>,
    ledger: Arc<dyn ItemLedger>,
    sink: Arc<dyn CompletionSink>,
    rate_limiter: Option<Arc<RateLimiter>>,
}

/// Adapters and system names for one task.
struct Endpoints {
    source: Arc<SiteAdapter>,
    destination: Arc<SiteAdapter>,
    source_name: String,
    destination_name: String,
}

impl Worker {
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("worker", worker_id = self.id);
        async move {
            debug!("Worker started");
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let task = tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                        continue;
                    }

                    task = self.view.take() => task,
                };

                if let Some(limiter) = &self.rate_limiter {
                    limiter.acquire().await;
                }
                self.process(task).await;
            }
            debug!("Worker stopped");
        }
        .instrument(span)
        .await
    }

    async fn resolve(&self, info: &TaskInfo) -> std::result::Result<Endpoints, ErrorCode> {
        let source = self
            .connections
            .get(info.source_site())
            .await
            .map_err(|e| error_code(&e))?;
        let destination = self
            .connections
            .get(info.destination_site())
            .await
            .map_err(|e| error_code(&e))?;
        let source_name = source.system_name().await.map_err(|e| e.error_code())?;
        let destination_name = destination.system_name().await.map_err(|e| e.error_code())?;
        Ok(Endpoints {
            source,
            destination,
            source_name,
            destination_name,
        })
    }

    async fn process(&self, task: Task) {
        let info = task.info().clone();
        let attempts = task.attempts();

        let endpoints = match self.resolve(&info).await {
            Ok(endpoints) => endpoints,
            Err(code) => {
                warn!(
                    task_id = info.id(),
                    source = info.source_site(),
                    destination = info.destination_site(),
                    ?code,
                    "Could not resolve task sites"
                );
                let disposition = task.fail(code).await;
                self.report(
                    &info,
                    info.source_site(),
                    info.destination_site(),
                    ItemStatus::Failure,
                    disposition,
                    attempts,
                    TransferOutcome::default(),
                );
                return;
            }
        };

        let Some(metadata) = info.to_metadata() else {
            warn!(task_id = info.id(), "Task carries no metadata, dropping");
            let disposition = task.fail(ErrorCode::UnknownError).await;
            self.report(
                &info,
                &endpoints.source_name,
                &endpoints.destination_name,
                ItemStatus::Failure,
                disposition,
                attempts,
                TransferOutcome::default(),
            );
            return;
        };

        let result = transfer::execute(
            &endpoints.source,
            &endpoints.destination,
            &endpoints.source_name,
            &endpoints.destination_name,
            metadata,
            info.operation(),
        )
        .await;

        let (status, code, outcome) = match result {
            Ok(outcome) if outcome.accepted => (ItemStatus::Success, None, outcome),
            Ok(outcome) => (ItemStatus::Failure, Some(ErrorCode::OperationRejected), outcome),
            Err(e) => {
                debug!(task_id = info.id(), attempts, error = %e, "Transfer failed");
                (ItemStatus::Failure, Some(e.error_code()), TransferOutcome::default())
            }
        };

        let ledger_outcome = match status {
            ItemStatus::Success => ItemOutcome::success(
                info.metadata_id(),
                &endpoints.source_name,
                &endpoints.destination_name,
                info.config_id(),
                outcome.resource_bytes,
                outcome.metadata_bytes,
            ),
            ItemStatus::Failure => ItemOutcome::failure(
                info.metadata_id(),
                &endpoints.source_name,
                &endpoints.destination_name,
                info.config_id(),
            ),
        };

        let (status, code) = match self.ledger.record(ledger_outcome).await {
            Ok(_) => (status, code),
            Err(e) => {
                warn!(task_id = info.id(), error = %e, "Failed to record task outcome");
                (ItemStatus::Failure, Some(code.unwrap_or(ErrorCode::InternalError)))
            }
        };

        let disposition = match code {
            None => task.complete().await,
            Some(code) => task.fail(code).await,
        };

        self.report(
            &info,
            &endpoints.source_name,
            &endpoints.destination_name,
            status,
            disposition,
            attempts,
            outcome,
        );
    }

    #[allow(clippy::too_many_arguments)]
    fn report(
        &self,
        info: &TaskInfo,
        source: &str,
        destination: &str,
        status: ItemStatus,
        disposition: Disposition,
        attempts: u32,
        outcome: TransferOutcome,
    ) {
        let success = status == ItemStatus::Success;
        self.sink.on_completion(&CompletionEvent {
            config_id: info.config_id().to_string(),
            metadata_id: info.metadata_id().to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            operation: info.operation(),
            status,
            terminal: disposition != Disposition::RetryQueued,
            attempts,
            resource_bytes: if success { outcome.resource_bytes } else { 0 },
            metadata_bytes: if success { outcome.metadata_bytes } else { 0 },
        });
    }
}

fn error_code(error: &ReplicationError) -> ErrorCode {
    match error {
        ReplicationError::NotFound { .. } => ErrorCode::NotFound,
        ReplicationError::Adapter(e) => e.error_code(),
        _ => ErrorCode::InternalError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{AdapterRegistry, MemoryAdapter, MemoryAdapterFactory};
    use crate::completion::{ChannelSink, ReplicationEvent};
    use crate::config::{AdapterTimeouts, QueueConfig, ReplicatorConfig, Site};
    use crate::config_store::InMemoryConfigStore;
    use crate::ledger::MemoryItemLedger;
    use crate::model::{Metadata, RawPayload};
    use crate::queue::Operation;
    use chrono::Utc;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        a: Arc<MemoryAdapter>,
        b: Arc<MemoryAdapter>,
        store: Arc<InMemoryConfigStore>,
        broker: Arc<QueueBroker>,
        ledger: Arc<MemoryItemLedger>,
        pool: WorkerPool,
        events: UnboundedReceiver<ReplicationEvent>,
    }

    fn fixture(workers: usize) -> Fixture {
        let a = Arc::new(MemoryAdapter::new("A"));
        let b = Arc::new(MemoryAdapter::new("B"));
        let factory = Arc::new(MemoryAdapterFactory::new());
        factory.register("a", Arc::clone(&a));
        factory.register("b", Arc::clone(&b));
        let registry = Arc::new(AdapterRegistry::new(AdapterTimeouts::default()));
        registry.register(factory);

        let store = InMemoryConfigStore::new();
        store.put_site(Site::for_testing("a", "memory"));
        store.put_site(Site::for_testing("b", "memory"));

        let broker = Arc::new(QueueBroker::new(QueueConfig::default()));
        let ledger = Arc::new(MemoryItemLedger::new());
        let connections = Arc::new(SiteConnections::new(registry, store.clone()));
        let (sink, events) = ChannelSink::new();

        let config = WorkerPoolConfig {
            workers,
            ..WorkerPoolConfig::default()
        };
        let pool = WorkerPool::new(
            config,
            Arc::clone(&broker),
            connections,
            ledger.clone(),
            Arc::new(sink),
        );
        Fixture {
            a,
            b,
            store,
            broker,
            ledger,
            pool,
            events,
        }
    }

    fn task(id: &str, retry_limit: u32) -> TaskInfo {
        let mut config = ReplicatorConfig::for_testing("cfg", "a", "b");
        config.failure_retry_limit = retry_limit;
        let m = Metadata::new(id, "xml", RawPayload::new("text/xml", b"<x/>".to_vec()), Utc::now());
        TaskInfo::new(&config, "a", "b", &m, Operation::Create)
    }

    async fn next_item(events: &mut UnboundedReceiver<ReplicationEvent>) -> CompletionEvent {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
                Ok(Some(ReplicationEvent::Item(event))) => return event,
                Ok(Some(_)) => continue,
                _ => panic!("no completion event"),
            }
        }
    }

    #[tokio::test]
    async fn test_worker_executes_task() {
        let mut f = fixture(2);
        f.pool.start().await.unwrap();
        f.broker.get_queue("b").unwrap().offer(task("m1", 3)).await.unwrap();

        let event = next_item(&mut f.events).await;
        assert!(event.is_success());
        assert!(event.terminal);
        assert_eq!(event.source, "A");
        assert_eq!(event.destination, "B");
        assert!(f.b.get("m1").is_some());

        let row = f.ledger.get("m1", "A", "B").await.unwrap().unwrap();
        assert!(row.is_success());
        f.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_retry_cap_then_dropped() {
        let mut f = fixture(1);
        f.b.set_available(false);
        f.pool.start().await.unwrap();
        f.broker.get_queue("b").unwrap().offer(task("m1", 3)).await.unwrap();

        for attempt in 1..=3 {
            let event = next_item(&mut f.events).await;
            assert_eq!(event.attempts, attempt);
            assert_eq!(event.terminal, attempt == 3);
        }

        let row = f.ledger.get("m1", "A", "B").await.unwrap().unwrap();
        assert_eq!(row.failure_count, 3);
        assert_eq!(f.broker.total_len(), 0);
        f.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_rejection_dropped_immediately() {
        let mut f = fixture(1);
        // Destination already holds the record, so CREATE is rejected.
        f.b.insert(Metadata::new("m1", "xml", RawPayload::new("text/xml", b"<x/>".to_vec()), Utc::now()));
        f.pool.start().await.unwrap();
        f.broker.get_queue("b").unwrap().offer(task("m1", 5)).await.unwrap();

        let event = next_item(&mut f.events).await;
        assert!(event.is_terminal_failure());
        assert_eq!(event.attempts, 1);
        f.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_missing_site_dropped() {
        let mut f = fixture(1);
        f.store.remove_site("a");
        f.pool.start().await.unwrap();
        f.broker.get_queue("b").unwrap().offer(task("m1", 5)).await.unwrap();

        let event = next_item(&mut f.events).await;
        assert!(event.is_terminal_failure());
        assert_eq!(event.source, "a");
        assert!(f.ledger.is_empty());
        f.pool.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_keeps_queued_tasks() {
        let f = fixture(2);
        f.pool.start().await.unwrap();
        assert!(f.pool.is_running().await);
        f.pool.shutdown(Duration::from_secs(1)).await;
        assert!(!f.pool.is_running().await);

        f.broker.get_queue("b").unwrap().offer(task("m1", 5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.broker.total_len(), 1);
        assert!(f.b.is_empty());
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let f = fixture(1);
        f.pool.start().await.unwrap();
        assert!(matches!(
            f.pool.start().await,
            Err(ReplicationError::InvalidState { .. })
        ));
        f.pool.shutdown(Duration::from_secs(1)).await;
    }
}
