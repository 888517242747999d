//! # Catalog Replication
//!
//! Scheduled, resumable replication of metadata records (and their binary
//! resources) between independently operated catalog sites.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                           catalog-replication                             │
//! │                                                                           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────────────────────────┐  │
//! │  │ ConfigStore │───►│  Scheduler   │───►│ Reconciler (one cycle)       │  │
//! │  │ (jobs/sites)│    │ (per config) │    │ query → classify → execute   │  │
//! │  └─────────────┘    └──────────────┘    └──────────────────────────────┘  │
//! │                                             │ direct          │ queued    │
//! │                                             ▼                 ▼           │
//! │  ┌─────────────┐    ┌──────────────┐    ┌──────────┐    ┌────────────┐    │
//! │  │ ItemLedger  │◄───│   transfer   │◄───│ Adapters │    │ QueueBroker│    │
//! │  │ (SQLite)    │    │              │◄───┼──────────┼────│ WorkerPool │    │
//! │  └─────────────┘    └──────────────┘    └──────────┘    └────────────┘    │
//! │         │                                                                 │
//! │         ▼                                                                 │
//! │  ┌────────────────┐                                                       │
//! │  │ CompletionSink │  item outcomes, cycle reports, engine state           │
//! │  └────────────────┘                                                       │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Resumability
//!
//! Each cycle asks the source only for records modified after the newest
//! successful transfer between the two sites, plus records that failed fewer
//! than `failure_retry_limit` times. Records whose lineage already contains
//! the destination are skipped, so bidirectional jobs do not echo.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use catalog_replication::{
//!     AdapterRegistry, EngineSettings, InMemoryConfigStore, MetricsSink, ReplicationEngine,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let settings = EngineSettings::default();
//!     let configs = InMemoryConfigStore::new();
//!     let registry = Arc::new(AdapterRegistry::new(settings.adapter.clone()));
//!     // registry.register(Arc::new(MyCatalogAdapterFactory::new()));
//!
//!     let mut engine = ReplicationEngine::open(settings, configs, registry, Arc::new(MetricsSink))
//!         .await
//!         .expect("Failed to open stores");
//!     engine.start().await.expect("Failed to start");
//!
//!     // Engine runs until shutdown signal
//!     engine.shutdown().await;
//! }
//! ```

pub mod adapter;
pub mod completion;
pub mod config;
pub mod config_store;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod metrics;
pub mod model;
pub mod queue;
pub mod resilience;
pub mod transfer;
pub mod worker;

// Re-exports for convenience
pub use adapter::{
    AdapterFactory, AdapterRegistry, MemoryAdapter, MemoryAdapterFactory, NodeAdapter, SiteAdapter,
    SiteConnections,
};
pub use completion::{
    ChannelSink, CompletionEvent, CompletionSink, MetricsSink, NoOpSink, ReplicationEvent,
};
pub use config::{
    AdapterTimeouts, Direction, EngineSettings, ExecutionMode, LedgerConfig, QueueConfig,
    ReplicatorConfig, Site, WorkerPoolConfig,
};
pub use config_store::{ConfigStore, InMemoryConfigStore};
pub use engine::{CycleReport, CycleState, CycleStatus, EngineState, ReplicationEngine};
pub use error::{AdapterError, QueueError, ReplicationError, Result};
pub use ledger::{
    ItemLedger, ItemOutcome, ItemStatus, MemoryItemLedger, ReplicationItem, SqliteItemLedger,
};
pub use model::{Metadata, QueryRequest, QueryResponse, RawPayload};
pub use queue::{
    CompositeQueue, Disposition, ErrorCode, Operation, QueueBroker, SiteQueue, Task, TaskInfo,
};
pub use worker::WorkerPool;
