//! Configuration for the replication engine.
//!
//! Two kinds of configuration live here:
//!
//! - [`EngineSettings`]: process-level tuning assembled once at start-up and
//!   passed to [`ReplicationEngine::new()`](crate::ReplicationEngine::new).
//! - [`ReplicatorConfig`] and [`Site`]: replication jobs and the sites they
//!   reference. These are created and edited externally and read through the
//!   [`ConfigStore`](crate::config_store::ConfigStore) boundary on every cycle.
//!
//! # Configuration Structure
//!
//! ```text
//! EngineSettings
//! ├── scan_interval: "30s"          # how often new configs are picked up
//! ├── exclude_destination: bool     # local exclusion of the destination
//! ├── page_size: usize
//! ├── shutdown_timeout: "10s"
//! ├── adapter: AdapterTimeouts      # connect / receive timeouts
//! ├── ledger: LedgerConfig          # SQLite item ledger
//! ├── queue: QueueConfig            # capacity, max queues, journal
//! └── workers: WorkerPoolConfig     # pool size, queue view, rate limit
//! ```
//!
//! # JSON Example
//!
//! ```json
//! {
//!   "id": "nightly-pull",
//!   "name": "Nightly pull",
//!   "source": "site-a",
//!   "destination": "site-b",
//!   "filter": "title like '%'",
//!   "direction": "push",
//!   "period": "5m",
//!   "failure_retry_limit": 5
//! }
//! ```

use crate::resilience::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Parse a humantime duration, falling back to `default` when it is invalid.
fn parse_duration_or(value: &str, default: Duration) -> Duration {
    humantime::parse_duration(value).unwrap_or(default)
}

// ═══════════════════════════════════════════════════════════════════════════════
// Sites and replication jobs
// ═══════════════════════════════════════════════════════════════════════════════

/// An independently operated catalog node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    /// Endpoint URL or path handed to the adapter factory.
    pub address: String,
    /// Adapter-type tag used to pick the factory (e.g. "csw", "rest", "fs").
    pub adapter_type: String,
    /// Replication for this site is driven by another node.
    #[serde(default)]
    pub remote_managed: bool,
}

impl Site {
    /// Create a site for testing.
    pub fn for_testing(id: &str, adapter_type: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            address: format!("mem://{}", id),
            adapter_type: adapter_type.to_string(),
            remote_managed: false,
        }
    }
}

/// Which way records flow between the configured source and destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// source → destination
    #[default]
    Push,
    /// destination → source
    Pull,
    /// Pull first, then push if the pull succeeded.
    Both,
}

/// How a cycle executes the operations it discovers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Execute against the destination inside the cycle.
    #[default]
    Direct,
    /// Build tasks and hand them to the worker pool.
    Queued,
}

/// A named replication job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    pub id: String,
    pub name: String,
    /// Source site id.
    pub source: String,
    /// Destination site id.
    pub destination: String,
    /// Selection predicate, interpreted by the source adapter.
    #[serde(default)]
    pub filter: String,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Cycle period as a humantime string.
    #[serde(default = "default_period")]
    pub period: String,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default = "default_failure_retry_limit")]
    pub failure_retry_limit: u32,
    /// Task priority, 0 (lowest) to 9 (highest).
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default)]
    pub description: Option<String>,
}

fn default_period() -> String {
    "5m".to_string()
}

fn default_failure_retry_limit() -> u32 {
    5
}

fn default_priority() -> u8 {
    5
}

impl ReplicatorConfig {
    /// Create a push job between two sites for testing.
    pub fn for_testing(id: &str, source: &str, destination: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            source: source.to_string(),
            destination: destination.to_string(),
            filter: String::new(),
            direction: Direction::Push,
            mode: ExecutionMode::Direct,
            period: default_period(),
            suspended: false,
            failure_retry_limit: default_failure_retry_limit(),
            priority: default_priority(),
            description: None,
        }
    }

    /// Cycle period, defaulting to 5 minutes when unparsable.
    pub fn period_duration(&self) -> Duration {
        parse_duration_or(&self.period, Duration::from_secs(300))
    }

    /// Retry limit, never below one attempt.
    pub fn retry_limit(&self) -> u32 {
        self.failure_retry_limit.max(1)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// EngineSettings: process-level tuning
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings assembled at process start and handed to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// How often the configuration boundary is scanned for new jobs.
    #[serde(default = "default_scan_interval")]
    pub scan_interval: String,

    /// Exclude records whose lineage already contains the destination.
    #[serde(default = "default_true")]
    pub exclude_destination: bool,

    /// Page size requested from source adapters.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// How long shutdown waits for each task to drain.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: String,

    #[serde(default)]
    pub adapter: AdapterTimeouts,

    #[serde(default)]
    pub ledger: LedgerConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub workers: WorkerPoolConfig,
}

fn default_scan_interval() -> String {
    "30s".to_string()
}

fn default_true() -> bool {
    true
}

fn default_page_size() -> usize {
    100
}

fn default_shutdown_timeout() -> String {
    "10s".to_string()
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            scan_interval: default_scan_interval(),
            exclude_destination: true,
            page_size: default_page_size(),
            shutdown_timeout: default_shutdown_timeout(),
            adapter: AdapterTimeouts::default(),
            ledger: LedgerConfig::default(),
            queue: QueueConfig::default(),
            workers: WorkerPoolConfig::default(),
        }
    }
}

impl EngineSettings {
    /// Settings for tests: in-memory ledger, short intervals.
    pub fn for_testing() -> Self {
        Self {
            scan_interval: "50ms".to_string(),
            shutdown_timeout: "2s".to_string(),
            adapter: AdapterTimeouts {
                connect_timeout: "500ms".to_string(),
                receive_timeout: "1s".to_string(),
            },
            ledger: LedgerConfig::in_memory(),
            workers: WorkerPoolConfig {
                enabled: false,
                workers: 2,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn scan_interval_duration(&self) -> Duration {
        parse_duration_or(&self.scan_interval, Duration::from_secs(30))
    }

    pub fn shutdown_timeout_duration(&self) -> Duration {
        parse_duration_or(&self.shutdown_timeout, Duration::from_secs(10))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// AdapterTimeouts
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-call timeouts applied to every node adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterTimeouts {
    /// Bounds availability probes.
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
    /// Bounds every other call, including each item pulled from a query.
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout: String,
}

fn default_connect_timeout() -> String {
    "30s".to_string()
}

fn default_receive_timeout() -> String {
    "60s".to_string()
}

impl Default for AdapterTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: default_connect_timeout(),
            receive_timeout: default_receive_timeout(),
        }
    }
}

impl AdapterTimeouts {
    pub fn connect(&self) -> Duration {
        parse_duration_or(&self.connect_timeout, Duration::from_secs(30))
    }

    pub fn receive(&self) -> Duration {
        parse_duration_or(&self.receive_timeout, Duration::from_secs(60))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// LedgerConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// SQLite item ledger settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Path to SQLite database file.
    #[serde(default = "default_ledger_path")]
    pub sqlite_path: String,

    /// Use WAL mode.
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_ledger_path() -> String {
    "replication_ledger.db".to_string()
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_ledger_path(),
            wal_mode: true,
        }
    }
}

impl LedgerConfig {
    /// In-memory database, single connection, no WAL.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueueConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Task queue broker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Maximum tasks held by one site queue.
    #[serde(default = "default_queue_capacity")]
    pub capacity: usize,

    /// Maximum number of site queues the broker will deploy.
    #[serde(default = "default_max_queues")]
    pub max_queues: usize,

    /// SQLite journal for queued tasks. `None` keeps tasks in memory only.
    #[serde(default)]
    pub journal_path: Option<String>,
}

fn default_queue_capacity() -> usize {
    10_000
}

fn default_max_queues() -> usize {
    256
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: default_queue_capacity(),
            max_queues: default_max_queues(),
            journal_path: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// WorkerPoolConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Worker pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Start the pool with the engine.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Number of concurrent workers.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Sites whose queues the workers drain. Empty means every deployed queue.
    #[serde(default)]
    pub sites: Vec<String>,

    /// Throttle task execution (tasks per second).
    #[serde(default)]
    pub rate_limit_enabled: bool,

    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_workers() -> usize {
    4
}

fn default_rate_limit_per_sec() -> u32 {
    50
}

fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            workers: default_workers(),
            sites: Vec::new(),
            rate_limit_enabled: false,
            rate_limit_per_sec: default_rate_limit_per_sec(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

impl WorkerPoolConfig {
    /// Rate limit settings, if enabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replicator_config_defaults_from_json() {
        let json = r#"{
            "id": "job-1",
            "name": "Job 1",
            "source": "site-a",
            "destination": "site-b"
        }"#;
        let config: ReplicatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.direction, Direction::Push);
        assert_eq!(config.mode, ExecutionMode::Direct);
        assert_eq!(config.period_duration(), Duration::from_secs(300));
        assert_eq!(config.failure_retry_limit, 5);
        assert_eq!(config.priority, 5);
        assert!(!config.suspended);
    }

    #[test]
    fn test_direction_serde_lowercase() {
        let json = r#"{
            "id": "job-1", "name": "Job 1", "source": "a", "destination": "b",
            "direction": "both", "mode": "queued", "period": "90s"
        }"#;
        let config: ReplicatorConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.direction, Direction::Both);
        assert_eq!(config.mode, ExecutionMode::Queued);
        assert_eq!(config.period_duration(), Duration::from_secs(90));
    }

    #[test]
    fn test_invalid_period_falls_back() {
        let mut config = ReplicatorConfig::for_testing("j", "a", "b");
        config.period = "soon".to_string();
        assert_eq!(config.period_duration(), Duration::from_secs(300));
    }

    #[test]
    fn test_retry_limit_floor() {
        let mut config = ReplicatorConfig::for_testing("j", "a", "b");
        config.failure_retry_limit = 0;
        assert_eq!(config.retry_limit(), 1);
    }

    #[test]
    fn test_engine_settings_defaults() {
        let settings = EngineSettings::default();
        assert_eq!(settings.scan_interval_duration(), Duration::from_secs(30));
        assert_eq!(settings.shutdown_timeout_duration(), Duration::from_secs(10));
        assert_eq!(settings.adapter.connect(), Duration::from_secs(30));
        assert_eq!(settings.adapter.receive(), Duration::from_secs(60));
        assert!(settings.exclude_destination);
        assert!(settings.workers.rate_limit_config().is_none());
    }

    #[test]
    fn test_engine_settings_from_empty_json() {
        let settings: EngineSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.page_size, 100);
        assert_eq!(settings.queue.capacity, 10_000);
        assert_eq!(settings.workers.workers, 4);
        assert!(settings.ledger.wal_mode);
    }

    #[test]
    fn test_ledger_in_memory() {
        let config = LedgerConfig::in_memory();
        assert!(config.is_in_memory());
        assert!(!config.wal_mode);
        assert!(!LedgerConfig::default().is_in_memory());
    }

    #[test]
    fn test_rate_limit_config_enabled() {
        let workers = WorkerPoolConfig {
            rate_limit_enabled: true,
            rate_limit_per_sec: 20,
            rate_limit_burst: 4,
            ..Default::default()
        };
        let cfg = workers.rate_limit_config().unwrap();
        assert_eq!(cfg.refill_rate, 20);
        assert_eq!(cfg.burst_size, 4);
    }

    #[test]
    fn test_site_roundtrip() {
        let site = Site::for_testing("site-a", "mem");
        let json = serde_json::to_string(&site).unwrap();
        let parsed: Site = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, site);
    }
}
