//! Engine and cycle state types.
//!
//! # Engine State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Running
//!    │                            │
//!    │ shutdown()                 │ shutdown()
//!    ↓                            ↓
//! Stopped ←──────────────── ShuttingDown
//!                                 │
//!                   (drain failed) ↓
//!                               Failed
//! ```
//!
//! # Cycle States (per config)
//!
//! ```text
//! Idle ──→ Querying ──→ Processing ──→ Idle
//!   ↑                                   │
//!   └──────────── (period) ─────────────┘
//!
//! Suspended: config flagged suspended; checked at the top of every tick.
//! ```

use crate::config::Direction;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// State of the replication engine.
///
/// See module docs for the state transition diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Engine created but not started.
    ///
    /// Call [`start()`](super::ReplicationEngine::start) to begin replication.
    Created,

    /// Schedulers and workers are running.
    Running,

    /// Shutting down gracefully.
    ///
    /// In-flight cycles stop between items, workers finish their current task.
    ShuttingDown,

    /// Engine has shut down cleanly. Safe to drop.
    Stopped,

    /// Shutdown did not complete within the drain timeout.
    Failed,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineState::Created => write!(f, "Created"),
            EngineState::Running => write!(f, "Running"),
            EngineState::ShuttingDown => write!(f, "ShuttingDown"),
            EngineState::Stopped => write!(f, "Stopped"),
            EngineState::Failed => write!(f, "Failed"),
        }
    }
}

/// Where a config's cycle driver currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleState {
    Idle,
    Querying,
    Processing,
    Suspended,
}

impl std::fmt::Display for CycleState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CycleState::Idle => write!(f, "Idle"),
            CycleState::Querying => write!(f, "Querying"),
            CycleState::Processing => write!(f, "Processing"),
            CycleState::Suspended => write!(f, "Suspended"),
        }
    }
}

/// How a cycle ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleStatus {
    /// Every record was visited. Individual items may still have failed.
    Success,
    /// One of the sites was down before the cycle started.
    ConnectionUnavailable,
    /// A site went down mid-cycle; the remaining records were skipped.
    ConnectionLost,
    /// Shutdown or an explicit cancel stopped the cycle between items.
    Canceled,
    /// Infrastructure failure (query, ledger or queue).
    Failure,
}

impl CycleStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleStatus::Success => "success",
            CycleStatus::ConnectionUnavailable => "connection_unavailable",
            CycleStatus::ConnectionLost => "connection_lost",
            CycleStatus::Canceled => "canceled",
            CycleStatus::Failure => "failure",
        }
    }

    pub fn is_success(&self) -> bool {
        *self == CycleStatus::Success
    }
}

impl std::fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summary of one cycle leg (one direction of one config).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    pub config_id: String,
    /// `Push` for source → destination, `Pull` for destination → source.
    pub direction: Direction,
    /// Site id records were read from.
    pub source_site: String,
    /// Site id records were written to.
    pub destination_site: String,
    pub status: CycleStatus,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    /// Records handed to the destination queue (queued mode).
    pub enqueued: u64,
    /// Records left for the next cycle because the destination queue was full.
    #[serde(default)]
    pub deferred: u64,
    pub resource_bytes: u64,
    pub metadata_bytes: u64,
    pub started_at: DateTime<Utc>,
    #[serde(with = "duration_str")]
    pub duration: Duration,
    /// Message of the failure that ended the cycle, if any.
    pub error: Option<String>,
}

impl CycleReport {
    pub(crate) fn new(config_id: &str, direction: Direction, source_site: &str, destination_site: &str) -> Self {
        Self {
            config_id: config_id.to_string(),
            direction,
            source_site: source_site.to_string(),
            destination_site: destination_site.to_string(),
            status: CycleStatus::Success,
            processed: 0,
            succeeded: 0,
            failed: 0,
            enqueued: 0,
            deferred: 0,
            resource_bytes: 0,
            metadata_bytes: 0,
            started_at: Utc::now(),
            duration: Duration::ZERO,
            error: None,
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.resource_bytes + self.metadata_bytes
    }
}

/// Serialize a `Duration` as a humantime string ("1s 500ms").
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(EngineState::Created.to_string(), "Created");
        assert_eq!(EngineState::Running.to_string(), "Running");
        assert_eq!(EngineState::ShuttingDown.to_string(), "ShuttingDown");
        assert_eq!(EngineState::Stopped.to_string(), "Stopped");
        assert_eq!(EngineState::Failed.to_string(), "Failed");
    }

    #[test]
    fn test_cycle_status_labels() {
        assert_eq!(CycleStatus::ConnectionLost.to_string(), "connection_lost");
        assert!(CycleStatus::Success.is_success());
        assert!(!CycleStatus::Canceled.is_success());
    }

    #[test]
    fn test_report_json_roundtrip() {
        let mut report = CycleReport::new("cfg", Direction::Push, "a", "b");
        report.duration = Duration::from_millis(1500);
        report.resource_bytes = 10;
        report.metadata_bytes = 5;

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"1s 500ms\""));
        let back: CycleReport = serde_json::from_str(&json).unwrap();
        assert_eq!(back, report);
        assert_eq!(back.total_bytes(), 15);
    }
}
