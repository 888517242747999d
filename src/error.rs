// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the replication engine.
//!
//! Errors are split by the boundary they come from. Adapter and queue errors
//! have their own types because adapters and queues are consumed by code that
//! needs to inspect them (retry decisions, task disposition). Everything
//! else funnels into [`ReplicationError`].
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Adapter` | Yes | Remote communication or protocol failure |
//! | `Ledger` | No | Ledger store failure, cycle/task retried next schedule |
//! | `Queue` | Yes | Broker could not accept the task |
//! | `NotFound` | No | Referenced site or config vanished |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Engine state machine violation |
//! | `Shutdown` | No | Engine is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! [`ReplicationError::is_retryable()`] answers whether the *next scheduled
//! cycle* can be expected to succeed without operator action. Item-level
//! retries are driven by the ledger failure count, not by this flag.

use crate::queue::ErrorCode;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Result type for node adapter calls.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Failure talking to a remote site through a node adapter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// Transport failure (connection refused, reset, TLS, ...).
    #[error("communication with {site} failed: {message}")]
    Communication { site: String, message: String },

    /// The call did not finish within the configured timeout.
    #[error("{operation} against {site} timed out after {timeout_ms}ms")]
    Timeout {
        site: String,
        operation: String,
        timeout_ms: u64,
    },

    /// The remote site answered with something we could not interpret.
    #[error("protocol error from {site}: {message}")]
    Protocol { site: String, message: String },

    /// The adapter was already closed.
    #[error("adapter for {site} is closed")]
    Closed { site: String },
}

impl AdapterError {
    /// Convenience constructor for transport failures.
    pub fn communication(site: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            site: site.into(),
            message: message.into(),
        }
    }

    /// Whether retrying the same call later could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Communication { .. } => true,
            Self::Timeout { .. } => true,
            Self::Protocol { .. } => false,
            Self::Closed { .. } => false,
        }
    }

    /// Task error code used when this error fails a queued task.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Communication { .. } => ErrorCode::SiteUnavailable,
            Self::Timeout { .. } => ErrorCode::SiteTimeout,
            Self::Protocol { .. } | Self::Closed { .. } => ErrorCode::UnknownError,
        }
    }
}

/// Failure of the task queue broker.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// No queue exists for the site and one could not be deployed.
    #[error("queue for site {site} is unavailable: {reason}")]
    Unavailable { site: String, reason: String },

    /// The broker has been closed.
    #[error("queue broker is closed")]
    Closed,

    /// The task journal could not be written or read.
    #[error("task journal error: {0}")]
    Journal(String),
}

/// Errors that can occur during replication.
///
/// Use [`is_retryable()`](Self::is_retryable) to check if the next
/// scheduled attempt is expected to recover on its own.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Remote site failure.
    ///
    /// Retryable: adapters recover when the remote comes back.
    #[error("Adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// SQLite error in the item ledger.
    ///
    /// Aborts the current cycle or task. The next schedule retries from the
    /// persisted cursor.
    #[error("Ledger error: {0}")]
    Ledger(#[from] sqlx::Error),

    /// A ledger row held a value we could not decode.
    #[error("Ledger row corrupt ({field}): {value}")]
    LedgerCorrupt { field: String, value: String },

    /// Broker failure while enqueueing.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// A referenced site, config or adapter type does not exist.
    ///
    /// Not retryable: the cycle is skipped until configuration changes.
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Engine state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running engine).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ReplicationError {
    /// Create a not-found error.
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Adapter(e) => e.is_transient(),
            Self::Queue(_) => true,
            Self::Ledger(_) => false, // Local DB issues need attention
            Self::LedgerCorrupt { .. } => false,
            Self::NotFound { .. } => false,
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}
