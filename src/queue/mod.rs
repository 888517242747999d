// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Task model and per-site priority queues.
//!
//! Queued-mode cycles turn each discovered change into a [`TaskInfo`] and put
//! it on the destination site's [`SiteQueue`]. Workers pop from a single
//! queue or a [`CompositeQueue`] spanning several sites.
//!
//! # Ordering
//!
//! Within a site: priority descending, FIFO within a priority. Across sites
//! (composite): the highest priority head wins; sites that tie on priority
//! are not ordered relative to each other.
//!
//! # Task Lifecycle
//!
//! ```text
//!            offer/put            take
//! TaskInfo ───────────→ Queued ──────────→ InProgress (Task handle)
//!                         ↑                    │
//!                         │  fail(retryable)   ├── complete() ──→ Completed
//!                         └── attempts < limit ┤
//!                                              └── fail(...) ───→ Dropped
//! ```
//!
//! A [`Task`] handle that is dropped without being resolved goes back to its
//! queue unchanged, so a crashed worker never loses work.

mod broker;
mod journal;
mod site;

pub use broker::{CompositeQueue, QueueBroker};
pub use journal::TaskJournal;
pub use site::{SiteQueue, Task};
pub(crate) use site::Enqueued;

use crate::config::ReplicatorConfig;
use crate::model::{Metadata, RawPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Highest task priority.
pub const MAX_PRIORITY: u8 = 9;

static TASK_SEQ: AtomicU64 = AtomicU64::new(0);

/// Operation a task performs at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Create => "CREATE",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task failed. Decides whether it is requeued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InternalError,
    SiteUnavailable,
    SiteTimeout,
    UpstreamServiceUnavailable,
    UpstreamServiceTimeout,
    /// The destination refused the write (well-formed rejection).
    OperationRejected,
    /// A site referenced by the task no longer exists.
    NotFound,
    UnknownError,
}

impl ErrorCode {
    pub fn should_be_retried(&self) -> bool {
        matches!(
            self,
            ErrorCode::InternalError
                | ErrorCode::SiteUnavailable
                | ErrorCode::SiteTimeout
                | ErrorCode::UpstreamServiceUnavailable
                | ErrorCode::UpstreamServiceTimeout
        )
    }
}

/// What happened to a task once its holder resolved it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Completed,
    RetryQueued,
    Dropped,
}

/// Resource reference carried by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInfo {
    pub uri: String,
    pub size: u64,
    pub modified: DateTime<Utc>,
}

/// One metadata fragment of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataInfo {
    pub metadata_type: String,
    pub payload: RawPayload,
    pub tags: BTreeSet<String>,
    pub lineage: Vec<String>,
    pub last_modified: DateTime<Utc>,
}

impl MetadataInfo {
    pub fn size(&self) -> u64 {
        self.payload.len() as u64
    }
}

/// Immutable description of one record's pending transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInfo {
    id: String,
    config_id: String,
    source_site: String,
    destination_site: String,
    priority: u8,
    operation: Operation,
    metadata_id: String,
    last_modified: DateTime<Utc>,
    resource: Option<ResourceInfo>,
    metadata: Vec<MetadataInfo>,
    retry_limit: u32,
    /// Failed attempts made before this task was built (earlier cycles).
    #[serde(default)]
    prior_attempts: u32,
}

impl TaskInfo {
    /// Build a task for `metadata` flowing from `source_site` to
    /// `destination_site` on behalf of `config`.
    pub fn new(
        config: &ReplicatorConfig,
        source_site: &str,
        destination_site: &str,
        metadata: &Metadata,
        operation: Operation,
    ) -> Self {
        let resource = match (&metadata.resource_uri, operation) {
            (Some(uri), Operation::Create | Operation::Update) => Some(ResourceInfo {
                uri: uri.clone(),
                size: metadata.resource_size.unwrap_or(0),
                modified: metadata.resource_modified.unwrap_or(metadata.metadata_modified),
            }),
            _ => None,
        };

        Self {
            id: format!(
                "{}:{}:{}-{}",
                config.id,
                metadata.id,
                Utc::now().timestamp_micros(),
                TASK_SEQ.fetch_add(1, AtomicOrdering::Relaxed)
            ),
            config_id: config.id.clone(),
            source_site: source_site.to_string(),
            destination_site: destination_site.to_string(),
            priority: config.priority.min(MAX_PRIORITY),
            operation,
            metadata_id: metadata.id.clone(),
            last_modified: metadata.metadata_modified,
            resource,
            metadata: vec![MetadataInfo {
                metadata_type: metadata.metadata_type.clone(),
                payload: metadata.payload.clone(),
                tags: metadata.tags.clone(),
                lineage: metadata.lineage.clone(),
                last_modified: metadata.metadata_modified,
            }],
            retry_limit: config.retry_limit(),
            prior_attempts: 0,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config_id(&self) -> &str {
        &self.config_id
    }

    pub fn source_site(&self) -> &str {
        &self.source_site
    }

    pub fn destination_site(&self) -> &str {
        &self.destination_site
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn metadata_id(&self) -> &str {
        &self.metadata_id
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    pub fn resource(&self) -> Option<&ResourceInfo> {
        self.resource.as_ref()
    }

    pub fn metadata(&self) -> &[MetadataInfo] {
        &self.metadata
    }

    pub fn retry_limit(&self) -> u32 {
        self.retry_limit
    }

    pub fn prior_attempts(&self) -> u32 {
        self.prior_attempts
    }

    /// Count `attempts` already spent on this record against the retry limit.
    pub fn with_prior_attempts(mut self, attempts: u32) -> Self {
        self.prior_attempts = attempts;
        self
    }

    /// Copy with a different priority, clamped to the valid range.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.min(MAX_PRIORITY);
        self
    }

    /// Identity used to suppress duplicate tasks on a queue.
    pub(crate) fn dedup_key(&self) -> String {
        format!(
            "{}\u{1f}{}\u{1f}{}",
            self.metadata_id, self.source_site, self.destination_site
        )
    }

    /// Rebuild the record this task transfers, from its first fragment.
    pub fn to_metadata(&self) -> Option<Metadata> {
        let primary = self.metadata.first()?;
        let mut metadata = Metadata::new(
            self.metadata_id.clone(),
            primary.metadata_type.clone(),
            primary.payload.clone(),
            primary.last_modified,
        );
        metadata.tags = primary.tags.clone();
        metadata.lineage = primary.lineage.clone();
        if let Some(resource) = &self.resource {
            metadata = metadata.with_resource(resource.uri.clone(), resource.size, resource.modified);
        }
        Some(metadata)
    }
}

/// A task plus the queue's bookkeeping for it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedTask {
    pub info: TaskInfo,
    /// Prior attempts + 1 when first queued, +1 on every requeue.
    pub attempts: u32,
    pub original_queued_time: DateTime<Utc>,
    pub queued_time: DateTime<Utc>,
}

impl QueuedTask {
    pub fn new(info: TaskInfo) -> Self {
        let now = Utc::now();
        Self {
            attempts: info.prior_attempts.saturating_add(1),
            info,
            original_queued_time: now,
            queued_time: now,
        }
    }

    /// Bookkeeping for the next attempt.
    pub(crate) fn next_attempt(mut self) -> Self {
        self.attempts += 1;
        self.queued_time = Utc::now();
        self
    }
}
