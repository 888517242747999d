// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Item ledger: last known replication outcome per (record, source, destination).
//!
//! The ledger is what makes replication resumable and idempotent:
//! - the newest successful `done_time` of a (source, destination) pair is the
//!   query cursor for the next cycle
//! - rows in `FAILURE` below the retry limit are forcibly re-included
//! - exactly one row exists per key; every attempt overwrites it
//!
//! # Merge Rule
//!
//! ```text
//! outcome SUCCESS → status=SUCCESS, failure_count=0, bytes += transferred
//! outcome FAILURE → status=FAILURE, failure_count += 1
//! outcome deferred → status=FAILURE, failure_count and done_time unchanged
//! older done_time than the stored row → ignored (last writer wins)
//! ```
//!
//! A deferred outcome marks a record that was never attempted (its queue was
//! full). It keeps the record in the failure list without spending any of
//! its retry budget.
//!
//! The merge runs atomically inside the store ([`ItemLedger::record`]), so
//! concurrent workers never race on a read-modify-write.

mod memory;
mod sqlite;

pub use memory::MemoryItemLedger;
pub use sqlite::SqliteItemLedger;
pub(crate) use sqlite::{execute_with_retry, open_pool};

use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;

/// Type alias for boxed ledger futures.
pub type LedgerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Outcome of the latest attempt for a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ItemStatus {
    Success,
    Failure,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Success => "SUCCESS",
            ItemStatus::Failure => "FAILURE",
        }
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemStatus {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "SUCCESS" => Ok(ItemStatus::Success),
            "FAILURE" => Ok(ItemStatus::Failure),
            other => Err(ReplicationError::LedgerCorrupt {
                field: "status".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// One ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationItem {
    pub metadata_id: String,
    /// Source system name.
    pub source: String,
    /// Destination system name.
    pub destination: String,
    pub config_id: String,
    pub done_time: DateTime<Utc>,
    pub status: ItemStatus,
    pub failure_count: u32,
    pub resource_bytes: u64,
    pub metadata_bytes: u64,
}

/// The result of a single attempt, merged into the ledger by [`ItemLedger::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemOutcome {
    pub metadata_id: String,
    pub source: String,
    pub destination: String,
    pub config_id: String,
    pub done_time: DateTime<Utc>,
    pub status: ItemStatus,
    /// No attempt was made; see [`ItemOutcome::deferred`].
    pub deferred: bool,
    pub resource_bytes: u64,
    pub metadata_bytes: u64,
}

impl ItemOutcome {
    pub fn success(
        metadata_id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        config_id: impl Into<String>,
        resource_bytes: u64,
        metadata_bytes: u64,
    ) -> Self {
        Self {
            metadata_id: metadata_id.into(),
            source: source.into(),
            destination: destination.into(),
            config_id: config_id.into(),
            done_time: Utc::now(),
            status: ItemStatus::Success,
            deferred: false,
            resource_bytes,
            metadata_bytes,
        }
    }

    pub fn failure(
        metadata_id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        config_id: impl Into<String>,
    ) -> Self {
        Self {
            metadata_id: metadata_id.into(),
            source: source.into(),
            destination: destination.into(),
            config_id: config_id.into(),
            done_time: Utc::now(),
            status: ItemStatus::Failure,
            deferred: false,
            resource_bytes: 0,
            metadata_bytes: 0,
        }
    }

    /// The record could not be handed off and must be offered again next
    /// cycle, without counting as a failed attempt.
    pub fn deferred(
        metadata_id: impl Into<String>,
        source: impl Into<String>,
        destination: impl Into<String>,
        config_id: impl Into<String>,
    ) -> Self {
        Self {
            deferred: true,
            ..Self::failure(metadata_id, source, destination, config_id)
        }
    }
}

impl ReplicationItem {
    /// Row created by the first attempt for a key.
    pub fn from_outcome(outcome: &ItemOutcome) -> Self {
        Self {
            metadata_id: outcome.metadata_id.clone(),
            source: outcome.source.clone(),
            destination: outcome.destination.clone(),
            config_id: outcome.config_id.clone(),
            done_time: outcome.done_time,
            status: outcome.status,
            failure_count: match outcome.status {
                ItemStatus::Success => 0,
                ItemStatus::Failure if outcome.deferred => 0,
                ItemStatus::Failure => 1,
            },
            resource_bytes: outcome.resource_bytes,
            metadata_bytes: outcome.metadata_bytes,
        }
    }

    /// Apply an attempt to an existing row. Returns false if the outcome is
    /// older than the row and was ignored.
    pub fn merge(&mut self, outcome: &ItemOutcome) -> bool {
        if outcome.done_time < self.done_time {
            return false;
        }
        self.config_id = outcome.config_id.clone();
        if outcome.deferred {
            self.status = ItemStatus::Failure;
            return true;
        }
        self.done_time = outcome.done_time;
        self.status = outcome.status;
        match outcome.status {
            ItemStatus::Success => self.failure_count = 0,
            ItemStatus::Failure => self.failure_count = self.failure_count.saturating_add(1),
        }
        self.resource_bytes = self.resource_bytes.saturating_add(outcome.resource_bytes);
        self.metadata_bytes = self.metadata_bytes.saturating_add(outcome.metadata_bytes);
        true
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }

    /// True when the row records `limit` or more failed attempts made no
    /// earlier than `modified`, i.e. this version of the record has used
    /// up its retry budget.
    pub fn is_exhausted(&self, limit: u32, modified: DateTime<Utc>) -> bool {
        self.status == ItemStatus::Failure && self.failure_count >= limit && modified <= self.done_time
    }
}

/// Durable per-record replication outcome store.
///
/// Source and destination are site *system names*, the same identity used for
/// lineage, so rows stay valid when a site record is renamed.
pub trait ItemLedger: Send + Sync + 'static {
    fn get<'a>(
        &'a self,
        metadata_id: &'a str,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Option<ReplicationItem>>;

    /// Overwrite the row for the item's key (last writer wins on `done_time`).
    fn upsert(&self, item: ReplicationItem) -> LedgerFuture<'_, ()>;

    /// Atomically merge one attempt into the row for its key, returning the
    /// resulting row.
    fn record(&self, outcome: ItemOutcome) -> LedgerFuture<'_, ReplicationItem>;

    /// Ids in `FAILURE` with `failure_count < max_failure_count`.
    fn failure_list<'a>(
        &'a self,
        max_failure_count: u32,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Vec<String>>;

    /// Newest successful `done_time` for the pair (the query cursor).
    fn last_success_time<'a>(
        &'a self,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Option<DateTime<Utc>>>;

    /// Remove every row written on behalf of a config. Returns rows removed.
    fn delete_for_config<'a>(&'a self, config_id: &'a str) -> LedgerFuture<'a, u64>;

    /// Distinct config ids that own at least one row.
    fn config_ids(&self) -> LedgerFuture<'_, Vec<String>>;

    /// Flush and release the store.
    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_status_roundtrip() {
        assert_eq!("SUCCESS".parse::<ItemStatus>().unwrap(), ItemStatus::Success);
        assert_eq!(ItemStatus::Failure.to_string(), "FAILURE");
        assert!(matches!(
            "PENDING".parse::<ItemStatus>(),
            Err(ReplicationError::LedgerCorrupt { .. })
        ));
    }

    #[test]
    fn test_first_outcome() {
        let row = ReplicationItem::from_outcome(&ItemOutcome::failure("m1", "a", "b", "c"));
        assert_eq!(row.failure_count, 1);
        let row = ReplicationItem::from_outcome(&ItemOutcome::success("m1", "a", "b", "c", 10, 5));
        assert_eq!(row.failure_count, 0);
        assert_eq!(row.resource_bytes, 10);
    }

    #[test]
    fn test_merge_failure_then_success() {
        let mut row = ReplicationItem::from_outcome(&ItemOutcome::failure("m1", "a", "b", "c"));
        let mut second = ItemOutcome::failure("m1", "a", "b", "c");
        second.done_time = row.done_time + Duration::seconds(1);
        assert!(row.merge(&second));
        assert_eq!(row.failure_count, 2);

        let mut ok = ItemOutcome::success("m1", "a", "b", "c", 7, 3);
        ok.done_time = row.done_time + Duration::seconds(1);
        assert!(row.merge(&ok));
        assert_eq!(row.failure_count, 0);
        assert_eq!(row.status, ItemStatus::Success);
        assert_eq!(row.resource_bytes, 7);
    }

    #[test]
    fn test_deferred_keeps_budget() {
        let row = ReplicationItem::from_outcome(&ItemOutcome::deferred("m1", "a", "b", "c"));
        assert_eq!(row.status, ItemStatus::Failure);
        assert_eq!(row.failure_count, 0);

        let mut row = ReplicationItem::from_outcome(&ItemOutcome::failure("m1", "a", "b", "c"));
        let attempted = row.done_time;
        let mut later = ItemOutcome::deferred("m1", "a", "b", "c");
        later.done_time = attempted + Duration::seconds(1);
        assert!(row.merge(&later));
        assert_eq!(row.failure_count, 1);
        assert_eq!(row.done_time, attempted);

        let mut row = ReplicationItem::from_outcome(&ItemOutcome::success("m1", "a", "b", "c", 4, 1));
        let mut later = ItemOutcome::deferred("m1", "a", "b", "c");
        later.done_time = row.done_time + Duration::seconds(1);
        assert!(row.merge(&later));
        assert_eq!(row.status, ItemStatus::Failure);
        assert_eq!(row.failure_count, 0);
    }

    #[test]
    fn test_exhausted_only_for_attempted_version() {
        let mut row = ReplicationItem::from_outcome(&ItemOutcome::failure("m1", "a", "b", "c"));
        let modified = row.done_time - Duration::minutes(1);
        assert!(!row.is_exhausted(2, modified));

        let mut second = ItemOutcome::failure("m1", "a", "b", "c");
        second.done_time = row.done_time + Duration::seconds(1);
        row.merge(&second);
        assert!(row.is_exhausted(2, modified));
        // A newer version of the record gets attempted again
        assert!(!row.is_exhausted(2, row.done_time + Duration::seconds(1)));
    }

    #[test]
    fn test_merge_ignores_stale_outcome() {
        let mut row = ReplicationItem::from_outcome(&ItemOutcome::success("m1", "a", "b", "c", 1, 1));
        let mut stale = ItemOutcome::failure("m1", "a", "b", "c");
        stale.done_time = row.done_time - Duration::seconds(5);
        assert!(!row.merge(&stale));
        assert!(row.is_success());
    }
}
