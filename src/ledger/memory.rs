//! In-memory item ledger.
//!
//! Same merge rule as the SQLite ledger, guarded by one mutex. Useful for
//! embedding without a database and in tests.

use super::{ItemLedger, ItemOutcome, ItemStatus, LedgerFuture, ReplicationItem};
use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

type Key = (String, String, String);

#[derive(Default)]
pub struct MemoryItemLedger {
    items: Mutex<HashMap<Key, ReplicationItem>>,
}

impl MemoryItemLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<Key, ReplicationItem>>> {
        self.items
            .lock()
            .map_err(|_| ReplicationError::Internal("ledger mutex poisoned".to_string()))
    }

    pub fn len(&self) -> usize {
        self.lock().map(|items| items.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of every row, for assertions and diagnostics.
    pub fn all(&self) -> Vec<ReplicationItem> {
        self.lock()
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn key(metadata_id: &str, source: &str, destination: &str) -> Key {
    (metadata_id.to_string(), source.to_string(), destination.to_string())
}

impl ItemLedger for MemoryItemLedger {
    fn get<'a>(
        &'a self,
        metadata_id: &'a str,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Option<ReplicationItem>> {
        Box::pin(async move {
            let items = self.lock()?;
            Ok(items.get(&key(metadata_id, source, destination)).cloned())
        })
    }

    fn upsert(&self, item: ReplicationItem) -> LedgerFuture<'_, ()> {
        Box::pin(async move {
            let mut items = self.lock()?;
            let k = key(&item.metadata_id, &item.source, &item.destination);
            match items.get(&k) {
                Some(existing) if existing.done_time > item.done_time => {}
                _ => {
                    items.insert(k, item);
                }
            }
            Ok(())
        })
    }

    fn record(&self, outcome: ItemOutcome) -> LedgerFuture<'_, ReplicationItem> {
        Box::pin(async move {
            let mut items = self.lock()?;
            let k = key(&outcome.metadata_id, &outcome.source, &outcome.destination);
            let row = items
                .entry(k)
                .and_modify(|row| {
                    row.merge(&outcome);
                })
                .or_insert_with(|| ReplicationItem::from_outcome(&outcome));
            Ok(row.clone())
        })
    }

    fn failure_list<'a>(
        &'a self,
        max_failure_count: u32,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Vec<String>> {
        Box::pin(async move {
            let items = self.lock()?;
            let mut failed: Vec<&ReplicationItem> = items
                .values()
                .filter(|row| {
                    row.source == source
                        && row.destination == destination
                        && row.status == ItemStatus::Failure
                        && row.failure_count < max_failure_count
                })
                .collect();
            failed.sort_by_key(|row| row.done_time);
            Ok(failed.into_iter().map(|row| row.metadata_id.clone()).collect())
        })
    }

    fn last_success_time<'a>(
        &'a self,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Option<DateTime<Utc>>> {
        Box::pin(async move {
            let items = self.lock()?;
            Ok(items
                .values()
                .filter(|row| row.source == source && row.destination == destination && row.is_success())
                .map(|row| row.done_time)
                .max())
        })
    }

    fn delete_for_config<'a>(&'a self, config_id: &'a str) -> LedgerFuture<'a, u64> {
        Box::pin(async move {
            let mut items = self.lock()?;
            let before = items.len();
            items.retain(|_, row| row.config_id != config_id);
            Ok((before - items.len()) as u64)
        })
    }

    fn config_ids(&self) -> LedgerFuture<'_, Vec<String>> {
        Box::pin(async move {
            let items = self.lock()?;
            let mut ids: Vec<String> = items.values().map(|row| row.config_id.clone()).collect();
            ids.sort();
            ids.dedup();
            Ok(ids)
        })
    }
}
