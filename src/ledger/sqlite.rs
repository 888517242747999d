// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed item ledger.
//!
//! One row per `(metadata_id, source, destination)`, written with a single
//! `INSERT ... ON CONFLICT DO UPDATE` so the merge rule runs inside SQLite
//! and concurrent workers cannot lose an increment.
//!
//! # SQLite Busy Handling
//!
//! The ledger is shared by every engine cycle and every worker. Under
//! contention SQLite returns SQLITE_BUSY/SQLITE_LOCKED; writes are retried
//! with exponential backoff (max 5 attempts, 10ms doubling to 500ms).
//!
//! Timestamps are stored as epoch milliseconds.

use super::{ItemLedger, ItemOutcome, ItemStatus, LedgerFuture, ReplicationItem};
use crate::config::LedgerConfig;
use crate::error::{ReplicationError, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Configuration for SQLite busy retry behavior
const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLite error codes: SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => return Err(e),
        }
    }
}

/// Open a SQLite pool. `":memory:"` gives a single long-lived connection so
/// every query sees the same database.
pub(crate) async fn open_pool(path: &str, wal_mode: bool) -> Result<SqlitePool> {
    let in_memory = path == ":memory:";
    let url = if in_memory {
        "sqlite::memory:".to_string()
    } else {
        format!("sqlite://{}?mode=rwc", path)
    };

    let mut options = SqliteConnectOptions::from_str(&url)
        .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);
    if wal_mode && !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(4)
    };

    Ok(pool_options.connect_with(options).await?)
}

fn millis_to_time(field: &str, millis: i64) -> Result<DateTime<Utc>> {
    DateTime::<Utc>::from_timestamp_millis(millis).ok_or_else(|| ReplicationError::LedgerCorrupt {
        field: field.to_string(),
        value: millis.to_string(),
    })
}

fn row_to_item(row: &SqliteRow) -> Result<ReplicationItem> {
    let status: String = row.try_get("status")?;
    let done_time: i64 = row.try_get("done_time")?;
    let failure_count: i64 = row.try_get("failure_count")?;
    let resource_bytes: i64 = row.try_get("resource_bytes")?;
    let metadata_bytes: i64 = row.try_get("metadata_bytes")?;

    Ok(ReplicationItem {
        metadata_id: row.try_get("metadata_id")?,
        source: row.try_get("source")?,
        destination: row.try_get("destination")?,
        config_id: row.try_get("config_id")?,
        done_time: millis_to_time("done_time", done_time)?,
        status: status.parse()?,
        failure_count: failure_count.max(0) as u32,
        resource_bytes: resource_bytes.max(0) as u64,
        metadata_bytes: metadata_bytes.max(0) as u64,
    })
}

const ITEM_COLUMNS: &str = "metadata_id, source, destination, config_id, done_time, status, \
                            failure_count, resource_bytes, metadata_bytes";

/// Item ledger stored in SQLite.
pub struct SqliteItemLedger {
    pool: SqlitePool,
    path: String,
}

impl SqliteItemLedger {
    /// Open (or create) the ledger described by `config`.
    pub async fn new(config: &LedgerConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Initializing item ledger");
        let pool = open_pool(&config.sqlite_path, config.wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS replication_items (
                metadata_id TEXT NOT NULL,
                source TEXT NOT NULL,
                destination TEXT NOT NULL,
                config_id TEXT NOT NULL,
                done_time INTEGER NOT NULL,
                status TEXT NOT NULL,
                failure_count INTEGER NOT NULL DEFAULT 0,
                resource_bytes INTEGER NOT NULL DEFAULT 0,
                metadata_bytes INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (metadata_id, source, destination)
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_items_pair ON replication_items (source, destination, status)",
        )
        .execute(&pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_items_config ON replication_items (config_id)")
            .execute(&pool)
            .await?;

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
        })
    }

    /// Get database path (for diagnostics).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Number of rows (for diagnostics and tests).
    pub async fn count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM replication_items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn fetch(&self, metadata_id: &str, source: &str, destination: &str) -> Result<Option<ReplicationItem>> {
        let sql = format!(
            "SELECT {} FROM replication_items WHERE metadata_id = ? AND source = ? AND destination = ?",
            ITEM_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(metadata_id)
            .bind(source)
            .bind(destination)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_item).transpose()
    }

    async fn merge_outcome(&self, outcome: ItemOutcome) -> Result<ReplicationItem> {
        let pool = &self.pool;
        let first = ReplicationItem::from_outcome(&outcome);
        let sql = format!(
            r#"
            INSERT INTO replication_items ({cols})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(metadata_id, source, destination) DO UPDATE SET
                config_id = excluded.config_id,
                -- A FAILURE carrying failure_count 0 is a deferred outcome
                done_time = CASE
                    WHEN excluded.status = 'FAILURE' AND excluded.failure_count = 0
                        THEN replication_items.done_time
                    ELSE excluded.done_time
                END,
                status = excluded.status,
                failure_count = CASE
                    WHEN excluded.status = 'SUCCESS' THEN 0
                    WHEN excluded.failure_count = 0 THEN replication_items.failure_count
                    ELSE replication_items.failure_count + 1
                END,
                resource_bytes = replication_items.resource_bytes + excluded.resource_bytes,
                metadata_bytes = replication_items.metadata_bytes + excluded.metadata_bytes
            WHERE excluded.done_time >= replication_items.done_time
            RETURNING {cols}
            "#,
            cols = ITEM_COLUMNS
        );

        let row = execute_with_retry("ledger_record", || async {
            sqlx::query(&sql)
                .bind(&first.metadata_id)
                .bind(&first.source)
                .bind(&first.destination)
                .bind(&first.config_id)
                .bind(first.done_time.timestamp_millis())
                .bind(first.status.as_str())
                .bind(first.failure_count as i64)
                .bind(first.resource_bytes as i64)
                .bind(first.metadata_bytes as i64)
                .fetch_optional(pool)
                .await
        })
        .await?;

        match row {
            Some(row) => row_to_item(&row),
            None => {
                // Outcome was older than the stored row; report what is stored
                debug!(metadata_id = %outcome.metadata_id, "Ignored stale ledger outcome");
                self.fetch(&outcome.metadata_id, &outcome.source, &outcome.destination)
                    .await?
                    .ok_or_else(|| {
                        ReplicationError::Internal(format!(
                            "ledger row for {} vanished during merge",
                            outcome.metadata_id
                        ))
                    })
            }
        }
    }

    async fn overwrite(&self, item: ReplicationItem) -> Result<()> {
        let pool = &self.pool;
        let sql = format!(
            r#"
            INSERT INTO replication_items ({cols})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(metadata_id, source, destination) DO UPDATE SET
                config_id = excluded.config_id,
                done_time = excluded.done_time,
                status = excluded.status,
                failure_count = excluded.failure_count,
                resource_bytes = excluded.resource_bytes,
                metadata_bytes = excluded.metadata_bytes
            WHERE excluded.done_time >= replication_items.done_time
            "#,
            cols = ITEM_COLUMNS
        );

        execute_with_retry("ledger_upsert", || async {
            sqlx::query(&sql)
                .bind(&item.metadata_id)
                .bind(&item.source)
                .bind(&item.destination)
                .bind(&item.config_id)
                .bind(item.done_time.timestamp_millis())
                .bind(item.status.as_str())
                .bind(item.failure_count as i64)
                .bind(item.resource_bytes as i64)
                .bind(item.metadata_bytes as i64)
                .execute(pool)
                .await
        })
        .await?;
        Ok(())
    }

    async fn failures(&self, max_failure_count: u32, source: &str, destination: &str) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT metadata_id FROM replication_items
            WHERE source = ? AND destination = ? AND status = 'FAILURE' AND failure_count < ?
            ORDER BY done_time
            "#,
        )
        .bind(source)
        .bind(destination)
        .bind(max_failure_count as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    async fn cursor(&self, source: &str, destination: &str) -> Result<Option<DateTime<Utc>>> {
        let millis: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(done_time) FROM replication_items WHERE source = ? AND destination = ? AND status = 'SUCCESS'",
        )
        .bind(source)
        .bind(destination)
        .fetch_one(&self.pool)
        .await?;
        millis.map(|ms| millis_to_time("done_time", ms)).transpose()
    }

    async fn delete_config(&self, config_id: &str) -> Result<u64> {
        let pool = &self.pool;
        let result = execute_with_retry("ledger_delete_config", || async {
            sqlx::query("DELETE FROM replication_items WHERE config_id = ?")
                .bind(config_id)
                .execute(pool)
                .await
        })
        .await?;
        info!(config_id = %config_id, rows = result.rows_affected(), "Deleted ledger rows for config");
        Ok(result.rows_affected())
    }

    async fn distinct_config_ids(&self) -> Result<Vec<String>> {
        let ids: Vec<String> =
            sqlx::query_scalar("SELECT DISTINCT config_id FROM replication_items ORDER BY config_id")
                .fetch_all(&self.pool)
                .await?;
        Ok(ids)
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        let pool = &self.pool;
        execute_with_retry("ledger_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;
        debug!("WAL checkpoint complete");
        Ok(())
    }
}

impl ItemLedger for SqliteItemLedger {
    fn get<'a>(
        &'a self,
        metadata_id: &'a str,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Option<ReplicationItem>> {
        Box::pin(self.fetch(metadata_id, source, destination))
    }

    fn upsert(&self, item: ReplicationItem) -> LedgerFuture<'_, ()> {
        Box::pin(self.overwrite(item))
    }

    fn record(&self, outcome: ItemOutcome) -> LedgerFuture<'_, ReplicationItem> {
        Box::pin(self.merge_outcome(outcome))
    }

    fn failure_list<'a>(
        &'a self,
        max_failure_count: u32,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Vec<String>> {
        Box::pin(self.failures(max_failure_count, source, destination))
    }

    fn last_success_time<'a>(
        &'a self,
        source: &'a str,
        destination: &'a str,
    ) -> LedgerFuture<'a, Option<DateTime<Utc>>> {
        Box::pin(self.cursor(source, destination))
    }

    fn delete_for_config<'a>(&'a self, config_id: &'a str) -> LedgerFuture<'a, u64> {
        Box::pin(self.delete_config(config_id))
    }

    fn config_ids(&self) -> LedgerFuture<'_, Vec<String>> {
        Box::pin(self.distinct_config_ids())
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            if let Err(e) = self.checkpoint().await {
                warn!(error = %e, "Failed to checkpoint WAL on close");
            }
            self.pool.close().await;
            info!("Item ledger closed");
        })
    }
}
