// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite journal of queued tasks.
//!
//! A task is written when it is queued (and rewritten when it is requeued
//! with a new attempt count) and removed once it is completed or dropped.
//! On startup the broker reloads whatever is left, in original queue order.

use super::QueuedTask;
use crate::error::{ReplicationError, Result};
use crate::ledger::{execute_with_retry, open_pool};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::{debug, info};

pub struct TaskJournal {
    pool: SqlitePool,
    path: String,
}

impl TaskJournal {
    pub async fn open(path: &str) -> Result<Self> {
        info!(path = %path, "Opening task journal");
        let pool = open_pool(path, true).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS task_journal (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                task_id TEXT NOT NULL UNIQUE,
                site TEXT NOT NULL,
                payload TEXT NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        Ok(Self {
            pool,
            path: path.to_string(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Insert or rewrite a task. A rewrite keeps the task's original position.
    pub async fn save(&self, site: &str, task: &QueuedTask) -> Result<()> {
        let payload = serde_json::to_string(task)
            .map_err(|e| ReplicationError::Internal(format!("task encode failed: {}", e)))?;
        let task_id = task.info.id();

        execute_with_retry("journal_save", || async {
            sqlx::query(
                r#"
                INSERT INTO task_journal (task_id, site, payload)
                VALUES (?, ?, ?)
                ON CONFLICT(task_id) DO UPDATE SET payload = excluded.payload
                "#,
            )
            .bind(task_id)
            .bind(site)
            .bind(&payload)
            .execute(&self.pool)
            .await
        })
        .await?;

        debug!(task_id, site, attempts = task.attempts, "Task journaled");
        Ok(())
    }

    pub async fn remove(&self, task_id: &str) -> Result<()> {
        execute_with_retry("journal_remove", || async {
            sqlx::query("DELETE FROM task_journal WHERE task_id = ?")
                .bind(task_id)
                .execute(&self.pool)
                .await
        })
        .await?;
        Ok(())
    }

    /// Every journaled task with its site, oldest first.
    pub async fn load(&self) -> Result<Vec<(String, QueuedTask)>> {
        let rows = sqlx::query("SELECT site, payload FROM task_journal ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let site: String = row.try_get("site")?;
            let payload: String = row.try_get("payload")?;
            let task: QueuedTask =
                serde_json::from_str(&payload).map_err(|e| ReplicationError::LedgerCorrupt {
                    field: "task_journal.payload".to_string(),
                    value: e.to_string(),
                })?;
            tasks.push((site, task));
        }
        Ok(tasks)
    }

    pub async fn count(&self) -> Result<u64> {
        let row = sqlx::query("SELECT COUNT(*) as cnt FROM task_journal")
            .fetch_one(&self.pool)
            .await?;
        let count: i64 = row.try_get("cnt")?;
        Ok(count as u64)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicatorConfig;
    use crate::model::{Metadata, RawPayload};
    use crate::queue::{Operation, TaskInfo};
    use chrono::Utc;
    use tempfile::tempdir;

    fn task(id: &str) -> QueuedTask {
        let config = ReplicatorConfig::for_testing("cfg", "a", "b");
        let m = Metadata::new(id, "xml", RawPayload::new("text/xml", b"<x/>".to_vec()), Utc::now());
        QueuedTask::new(TaskInfo::new(&config, "a", "b", &m, Operation::Create))
    }

    #[tokio::test]
    async fn test_save_load_remove() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let journal = TaskJournal::open(path.to_str().unwrap()).await.unwrap();

        let first = task("m1");
        let second = task("m2");
        journal.save("b", &first).await.unwrap();
        journal.save("b", &second).await.unwrap();
        assert_eq!(journal.count().await.unwrap(), 2);

        journal.remove(first.info.id()).await.unwrap();
        let loaded = journal.load().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "b");
        assert_eq!(loaded[0].1, second);
    }

    #[tokio::test]
    async fn test_resave_keeps_order() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("journal.db");
        let journal = TaskJournal::open(path.to_str().unwrap()).await.unwrap();

        let first = task("m1");
        journal.save("b", &first).await.unwrap();
        journal.save("b", &task("m2")).await.unwrap();
        let retried = first.clone().next_attempt();
        journal.save("b", &retried).await.unwrap();

        let loaded = journal.load().await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].1.info.metadata_id(), "m1");
        assert_eq!(loaded[0].1.attempts, 2);
    }
}
