// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Queue broker: one lazily deployed queue per destination site.

use super::{SiteQueue, Task, TaskJournal};
use crate::config::QueueConfig;
use crate::error::{QueueError, Result};
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info};

/// Pop the best head across `queues`. A head can vanish between the peek and
/// the pop when another worker wins it; the scan then starts over.
fn take_best(queues: &[Arc<SiteQueue>]) -> Option<Task> {
    loop {
        let best = queues
            .iter()
            .filter_map(|q| q.head_rank().map(|rank| (rank, q)))
            .max_by_key(|(rank, _)| *rank)?;
        if let Some(task) = best.1.try_take() {
            return Some(task);
        }
    }
}

/// Owns every site queue and the journal behind them.
pub struct QueueBroker {
    config: QueueConfig,
    queues: DashMap<String, Arc<SiteQueue>>,
    available: Arc<Notify>,
    seq: Arc<AtomicU64>,
    journal: Option<Arc<TaskJournal>>,
    closed: AtomicBool,
}

impl QueueBroker {
    /// Broker without a journal; queued tasks live only in memory.
    pub fn new(config: QueueConfig) -> Self {
        Self {
            config,
            queues: DashMap::new(),
            available: Arc::new(Notify::new()),
            seq: Arc::new(AtomicU64::new(0)),
            journal: None,
            closed: AtomicBool::new(false),
        }
    }

    /// Broker with the configured journal, restoring any tasks it holds.
    pub async fn open(config: QueueConfig) -> Result<Self> {
        let journal = match &config.journal_path {
            Some(path) => Some(Arc::new(TaskJournal::open(path).await?)),
            None => None,
        };

        let mut broker = Self::new(config);
        broker.journal = journal;

        if let Some(journal) = broker.journal.clone() {
            let restored = journal.load().await?;
            let count = restored.len();
            for (site, task) in restored {
                broker.get_queue(&site)?.requeue(task);
            }
            if count > 0 {
                info!(count, "Restored queued tasks from journal");
            }
        }

        Ok(broker)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// The queue for `site`, deploying it on first use.
    pub fn get_queue(&self, site: &str) -> std::result::Result<Arc<SiteQueue>, QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed);
        }
        if let Some(queue) = self.queues.get(site) {
            return Ok(Arc::clone(queue.value()));
        }
        if self.queues.len() >= self.config.max_queues {
            return Err(QueueError::Unavailable {
                site: site.to_string(),
                reason: format!("broker already holds {} queues", self.config.max_queues),
            });
        }

        let queue = self
            .queues
            .entry(site.to_string())
            .or_insert_with(|| {
                debug!(site, capacity = self.config.capacity, "Deploying site queue");
                Arc::new(SiteQueue::new(
                    site,
                    self.config.capacity,
                    Arc::clone(&self.available),
                    Arc::clone(&self.seq),
                    self.journal.clone(),
                ))
            })
            .clone();
        Ok(queue)
    }

    /// A view taking from several sites, highest priority first.
    pub fn get_queues<S: AsRef<str>>(
        &self,
        sites: &[S],
    ) -> std::result::Result<CompositeQueue, QueueError> {
        let queues = sites
            .iter()
            .map(|site| self.get_queue(site.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(CompositeQueue {
            queues,
            available: Arc::clone(&self.available),
        })
    }

    /// Sites with a deployed queue.
    pub fn sites(&self) -> Vec<String> {
        let mut sites: Vec<String> = self.queues.iter().map(|q| q.key().clone()).collect();
        sites.sort();
        sites
    }

    /// Tasks waiting across all queues.
    pub fn total_len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    fn snapshot(&self) -> Vec<Arc<SiteQueue>> {
        self.queues.iter().map(|q| Arc::clone(q.value())).collect()
    }

    /// Pop the best task from any deployed queue.
    pub fn try_take_any(&self) -> Option<Task> {
        take_best(&self.snapshot())
    }

    /// Wait for a task on any queue, including queues deployed while waiting.
    pub async fn take_any(&self) -> Task {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(task) = self.try_take_any() {
                return task;
            }
            available.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuse new queues and release the journal. Tasks still journaled are
    /// restored by the next [`open`](Self::open).
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.available.notify_waiters();
        if let Some(journal) = &self.journal {
            journal.close().await;
        }
        info!(queues = self.queues.len(), pending = self.total_len(), "Queue broker closed");
    }
}

/// Several site queues consumed as one.
#[derive(Clone)]
pub struct CompositeQueue {
    queues: Vec<Arc<SiteQueue>>,
    available: Arc<Notify>,
}

impl CompositeQueue {
    pub fn sites(&self) -> Vec<&str> {
        self.queues.iter().map(|q| q.site()).collect()
    }

    pub fn len(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn try_take(&self) -> Option<Task> {
        take_best(&self.queues)
    }

    pub async fn take(&self) -> Task {
        loop {
            let available = self.available.notified();
            tokio::pin!(available);
            available.as_mut().enable();

            if let Some(task) = self.try_take() {
                return task;
            }
            available.await;
        }
    }

    pub async fn poll(&self, timeout: Duration) -> Option<Task> {
        tokio::time::timeout(timeout, self.take()).await.ok()
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

    fn info(id: &str, destination: &str, priority: u8) -> TaskInfo {
        let config = ReplicatorConfig::for_testing("cfg", "a", destination);
        let m = Metadata::new(id, "xml", RawPayload::new("text/xml", b"<x/>".to_vec()), Utc::now());
        TaskInfo::new(&config, "a", destination, &m, Operation::Create).with_priority(priority)
    }

    fn config(max_queues: usize) -> QueueConfig {
        QueueConfig {
            capacity: 16,
            max_queues,
            journal_path: None,
        }
    }

    #[tokio::test]
    async fn test_get_queue_is_stable() {
        let broker = QueueBroker::new(config(4));
        let first = broker.get_queue("b").unwrap();
        let second = broker.get_queue("b").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(broker.sites(), vec!["b"]);
    }

    #[tokio::test]
    async fn test_max_queues_enforced() {
        let broker = QueueBroker::new(config(1));
        broker.get_queue("b").unwrap();
        assert!(matches!(
            broker.get_queue("c"),
            Err(QueueError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_composite_takes_highest_priority() {
        let broker = QueueBroker::new(config(4));
        broker.get_queue("a").unwrap().offer(info("low", "a", 2)).await.unwrap();
        broker.get_queue("b").unwrap().offer(info("high", "b", 7)).await.unwrap();

        let composite = broker.get_queues(&["a", "b"]).unwrap();
        assert_eq!(composite.len(), 2);
        let task = composite.try_take().unwrap();
        assert_eq!(task.info().metadata_id(), "high");
        task.complete().await;
        let task = composite.try_take().unwrap();
        assert_eq!(task.info().metadata_id(), "low");
        task.complete().await;
        assert!(composite.try_take().is_none());
    }

    #[tokio::test]
    async fn test_composite_drains_populated_site_then_sees_other() {
        let broker = Arc::new(QueueBroker::new(config(4)));
        let a = broker.get_queue("a").unwrap();
        for (id, priority) in [("a1", 1), ("a5", 5), ("a3", 3)] {
            a.offer(info(id, "a", priority)).await.unwrap();
        }
        let composite = broker.get_queues(&["a", "b"]).unwrap();

        let mut order = Vec::new();
        while let Some(task) = composite.try_take() {
            assert_eq!(task.site(), "a");
            order.push(task.info().metadata_id().to_string());
            task.complete().await;
        }
        assert_eq!(order, vec!["a5", "a3", "a1"]);

        let consumer = {
            let composite = composite.clone();
            tokio::spawn(async move {
                let task = composite.take().await;
                let taken = (task.site().to_string(), task.info().metadata_id().to_string());
                task.complete().await;
                taken
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.get_queue("b").unwrap().offer(info("b1", "b", 1)).await.unwrap();
        assert_eq!(consumer.await.unwrap(), ("b".to_string(), "b1".to_string()));
    }

    #[tokio::test]
    async fn test_composite_ignores_other_sites() {
        let broker = QueueBroker::new(config(4));
        broker.get_queue("c").unwrap().offer(info("m1", "c", 9)).await.unwrap();
        let composite = broker.get_queues(&["a", "b"]).unwrap();
        assert!(composite.poll(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_take_any_sees_new_queue() {
        let broker = Arc::new(QueueBroker::new(config(4)));
        let consumer = {
            let broker = Arc::clone(&broker);
            tokio::spawn(async move { broker.take_any().await.info().metadata_id().to_string() })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.get_queue("z").unwrap().offer(info("m1", "z", 1)).await.unwrap();
        assert_eq!(consumer.await.unwrap(), "m1");
    }

    #[tokio::test]
    async fn test_closed_broker_refuses_queues() {
        let broker = QueueBroker::new(config(4));
        broker.close().await;
        assert!(matches!(broker.get_queue("b"), Err(QueueError::Closed)));
    }

    #[tokio::test]
    async fn test_journal_restores_pending_tasks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.db").to_str().unwrap().to_string();
        let queue_config = QueueConfig {
            capacity: 16,
            max_queues: 4,
            journal_path: Some(path),
        };

        {
            let broker = QueueBroker::open(queue_config.clone()).await.unwrap();
            let queue = broker.get_queue("b").unwrap();
            queue.offer(info("done", "b", 1)).await.unwrap();
            queue.offer(info("pending", "b", 1)).await.unwrap();
            queue.try_take().unwrap().complete().await;
            broker.close().await;
        }

        let broker = QueueBroker::open(queue_config).await.unwrap();
        let queue = broker.get_queue("b").unwrap();
        assert_eq!(queue.len(), 1);
        let task = queue.try_take().unwrap();
        assert_eq!(task.info().metadata_id(), "pending");
        // Restored keys still deduplicate.
        assert!(!queue.offer(info("pending", "b", 1)).await.unwrap());
        task.complete().await;
        broker.close().await;
    }
}
