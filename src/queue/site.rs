// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Bounded priority queue for one destination site.

use super::{Disposition, ErrorCode, QueuedTask, TaskInfo, TaskJournal};
use crate::error::QueueError;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// Rank of a queue head: priority first, then earliest sequence.
pub(crate) type HeadRank = (u8, std::cmp::Reverse<u64>);

struct Entry {
    priority: u8,
    seq: u64,
    task: QueuedTask,
}

impl Entry {
    fn rank(&self) -> HeadRank {
        (self.priority, std::cmp::Reverse(self.seq))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Entry>,
    /// Dedup keys of every task that is queued, being journaled, or held by a worker.
    keys: HashSet<String>,
    /// Slots claimed by offers still writing to the journal.
    reserved: usize,
}

/// Result of a non-blocking offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Enqueued {
    Queued,
    /// Same record and pair already queued or in progress.
    Duplicate,
    Full,
}

/// Priority queue of tasks destined for one site.
///
/// Tasks with the same (record, source, destination) are admitted once: an
/// offer for a key that is already queued or in progress is ignored.
pub struct SiteQueue {
    site: String,
    capacity: usize,
    state: Mutex<QueueState>,
    /// Broker-wide "a task became available" signal.
    available: Arc<Notify>,
    space: Notify,
    seq: Arc<AtomicU64>,
    journal: Option<Arc<TaskJournal>>,
}

impl SiteQueue {
    pub(crate) fn new(
        site: impl Into<String>,
        capacity: usize,
        available: Arc<Notify>,
        seq: Arc<AtomicU64>,
        journal: Option<Arc<TaskJournal>>,
    ) -> Self {
        Self {
            site: site.into(),
            capacity: capacity.max(1),
            state: Mutex::new(QueueState::default()),
            available,
            space: Notify::new(),
            seq,
            journal,
        }
    }

    /// Standalone queue with its own signal and no journal.
    pub fn standalone(site: impl Into<String>, capacity: usize) -> Arc<Self> {
        Arc::new(Self::new(
            site,
            capacity,
            Arc::new(Notify::new()),
            Arc::new(AtomicU64::new(0)),
            None,
        ))
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // A panic while holding the lock cannot leave the heap half-updated.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Tasks waiting to be taken.
    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queued plus in-progress tasks.
    pub fn outstanding(&self) -> usize {
        self.lock().keys.len()
    }

    /// Queue a task without waiting. `Ok(false)` if the queue is full or a
    /// task for the same record and pair is already queued or in progress.
    pub async fn offer(&self, info: TaskInfo) -> Result<bool, QueueError> {
        Ok(self.try_offer(info).await? == Enqueued::Queued)
    }

    /// Like [`offer`](Self::offer), but says why a task was not queued.
    pub(crate) async fn try_offer(&self, info: TaskInfo) -> Result<Enqueued, QueueError> {
        self.enqueue(QueuedTask::new(info)).await
    }

    /// Queue a task, waiting for space. `Ok(false)` only for a duplicate.
    pub async fn put(&self, info: TaskInfo) -> Result<bool, QueueError> {
        let task = QueuedTask::new(info);
        loop {
            let space = self.space.notified();
            tokio::pin!(space);
            space.as_mut().enable();

            match self.enqueue(task.clone()).await? {
                Enqueued::Queued => return Ok(true),
                Enqueued::Duplicate => return Ok(false),
                Enqueued::Full => space.await,
            }
        }
    }

    async fn enqueue(&self, task: QueuedTask) -> Result<Enqueued, QueueError> {
        let key = task.info.dedup_key();
        {
            let mut state = self.lock();
            if state.keys.contains(&key) {
                return Ok(Enqueued::Duplicate);
            }
            if state.heap.len() + state.reserved >= self.capacity {
                return Ok(Enqueued::Full);
            }
            state.keys.insert(key.clone());
            state.reserved += 1;
        }

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save(&self.site, &task).await {
                let mut state = self.lock();
                state.keys.remove(&key);
                state.reserved -= 1;
                return Err(QueueError::Journal(e.to_string()));
            }
        }

        {
            let mut state = self.lock();
            state.reserved -= 1;
            self.push(&mut state, task);
        }
        debug!(site = %self.site, key = %key, "Task queued");
        Ok(Enqueued::Queued)
    }

    fn push(&self, state: &mut QueueState, task: QueuedTask) {
        let seq = self.seq.fetch_add(1, AtomicOrdering::Relaxed);
        state.heap.push(Entry {
            priority: task.info.priority(),
            seq,
            task,
        });
        self.available.notify_waiters();
    }

    /// Put back a task this queue already accounts for (journal restore,
    /// unlock, retry). Ignores capacity.
    pub(crate) fn requeue(&self, task: QueuedTask) {
        let mut state = self.lock();
        state.keys.insert(task.info.dedup_key());
        self.push(&mut state, task);
    }

    pub(crate) fn head_rank(&self) -> Option<HeadRank> {
        self.lock().heap.peek().map(Entry::rank)
    }

    /// Pop the highest-priority task, if any.
    pub fn try_take(self: &Arc<Self>) -> Option<Task> {
        let entry = self.lock().heap.pop()?;
        self.space.notify_one();
        Some(Task::new(Arc::clone(self), entry.task))
    }

    /// Wait until a task is available.
    pub async fn take(self: &Arc<Self>) -> Task {
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

    /// Wait up to `timeout` for a task.
    pub async fn poll(self: &Arc<Self>, timeout: Duration) -> Option<Task> {
        tokio::time::timeout(timeout, self.take()).await.ok()
    }

    /// Release a finished task's key and journal entry.
    async fn finish(&self, task: &QueuedTask) {
        self.lock().keys.remove(&task.info.dedup_key());
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.remove(task.info.id()).await {
                warn!(site = %self.site, task_id = task.info.id(), error = %e, "Failed to remove task from journal");
            }
        }
    }

    async fn retry(&self, task: QueuedTask) {
        let task = task.next_attempt();
        if let Some(journal) = &self.journal {
            if let Err(e) = journal.save(&self.site, &task).await {
                warn!(site = %self.site, task_id = task.info.id(), error = %e, "Failed to journal task retry");
            }
        }
        self.requeue(task);
    }
}

/// A task taken from a queue. Exactly one of [`complete`](Self::complete),
/// [`fail`](Self::fail) or [`unlock`](Self::unlock) resolves it; dropping an
/// unresolved handle is equivalent to `unlock`.
pub struct Task {
    queue: Arc<SiteQueue>,
    task: Option<QueuedTask>,
}

impl Task {
    fn new(queue: Arc<SiteQueue>, task: QueuedTask) -> Self {
        Self {
            queue,
            task: Some(task),
        }
    }

    fn queued(&self) -> &QueuedTask {
        // Only `resolve` empties the slot, and it consumes the handle.
        match &self.task {
            Some(task) => task,
            None => unreachable!("task handle used after resolution"),
        }
    }

    pub fn info(&self) -> &TaskInfo {
        &self.queued().info
    }

    pub fn attempts(&self) -> u32 {
        self.queued().attempts
    }

    pub fn queued_task(&self) -> &QueuedTask {
        self.queued()
    }

    pub fn site(&self) -> &str {
        self.queue.site()
    }

    fn resolve(mut self) -> (Arc<SiteQueue>, QueuedTask) {
        let queue = Arc::clone(&self.queue);
        let task = self.task.take();
        match task {
            Some(task) => (queue, task),
            None => unreachable!("task handle resolved twice"),
        }
    }

    /// The transfer succeeded.
    pub async fn complete(self) -> Disposition {
        let (queue, task) = self.resolve();
        queue.finish(&task).await;
        Disposition::Completed
    }

    /// The transfer failed. Retryable codes requeue the task until its
    /// attempts reach the retry limit; everything else drops it.
    pub async fn fail(self, code: ErrorCode) -> Disposition {
        let (queue, task) = self.resolve();
        if code.should_be_retried() && task.attempts < task.info.retry_limit() {
            debug!(
                site = %queue.site(),
                task_id = task.info.id(),
                attempts = task.attempts,
                ?code,
                "Requeueing failed task"
            );
            queue.retry(task).await;
            Disposition::RetryQueued
        } else {
            debug!(
                site = %queue.site(),
                task_id = task.info.id(),
                attempts = task.attempts,
                ?code,
                "Dropping failed task"
            );
            queue.finish(&task).await;
            Disposition::Dropped
        }
    }

    /// Give the task back untouched (e.g. on shutdown).
    pub fn unlock(self) {
        let (queue, task) = self.resolve();
        queue.requeue(task);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            self.queue.requeue(task);
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("site", &self.queue.site())
            .field("task", &self.task)
            .finish()
    }
}
