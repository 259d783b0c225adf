//! Background task queue for archival and preference persistence
//!
//! The request path only enqueues. A single worker applies tasks in order,
//! redelivering a failed task with backoff until it succeeds or runs out of
//! attempts. Each task carries an idempotency key; a key that already
//! completed is not applied again.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::archiver::OverflowArchiver;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::preferences::{PreferenceChange, PreferenceEntry};
use crate::storage::SqliteStorage;

const COMPLETED_KEYS_CAPACITY: usize = 8192;

#[derive(Debug, Clone)]
pub enum Task {
    /// Evicted exchanges to embed and index
    Archive { batch: Vec<Exchange> },
    SavePreference { owner: String, entry: PreferenceEntry },
    DeletePreference { owner: String, key: String },
}

impl Task {
    /// Tasks for a batch of preference mutations
    pub fn from_changes(owner: &str, changes: Vec<PreferenceChange>) -> Vec<Task> {
        changes
            .into_iter()
            .map(|change| match change {
                PreferenceChange::Upserted(entry) => Task::SavePreference {
                    owner: owner.to_string(),
                    entry,
                },
                PreferenceChange::Removed { key } => Task::DeletePreference {
                    owner: owner.to_string(),
                    key,
                },
            })
            .collect()
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Archive { .. } => "archive",
            Task::SavePreference { .. } => "save_preference",
            Task::DeletePreference { .. } => "delete_preference",
        }
    }

    fn idempotency_key(&self, sequence: u64) -> String {
        match self {
            Task::Archive { batch } => {
                let ids: Vec<String> = batch.iter().map(|e| e.id.simple().to_string()).collect();
                format!("archive:{}", ids.join(","))
            }
            Task::SavePreference { owner, entry } => format!(
                "save:{}:{}:{}:{}",
                owner,
                entry.key,
                entry.confidence.to_bits(),
                entry.last_updated.timestamp_nanos_opt().unwrap_or_default()
            ),
            // Deletes carry no content of their own
            Task::DeletePreference { owner, key } => format!("delete:{}:{}:{}", owner, key, sequence),
        }
    }
}

/// Applies tasks; implementations must tolerate the same task twice
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &Task) -> Result<()>;
}

/// Handler wired to the archiver and the preference repository
pub struct ContextWorker {
    archiver: Arc<OverflowArchiver>,
    preferences: Option<SqliteStorage>,
}

impl ContextWorker {
    pub fn new(archiver: Arc<OverflowArchiver>, preferences: Option<SqliteStorage>) -> Self {
        Self {
            archiver,
            preferences,
        }
    }
}

#[async_trait]
impl TaskHandler for ContextWorker {
    async fn handle(&self, task: &Task) -> Result<()> {
        match task {
            Task::Archive { batch } => {
                self.archiver.archive(batch.clone()).await;
                Ok(())
            }
            Task::SavePreference { owner, entry } => match &self.preferences {
                Some(storage) => storage.save_preference(owner, entry),
                None => Ok(()),
            },
            Task::DeletePreference { owner, key } => match &self.preferences {
                Some(storage) => storage.delete_preference(owner, key).map(|_| ()),
                None => Ok(()),
            },
        }
    }
}

#[derive(Debug)]
struct Envelope {
    key: String,
    task: Task,
}

enum Message {
    Task(Envelope),
    Shutdown,
}

#[derive(Debug, Default)]
struct Counters {
    sequence: AtomicU64,
    enqueued: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    redelivered: AtomicU64,
    duplicates: AtomicU64,
    abandoned: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct QueueStats {
    pub enqueued: u64,
    /// Turned away because the queue was full
    pub rejected: u64,
    pub completed: u64,
    pub redelivered: u64,
    pub duplicates: u64,
    pub abandoned: u64,
}

/// Cloneable handle for enqueueing work
#[derive(Clone)]
pub struct TaskSender {
    tx: mpsc::Sender<Message>,
    counters: Arc<Counters>,
}

impl TaskSender {
    /// Hand a task to the worker without waiting.
    ///
    /// A full queue rejects the task instead of holding up the caller.
    pub fn enqueue(&self, task: Task) -> Result<()> {
        let sequence = self.counters.sequence.fetch_add(1, Ordering::Relaxed);
        let envelope = Envelope {
            key: task.idempotency_key(sequence),
            task,
        };
        let kind = envelope.task.kind();
        match self.tx.try_send(Message::Task(envelope)) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                debug!(kind, "Enqueued task");
                Ok(())
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                Err(Error::storage("task queue is full"))
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::storage("task queue is closed")),
        }
    }
}

pub struct TaskQueue {
    sender: TaskSender,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    /// Start the worker on the current runtime
    pub fn spawn(handler: Arc<dyn TaskHandler>, config: &Config) -> Self {
        let (tx, rx) = mpsc::channel(config.task_queue_capacity.max(1));
        let counters = Arc::new(Counters::default());

        let worker = Worker {
            handler,
            counters: counters.clone(),
            max_attempts: config.task_max_attempts.max(1),
            initial_delay: config.retry_initial_delay(),
            completed: RecentSet::new(COMPLETED_KEYS_CAPACITY),
        };
        let handle = tokio::spawn(worker.run(rx));

        Self {
            sender: TaskSender { tx, counters },
            worker: Mutex::new(Some(handle)),
        }
    }

    pub fn sender(&self) -> TaskSender {
        self.sender.clone()
    }

    pub fn enqueue(&self, task: Task) -> Result<()> {
        self.sender.enqueue(task)
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.sender.counters;
        QueueStats {
            enqueued: c.enqueued.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            redelivered: c.redelivered.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Finish everything already enqueued, then stop the worker.
    pub async fn shutdown(&self) {
        let Some(handle) = self.worker.lock().await.take() else {
            return;
        };
        if self.sender.tx.send(Message::Shutdown).await.is_err() {
            warn!("Task worker already stopped");
        }
        if let Err(e) = handle.await {
            error!(error = %e, "Task worker panicked");
        }
        info!("Task queue drained");
    }
}

struct Worker {
    handler: Arc<dyn TaskHandler>,
    counters: Arc<Counters>,
    max_attempts: u32,
    initial_delay: Duration,
    completed: RecentSet<String>,
}

impl Worker {
    async fn run(mut self, mut rx: mpsc::Receiver<Message>) {
        while let Some(message) = rx.recv().await {
            match message {
                Message::Task(envelope) => self.process(envelope).await,
                Message::Shutdown => break,
            }
        }
        rx.close();
    }

    async fn process(&mut self, envelope: Envelope) {
        if self.completed.contains(&envelope.key) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            debug!(kind = envelope.task.kind(), "Skipping already-applied task");
            return;
        }

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.handler.handle(&envelope.task).await {
                Ok(()) => {
                    self.completed.insert(envelope.key);
                    self.counters.completed.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                Err(e) if attempt < self.max_attempts => {
                    let delay = self.initial_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(kind = envelope.task.kind(), attempt, error = %e, "Task failed, redelivering");
                    self.counters.redelivered.fetch_add(1, Ordering::Relaxed);
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(kind = envelope.task.kind(), attempts = attempt, error = %e, "Abandoning task");
                    self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
                    return;
                }
            }
        }
    }
}

/// Bounded set that forgets its oldest members first
pub(crate) struct RecentSet<T> {
    order: VecDeque<T>,
    set: HashSet<T>,
    capacity: usize,
}

impl<T: Hash + Eq + Clone> RecentSet<T> {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::new(),
            set: HashSet::new(),
            capacity,
        }
    }

    pub(crate) fn contains(&self, value: &T) -> bool {
        self.set.contains(value)
    }

    /// Returns false if the value was already present
    pub(crate) fn insert(&mut self, value: T) -> bool {
        if !self.set.insert(value.clone()) {
            return false;
        }
        self.order.push_back(value);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.set.remove(&old);
            }
        }
        true
    }

    pub(crate) fn remove(&mut self, value: &T) {
        if self.set.remove(value) {
            self.order.retain(|v| v != value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::{PreferenceCategory, PreferenceValue};
    use chrono::Utc;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingHandler {
        calls: AtomicUsize,
        failures_left: AtomicUsize,
        applied: std::sync::Mutex<Vec<String>>,
    }

    #[async_trait]
    impl TaskHandler for CountingHandler {
        async fn handle(&self, task: &Task) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(Error::storage("disk busy"));
            }
            self.applied.lock().unwrap().push(task.kind().to_string());
            Ok(())
        }
    }

    fn config() -> Config {
        Config {
            retry_initial_delay_ms: 1,
            task_max_attempts: 3,
            ..Default::default()
        }
    }

    fn entry() -> PreferenceEntry {
        PreferenceEntry {
            key: "name".into(),
            value: PreferenceValue::Text("Ada".into()),
            confidence: 0.5,
            category: PreferenceCategory::Personal,
            last_updated: Utc::now(),
        }
    }

    fn save_task() -> Task {
        Task::SavePreference {
            owner: "ada".into(),
            entry: entry(),
        }
    }

    #[tokio::test]
    async fn processes_in_order_and_drains_on_shutdown() {
        let handler = Arc::new(CountingHandler::default());
        let queue = TaskQueue::spawn(handler.clone(), &config());

        queue
            .enqueue(Task::Archive {
                batch: vec![Exchange::user("s", "q"), Exchange::assistant("s", "a")],
            })
            .unwrap();
        queue.enqueue(save_task()).unwrap();
        queue
            .enqueue(Task::DeletePreference {
                owner: "ada".into(),
                key: "name".into(),
            })
            .unwrap();
        queue.shutdown().await;

        let applied = handler.applied.lock().unwrap().clone();
        assert_eq!(applied, vec!["archive", "save_preference", "delete_preference"]);
        assert_eq!(queue.stats().completed, 3);
    }

    #[tokio::test]
    async fn failed_task_is_redelivered() {
        let handler = Arc::new(CountingHandler {
            failures_left: AtomicUsize::new(2),
            ..Default::default()
        });
        let queue = TaskQueue::spawn(handler.clone(), &config());

        queue.enqueue(save_task()).unwrap();
        queue.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(handler.applied.lock().unwrap().len(), 1);
        let stats = queue.stats();
        assert_eq!(stats.redelivered, 2);
        assert_eq!(stats.abandoned, 0);
    }

    #[tokio::test]
    async fn gives_up_after_max_attempts() {
        let handler = Arc::new(CountingHandler {
            failures_left: AtomicUsize::new(usize::MAX),
            ..Default::default()
        });
        let queue = TaskQueue::spawn(handler.clone(), &config());

        queue.enqueue(save_task()).unwrap();
        queue.shutdown().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.stats().abandoned, 1);
    }

    #[tokio::test]
    async fn duplicate_task_is_applied_once() {
        let handler = Arc::new(CountingHandler::default());
        let queue = TaskQueue::spawn(handler.clone(), &config());

        let task = save_task();
        queue.enqueue(task.clone()).unwrap();
        queue.enqueue(task).unwrap();
        queue.shutdown().await;

        assert_eq!(handler.applied.lock().unwrap().len(), 1);
        assert_eq!(queue.stats().duplicates, 1);
    }

    struct StuckHandler;

    #[async_trait]
    impl TaskHandler for StuckHandler {
        async fn handle(&self, _: &Task) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn full_queue_rejects_without_waiting() {
        let config = Config {
            task_queue_capacity: 2,
            ..config()
        };
        let queue = TaskQueue::spawn(Arc::new(StuckHandler), &config);

        let accepted: Vec<bool> = (0..4).map(|_| queue.enqueue(save_task()).is_ok()).collect();
        assert_eq!(accepted, vec![true, true, false, false]);

        let stats = queue.stats();
        assert_eq!(stats.enqueued, 2);
        assert_eq!(stats.rejected, 2);
    }

    #[tokio::test]
    async fn enqueue_after_shutdown_fails() {
        let queue = TaskQueue::spawn(Arc::new(CountingHandler::default()), &config());
        let sender = queue.sender();
        queue.shutdown().await;

        assert!(sender.enqueue(save_task()).is_err());
    }

    #[tokio::test]
    async fn worker_persists_preferences() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let archiver = Arc::new(OverflowArchiver::new(
            Arc::new(crate::embedding::HashingEmbedder::new(16)),
            Arc::new(crate::storage::InMemoryIndex::new()),
            &config(),
        ));
        let worker = ContextWorker::new(archiver, Some(storage.clone()));

        worker.handle(&save_task()).await.unwrap();
        assert_eq!(storage.load_preferences("ada").unwrap().len(), 1);

        let delete = Task::DeletePreference {
            owner: "ada".into(),
            key: "name".into(),
        };
        worker.handle(&delete).await.unwrap();
        // Deleting twice is harmless
        worker.handle(&delete).await.unwrap();
        assert!(storage.load_preferences("ada").unwrap().is_empty());
    }

    #[test]
    fn recent_set_forgets_oldest() {
        let mut set = RecentSet::new(2);
        assert!(set.insert(1));
        assert!(!set.insert(1));
        set.insert(2);
        set.insert(3);
        assert!(!set.contains(&1));
        assert!(set.contains(&3));
    }
}
