//! Overflow archival: evicted exchanges become embedded, retrievable chunks
//!
//! Archival is best-effort. A chunk whose embedding or upsert keeps failing
//! after one retry is dropped with a warning; the conversation never waits on
//! it.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::exchange::{Exchange, Role};
use crate::storage::{ChunkPayload, VectorIndex};
use crate::tasks::RecentSet;

/// Namespace for content-derived chunk ids
const CHUNK_NAMESPACE: Uuid = Uuid::from_u128(0x6d1e_7a2c_4b0f_4c55_9a61_0d3e_2f8b_91c4);

/// Chunk ids remembered locally to skip re-embedding duplicates
const RECENT_IDS_CAPACITY: usize = 4096;

/// An embedded unit of archived conversation text
#[derive(Debug, Clone, Serialize)]
pub struct ArchivedChunk {
    pub id: Uuid,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
    pub created_at: DateTime<Utc>,
    pub source_session: String,
    pub exchange_count: u32,
}

impl ArchivedChunk {
    pub fn payload(&self) -> ChunkPayload {
        ChunkPayload {
            text: self.text.clone(),
            created_at: self.created_at,
            source_session: self.source_session.clone(),
            exchange_count: self.exchange_count,
        }
    }
}

/// Retry behaviour for port calls made during archival.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Ceiling for any single delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay for a given retry number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        Duration::from_secs_f64(base.min(self.max_delay.as_secs_f64()))
    }
}

/// How much archived material compaction keeps
#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    pub max_age: chrono::Duration,
    pub max_chunks: usize,
}

impl RetentionPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_age: config.chunk_retention(),
            max_chunks: config.max_archived_chunks,
        }
    }
}

/// Moves overflow exchanges into the vector index
pub struct OverflowArchiver {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    timeout: Duration,
    retry: RetryPolicy,
    retention: RetentionPolicy,
    recent_ids: Mutex<RecentSet<Uuid>>,
}

impl OverflowArchiver {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, config: &Config) -> Self {
        Self {
            embedder,
            index,
            timeout: config.port_timeout(),
            retry: RetryPolicy {
                initial_delay: config.retry_initial_delay(),
                ..Default::default()
            },
            retention: RetentionPolicy::from_config(config),
            recent_ids: Mutex::new(RecentSet::new(RECENT_IDS_CAPACITY)),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    /// Number of chunks currently in the index
    pub async fn chunk_count(&self) -> Result<usize> {
        self.index.count().await
    }

    /// Archive an overflow batch; returns the chunks that were stored.
    pub async fn archive(&self, overflow: Vec<Exchange>) -> Vec<ArchivedChunk> {
        let mut archived = Vec::new();

        for group in group_exchanges(overflow) {
            let text = format_chunk_text(&group);
            let created_at = group[0].created_at;
            let id = chunk_id(&text, created_at);

            if !self.claim(id) {
                debug!(chunk_id = %id, "Chunk already archived, skipping");
                continue;
            }

            match self.store_chunk(id, text, &group).await {
                Ok(chunk) => archived.push(chunk),
                Err(e) => {
                    self.release(id);
                    warn!(chunk_id = %id, error = %e, "Dropping overflow chunk after retries");
                }
            }
        }

        if !archived.is_empty() {
            info!(chunks = archived.len(), index = self.index.name(), "Archived overflow");
        }
        archived
    }

    /// Enforce the retention policy; returns how many chunks were removed.
    pub async fn compact(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = &self.retention;
        let mut removed = self.index.delete_before(now - retention.max_age).await?;

        let count = self.index.count().await?;
        if count > retention.max_chunks {
            let mut stamps = self.index.timestamps().await?;
            stamps.sort_unstable_by(|a, b| b.cmp(a));
            let cutoff = match retention.max_chunks {
                0 => Some(now + chrono::Duration::milliseconds(1)),
                n => stamps.get(n - 1).copied(),
            };
            if let Some(cutoff) = cutoff {
                removed += self.index.delete_before(cutoff).await?;
            }
        }

        if removed > 0 {
            info!(removed, "Compacted archived chunks");
        }
        Ok(removed)
    }

    async fn store_chunk(&self, id: Uuid, text: String, group: &[Exchange]) -> Result<ArchivedChunk> {
        let embedding = self
            .retrying("embed", || async {
                match tokio::time::timeout(self.timeout, self.embedder.embed(&text)).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::embedding_unavailable("embedding timed out")),
                }
            })
            .await?;

        let chunk = ArchivedChunk {
            id,
            text,
            embedding,
            created_at: group[0].created_at,
            source_session: group[0].session_id.clone(),
            exchange_count: group.len() as u32,
        };

        let payload = chunk.payload();
        self.retrying("upsert", || async {
            match tokio::time::timeout(
                self.timeout,
                self.index.upsert(chunk.id, &chunk.embedding, &payload),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(Error::index_unavailable("upsert timed out")),
            }
        })
        .await?;

        Ok(chunk)
    }

    async fn retrying<T, F, Fut>(&self, operation: &str, mut call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(e) if attempt < self.retry.max_retries => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(operation, attempt, error = %e, delay_ms = delay.as_millis() as u64, "Archival call failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn claim(&self, id: Uuid) -> bool {
        match self.recent_ids.lock() {
            Ok(mut ids) => ids.insert(id),
            Err(_) => true,
        }
    }

    fn release(&self, id: Uuid) {
        if let Ok(mut ids) = self.recent_ids.lock() {
            ids.remove(&id);
        }
    }
}

/// Split overflow into chunks: each user exchange opens a group that absorbs
/// every following non-user entry. Leading replies form their own group.
pub fn group_exchanges(exchanges: Vec<Exchange>) -> Vec<Vec<Exchange>> {
    let mut groups: Vec<Vec<Exchange>> = Vec::new();
    for exchange in exchanges {
        match groups.last_mut() {
            Some(group) if exchange.role != Role::User => group.push(exchange),
            _ => groups.push(vec![exchange]),
        }
    }
    groups
}

/// Role-tagged, chronological text for a group of exchanges
pub fn format_chunk_text(group: &[Exchange]) -> String {
    group
        .iter()
        .map(|e| {
            format!(
                "[{}] {}: {}",
                e.created_at.format("%Y-%m-%d %H:%M"),
                e.role.label(),
                e.content
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Content-derived id: the same text at the same time always maps to one chunk
pub fn chunk_id(text: &str, created_at: DateTime<Utc>) -> Uuid {
    let key = format!("{}|{}", created_at.timestamp_millis(), text);
    Uuid::new_v5(&CHUNK_NAMESPACE, key.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::HashingEmbedder;
    use crate::storage::{IndexHit, InMemoryIndex};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair(q: &str, a: &str) -> Vec<Exchange> {
        vec![Exchange::user("session_a", q), Exchange::assistant("session_a", a)]
    }

    fn archiver(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>) -> OverflowArchiver {
        OverflowArchiver::new(embedder, index, &Config::default()).with_retry(RetryPolicy {
            initial_delay: Duration::from_millis(10),
            ..Default::default()
        })
    }

    /// Fails the first `failures` calls, then delegates
    struct FlakyEmbedder {
        inner: HashingEmbedder,
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Embedder for FlakyEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(Error::embedding_unavailable("provider down"));
            }
            self.inner.embed(text).await
        }

        fn dimensions(&self) -> usize {
            self.inner.dimensions()
        }
    }

    struct DownIndex;

    #[async_trait]
    impl VectorIndex for DownIndex {
        fn name(&self) -> &str {
            "down"
        }
        async fn upsert(&self, _: Uuid, _: &[f32], _: &ChunkPayload) -> Result<()> {
            Err(Error::index_unavailable("connection refused"))
        }
        async fn query(&self, _: &[f32], _: usize) -> Result<Vec<IndexHit>> {
            Err(Error::index_unavailable("connection refused"))
        }
        async fn count(&self) -> Result<usize> {
            Ok(0)
        }
        async fn delete_before(&self, _: DateTime<Utc>) -> Result<usize> {
            Ok(0)
        }
        async fn timestamps(&self) -> Result<Vec<DateTime<Utc>>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn groups_pairs_and_scratch_entries() {
        let mut exchanges = pair("q1", "a1");
        exchanges.push(Exchange::user("s", "q2"));
        exchanges.push(Exchange::assistant("s", "thinking"));
        exchanges.push(Exchange::assistant("s", "a2"));

        let groups = group_exchanges(exchanges);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].len(), 2);
        assert_eq!(groups[1].len(), 3);
    }

    #[test]
    fn chunk_text_is_role_tagged_and_chronological() {
        let text = format_chunk_text(&pair("How do I rebase?", "Use git rebase -i"));
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("User: How do I rebase?"));
        assert!(lines[1].ends_with("Assistant: Use git rebase -i"));
    }

    #[test]
    fn chunk_id_depends_on_text_and_time() {
        let now = Utc::now();
        assert_eq!(chunk_id("abc", now), chunk_id("abc", now));
        assert_ne!(chunk_id("abc", now), chunk_id("abd", now));
        assert_ne!(
            chunk_id("abc", now),
            chunk_id("abc", now + chrono::Duration::seconds(1))
        );
    }

    #[test]
    fn retry_delay_grows_exponentially() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[tokio::test]
    async fn archives_each_pair_as_a_chunk() {
        let index = Arc::new(InMemoryIndex::new());
        let archiver = archiver(Arc::new(HashingEmbedder::new(64)), index.clone());

        let mut overflow = pair("q1", "a1");
        overflow.extend(pair("q2", "a2"));
        let chunks = archiver.archive(overflow).await;

        assert_eq!(chunks.len(), 2);
        assert_eq!(index.count().await.unwrap(), 2);
        assert!(chunks.iter().all(|c| c.exchange_count == 2));
        assert!(chunks.iter().all(|c| c.source_session == "session_a"));
    }

    #[tokio::test]
    async fn same_batch_twice_is_archived_once() {
        let index = Arc::new(InMemoryIndex::new());
        let archiver = archiver(Arc::new(HashingEmbedder::new(64)), index.clone());

        let batch = pair("q1", "a1");
        assert_eq!(archiver.archive(batch.clone()).await.len(), 1);
        assert!(archiver.archive(batch).await.is_empty());
        assert_eq!(index.count().await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn embedding_failure_is_retried_once() {
        let index = Arc::new(InMemoryIndex::new());
        let embedder = Arc::new(FlakyEmbedder {
            inner: HashingEmbedder::new(32),
            failures: 1,
            calls: AtomicUsize::new(0),
        });
        let archiver = archiver(embedder.clone(), index.clone());

        let chunks = archiver.archive(pair("q1", "a1")).await;
        assert_eq!(chunks.len(), 1);
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_failure_drops_chunk_without_error() {
        let index = Arc::new(InMemoryIndex::new());
        let embedder = Arc::new(FlakyEmbedder {
            inner: HashingEmbedder::new(32),
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        });
        let archiver = archiver(embedder.clone(), index.clone());

        let batch = pair("q1", "a1");
        assert!(archiver.archive(batch.clone()).await.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 2);
        assert_eq!(index.count().await.unwrap(), 0);

        // A dropped chunk may be offered again later
        assert!(archiver.archive(batch).await.is_empty());
        assert_eq!(embedder.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_index_degrades_to_no_op() {
        let archiver = archiver(Arc::new(HashingEmbedder::new(32)), Arc::new(DownIndex));
        assert!(archiver.archive(pair("q1", "a1")).await.is_empty());
    }

    #[tokio::test]
    async fn compaction_applies_age_then_count() {
        let index = Arc::new(InMemoryIndex::new());
        let archiver = archiver(Arc::new(HashingEmbedder::new(16)), index.clone())
            .with_retention(RetentionPolicy {
                max_age: chrono::Duration::days(180),
                max_chunks: 3,
            });
        let now = Utc::now();

        for (i, age) in [400i64, 10, 5, 2, 1].iter().enumerate() {
            let at = now - chrono::Duration::days(*age);
            let batch = vec![
                Exchange::user("s", format!("q{i}")).at(at),
                Exchange::assistant("s", format!("a{i}")).at(at),
            ];
            archiver.archive(batch).await;
        }
        assert_eq!(index.count().await.unwrap(), 5);

        let removed = archiver.compact(now).await.unwrap();
        assert_eq!(removed, 2);
        assert_eq!(index.count().await.unwrap(), 3);

        let mut stamps = index.timestamps().await.unwrap();
        stamps.sort();
        assert!(stamps[0] >= now - chrono::Duration::days(5));
    }
}
