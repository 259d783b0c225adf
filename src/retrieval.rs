//! Semantic retrieval of archived chunks
//!
//! Search never fails: an empty index, an unreachable embedder or index, or a
//! timeout all yield an empty result so the turn proceeds without archive
//! context.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::embedding::Embedder;
use crate::error::{Error, Result};
use crate::storage::{ChunkPayload, IndexHit, VectorIndex};

/// Upper bound on candidates requested from the index in one search
pub const MAX_CANDIDATES: usize = 1024;

/// Gates applied to index candidates
#[derive(Debug, Clone)]
pub struct RetrievalPolicy {
    /// Chunks younger than this pass regardless of similarity
    pub recency_window: chrono::Duration,
    /// Minimum similarity for chunks outside the recency window
    pub similarity_threshold: f32,
    /// Candidates fetched per requested result
    pub overfetch_factor: usize,
}

impl Default for RetrievalPolicy {
    fn default() -> Self {
        Self {
            recency_window: chrono::Duration::days(7),
            similarity_threshold: 0.7,
            overfetch_factor: 3,
        }
    }
}

impl RetrievalPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            recency_window: config.recency_gate(),
            similarity_threshold: config.rag_similarity_threshold,
            overfetch_factor: config.overfetch_factor.max(1),
        }
    }
}

/// An archived chunk with its relevance to the query
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedChunk {
    pub id: Uuid,
    pub chunk: ChunkPayload,
    pub similarity: f32,
}

/// Keep candidates that pass the recency or relevance gate, best first.
///
/// Ties in similarity go to the newer chunk.
pub fn apply_gates(
    hits: Vec<IndexHit>,
    policy: &RetrievalPolicy,
    now: DateTime<Utc>,
    limit: usize,
) -> Vec<RankedChunk> {
    let mut kept: Vec<RankedChunk> = hits
        .into_iter()
        .filter(|hit| {
            let age = now - hit.payload.created_at;
            age < policy.recency_window || hit.similarity >= policy.similarity_threshold
        })
        .map(|hit| RankedChunk {
            id: hit.id,
            chunk: hit.payload,
            similarity: hit.similarity,
        })
        .collect();

    kept.sort_by(|a, b| {
        b.similarity
            .total_cmp(&a.similarity)
            .then_with(|| b.chunk.created_at.cmp(&a.chunk.created_at))
    });
    kept.truncate(limit);
    kept
}

/// Embeds queries and gates index results
pub struct RetrievalEngine {
    embedder: Arc<dyn Embedder>,
    index: Arc<dyn VectorIndex>,
    policy: RetrievalPolicy,
    timeout: Duration,
    default_limit: usize,
}

impl RetrievalEngine {
    pub fn new(embedder: Arc<dyn Embedder>, index: Arc<dyn VectorIndex>, config: &Config) -> Self {
        Self {
            embedder,
            index,
            policy: RetrievalPolicy::from_config(config),
            timeout: config.port_timeout(),
            default_limit: config.vector_search_limit,
        }
    }

    pub fn with_policy(mut self, policy: RetrievalPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn policy(&self) -> &RetrievalPolicy {
        &self.policy
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Search relative to the current time
    pub async fn search(&self, query: &str, limit: usize) -> Vec<RankedChunk> {
        self.search_at(query, limit, Utc::now()).await
    }

    pub async fn search_at(&self, query: &str, limit: usize, now: DateTime<Utc>) -> Vec<RankedChunk> {
        if limit == 0 || query.trim().is_empty() {
            return Vec::new();
        }

        let k = limit
            .saturating_mul(self.policy.overfetch_factor)
            .min(MAX_CANDIDATES);
        match self.candidates(query, k).await {
            Ok(hits) => {
                let candidates = hits.len();
                let ranked = apply_gates(hits, &self.policy, now, limit);
                debug!(candidates, kept = ranked.len(), "Retrieved archived chunks");
                ranked
            }
            Err(e) if e.is_transient() => {
                warn!(error = %e, index = self.index.name(), "Retrieval degraded, continuing without archive context");
                Vec::new()
            }
            Err(e) => {
                error!(error = %e, index = self.index.name(), "Retrieval failed, continuing without archive context");
                Vec::new()
            }
        }
    }

    async fn candidates(&self, query: &str, k: usize) -> Result<Vec<IndexHit>> {
        let vector = tokio::time::timeout(self.timeout, self.embedder.embed(query))
            .await
            .map_err(|_| Error::embedding_unavailable("query embedding timed out"))??;

        tokio::time::timeout(self.timeout, self.index.query(&vector, k))
            .await
            .map_err(|_| Error::index_unavailable("index query timed out"))?
    }
}
