//! Vector index port

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

/// What the index stores next to each vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkPayload {
    /// Role-tagged, chronological text of the archived exchanges
    pub text: String,

    /// Creation time of the first exchange in the chunk
    pub created_at: DateTime<Utc>,

    /// Session the exchanges came from
    pub source_session: String,

    /// Number of exchanges folded into the chunk
    pub exchange_count: u32,
}

/// A nearest-neighbour match
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub id: Uuid,
    pub payload: ChunkPayload,
    /// Cosine similarity, 1.0 for identical direction
    pub similarity: f32,
}

/// Stores `(id, vector, payload)` triples and answers nearest-neighbour queries.
///
/// Upserts must be idempotent per id so archival retries are harmless.
/// Failures surface as [`crate::Error::IndexUnavailable`].
#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn name(&self) -> &str;

    /// Insert or replace the entry with this id
    async fn upsert(&self, id: Uuid, vector: &[f32], payload: &ChunkPayload) -> Result<()>;

    /// Up to `k` entries ordered by similarity, best first
    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>>;

    /// Number of stored entries
    async fn count(&self) -> Result<usize>;

    /// Delete every entry created strictly before `cutoff`; returns how many went
    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize>;

    /// Creation times of all stored entries, in no particular order
    async fn timestamps(&self) -> Result<Vec<DateTime<Utc>>>;
}

/// Compute cosine similarity between two vectors.
///
/// Returns a value in [-1, 1] where 1 = identical, 0 = orthogonal, -1 = opposite.
/// Returns 0.0 if either vector is zero-length or the lengths differ.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;

    for (x, y) in a.iter().zip(b.iter()) {
        let x = *x as f64;
        let y = *y as f64;
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < 1e-10 {
        return 0.0;
    }

    (dot / denom) as f32
}
