//! In-memory vector index for tests and ephemeral sessions

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::index::{cosine_similarity, ChunkPayload, IndexHit, VectorIndex};
use crate::error::{Error, Result};

/// Brute-force cosine index over a map. Cloning shares the underlying data.
#[derive(Clone, Default)]
pub struct InMemoryIndex {
    entries: Arc<RwLock<HashMap<Uuid, (Vec<f32>, ChunkPayload)>>>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn upsert(&self, id: Uuid, vector: &[f32], payload: &ChunkPayload) -> Result<()> {
        let mut entries = self.entries.write().await;
        if let Some((existing, _)) = entries.values().next() {
            if existing.len() != vector.len() {
                return Err(Error::index_unavailable(format!(
                    "Embedding dimension mismatch: expected {}, got {}",
                    existing.len(),
                    vector.len()
                )));
            }
        }
        entries.insert(id, (vector.to_vec(), payload.clone()));
        Ok(())
    }

    async fn query(&self, vector: &[f32], k: usize) -> Result<Vec<IndexHit>> {
        let entries = self.entries.read().await;

        let mut hits: Vec<IndexHit> = entries
            .iter()
            .map(|(id, (stored, payload))| IndexHit {
                id: *id,
                payload: payload.clone(),
                similarity: cosine_similarity(stored, vector),
            })
            .collect();

        hits.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.entries.read().await.len())
    }

    async fn delete_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|_, (_, payload)| payload.created_at >= cutoff);
        Ok(before - entries.len())
    }

    async fn timestamps(&self) -> Result<Vec<DateTime<Utc>>> {
        let entries = self.entries.read().await;
        Ok(entries.values().map(|(_, p)| p.created_at).collect())
    }
}
