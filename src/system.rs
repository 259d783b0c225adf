//! Wiring: opens storage, starts the task queue, hands out conversations

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::info;

use crate::archiver::OverflowArchiver;
use crate::assembler::ContextAssembler;
use crate::config::Config;
use crate::conversation::{ContextServices, Conversation};
use crate::embedding::{Embedder, FastEmbedder, HashingEmbedder};
use crate::error::Result;
use crate::preferences::PreferenceStore;
use crate::retrieval::{RankedChunk, RetrievalEngine};
use crate::storage::{InMemoryIndex, LanceIndex, SqliteStorage, VectorIndex};
use crate::tasks::{ContextWorker, QueueStats, TaskQueue};
use crate::tokens::{TokenCounter, TokenEstimator};

#[derive(Debug, Clone, Serialize)]
pub struct SystemStats {
    pub archived_chunks: usize,
    pub stored_preferences: usize,
    pub queue: QueueStats,
}

/// Everything conversations share
pub struct ContextSystem {
    config: Config,
    archiver: Arc<OverflowArchiver>,
    storage: Option<SqliteStorage>,
    queue: TaskQueue,
    services: ContextServices,
}

impl ContextSystem {
    /// On-disk system: LanceDB chunks, SQLite preferences, local embedding model
    pub async fn open(config: Config) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::new(FastEmbedder::new(&config)?);
        Self::open_with_embedder(config, embedder).await
    }

    /// On-disk system with a caller-chosen embedder
    pub async fn open_with_embedder(config: Config, embedder: Arc<dyn Embedder>) -> Result<Self> {
        config.validate()?;
        config.ensure_dirs()?;

        let index: Arc<dyn VectorIndex> = Arc::new(LanceIndex::new(&config).await?);
        let storage = SqliteStorage::open(config.sqlite_path())?;
        info!(data_dir = ?config.data_dir, "Opened context storage");

        Ok(Self::from_parts(
            config,
            embedder,
            index,
            Some(storage),
            Arc::new(TokenCounter::cl100k()?),
        ))
    }

    /// Ephemeral system with no files: hashing embedder, in-memory index and
    /// an in-memory SQLite profile store
    pub fn in_memory(config: Config, counter: Arc<dyn TokenEstimator>) -> Result<Self> {
        config.validate()?;
        let embedder = Arc::new(HashingEmbedder::new(config.embedding_dimensions));
        let storage = SqliteStorage::open_in_memory()?;
        Ok(Self::from_parts(
            config,
            embedder,
            Arc::new(InMemoryIndex::new()),
            Some(storage),
            counter,
        ))
    }

    /// Build from explicit parts
    pub fn from_parts(
        config: Config,
        embedder: Arc<dyn Embedder>,
        index: Arc<dyn VectorIndex>,
        storage: Option<SqliteStorage>,
        counter: Arc<dyn TokenEstimator>,
    ) -> Self {
        let archiver = Arc::new(OverflowArchiver::new(embedder.clone(), index.clone(), &config));
        let queue = TaskQueue::spawn(
            Arc::new(ContextWorker::new(archiver.clone(), storage.clone())),
            &config,
        );
        let services = ContextServices {
            config: config.clone(),
            retrieval: Arc::new(RetrievalEngine::new(embedder, index, &config)),
            assembler: ContextAssembler::new(counter),
            tasks: queue.sender(),
        };

        Self {
            config,
            archiver,
            storage,
            queue,
            services,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn services(&self) -> &ContextServices {
        &self.services
    }

    pub fn archiver(&self) -> &Arc<OverflowArchiver> {
        &self.archiver
    }

    /// New conversation for `owner`, restoring any persisted profile
    pub fn conversation(&self, owner: &str) -> Result<Conversation> {
        let preferences = match &self.storage {
            Some(storage) => PreferenceStore::from_entries(storage.load_preferences(owner)?),
            None => PreferenceStore::new(),
        };
        Ok(Conversation::new(self.services.clone(), owner)?.with_preferences(preferences))
    }

    /// Search the archive outside any conversation
    pub async fn search(&self, query: &str, limit: Option<usize>) -> Vec<RankedChunk> {
        let retrieval = &self.services.retrieval;
        retrieval
            .search(query, limit.unwrap_or_else(|| retrieval.default_limit()))
            .await
    }

    /// Apply the retention policy now
    pub async fn compact(&self) -> Result<usize> {
        self.archiver.compact(Utc::now()).await
    }

    pub async fn stats(&self) -> Result<SystemStats> {
        let stored_preferences = match &self.storage {
            Some(storage) => storage.count_preferences()?,
            None => 0,
        };
        Ok(SystemStats {
            archived_chunks: self.archiver.chunk_count().await?,
            stored_preferences,
            queue: self.queue.stats(),
        })
    }

    /// Drain background work
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tokens::WordEstimator;

    fn system() -> ContextSystem {
        let config = Config {
            embedding_dimensions: 64,
            ..Default::default()
        };
        ContextSystem::in_memory(config, Arc::new(WordEstimator)).unwrap()
    }

    #[tokio::test]
    async fn conversation_restores_persisted_profile() {
        let system = system();
        let mut first = system.conversation("ada").unwrap();
        first.record("my name is Ada", "nice to meet you").await.unwrap();

        // Let the worker persist before the next conversation loads
        system.shutdown().await;

        let second = system.conversation("ada").unwrap();
        assert!(second.preferences().get("name").is_some());
        assert!(system.conversation("bob").unwrap().preferences().is_empty());
    }

    #[tokio::test]
    async fn stats_on_empty_system() {
        let system = system();
        let stats = system.stats().await.unwrap();
        assert_eq!(stats.archived_chunks, 0);
        assert_eq!(stats.stored_preferences, 0);
        assert_eq!(system.compact().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn on_disk_system_with_hashing_embedder() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            embedding_dimensions: 32,
            ..Config::with_data_dir(dir.path())
        };
        let embedder = Arc::new(HashingEmbedder::new(32));
        let system = ContextSystem::open_with_embedder(config, embedder).await.unwrap();

        let mut conversation = system.conversation("ada").unwrap();
        conversation.record("hello", "hi").await.unwrap();
        conversation.end_session().await;
        system.shutdown().await;

        assert_eq!(system.stats().await.unwrap().archived_chunks, 1);
        assert!(dir.path().join("preferences.db").exists());
    }
}
