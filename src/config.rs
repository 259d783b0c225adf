//! Configuration for dieah-context

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Configuration for the context system
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Base directory for all storage
    pub data_dir: PathBuf,

    /// Embedding model name (for reference, actual model set in embedding.rs)
    pub embedding_model: String,

    /// Embedding dimensions (384 for all-MiniLM-L6-v2)
    pub embedding_dimensions: usize,

    /// Session window capacity, in exchanges (not pairs)
    pub recent_message_limit: usize,

    /// Number of retrieved chunks offered to the assembler
    pub vector_search_limit: usize,

    /// Minimum similarity for chunks older than the recency gate (0.0 - 1.0)
    pub rag_similarity_threshold: f32,

    /// Token budget for an assembled prompt
    pub token_budget_limit: u32,

    /// Chunks younger than this many days skip the relevance gate
    pub recency_gate_days: i64,

    /// Candidates fetched per requested result, to leave room for filtering
    pub overfetch_factor: usize,

    /// Timeout applied to every embedding / index call
    pub port_timeout_secs: u64,

    /// First backoff delay for archival retries
    pub retry_initial_delay_ms: u64,

    /// Background task queue capacity
    pub task_queue_capacity: usize,

    /// Delivery attempts for a background task before it is abandoned
    pub task_max_attempts: u32,

    /// Archived chunks older than this are removed by compaction
    pub chunk_retention_days: i64,

    /// Upper bound on archived chunks kept by compaction
    pub max_archived_chunks: usize,

    /// Interval between scheduled compactions in the server
    pub compaction_interval_secs: u64,

    /// Server conversations untouched this long are ended and archived
    pub conversation_idle_secs: u64,

    /// HTTP server port
    pub server_port: u16,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dieah-context");

        Self {
            data_dir,
            embedding_model: "all-MiniLM-L6-v2".to_string(),
            embedding_dimensions: 384, // MiniLM-L6-v2 outputs 384-dim vectors
            recent_message_limit: 20,
            vector_search_limit: 3,
            rag_similarity_threshold: 0.7,
            token_budget_limit: 4000,
            recency_gate_days: 7,
            overfetch_factor: 3,
            port_timeout_secs: 30,
            retry_initial_delay_ms: 500,
            task_queue_capacity: 64,
            task_max_attempts: 3,
            chunk_retention_days: 180,
            max_archived_chunks: 10_000,
            compaction_interval_secs: 3600,
            conversation_idle_secs: 3600,
            server_port: 8421,
        }
    }
}

impl Config {
    /// Create a new config with a custom data directory
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Load a config from a JSON file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config: Config = serde_json::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the components cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.recent_message_limit < 2 {
            return Err(Error::config(
                "recent_message_limit must hold at least one user/assistant pair",
            ));
        }
        if !(0.0..=1.0).contains(&self.rag_similarity_threshold) {
            return Err(Error::config(format!(
                "rag_similarity_threshold must be within [0, 1], got {}",
                self.rag_similarity_threshold
            )));
        }
        if self.embedding_dimensions == 0 {
            return Err(Error::config("embedding_dimensions must be non-zero"));
        }
        if self.overfetch_factor == 0 || self.task_queue_capacity == 0 {
            return Err(Error::config(
                "overfetch_factor and task_queue_capacity must be non-zero",
            ));
        }
        if self.task_max_attempts == 0 {
            return Err(Error::config("task_max_attempts must be at least 1"));
        }
        if self.recency_gate_days < 0 || self.chunk_retention_days < 0 {
            return Err(Error::config("day counts must not be negative"));
        }
        Ok(())
    }

    pub fn port_timeout(&self) -> Duration {
        Duration::from_secs(self.port_timeout_secs)
    }

    pub fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    pub fn recency_gate(&self) -> chrono::Duration {
        chrono::Duration::days(self.recency_gate_days)
    }

    pub fn chunk_retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.chunk_retention_days)
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("preferences.db")
    }

    /// Get the path to the vector database
    pub fn vector_db_path(&self) -> PathBuf {
        self.data_dir.join("vectors")
    }

    /// Ensure all required directories exist
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(self.vector_db_path())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_surface() {
        let config = Config::default();
        assert_eq!(config.recent_message_limit, 20);
        assert_eq!(config.vector_search_limit, 3);
        assert!((config.rag_similarity_threshold - 0.7).abs() < f32::EPSILON);
        assert_eq!(config.token_budget_limit, 4000);
        assert_eq!(config.recency_gate_days, 7);
        assert_eq!(config.port_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_window_smaller_than_a_pair() {
        let config = Config {
            recent_message_limit: 1,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let config = Config {
            rag_similarity_threshold: 1.5,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_fills_missing_keys_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("context.json");
        std::fs::write(&path, r#"{ "recent_message_limit": 8, "token_budget_limit": 1000 }"#)
            .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.recent_message_limit, 8);
        assert_eq!(config.token_budget_limit, 1000);
        assert_eq!(config.vector_search_limit, 3);
    }

    #[test]
    fn paths_live_under_data_dir() {
        let config = Config::with_data_dir("/tmp/dieah-test");
        assert_eq!(config.sqlite_path(), PathBuf::from("/tmp/dieah-test/preferences.db"));
        assert_eq!(config.vector_db_path(), PathBuf::from("/tmp/dieah-test/vectors"));
    }
}
