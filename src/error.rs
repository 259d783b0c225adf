//! Error types for dieah-context

use thiserror::Error;

/// Result type alias for dieah-context operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in dieah-context
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed turn data. The caller must not retry with the same input.
    #[error("Invalid exchange: {0}")]
    InvalidExchange(String),

    #[error("Embedding unavailable: {0}")]
    EmbeddingUnavailable(String),

    #[error("Vector index unavailable: {0}")]
    IndexUnavailable(String),

    /// The system prompt and the live query alone do not fit the budget.
    #[error("Token budget exceeded: {required} tokens required, budget is {budget}")]
    BudgetExceeded { required: u32, budget: u32 },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Generation failed: {0}")]
    Generation(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn invalid_exchange(msg: impl Into<String>) -> Self {
        Self::InvalidExchange(msg.into())
    }

    pub fn embedding_unavailable(msg: impl Into<String>) -> Self {
        Self::EmbeddingUnavailable(msg.into())
    }

    pub fn index_unavailable(msg: impl Into<String>) -> Self {
        Self::IndexUnavailable(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this failure is transient and absorbed by retrieval/archival.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EmbeddingUnavailable(_) | Self::IndexUnavailable(_)
        )
    }
}
