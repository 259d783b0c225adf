//! # Dieah Context
//!
//! Working-context management for conversational agents.
//!
//! ## Architecture
//!
//! Each turn flows through five parts:
//! - **Session window** - the most recent exchanges, bounded; overflow is
//!   evicted in whole user/assistant pairs
//! - **Overflow archiver** - embeds evicted pairs into a vector index
//! - **Retrieval engine** - finds archived chunks that are recent or relevant
//! - **Preference store** - a learned, confidence-weighted user profile
//! - **Context assembler** - packs everything into one prompt within a token
//!   budget
//!
//! Archival and preference persistence run on a background task queue, so a
//! slow or unreachable index never holds up a reply.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use dieah_context::{Config, ContextSystem};
//!
//! let system = ContextSystem::open(Config::default()).await?;
//! let mut conversation = system.conversation("ada")?;
//!
//! let prompt = conversation.prepare("How do I rebase onto main?").await?;
//! let response = my_model.generate(&prompt.blocks).await?;
//! conversation.record("How do I rebase onto main?", &response).await?;
//!
//! system.shutdown().await;
//! ```

pub mod archiver;
pub mod assembler;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod exchange;
pub mod preferences;
pub mod retrieval;
pub mod session;
pub mod storage;
pub mod system;
pub mod tasks;
pub mod tokens;

pub use archiver::{ArchivedChunk, OverflowArchiver};
pub use assembler::{AssembledPrompt, ContextAssembler, PromptBlock, Section};
pub use config::Config;
pub use conversation::{ContextServices, Conversation, Generator, TurnOutcome, TurnRecord};
pub use embedding::{Embedder, FastEmbedder, HashingEmbedder};
pub use error::{Error, Result};
pub use exchange::{Exchange, Role, TokenUsage};
pub use preferences::{
    Outcome, PreferenceCategory, PreferenceEntry, PreferenceStore, PreferenceValue, TaskType,
};
pub use retrieval::{RankedChunk, RetrievalEngine};
pub use session::SessionWindow;
pub use storage::{InMemoryIndex, LanceIndex, SqliteStorage, VectorIndex};
pub use system::ContextSystem;
pub use tasks::{Task, TaskQueue};
pub use tokens::{TokenCounter, TokenEstimator};
