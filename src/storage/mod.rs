//! Storage backends for dieah-context

mod index;
mod memory;
mod sqlite;
pub mod vector;

pub use index::{cosine_similarity, ChunkPayload, IndexHit, VectorIndex};
pub use memory::InMemoryIndex;
pub use sqlite::SqliteStorage;
pub use vector::LanceIndex;
