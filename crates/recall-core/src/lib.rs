//! ============================================================================
//! RECALL-CORE: Tiered Conversational Memory
//! ============================================================================
//! Remembers every query/response pair a user has with the assistant and
//! recalls the most relevant ones later:
//! - Staging buffer on redb, crash-tolerant local writes
//! - Durable store on SQLite, tier of record for entries and profiles
//! - Vector index (in-process or Qdrant) with per-user scoped search
//! - Lexical reranking and profile decay
//! ============================================================================

pub mod config;
pub mod durable;
pub mod memory;
pub mod retry;
pub mod staging;
pub mod types;

#[cfg(test)]
mod testing;

// Re-export main types for convenience
pub use config::EngineConfig;
pub use durable::{DurableStore, MemoryRecord, SqliteStore};
pub use memory::{
    EmbeddingPort, EnginePorts, HashEmbedder, InMemoryIndex, LexicalReranker, MemoryEngine,
    QdrantIndex, Reranker, ResetReport, VectorIndex,
};
pub use staging::{FlushReport, StagingBuffer};
pub use types::*;
