//! ============================================================================
//! Memory Module - Semantic recall over conversation history
//! ============================================================================
//! Three tiers behind one facade:
//! - Staging buffer (redb): crash-tolerant local writes
//! - Durable store (SQLite): tier of record for entries and profiles
//! - Vector index (in-memory or Qdrant): similarity search, per-user scoped
//!
//! Entries flow staging -> durable -> index; recall reads the index only.
//! ============================================================================

pub mod decay;
pub mod embeddings;
pub mod index;
pub mod manager;
pub mod rerank;
pub mod store;
pub mod worker;

pub use decay::{DecayModel, DECAY_LAMBDA};
pub use embeddings::{create_embedding_service, EmbeddingPort, EmbeddingService, HashEmbedder};
pub use index::{cosine_similarity, InMemoryIndex, PayloadFilter, SearchHit, VectorIndex, VectorPayload};
pub use manager::{EnginePorts, MemoryEngine, ResetReport};
pub use rerank::{LexicalReranker, Reranker};
pub use store::QdrantIndex;
pub use worker::{IndexJob, IndexQueue, SESSION_ATTRIBUTE};
