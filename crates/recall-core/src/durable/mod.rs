//! ============================================================================
//! Durable Store - Relational tier of record
//! ============================================================================
//! Permanent home for every memory entry and for per-user profile state.
//! The engine only talks to the [`DurableStore`] trait; [`SqliteStore`] is
//! the bundled implementation.
//! ============================================================================

mod sqlite;

pub use sqlite::SqliteStore;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{HistoryEntry, MemoryEntry, ResultPayload, UserProfile, VectorId};

/// A memory row as stored in the durable tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryRecord {
    /// Assigned by the store, ignored on upsert
    pub entry_id: Option<i64>,
    pub user_id: String,
    pub session_id: Option<String>,
    pub query_text: String,
    /// Encoded [`ResultPayload`]
    pub result: Vec<u8>,
    pub created_at: i64,
    pub vector_id: Option<VectorId>,
}

impl MemoryRecord {
    /// Decode into the public entry type
    pub fn into_entry(self) -> MemoryEntry {
        MemoryEntry {
            entry_id: self.entry_id,
            user_id: self.user_id,
            session_id: self.session_id,
            query_text: self.query_text,
            result_payload: ResultPayload::from_bytes(&self.result),
            created_at: self.created_at,
            vector_id: self.vector_id,
        }
    }
}

/// Storage surface the engine requires from the tier of record.
///
/// Implementations must be safe to share between engine instances:
/// `upsert_memory` is idempotent on `(user_id, session_id, created_at, query_text)`
/// and on `vector_id` once one is assigned.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert or update a memory row, returning its entry id
    async fn upsert_memory(&self, record: &MemoryRecord) -> Result<i64>;

    /// Upsert a whole batch atomically, returning ids in input order.
    /// On error no row of the batch is written.
    async fn upsert_batch(&self, records: &[MemoryRecord]) -> Result<Vec<i64>>;

    /// Record the vector id of an entry. Returns false if the entry is gone.
    async fn attach_vector(&self, entry_id: i64, vector_id: VectorId) -> Result<bool>;

    /// Forget every vector id, marking all entries unindexed.
    /// Used when the vector index starts out empty.
    async fn detach_all_vectors(&self) -> Result<u64>;

    async fn get_memory(&self, entry_id: i64) -> Result<Option<MemoryRecord>>;

    /// Most recent memories of a user, newest first
    async fn list_memories(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>>;

    /// Entries without a vector id, oldest first
    async fn list_unindexed(&self, limit: usize) -> Result<Vec<MemoryRecord>>;

    async fn count_memories(&self) -> Result<u64>;

    async fn count_unindexed(&self) -> Result<u64>;

    /// Delete one entry owned by `user_id`, returning the removed row
    async fn delete_memory(&self, user_id: &str, entry_id: i64) -> Result<Option<MemoryRecord>>;

    /// Delete every entry created before `cutoff`, returning the removed rows
    async fn prune_before(&self, cutoff: i64) -> Result<Vec<MemoryRecord>>;

    /// Entries `prune_before(cutoff)` would remove
    async fn count_before(&self, cutoff: i64) -> Result<u64>;

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>>;

    /// Fetch the profile, creating an empty one stamped `now` if missing
    async fn ensure_profile(&self, user_id: &str, now: i64) -> Result<UserProfile>;

    /// Set one profile field. Last write wins by `timestamp`; returns false
    /// when a newer value was already stored.
    async fn update_profile_field(
        &self,
        user_id: &str,
        field: &str,
        value: &serde_json::Value,
        timestamp: i64,
    ) -> Result<bool>;

    async fn append_history(&self, user_id: &str, entry: &HistoryEntry) -> Result<()>;

    /// Most recent history lines, newest first
    async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<HistoryEntry>>;

    async fn total_interactions(&self, user_id: &str) -> Result<u64>;

    /// Entries created within the last `window_days`
    async fn recent_interactions(&self, user_id: &str, window_days: u32) -> Result<u64>;

    /// Remove every memory, profile, field and history row of a user
    async fn delete_user(&self, user_id: &str) -> Result<u64>;
}
