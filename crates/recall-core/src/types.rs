//! ============================================================================
//! Core Types - Shared data structures for the memory engine
//! ============================================================================
//! Memory entries, result payloads, user profiles, recall hits and the
//! engine error taxonomy.
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Sentinel stored in id columns meaning "not assigned yet"
pub const UNASSIGNED_ID: i64 = -1;

/// Session key used when an entry carries no session id
pub const DEFAULT_SESSION: &str = "__default__";

/// Identifier of a record inside a vector index
pub type VectorId = u64;

/// Resolve an optional session id to the key used for buffering
pub fn session_key(session_id: Option<&str>) -> &str {
    session_id.unwrap_or(DEFAULT_SESSION)
}

/// Current unix time in seconds
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

// ============================================================================
// Memory Entries
// ============================================================================

/// Result of an assistant interaction, opaque to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum ResultPayload {
    /// No result was produced
    Empty,
    /// Plain text answer
    Text(String),
    /// Structured JSON document
    Json(serde_json::Value),
    /// Raw bytes in an unknown encoding
    Bytes(Vec<u8>),
}

impl ResultPayload {
    /// Encode for storage in the staging and durable tiers
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| anyhow::anyhow!("Failed to encode result payload: {}", e))
    }

    /// Decode bytes written by [`ResultPayload::to_bytes`].
    /// Anything else is preserved as [`ResultPayload::Bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return ResultPayload::Empty;
        }
        serde_json::from_slice(bytes).unwrap_or_else(|_| ResultPayload::Bytes(bytes.to_vec()))
    }
}

impl From<serde_json::Value> for ResultPayload {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => ResultPayload::Empty,
            serde_json::Value::String(s) => ResultPayload::Text(s),
            other => ResultPayload::Json(other),
        }
    }
}

/// One remembered query/response pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    /// Durable-store id, `None` until the entry has been flushed
    pub entry_id: Option<i64>,
    pub user_id: String,
    pub session_id: Option<String>,
    pub query_text: String,
    pub result_payload: ResultPayload,
    /// Unix timestamp assigned at ingestion
    pub created_at: i64,
    /// Vector index id, `None` until the entry has been indexed
    pub vector_id: Option<VectorId>,
}

impl MemoryEntry {
    /// Create a new, not yet persisted entry stamped with the current time
    pub fn new(
        user_id: impl Into<String>,
        session_id: Option<String>,
        query_text: impl Into<String>,
        result_payload: ResultPayload,
    ) -> Self {
        Self {
            entry_id: None,
            user_id: user_id.into(),
            session_id,
            query_text: query_text.into(),
            result_payload,
            created_at: now_ts(),
            vector_id: None,
        }
    }

    /// Override the ingestion timestamp
    pub fn at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Convert a stored id column into an optional id
pub fn id_from_column(value: i64) -> Option<i64> {
    (value >= 0).then_some(value)
}

/// Convert an optional vector id into its stored column value
pub fn vector_id_to_column(vector_id: Option<VectorId>) -> i64 {
    vector_id.map(|v| v as i64).unwrap_or(UNASSIGNED_ID)
}

/// Convert a stored vector id column into an optional vector id
pub fn vector_id_from_column(value: i64) -> Option<VectorId> {
    (value >= 0).then_some(value as VectorId)
}

// ============================================================================
// Profiles
// ============================================================================

/// Per-user attribute store with edit bookkeeping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserProfile {
    pub user_id: String,
    pub fields: BTreeMap<String, serde_json::Value>,
    /// Unix timestamp of the most recent field mutation
    pub last_update: i64,
    /// Number of mutations ever applied, never decremented
    pub edit_count: u64,
}

impl UserProfile {
    /// Fresh profile with no fields
    pub fn empty(user_id: impl Into<String>, now: i64) -> Self {
        Self {
            user_id: user_id.into(),
            fields: BTreeMap::new(),
            last_update: now,
            edit_count: 0,
        }
    }
}

/// One line of a profile's edit history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub field: String,
    pub value: serde_json::Value,
    pub timestamp: i64,
}

// ============================================================================
// Recall Results
// ============================================================================

/// A single ranked recall result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecallHit {
    /// Durable id of the entry, if the indexed record carried one
    pub entry_id: Option<i64>,
    pub vector_id: VectorId,
    /// Reranker score, the ordering key
    pub score: f64,
    /// Cosine similarity from the coarse vector search
    pub similarity: f32,
    /// exp(-λ · age_days) of the entry, informational only
    pub freshness: f64,
    pub payload: crate::memory::VectorPayload,
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub staged_rows: usize,
    pub pending_sessions: usize,
    pub durable_entries: u64,
    /// Durable entries whose vector id is still unassigned
    pub unindexed_entries: u64,
    pub indexed_vectors: u64,
    pub queued_index_jobs: usize,
}

// ============================================================================
// Errors
// ============================================================================

/// Error types surfaced by the memory engine
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Downstream unavailable: {0}")]
    TransientDownstream(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Isolation violation: expected user {expected}, found {found}")]
    IsolationViolation { expected: String, found: String },

    #[error("Staging storage error: {0}")]
    Storage(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Index queue is full")]
    QueueFull,

    #[error("Engine is shut down")]
    ShutDown,
}

impl EngineError {
    /// Whether the write path should retry after this error
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::TransientDownstream(_) | EngineError::QueueFull)
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
