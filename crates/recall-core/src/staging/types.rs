//! ============================================================================
//! Staging Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};

use crate::durable::MemoryRecord;
use crate::types::{MemoryEntry, VectorId};

/// One buffered entry awaiting its flush to the durable tier.
/// Stored bincode-encoded, keyed by `(session_key, seq)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedRow {
    pub user_id: String,
    pub session_id: Option<String>,
    pub query_text: String,
    /// Encoded result payload
    pub result: Vec<u8>,
    pub vector_id: Option<VectorId>,
    pub timestamp: i64,
}

impl StagedRow {
    pub fn from_entry(entry: &MemoryEntry) -> anyhow::Result<Self> {
        Ok(Self {
            user_id: entry.user_id.clone(),
            session_id: entry.session_id.clone(),
            query_text: entry.query_text.clone(),
            result: entry.result_payload.to_bytes()?,
            vector_id: entry.vector_id,
            timestamp: entry.created_at,
        })
    }

    /// Durable form of this row, before an id is assigned
    pub fn to_record(&self) -> MemoryRecord {
        MemoryRecord {
            entry_id: None,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
            query_text: self.query_text.clone(),
            result: self.result.clone(),
            created_at: self.timestamp,
            vector_id: self.vector_id,
        }
    }
}

/// Outcome of a flush pass
#[derive(Debug, Clone, Default)]
pub struct FlushReport {
    /// Rows committed to the durable tier, in flush order, with their ids
    pub flushed: Vec<MemoryRecord>,
    /// Sessions left untouched because the durable tier rejected a row
    pub failed_sessions: Vec<String>,
}

impl FlushReport {
    pub fn is_clean(&self) -> bool {
        self.failed_sessions.is_empty()
    }

    pub(crate) fn merge(&mut self, other: FlushReport) {
        self.flushed.extend(other.flushed);
        self.failed_sessions.extend(other.failed_sessions);
    }
}

/// Staging buffer statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StagingStats {
    pub staged_rows: usize,
    /// (session key, pending rows), sorted by session key
    pub sessions: Vec<(String, usize)>,
}
