//! ============================================================================
//! Vector Index - Similarity search over embedded memory entries
//! ============================================================================
//! [`VectorIndex`] is the port the engine searches through. Every search is
//! scoped by a [`PayloadFilter`] applied inside the index, so records of
//! other users never leave it.
//!
//! [`InMemoryIndex`] is an exact cosine index, bounded by a capacity past
//! which the oldest inserted records are evicted.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::debug;

use crate::types::{ResultPayload, VectorId};

/// Metadata stored next to each vector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPayload {
    pub user_id: String,
    /// Query text that was embedded
    pub text: String,
    /// Durable id of the entry this vector belongs to
    pub entry_id: Option<i64>,
    pub session_id: Option<String>,
    pub created_at: i64,
    pub result: ResultPayload,
    /// Free-form string attributes usable in filters
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

/// Search scope: the owning user plus optional exact-match attributes
#[derive(Debug, Clone, PartialEq)]
pub struct PayloadFilter {
    pub user_id: String,
    pub attributes: BTreeMap<String, String>,
}

impl PayloadFilter {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn matches(&self, payload: &VectorPayload) -> bool {
        payload.user_id == self.user_id
            && self
                .attributes
                .iter()
                .all(|(k, v)| payload.attributes.get(k) == Some(v))
    }
}

/// One coarse search result
#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub vector_id: VectorId,
    /// Cosine similarity to the query
    pub score: f32,
    pub payload: VectorPayload,
}

#[async_trait]
pub trait VectorIndex: Send + Sync {
    fn dimension(&self) -> usize;

    /// Insert a vector and return its id. Upserting a payload whose
    /// `entry_id` is already indexed returns the existing id.
    async fn upsert(&self, vector: Vec<f32>, payload: VectorPayload) -> Result<VectorId>;

    /// Up to `top_k` records matching `filter`, best first
    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>>;

    async fn delete(&self, ids: &[VectorId]) -> Result<()>;

    /// Remove every record matching `filter`, returning how many went
    async fn delete_where(&self, filter: &PayloadFilter) -> Result<u64>;

    async fn count(&self) -> Result<u64>;
}

/// Cosine similarity, 0.0 when either vector has zero length or norm
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

// ============================================================================
// In-memory index
// ============================================================================

struct StoredVector {
    vector: Vec<f32>,
    payload: VectorPayload,
    seq: u64,
}

#[derive(Default)]
struct IndexState {
    records: BTreeMap<VectorId, StoredVector>,
    /// insertion seq -> id, oldest first
    order: BTreeMap<u64, VectorId>,
    by_entry: HashMap<i64, VectorId>,
    next_id: VectorId,
    next_seq: u64,
}

impl IndexState {
    fn remove(&mut self, id: VectorId) -> Option<StoredVector> {
        let stored = self.records.remove(&id)?;
        self.order.remove(&stored.seq);
        if let Some(entry_id) = stored.payload.entry_id {
            if self.by_entry.get(&entry_id) == Some(&id) {
                self.by_entry.remove(&entry_id);
            }
        }
        Some(stored)
    }
}

/// Exact cosine index held in process memory
pub struct InMemoryIndex {
    dimension: usize,
    capacity: usize,
    state: RwLock<IndexState>,
}

impl InMemoryIndex {
    pub fn new(dimension: usize, capacity: usize) -> Self {
        Self {
            dimension,
            capacity: capacity.max(1),
            state: RwLock::new(IndexState {
                next_id: 1,
                ..Default::default()
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(anyhow!(
                "Vector dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, vector: Vec<f32>, payload: VectorPayload) -> Result<VectorId> {
        self.check_dimension(&vector)?;
        let mut state = self.state.write().await;

        if let Some(entry_id) = payload.entry_id {
            if let Some(existing) = state.by_entry.get(&entry_id) {
                return Ok(*existing);
            }
        }

        while state.records.len() >= self.capacity {
            let Some((_, oldest)) = state.order.pop_first() else {
                break;
            };
            if let Some(evicted) = state.remove(oldest) {
                debug!(
                    "Evicted vector {} (entry {:?}) at capacity {}",
                    oldest, evicted.payload.entry_id, self.capacity
                );
            }
        }

        let id = state.next_id;
        state.next_id += 1;
        let seq = state.next_seq;
        state.next_seq += 1;

        if let Some(entry_id) = payload.entry_id {
            state.by_entry.insert(entry_id, id);
        }
        state.order.insert(seq, id);
        state.records.insert(id, StoredVector { vector, payload, seq });
        Ok(id)
    }

    async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>> {
        self.check_dimension(query)?;
        if top_k == 0 {
            return Ok(vec![]);
        }

        let state = self.state.read().await;
        let mut hits: Vec<SearchHit> = state
            .records
            .iter()
            .filter(|(_, stored)| filter.matches(&stored.payload))
            .map(|(id, stored)| SearchHit {
                vector_id: *id,
                score: cosine_similarity(query, &stored.vector),
                payload: stored.payload.clone(),
            })
            .filter(|hit| !hit.score.is_nan())
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.vector_id.cmp(&b.vector_id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    async fn delete(&self, ids: &[VectorId]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            state.remove(*id);
        }
        Ok(())
    }

    async fn delete_where(&self, filter: &PayloadFilter) -> Result<u64> {
        let mut state = self.state.write().await;
        let doomed: Vec<VectorId> = state
            .records
            .iter()
            .filter(|(_, stored)| filter.matches(&stored.payload))
            .map(|(id, _)| *id)
            .collect();
        for id in &doomed {
            state.remove(*id);
        }
        Ok(doomed.len() as u64)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.state.read().await.records.len() as u64)
    }
}
