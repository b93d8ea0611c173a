//! Test doubles shared by the unit tests.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, Semaphore};

use crate::durable::{DurableStore, MemoryRecord, SqliteStore};
use crate::memory::{
    EmbeddingPort, HashEmbedder, PayloadFilter, SearchHit, VectorIndex, VectorPayload,
};
use crate::types::{HistoryEntry, ResultPayload, UserProfile, VectorId};

/// In-memory SQLite store whose memory upserts can be made to fail.
/// A batch needing more rows than the remaining budget fails as a whole.
pub struct FlakyStore {
    inner: SqliteStore,
    /// Successful row upserts left before failing, negative = never fail
    budget: AtomicI64,
    upserts: AtomicUsize,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self {
            inner: SqliteStore::open_in_memory().unwrap(),
            budget: AtomicI64::new(-1),
            upserts: AtomicUsize::new(0),
        }
    }

    /// Fail every upsert from now on
    pub fn go_down(&self) {
        self.budget.store(0, Ordering::SeqCst);
    }

    /// Allow `n` more upserts, then fail
    pub fn fail_after(&self, n: i64) {
        self.budget.store(n, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.budget.store(-1, Ordering::SeqCst);
    }

    /// Upserts that reached the underlying store
    pub fn upsert_calls(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn upsert_memory(&self, record: &MemoryRecord) -> Result<i64> {
        let budget = self.budget.load(Ordering::SeqCst);
        if budget == 0 {
            return Err(anyhow!("connection refused"));
        }
        if budget > 0 {
            self.budget.fetch_sub(1, Ordering::SeqCst);
        }
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.inner.upsert_memory(record).await
    }

    async fn upsert_batch(&self, records: &[MemoryRecord]) -> Result<Vec<i64>> {
        let needed = records.len() as i64;
        let budget = self.budget.load(Ordering::SeqCst);
        if budget >= 0 && budget < needed {
            self.budget.store(0, Ordering::SeqCst);
            return Err(anyhow!("connection refused"));
        }
        if budget > 0 {
            self.budget.fetch_sub(needed, Ordering::SeqCst);
        }
        self.upserts.fetch_add(records.len(), Ordering::SeqCst);
        self.inner.upsert_batch(records).await
    }

    async fn attach_vector(&self, entry_id: i64, vector_id: VectorId) -> Result<bool> {
        self.inner.attach_vector(entry_id, vector_id).await
    }

    async fn detach_all_vectors(&self) -> Result<u64> {
        self.inner.detach_all_vectors().await
    }

    async fn get_memory(&self, entry_id: i64) -> Result<Option<MemoryRecord>> {
        self.inner.get_memory(entry_id).await
    }

    async fn list_memories(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.inner.list_memories(user_id, limit).await
    }

    async fn list_unindexed(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.inner.list_unindexed(limit).await
    }

    async fn count_memories(&self) -> Result<u64> {
        self.inner.count_memories().await
    }

    async fn count_unindexed(&self) -> Result<u64> {
        self.inner.count_unindexed().await
    }

    async fn delete_memory(&self, user_id: &str, entry_id: i64) -> Result<Option<MemoryRecord>> {
        self.inner.delete_memory(user_id, entry_id).await
    }

    async fn count_before(&self, cutoff: i64) -> Result<u64> {
        self.inner.count_before(cutoff).await
    }

    async fn prune_before(&self, cutoff: i64) -> Result<Vec<MemoryRecord>> {
        self.inner.prune_before(cutoff).await
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        self.inner.get_profile(user_id).await
    }

    async fn ensure_profile(&self, user_id: &str, now: i64) -> Result<UserProfile> {
        self.inner.ensure_profile(user_id, now).await
    }

    async fn update_profile_field(
        &self,
        user_id: &str,
        field: &str,
        value: &serde_json::Value,
        timestamp: i64,
    ) -> Result<bool> {
        self.inner
            .update_profile_field(user_id, field, value, timestamp)
            .await
    }

    async fn append_history(&self, user_id: &str, entry: &HistoryEntry) -> Result<()> {
        self.inner.append_history(user_id, entry).await
    }

    async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        self.inner.history(user_id, limit).await
    }

    async fn total_interactions(&self, user_id: &str) -> Result<u64> {
        self.inner.total_interactions(user_id).await
    }

    async fn recent_interactions(&self, user_id: &str, window_days: u32) -> Result<u64> {
        self.inner.recent_interactions(user_id, window_days).await
    }

    async fn delete_user(&self, user_id: &str) -> Result<u64> {
        self.inner.delete_user(user_id).await
    }
}

/// Hash embedder that can be switched off
pub struct SwitchEmbedder {
    inner: HashEmbedder,
    down: AtomicBool,
}

impl SwitchEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: HashEmbedder::new(dimension),
            down: AtomicBool::new(false),
        }
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl EmbeddingPort for SwitchEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if self.down.load(Ordering::SeqCst) {
            return Err(anyhow!("embedding service unavailable"));
        }
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// Hash embedder that blocks every call until released
pub struct GatedEmbedder {
    inner: HashEmbedder,
    entered: Notify,
    gate: Semaphore,
}

impl GatedEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            inner: HashEmbedder::new(dimension),
            entered: Notify::new(),
            gate: Semaphore::new(0),
        }
    }

    /// Resolves once some call is waiting at the gate
    pub async fn entered(&self) {
        self.entered.notified().await;
    }

    /// Let every current and future call through
    pub fn release(&self) {
        self.gate.add_permits(1_000);
    }
}

#[async_trait]
impl EmbeddingPort for GatedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.entered.notify_one();
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|e| anyhow!("gate closed: {}", e))?;
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// Hash embedder that sleeps before answering
pub struct SlowEmbedder {
    inner: HashEmbedder,
    delay: Duration,
}

impl SlowEmbedder {
    pub fn new(dimension: usize, delay: Duration) -> Self {
        Self {
            inner: HashEmbedder::new(dimension),
            delay,
        }
    }
}

#[async_trait]
impl EmbeddingPort for SlowEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed(text).await
    }

    fn dimension(&self) -> usize {
        self.inner.dimension()
    }
}

/// Embeds texts starting with "cold" opposite to everything else
pub struct PolarEmbedder {
    pub dimension: usize,
}

#[async_trait]
impl EmbeddingPort for PolarEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = vec![0.0; self.dimension];
        if text.starts_with("cold") {
            vector[0] = -1.0;
        } else {
            vector[0] = 1.0;
            vector[1] = 0.1;
        }
        Ok(vector)
    }

    fn dimension(&self) -> usize {
        self.dimension
    }
}

/// Index that ignores the filter and answers with another user's record
pub struct RogueIndex {
    pub dimension: usize,
    pub owner: String,
}

#[async_trait]
impl VectorIndex for RogueIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, _vector: Vec<f32>, _payload: VectorPayload) -> Result<VectorId> {
        Ok(1)
    }

    async fn search(
        &self,
        _query: &[f32],
        _top_k: usize,
        _filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>> {
        Ok(vec![SearchHit {
            vector_id: 1,
            score: 0.99,
            payload: VectorPayload {
                user_id: self.owner.clone(),
                text: "someone else's secret".to_string(),
                entry_id: Some(1),
                session_id: None,
                created_at: 0,
                result: ResultPayload::Empty,
                attributes: Default::default(),
            },
        }])
    }

    async fn delete(&self, _ids: &[VectorId]) -> Result<()> {
        Ok(())
    }

    async fn delete_where(&self, _filter: &PayloadFilter) -> Result<u64> {
        Ok(0)
    }

    async fn count(&self) -> Result<u64> {
        Ok(1)
    }
}

/// Index whose searches always fail
pub struct DownIndex {
    pub dimension: usize,
}

#[async_trait]
impl VectorIndex for DownIndex {
    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn upsert(&self, _vector: Vec<f32>, _payload: VectorPayload) -> Result<VectorId> {
        Err(anyhow!("connection refused"))
    }

    async fn search(
        &self,
        _query: &[f32],
        _top_k: usize,
        _filter: &PayloadFilter,
    ) -> Result<Vec<SearchHit>> {
        Err(anyhow!("connection refused"))
    }

    async fn delete(&self, _ids: &[VectorId]) -> Result<()> {
        Err(anyhow!("connection refused"))
    }

    async fn delete_where(&self, _filter: &PayloadFilter) -> Result<u64> {
        Err(anyhow!("connection refused"))
    }

    async fn count(&self) -> Result<u64> {
        Err(anyhow!("connection refused"))
    }
}
