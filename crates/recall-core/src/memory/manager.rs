//! ============================================================================
//! Memory Engine - Orchestrates the staging, durable and index tiers
//! ============================================================================
//! Write path: store -> staging buffer -> (inline or periodic flush) ->
//! durable store -> index queue -> vector index.
//! Read path: embed query -> user-scoped vector search -> rerank.
//!
//! Writes never fail because a downstream tier is unavailable; they stay
//! staged (or unindexed) and are retried by the background loop. Reads
//! surface every downstream failure as a typed error.
//! ============================================================================

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::decay::DecayModel;
use super::embeddings::EmbeddingPort;
use super::index::{InMemoryIndex, PayloadFilter, SearchHit, VectorIndex};
use super::rerank::{LexicalReranker, Reranker};
use super::worker::{IndexContext, IndexJob, IndexQueue, SESSION_ATTRIBUTE};
use crate::config::EngineConfig;
use crate::durable::{DurableStore, SqliteStore};
use crate::retry::{calculate_delay, RetryConfig};
use crate::staging::{FlushReport, StagingBuffer};
use crate::types::{
    now_ts, EngineError, EngineResult, EngineStats, HistoryEntry, MemoryEntry, RecallHit,
    UserProfile,
};

/// Time index workers get to drain their queue on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const SECONDS_PER_DAY: i64 = 86_400;

fn downstream(context: &'static str) -> impl Fn(anyhow::Error) -> EngineError {
    move |e| EngineError::TransientDownstream(format!("{}: {}", context, e))
}

/// External collaborators of the engine
#[derive(Clone)]
pub struct EnginePorts {
    pub embedder: Arc<dyn EmbeddingPort>,
    pub durable: Arc<dyn DurableStore>,
    pub index: Arc<dyn VectorIndex>,
    pub reranker: Arc<dyn Reranker>,
}

impl EnginePorts {
    /// SQLite durable tier at the configured path, in-process vector index
    /// and lexical reranker
    pub fn local(config: &EngineConfig, embedder: Arc<dyn EmbeddingPort>) -> EngineResult<Self> {
        let path = config.resolved_durable_path()?;
        let durable = SqliteStore::open(&path).map_err(downstream("Failed to open durable store"))?;
        Ok(Self {
            embedder,
            durable: Arc::new(durable),
            index: Arc::new(InMemoryIndex::new(config.embedding_dim, config.index_capacity)),
            reranker: Arc::new(LexicalReranker),
        })
    }
}

/// What a user reset removed from each tier
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResetReport {
    pub staged_discarded: usize,
    pub durable_deleted: u64,
    pub vectors_deleted: u64,
}

/// Tiered conversational memory
pub struct MemoryEngine {
    config: EngineConfig,
    buffer: Arc<StagingBuffer>,
    durable: Arc<dyn DurableStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Arc<dyn EmbeddingPort>,
    reranker: Arc<dyn Reranker>,
    queue: Arc<IndexQueue>,
    decay: DecayModel,
    /// Shared by writes, exclusive for reset
    write_gate: RwLock<()>,
    shutdown_tx: watch::Sender<bool>,
    flush_task: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl MemoryEngine {
    /// Open the staging buffer, start the index workers and the background
    /// flush loop. Must be called inside a tokio runtime.
    pub async fn new(config: EngineConfig, ports: EnginePorts) -> EngineResult<Self> {
        config.validate()?;

        let dim = config.embedding_dim;
        if ports.embedder.dimension() != dim {
            return Err(EngineError::Configuration(format!(
                "Embedder dimension {} does not match configured dimension {}",
                ports.embedder.dimension(),
                dim
            )));
        }
        if ports.index.dimension() != dim {
            return Err(EngineError::Configuration(format!(
                "Index dimension {} does not match configured dimension {}",
                ports.index.dimension(),
                dim
            )));
        }

        let staging_path = config.resolved_staging_path()?;
        let buffer = Arc::new(StagingBuffer::open(
            &staging_path,
            ports.durable.clone(),
            config.flush_size,
        )?);

        let queue = Arc::new(IndexQueue::start(
            IndexContext {
                embedder: ports.embedder.clone(),
                index: ports.index.clone(),
                durable: ports.durable.clone(),
                retry: config.retry.clone(),
            },
            config.index_workers,
            config.index_queue_capacity,
        ));

        rebuild_if_empty(ports.durable.as_ref(), ports.index.as_ref()).await;
        if let Err(e) = sweep_unindexed(ports.durable.as_ref(), &queue, config.reindex_batch).await {
            warn!("Startup reindex sweep failed: {}", e);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let flush_loop = FlushLoop {
            buffer: buffer.clone(),
            queue: queue.clone(),
            durable: ports.durable.clone(),
            interval: config.flush_interval,
            retry: config.retry.clone(),
            reindex_batch: config.reindex_batch,
        };
        let flush_task = tokio::spawn(flush_loop.run(shutdown_rx));

        info!(
            "Memory engine ready (dim {}, flush size {}, {} index workers)",
            dim, config.flush_size, config.index_workers
        );

        Ok(Self {
            config,
            buffer,
            durable: ports.durable,
            index: ports.index,
            embedder: ports.embedder,
            reranker: ports.reranker,
            queue,
            decay: DecayModel::default(),
            write_gate: RwLock::new(()),
            shutdown_tx,
            flush_task: Mutex::new(Some(flush_task)),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Stage an entry. Returns once it is durable in the staging file; a
    /// flush triggered by this write never turns a downstream outage into
    /// an error.
    pub async fn store(&self, entry: MemoryEntry) -> EngineResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(EngineError::ShutDown);
        }
        let _gate = self.write_gate.read().await;

        if let Some(report) = self.buffer.add_entry(&entry).await? {
            enqueue_flushed(&self.queue, &report);
            if !report.is_clean() {
                warn!(
                    "Inline flush left {} session(s) staged",
                    report.failed_sessions.len()
                );
            }
        }
        Ok(())
    }

    /// Flush one session (or all) to the durable tier and queue the flushed
    /// entries for indexing
    pub async fn flush(&self, session_id: Option<&str>) -> EngineResult<FlushReport> {
        let report = self.buffer.flush_to_durable(session_id).await?;
        let queued = enqueue_flushed(&self.queue, &report);
        debug!(
            "Flushed {} entries, {} queued for indexing",
            report.flushed.len(),
            queued
        );
        Ok(report)
    }

    /// Queue durable entries that have no vector yet
    pub async fn reindex_missing(&self) -> EngineResult<usize> {
        sweep_unindexed(self.durable.as_ref(), &self.queue, self.config.reindex_batch).await
    }

    /// Wait until the index workers have drained every queued job
    pub async fn wait_for_indexing(&self) {
        self.queue.wait_idle().await;
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Top `top_k` memories of `user_id` relevant to `query`, best first.
    /// Applies the configured recall timeout, if any.
    pub async fn recall(
        &self,
        user_id: &str,
        query: &str,
        top_k: usize,
    ) -> EngineResult<Vec<RecallHit>> {
        self.recall_with_filter(PayloadFilter::user(user_id), query, top_k)
            .await
    }

    /// Like [`MemoryEngine::recall`], restricted to one session
    pub async fn recall_in_session(
        &self,
        user_id: &str,
        session_id: &str,
        query: &str,
        top_k: usize,
    ) -> EngineResult<Vec<RecallHit>> {
        let filter = PayloadFilter::user(user_id).with(SESSION_ATTRIBUTE, session_id);
        self.recall_with_filter(filter, query, top_k).await
    }

    /// Recall scoped by an arbitrary payload filter
    pub async fn recall_with_filter(
        &self,
        filter: PayloadFilter,
        query: &str,
        top_k: usize,
    ) -> EngineResult<Vec<RecallHit>> {
        match self.config.recall_timeout {
            Some(deadline) => self.recall_with_deadline(filter, query, top_k, deadline).await,
            None => self.ranked_recall(&filter, query, top_k).await,
        }
    }

    /// Recall that fails with [`EngineError::Timeout`] if it takes longer
    /// than `deadline`. Partial results are discarded.
    pub async fn recall_with_deadline(
        &self,
        filter: PayloadFilter,
        query: &str,
        top_k: usize,
        deadline: Duration,
    ) -> EngineResult<Vec<RecallHit>> {
        tokio::time::timeout(deadline, self.ranked_recall(&filter, query, top_k))
            .await
            .map_err(|_| {
                warn!("Recall for user {} timed out after {:?}", filter.user_id, deadline);
                EngineError::Timeout(deadline)
            })?
    }

    async fn ranked_recall(
        &self,
        filter: &PayloadFilter,
        query: &str,
        top_k: usize,
    ) -> EngineResult<Vec<RecallHit>> {
        if top_k == 0 {
            return Ok(vec![]);
        }
        let user_id = filter.user_id.as_str();
        debug!("Recall for user {} (top {})", user_id, top_k);

        let query_vector = self
            .embedder
            .embed(query)
            .await
            .map_err(|e| EngineError::Query(format!("Failed to embed query: {}", e)))?;
        if query_vector.len() != self.config.embedding_dim {
            return Err(EngineError::Query(format!(
                "Query embedding has dimension {}, expected {}",
                query_vector.len(),
                self.config.embedding_dim
            )));
        }

        let hits = self
            .index
            .search(&query_vector, top_k, filter)
            .await
            .map_err(downstream("Vector search failed"))?;

        if let Some(foreign) = hits.iter().find(|h| h.payload.user_id != user_id) {
            error!(
                "Vector search for user {} returned a record of user {}",
                user_id, foreign.payload.user_id
            );
            return Err(EngineError::IsolationViolation {
                expected: user_id.to_string(),
                found: foreign.payload.user_id.clone(),
            });
        }

        let hits: Vec<SearchHit> = match self.config.min_similarity {
            Some(threshold) => hits.into_iter().filter(|h| h.score >= threshold).collect(),
            None => hits,
        };
        if hits.is_empty() {
            return Ok(vec![]);
        }

        let texts: Vec<String> = hits.iter().map(|h| h.payload.text.clone()).collect();
        let scores = self.reranker.score(query, &texts);
        if scores.len() != hits.len() {
            return Err(EngineError::Query(format!(
                "Reranker returned {} scores for {} candidates",
                scores.len(),
                hits.len()
            )));
        }

        let now = now_ts();
        let mut ranked: Vec<RecallHit> = hits
            .into_iter()
            .zip(scores)
            .map(|(hit, score)| RecallHit {
                entry_id: hit.payload.entry_id,
                vector_id: hit.vector_id,
                score,
                similarity: hit.score,
                freshness: self.decay.decay_between(hit.payload.created_at, now),
                payload: hit.payload,
            })
            .collect();

        ranked.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| b.similarity.total_cmp(&a.similarity))
                .then_with(|| {
                    let a_id = a.entry_id.unwrap_or(i64::MAX);
                    let b_id = b.entry_id.unwrap_or(i64::MAX);
                    a_id.cmp(&b_id)
                })
                .then_with(|| a.vector_id.cmp(&b.vector_id))
        });
        ranked.truncate(top_k);

        debug!("Recall for user {} returned {} hits", user_id, ranked.len());
        Ok(ranked)
    }

    // ========================================================================
    // Deletion
    // ========================================================================

    /// Remove every trace of a user from all three tiers.
    /// Blocks new writes until done, so nothing staged concurrently survives.
    pub async fn reset(&self, user_id: &str) -> EngineResult<ResetReport> {
        let _gate = self.write_gate.write().await;
        info!("Resetting memory for user {}", user_id);

        let staged_discarded = self.buffer.discard_user(user_id).await?;
        let durable_deleted = self
            .durable
            .delete_user(user_id)
            .await
            .map_err(downstream("Failed to delete durable rows"))?;
        let vectors_deleted = self
            .index
            .delete_where(&PayloadFilter::user(user_id))
            .await
            .map_err(downstream("Failed to delete vectors"))?;

        let report = ResetReport {
            staged_discarded,
            durable_deleted,
            vectors_deleted,
        };
        info!("Reset user {}: {:?}", user_id, report);
        Ok(report)
    }

    /// Delete one durable entry of `user_id` and its vector.
    /// Returns false if the user owns no such entry.
    pub async fn forget(&self, user_id: &str, entry_id: i64) -> EngineResult<bool> {
        let removed = self
            .durable
            .delete_memory(user_id, entry_id)
            .await
            .map_err(downstream("Failed to delete entry"))?;

        let Some(record) = removed else {
            return Ok(false);
        };
        if let Some(vector_id) = record.vector_id {
            self.index
                .delete(&[vector_id])
                .await
                .map_err(downstream("Failed to delete vector"))?;
        }
        debug!("Forgot entry {} of user {}", entry_id, user_id);
        Ok(true)
    }

    /// Delete durable entries older than `older_than_days` and their vectors
    pub async fn prune(&self, older_than_days: u32) -> EngineResult<usize> {
        let cutoff = now_ts() - i64::from(older_than_days) * SECONDS_PER_DAY;
        let removed = self
            .durable
            .prune_before(cutoff)
            .await
            .map_err(downstream("Failed to prune entries"))?;

        let vector_ids: Vec<_> = removed.iter().filter_map(|r| r.vector_id).collect();
        if !vector_ids.is_empty() {
            self.index
                .delete(&vector_ids)
                .await
                .map_err(downstream("Failed to delete pruned vectors"))?;
        }
        if !removed.is_empty() {
            info!(
                "Pruned {} entries older than {} days",
                removed.len(),
                older_than_days
            );
        }
        Ok(removed.len())
    }

    // ========================================================================
    // Profiles
    // ========================================================================

    /// Set a profile field now. Returns whether the write was applied.
    pub async fn update_profile(
        &self,
        user_id: &str,
        field: &str,
        value: serde_json::Value,
    ) -> EngineResult<bool> {
        self.update_profile_at(user_id, field, value, now_ts()).await
    }

    /// Set a profile field as of `timestamp`. A write older than the
    /// field's current value is ignored.
    pub async fn update_profile_at(
        &self,
        user_id: &str,
        field: &str,
        value: serde_json::Value,
        timestamp: i64,
    ) -> EngineResult<bool> {
        let applied = self
            .durable
            .update_profile_field(user_id, field, &value, timestamp)
            .await
            .map_err(downstream("Failed to update profile"))?;

        if applied {
            let entry = HistoryEntry {
                field: field.to_string(),
                value,
                timestamp,
            };
            self.durable
                .append_history(user_id, &entry)
                .await
                .map_err(downstream("Failed to record profile history"))?;
        } else {
            debug!("Stale update of {}.{} ignored", user_id, field);
        }
        Ok(applied)
    }

    /// Current profile, created empty on first access
    pub async fn profile(&self, user_id: &str) -> EngineResult<UserProfile> {
        self.durable
            .ensure_profile(user_id, now_ts())
            .await
            .map_err(downstream("Failed to load profile"))
    }

    /// Most recent profile edits, newest first
    pub async fn profile_history(
        &self,
        user_id: &str,
        limit: usize,
    ) -> EngineResult<Vec<HistoryEntry>> {
        self.durable
            .history(user_id, limit)
            .await
            .map_err(downstream("Failed to load profile history"))
    }

    /// Freshness of the user's profile, 1.0 right after an update
    pub async fn decay(&self, user_id: &str) -> EngineResult<f64> {
        let profile = self.profile(user_id).await?;
        Ok(self.decay.decay(&profile, now_ts()))
    }

    /// Share of the user's interactions inside the retention window
    pub async fn retention(&self, user_id: &str) -> EngineResult<f64> {
        let recent = self
            .durable
            .recent_interactions(user_id, self.config.retention_window_days)
            .await
            .map_err(downstream("Failed to count recent interactions"))?;
        let total = self
            .durable
            .total_interactions(user_id)
            .await
            .map_err(downstream("Failed to count interactions"))?;
        Ok(self.decay.retention(recent, total))
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    pub async fn stats(&self) -> EngineResult<EngineStats> {
        let staging = self.buffer.stats().await?;
        let durable_entries = self
            .durable
            .count_memories()
            .await
            .map_err(downstream("Failed to count entries"))?;
        let unindexed_entries = self
            .durable
            .count_unindexed()
            .await
            .map_err(downstream("Failed to count unindexed entries"))?;
        let indexed_vectors = self
            .index
            .count()
            .await
            .map_err(downstream("Failed to count vectors"))?;

        Ok(EngineStats {
            staged_rows: staging.staged_rows,
            pending_sessions: staging.sessions.len(),
            durable_entries,
            unindexed_entries,
            indexed_vectors,
            queued_index_jobs: self.queue.pending(),
        })
    }

    /// Stop the flush loop, flush what is staged, and drain the index
    /// workers. Entries that could not be flushed stay in the staging file
    /// for the next start. Further stores fail with [`EngineError::ShutDown`].
    pub async fn shutdown(&self) -> EngineResult<FlushReport> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(FlushReport::default());
        }
        info!("Shutting down memory engine");

        let _ = self.shutdown_tx.send(true);
        let task = self.flush_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!("Flush loop ended abnormally: {}", e);
            }
        }

        // wait for stores already past the closed check
        let _gate = self.write_gate.write().await;
        let report = self.buffer.flush_to_durable(None).await?;
        enqueue_flushed(&self.queue, &report);
        if !report.is_clean() {
            warn!(
                "{} session(s) remain staged until the next start",
                report.failed_sessions.len()
            );
        }

        self.queue.shutdown(SHUTDOWN_GRACE).await;
        info!("Memory engine stopped");
        Ok(report)
    }
}

/// An index that starts out empty (in-process, or a wiped collection)
/// invalidates every stored vector id
async fn rebuild_if_empty(durable: &dyn DurableStore, index: &dyn VectorIndex) {
    match index.count().await {
        Ok(0) => match durable.detach_all_vectors().await {
            Ok(0) => {}
            Ok(n) => info!("Vector index is empty, {} entries marked for re-indexing", n),
            Err(e) => warn!("Failed to mark entries for re-indexing: {}", e),
        },
        Ok(_) => {}
        Err(e) => warn!("Could not inspect vector index at start: {}", e),
    }
}

/// Queue every flushed entry that has no vector yet
fn enqueue_flushed(queue: &IndexQueue, report: &FlushReport) -> usize {
    let mut queued = 0;
    for record in report.flushed.iter().filter(|r| r.vector_id.is_none()) {
        let Some(job) = IndexJob::from_record(record) else {
            continue;
        };
        match queue.submit(job) {
            Ok(true) => queued += 1,
            Ok(false) => {}
            Err(e) => debug!(
                "Entry {:?} left for the reindex sweep: {}",
                record.entry_id, e
            ),
        }
    }
    queued
}

async fn sweep_unindexed(
    durable: &dyn DurableStore,
    queue: &IndexQueue,
    batch: usize,
) -> EngineResult<usize> {
    let records = durable
        .list_unindexed(batch)
        .await
        .map_err(downstream("Failed to list unindexed entries"))?;

    let mut submitted = 0;
    for record in &records {
        let Some(job) = IndexJob::from_record(record) else {
            continue;
        };
        match queue.submit(job) {
            Ok(true) => submitted += 1,
            Ok(false) => {}
            Err(EngineError::QueueFull) => {
                debug!("Index queue full, sweep stopped after {} job(s)", submitted);
                break;
            }
            Err(e) => return Err(e),
        }
    }
    if submitted > 0 {
        info!("Queued {} unindexed entries for indexing", submitted);
    }
    Ok(submitted)
}

/// Periodic staging flush with backoff while the durable tier is failing
struct FlushLoop {
    buffer: Arc<StagingBuffer>,
    queue: Arc<IndexQueue>,
    durable: Arc<dyn DurableStore>,
    interval: Duration,
    retry: RetryConfig,
    reindex_batch: usize,
}

impl FlushLoop {
    async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        loop {
            let delay = if failures == 0 {
                self.interval
            } else {
                calculate_delay(failures - 1, &self.retry)
            };

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.changed() => break,
            }

            match self.buffer.flush_to_durable(None).await {
                Ok(report) => {
                    enqueue_flushed(&self.queue, &report);
                    if report.is_clean() {
                        failures = 0;
                        if let Err(e) =
                            sweep_unindexed(self.durable.as_ref(), &self.queue, self.reindex_batch)
                                .await
                        {
                            warn!("Reindex sweep failed: {}", e);
                        }
                    } else {
                        failures = failures.saturating_add(1);
                        warn!(
                            "Background flush left {} session(s) staged (failure {})",
                            report.failed_sessions.len(),
                            failures
                        );
                    }
                }
                Err(e) => {
                    failures = failures.saturating_add(1);
                    error!("Background flush failed: {}", e);
                }
            }
        }
        debug!("Flush loop stopped");
    }
}
