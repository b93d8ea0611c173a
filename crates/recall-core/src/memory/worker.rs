//! ============================================================================
//! Index Workers - Background embedding and indexing of flushed entries
//! ============================================================================
//! Jobs go through a bounded queue shared by a fixed pool of tokio tasks.
//! Each job: embed the query text -> upsert into the vector index ->
//! attach the vector id to the durable row. Failures are logged and the
//! entry stays unindexed until the reindex sweep picks it up again.
//! ============================================================================

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::embeddings::EmbeddingPort;
use super::index::{VectorIndex, VectorPayload};
use crate::durable::{DurableStore, MemoryRecord};
use crate::retry::{retry_async, RetryConfig};
use crate::types::{session_key, EngineError, EngineResult, ResultPayload};

/// Payload attribute carrying the entry's session key. Entries without a
/// session are tagged with [`crate::types::DEFAULT_SESSION`].
pub const SESSION_ATTRIBUTE: &str = "session";

/// One durable entry waiting to be indexed
#[derive(Debug, Clone)]
pub struct IndexJob {
    pub entry_id: i64,
    pub payload: VectorPayload,
}

impl IndexJob {
    /// Build a job for a durable record; `None` if it has no id yet
    pub fn from_record(record: &MemoryRecord) -> Option<Self> {
        let entry_id = record.entry_id?;
        let mut attributes = BTreeMap::new();
        attributes.insert(
            SESSION_ATTRIBUTE.to_string(),
            session_key(record.session_id.as_deref()).to_string(),
        );
        Some(Self {
            entry_id,
            payload: VectorPayload {
                user_id: record.user_id.clone(),
                text: record.query_text.clone(),
                entry_id: Some(entry_id),
                session_id: record.session_id.clone(),
                created_at: record.created_at,
                result: ResultPayload::from_bytes(&record.result),
                attributes,
            },
        })
    }
}

/// Dependencies shared by every worker
#[derive(Clone)]
pub struct IndexContext {
    pub embedder: Arc<dyn EmbeddingPort>,
    pub index: Arc<dyn VectorIndex>,
    pub durable: Arc<dyn DurableStore>,
    pub retry: RetryConfig,
}

/// Bounded job queue drained by a pool of index workers
pub struct IndexQueue {
    sender: Mutex<Option<mpsc::Sender<IndexJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    /// Entry ids submitted and not yet processed
    queued: Arc<Mutex<HashSet<i64>>>,
    in_flight: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl IndexQueue {
    /// Spawn `workers` tasks on the current runtime
    pub fn start(ctx: IndexContext, workers: usize, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel::<IndexJob>(capacity.max(1));
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let queued = Arc::new(Mutex::new(HashSet::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let idle = Arc::new(Notify::new());

        let handles = (0..workers.max(1))
            .map(|n| {
                let ctx = ctx.clone();
                let rx = rx.clone();
                let queued = queued.clone();
                let in_flight = in_flight.clone();
                let idle = idle.clone();
                tokio::spawn(async move {
                    loop {
                        let job = { rx.lock().await.recv().await };
                        let Some(job) = job else {
                            break;
                        };
                        let entry_id = job.entry_id;
                        process_job(&ctx, job).await;
                        queued.lock().remove(&entry_id);
                        if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                            idle.notify_waiters();
                        }
                    }
                    debug!("Index worker {} stopped", n);
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(tx)),
            workers: Mutex::new(handles),
            queued,
            in_flight,
            idle,
        }
    }

    /// Enqueue a job without waiting.
    ///
    /// Returns `Ok(false)` if the entry is already queued,
    /// [`EngineError::QueueFull`] when the queue is at capacity.
    pub fn submit(&self, job: IndexJob) -> EngineResult<bool> {
        let sender = self.sender.lock().clone().ok_or(EngineError::ShutDown)?;

        if !self.queued.lock().insert(job.entry_id) {
            return Ok(false);
        }
        self.in_flight.fetch_add(1, Ordering::SeqCst);

        let entry_id = job.entry_id;
        match sender.try_send(job) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.queued.lock().remove(&entry_id);
                if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.idle.notify_waiters();
                }
                match e {
                    mpsc::error::TrySendError::Full(_) => Err(EngineError::QueueFull),
                    mpsc::error::TrySendError::Closed(_) => Err(EngineError::ShutDown),
                }
            }
        }
    }

    /// Jobs submitted and not yet finished
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until every submitted job has been processed
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.in_flight.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Stop accepting jobs, let workers drain the queue, then join them.
    /// Workers still running after `grace` are aborted.
    pub async fn shutdown(&self, grace: Duration) {
        drop(self.sender.lock().take());
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        if handles.is_empty() {
            return;
        }

        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let joined = tokio::time::timeout(grace, async {
            for handle in handles {
                let _ = handle.await;
            }
        })
        .await;

        if joined.is_err() {
            warn!(
                "Index workers did not drain within {:?}, aborting {} job(s)",
                grace,
                self.pending()
            );
            for abort in aborts {
                abort.abort();
            }
        } else {
            info!("Index workers stopped");
        }
    }
}

async fn process_job(ctx: &IndexContext, job: IndexJob) {
    let text = job.payload.text.as_str();
    let vector = match retry_async(&ctx.retry, "embed", || ctx.embedder.embed(text)).await {
        Ok(v) => v,
        Err(e) => {
            warn!("Embedding entry {} failed, left unindexed: {}", job.entry_id, e);
            return;
        }
    };

    let vector_id = match retry_async(&ctx.retry, "index upsert", || {
        ctx.index.upsert(vector.clone(), job.payload.clone())
    })
    .await
    {
        Ok(id) => id,
        Err(e) => {
            warn!("Indexing entry {} failed, left unindexed: {}", job.entry_id, e);
            return;
        }
    };

    match ctx.durable.attach_vector(job.entry_id, vector_id).await {
        Ok(true) => debug!("Entry {} indexed as vector {}", job.entry_id, vector_id),
        Ok(false) => {
            // Entry deleted while we were indexing it
            debug!("Entry {} is gone, removing vector {}", job.entry_id, vector_id);
            if let Err(e) = ctx.index.delete(&[vector_id]).await {
                warn!("Failed to remove orphan vector {}: {}", vector_id, e);
            }
        }
        Err(e) => warn!(
            "Failed to attach vector {} to entry {}: {}",
            vector_id, job.entry_id, e
        ),
    }
}
