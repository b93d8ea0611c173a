// ============================================================================
// StagingBuffer: Embedded write buffer (redb)
// ============================================================================
// Accepts entries at caller speed, persists them to a local redb file before
// acknowledging, and drains them to the durable tier in per-session batches.
// A batch is only removed locally once every row in it has been upserted.
// Default path: ~/.recall/staging.redb (override via RECALL_STAGING_PATH)
// ============================================================================

pub mod types;

pub use types::{FlushReport, StagedRow, StagingStats};

use redb::{Database, ReadableTable, TableDefinition};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::durable::{DurableStore, MemoryRecord};
use crate::types::{session_key, EngineError, EngineResult, MemoryEntry};

// Table definitions
const STAGED: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("staged");
const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

const NEXT_SEQ_KEY: &str = "meta:next_seq";

fn storage(context: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Storage(format!("{}: {}", context, e))
}

/// State guarded by the buffer's single mutex
struct StagingState {
    db: Database,
    /// Sequence numbers of rows not yet flushed, per session key
    pending: HashMap<String, Vec<u64>>,
    next_seq: u64,
}

/// Crash-tolerant staging tier in front of a [`DurableStore`]
pub struct StagingBuffer {
    state: Mutex<StagingState>,
    durable: Arc<dyn DurableStore>,
    flush_size: usize,
    path: PathBuf,
}

impl StagingBuffer {
    /// Open (or create) the staging file and recover rows left by a
    /// previous process.
    pub fn open(path: &Path, durable: Arc<dyn DurableStore>, flush_size: usize) -> EngineResult<Self> {
        if flush_size == 0 {
            return Err(EngineError::Configuration("flush_size must be at least 1".into()));
        }

        info!("Opening staging buffer at: {}", path.display());

        let db = Database::create(path)
            .map_err(|e| EngineError::Configuration(format!("Failed to open staging file: {}", e)))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| storage("Failed to begin write", e))?;
        {
            write_txn
                .open_table(STAGED)
                .map_err(|e| storage("Failed to create staged table", e))?;
            write_txn
                .open_table(META)
                .map_err(|e| storage("Failed to create meta table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage("Failed to commit init", e))?;

        let rows = Self::read_all(&db)?;
        let stored_seq = Self::read_next_seq(&db)?;

        let mut pending: HashMap<String, Vec<u64>> = HashMap::new();
        let mut next_seq = stored_seq;
        for (session, seq, _) in &rows {
            pending.entry(session.clone()).or_default().push(*seq);
            next_seq = next_seq.max(seq + 1);
        }

        if !rows.is_empty() {
            info!(
                "Recovered {} staged rows across {} sessions",
                rows.len(),
                pending.len()
            );
        }

        Ok(Self {
            state: Mutex::new(StagingState {
                db,
                pending,
                next_seq,
            }),
            durable,
            flush_size,
            path: path.to_path_buf(),
        })
    }

    /// Get the staging file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn flush_size(&self) -> usize {
        self.flush_size
    }

    // ========================================================================
    // Write Path
    // ========================================================================

    /// Persist an entry locally and queue it for its session's next flush.
    ///
    /// Never fails because the durable tier is down. When the session's
    /// pending list reaches `flush_size` the session is flushed before
    /// returning and the report is handed back.
    pub async fn add_entry(&self, entry: &MemoryEntry) -> EngineResult<Option<FlushReport>> {
        let key = session_key(entry.session_id.as_deref()).to_string();
        let row =
            StagedRow::from_entry(entry).map_err(|e| storage("Failed to encode entry", e))?;
        let value = bincode::serialize(&row)
            .map_err(|e| storage("Failed to serialize staged row", e))?;

        let mut state = self.state.lock().await;
        let seq = state.next_seq;

        let write_txn = state
            .db
            .begin_write()
            .map_err(|e| storage("Failed to begin write", e))?;
        {
            let mut table = write_txn
                .open_table(STAGED)
                .map_err(|e| storage("Failed to open staged table", e))?;
            table
                .insert((key.as_str(), seq), value.as_slice())
                .map_err(|e| storage("Failed to insert staged row", e))?;

            let mut meta = write_txn
                .open_table(META)
                .map_err(|e| storage("Failed to open meta table", e))?;
            meta.insert(NEXT_SEQ_KEY, seq + 1)
                .map_err(|e| storage("Failed to bump sequence", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage("Failed to commit staged row", e))?;

        state.next_seq = seq + 1;
        let pending = state.pending.entry(key.clone()).or_default();
        pending.push(seq);
        let pending_len = pending.len();

        debug!(
            "Staged entry {} for user {} in session {} ({} pending)",
            seq, entry.user_id, key, pending_len
        );

        if pending_len >= self.flush_size {
            debug!("Session {} reached flush size {}", key, self.flush_size);
            let report = self.flush_session_locked(&mut state, &key).await?;
            return Ok(Some(report));
        }

        Ok(None)
    }

    // ========================================================================
    // Flush Path
    // ========================================================================

    /// Drain one session, or every session with staged rows when `session`
    /// is `None`. Durable-tier failures leave the affected batch in place and
    /// are reported in [`FlushReport::failed_sessions`]; only local storage
    /// failures are returned as errors.
    pub async fn flush_to_durable(&self, session: Option<&str>) -> EngineResult<FlushReport> {
        let mut state = self.state.lock().await;

        let sessions: Vec<String> = match session {
            Some(s) => vec![s.to_string()],
            None => Self::staged_sessions(&state.db)?,
        };

        let mut report = FlushReport::default();
        for s in sessions {
            let outcome = self.flush_session_locked(&mut state, &s).await?;
            report.merge(outcome);
        }
        Ok(report)
    }

    async fn flush_session_locked(
        &self,
        state: &mut StagingState,
        session: &str,
    ) -> EngineResult<FlushReport> {
        let rows = Self::read_session(&state.db, session)?;
        if rows.is_empty() {
            state.pending.remove(session);
            return Ok(FlushReport::default());
        }

        let mut flushed: Vec<MemoryRecord> =
            rows.iter().map(|(_, row)| row.to_record()).collect();
        match self.durable.upsert_batch(&flushed).await {
            Ok(ids) => {
                for (record, entry_id) in flushed.iter_mut().zip(ids) {
                    record.entry_id = Some(entry_id);
                }
            }
            Err(e) => {
                warn!(
                    "Flush of session {} failed ({} rows kept for retry): {}",
                    session,
                    rows.len(),
                    e
                );
                return Ok(FlushReport {
                    flushed: Vec::new(),
                    failed_sessions: vec![session.to_string()],
                });
            }
        }

        // Every row is durable; only now drop the batch locally
        let write_txn = state
            .db
            .begin_write()
            .map_err(|e| storage("Failed to begin write", e))?;
        {
            let mut table = write_txn
                .open_table(STAGED)
                .map_err(|e| storage("Failed to open staged table", e))?;
            for (seq, _) in &rows {
                table
                    .remove((session, *seq))
                    .map_err(|e| storage("Failed to remove staged row", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| storage("Failed to commit flush", e))?;

        state.pending.remove(session);
        info!("Flushed {} entries for session {}", flushed.len(), session);

        Ok(FlushReport {
            flushed,
            failed_sessions: Vec::new(),
        })
    }

    // ========================================================================
    // Reset Support
    // ========================================================================

    /// Delete every staged row owned by `user_id` without flushing it.
    /// Returns the number of rows discarded.
    pub async fn discard_user(&self, user_id: &str) -> EngineResult<usize> {
        let mut state = self.state.lock().await;

        let doomed: Vec<(String, u64)> = Self::read_all(&state.db)?
            .into_iter()
            .filter(|(_, _, row)| row.user_id == user_id)
            .map(|(session, seq, _)| (session, seq))
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }

        let write_txn = state
            .db
            .begin_write()
            .map_err(|e| storage("Failed to begin write", e))?;
        {
            let mut table = write_txn
                .open_table(STAGED)
                .map_err(|e| storage("Failed to open staged table", e))?;
            for (session, seq) in &doomed {
                table
                    .remove((session.as_str(), *seq))
                    .map_err(|e| storage("Failed to remove staged row", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| storage("Failed to commit discard", e))?;

        for (session, seq) in &doomed {
            if let Some(list) = state.pending.get_mut(session) {
                list.retain(|s| s != seq);
                if list.is_empty() {
                    state.pending.remove(session);
                }
            }
        }

        info!("Discarded {} staged rows for user {}", doomed.len(), user_id);
        Ok(doomed.len())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Number of pending rows for one session key
    pub async fn pending_len(&self, session: &str) -> usize {
        let state = self.state.lock().await;
        state.pending.get(session).map(Vec::len).unwrap_or(0)
    }

    /// All staged rows, grouped by session key in flush order
    pub async fn staged_rows(&self) -> EngineResult<Vec<(String, StagedRow)>> {
        let state = self.state.lock().await;
        Ok(Self::read_all(&state.db)?
            .into_iter()
            .map(|(session, _, row)| (session, row))
            .collect())
    }

    pub async fn stats(&self) -> EngineResult<StagingStats> {
        let state = self.state.lock().await;
        let rows = Self::read_all(&state.db)?;

        let mut per_session: BTreeMap<String, usize> = BTreeMap::new();
        for (session, _, _) in &rows {
            *per_session.entry(session.clone()).or_insert(0) += 1;
        }

        Ok(StagingStats {
            staged_rows: rows.len(),
            sessions: per_session.into_iter().collect(),
        })
    }

    // ========================================================================
    // Storage Helpers
    // ========================================================================

    fn read_next_seq(db: &Database) -> EngineResult<u64> {
        let read_txn = db
            .begin_read()
            .map_err(|e| storage("Failed to begin read", e))?;
        let table = read_txn
            .open_table(META)
            .map_err(|e| storage("Failed to open meta table", e))?;
        let value = table
            .get(NEXT_SEQ_KEY)
            .map_err(|e| storage("Failed to read sequence", e))?;
        Ok(value.map(|v| v.value()).unwrap_or(0))
    }

    fn read_session(db: &Database, session: &str) -> EngineResult<Vec<(u64, StagedRow)>> {
        let read_txn = db
            .begin_read()
            .map_err(|e| storage("Failed to begin read", e))?;
        let table = read_txn
            .open_table(STAGED)
            .map_err(|e| storage("Failed to open staged table", e))?;

        let mut rows = Vec::new();
        let iter = table
            .range((session, 0u64)..=(session, u64::MAX))
            .map_err(|e| storage("Failed to iterate staged rows", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| storage("Failed to read staged row", e))?;
            let (_, seq) = key.value();
            let row: StagedRow = bincode::deserialize(value.value())
                .map_err(|e| storage("Corrupt staged row", e))?;
            rows.push((seq, row));
        }
        Ok(rows)
    }

    fn read_all(db: &Database) -> EngineResult<Vec<(String, u64, StagedRow)>> {
        let read_txn = db
            .begin_read()
            .map_err(|e| storage("Failed to begin read", e))?;
        let table = read_txn
            .open_table(STAGED)
            .map_err(|e| storage("Failed to open staged table", e))?;

        let mut rows = Vec::new();
        let iter = table
            .iter()
            .map_err(|e| storage("Failed to iterate staged rows", e))?;
        for entry in iter {
            let (key, value) = entry.map_err(|e| storage("Failed to read staged row", e))?;
            let (session, seq) = key.value();
            let row: StagedRow = bincode::deserialize(value.value())
                .map_err(|e| storage("Corrupt staged row", e))?;
            rows.push((session.to_string(), seq, row));
        }
        Ok(rows)
    }

    fn staged_sessions(db: &Database) -> EngineResult<Vec<String>> {
        let sessions: BTreeSet<String> = Self::read_all(db)?
            .into_iter()
            .map(|(session, _, _)| session)
            .collect();
        Ok(sessions.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::SqliteStore;
    use crate::testing::FlakyStore;
    use crate::types::{ResultPayload, DEFAULT_SESSION};

    fn entry(user: &str, session: Option<&str>, text: &str, ts: i64) -> MemoryEntry {
        MemoryEntry::new(
            user,
            session.map(str::to_string),
            text,
            ResultPayload::Json(serde_json::json!({"a": 1})),
        )
        .at(ts)
    }

    fn open_with(
        dir: &tempfile::TempDir,
        durable: Arc<dyn DurableStore>,
        flush_size: usize,
    ) -> StagingBuffer {
        StagingBuffer::open(&dir.path().join("staging.redb"), durable, flush_size).unwrap()
    }

    #[tokio::test]
    async fn test_add_below_threshold_stays_local() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
        let buffer = open_with(&dir, durable.clone(), 20);

        let report = buffer.add_entry(&entry("u1", Some("s1"), "q", 1)).await.unwrap();
        assert!(report.is_none());
        assert_eq!(buffer.pending_len("s1").await, 1);
        assert_eq!(durable.count_memories().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_threshold_triggers_single_flush() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(FlakyStore::new());
        let buffer = open_with(&dir, durable.clone(), 2);

        let first = buffer.add_entry(&entry("u1", Some("s1"), "one", 1)).await.unwrap();
        let second = buffer.add_entry(&entry("u1", Some("s1"), "two", 2)).await.unwrap();
        let third = buffer.add_entry(&entry("u1", Some("s1"), "three", 3)).await.unwrap();

        assert!(first.is_none());
        assert_eq!(second.map(|r| r.flushed.len()), Some(2));
        assert!(third.is_none());
        assert_eq!(durable.upsert_calls(), 2);
        assert_eq!(buffer.pending_len("s1").await, 1);
    }

    #[tokio::test]
    async fn test_flush_preserves_session_order() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
        let buffer = open_with(&dir, durable.clone(), 100);

        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            buffer.add_entry(&entry("u1", Some("s1"), text, 10 - i as i64)).await.unwrap();
        }
        let report = buffer.flush_to_durable(Some("s1")).await.unwrap();

        let texts: Vec<_> = report.flushed.iter().map(|r| r.query_text.as_str()).collect();
        assert_eq!(texts, vec!["a", "b", "c"]);
        let ids: Vec<_> = report.flushed.iter().map(|r| r.entry_id.unwrap()).collect();
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn test_failed_batch_is_kept_whole() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(FlakyStore::new());
        let buffer = open_with(&dir, durable.clone(), 100);

        for i in 0..3 {
            buffer.add_entry(&entry("u1", Some("s1"), &format!("q{}", i), i)).await.unwrap();
        }

        // Connection drops after the first row of the batch
        durable.fail_after(1);
        let report = buffer.flush_to_durable(None).await.unwrap();
        assert_eq!(report.failed_sessions, vec!["s1".to_string()]);
        assert!(report.flushed.is_empty());
        assert_eq!(buffer.pending_len("s1").await, 3);
        assert_eq!(durable.count_memories().await.unwrap(), 0);

        durable.recover();
        let report = buffer.flush_to_durable(None).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.flushed.len(), 3);
        assert_eq!(durable.count_memories().await.unwrap(), 3);
        assert_eq!(buffer.pending_len("s1").await, 0);
    }

    #[tokio::test]
    async fn test_double_flush_writes_nothing_twice() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
        let buffer = open_with(&dir, durable.clone(), 100);

        buffer.add_entry(&entry("u1", Some("s1"), "q", 1)).await.unwrap();
        buffer.flush_to_durable(Some("s1")).await.unwrap();
        let again = buffer.flush_to_durable(Some("s1")).await.unwrap();

        assert!(again.flushed.is_empty());
        assert_eq!(durable.count_memories().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_restart_recovers_and_flushes_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(SqliteStore::open_in_memory().unwrap());

        {
            let buffer = open_with(&dir, durable.clone(), 100);
            buffer.add_entry(&entry("u1", Some("s1"), "a", 1)).await.unwrap();
            buffer.add_entry(&entry("u1", None, "b", 2)).await.unwrap();
            buffer.add_entry(&entry("u2", Some("s2"), "c", 3)).await.unwrap();
        }

        let buffer = open_with(&dir, durable.clone(), 100);
        assert_eq!(buffer.pending_len("s1").await, 1);
        assert_eq!(buffer.pending_len(DEFAULT_SESSION).await, 1);

        // New rows after restart must not collide with recovered ones
        buffer.add_entry(&entry("u1", Some("s1"), "d", 4)).await.unwrap();
        assert_eq!(buffer.pending_len("s1").await, 2);

        let report = buffer.flush_to_durable(None).await.unwrap();
        assert_eq!(report.flushed.len(), 4);
        buffer.flush_to_durable(None).await.unwrap();
        assert_eq!(durable.count_memories().await.unwrap(), 4);
        assert_eq!(buffer.stats().await.unwrap().staged_rows, 0);
    }

    #[tokio::test]
    async fn test_discard_user_only_touches_that_user() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
        let buffer = open_with(&dir, durable.clone(), 100);

        buffer.add_entry(&entry("u1", Some("s1"), "a", 1)).await.unwrap();
        buffer.add_entry(&entry("u2", Some("s1"), "b", 2)).await.unwrap();
        buffer.add_entry(&entry("u1", Some("s2"), "c", 3)).await.unwrap();

        assert_eq!(buffer.discard_user("u1").await.unwrap(), 2);
        assert_eq!(buffer.pending_len("s1").await, 1);
        assert_eq!(buffer.pending_len("s2").await, 0);

        buffer.flush_to_durable(None).await.unwrap();
        assert_eq!(durable.total_interactions("u1").await.unwrap(), 0);
        assert_eq!(durable.total_interactions("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_stats_groups_by_session() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
        let buffer = open_with(&dir, durable, 100);

        buffer.add_entry(&entry("u1", Some("b"), "x", 1)).await.unwrap();
        buffer.add_entry(&entry("u1", Some("a"), "y", 2)).await.unwrap();
        buffer.add_entry(&entry("u1", Some("b"), "z", 3)).await.unwrap();

        let stats = buffer.stats().await.unwrap();
        assert_eq!(stats.staged_rows, 3);
        assert_eq!(
            stats.sessions,
            vec![("a".to_string(), 1), ("b".to_string(), 2)]
        );
    }

    #[test]
    fn test_zero_flush_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let durable = Arc::new(SqliteStore::open_in_memory().unwrap());
        let result = StagingBuffer::open(&dir.path().join("s.redb"), durable, 0);
        assert!(matches!(result, Err(EngineError::Configuration(_))));
    }
}
