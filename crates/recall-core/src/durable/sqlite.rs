//! ============================================================================
//! SqliteStore: Durable tier backed by SQLite (rusqlite)
//! ============================================================================
//! Default path: ~/.recall/memory.sqlite3 (override via RECALL_DURABLE_PATH)
//! Entry ids come from an AUTOINCREMENT key, so they are monotonic and never
//! reused within one database file.
//!
//! Every query runs through a deadpool-sqlite pool on the blocking thread
//! pool, never on a runtime worker. Write transactions are IMMEDIATE so
//! concurrent writers queue on busy_timeout instead of failing on upgrade.
//! ============================================================================

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use deadpool_sqlite::{Config, Hook, HookError, Pool, Runtime};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::{DurableStore, MemoryRecord};
use crate::types::{
    id_from_column, now_ts, vector_id_from_column, vector_id_to_column, HistoryEntry,
    UserProfile, VectorId, UNASSIGNED_ID,
};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS memories (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     TEXT    NOT NULL,
        session_id  TEXT    NOT NULL DEFAULT '',
        query_text  TEXT    NOT NULL,
        result      BLOB    NOT NULL,
        created_at  INTEGER NOT NULL,
        vector_id   INTEGER NOT NULL DEFAULT -1,
        UNIQUE (user_id, session_id, created_at, query_text)
    );
    CREATE INDEX IF NOT EXISTS idx_memories_user ON memories (user_id, created_at);
    CREATE INDEX IF NOT EXISTS idx_memories_vector ON memories (vector_id);

    CREATE TABLE IF NOT EXISTS profiles (
        user_id     TEXT    PRIMARY KEY,
        last_update INTEGER NOT NULL,
        edit_count  INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS profile_fields (
        user_id     TEXT    NOT NULL,
        field       TEXT    NOT NULL,
        value       TEXT    NOT NULL,
        updated_at  INTEGER NOT NULL,
        PRIMARY KEY (user_id, field)
    );

    CREATE TABLE IF NOT EXISTS profile_history (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        user_id     TEXT    NOT NULL,
        field       TEXT    NOT NULL,
        value       TEXT    NOT NULL,
        timestamp   INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_history_user ON profile_history (user_id, id);
";

const MEMORY_COLUMNS: &str = "id, user_id, session_id, query_text, result, created_at, vector_id";

const FILE_PRAGMAS: &str = "PRAGMA journal_mode=WAL; \
                            PRAGMA busy_timeout=5000; \
                            PRAGMA synchronous=NORMAL;";
const MEMORY_PRAGMAS: &str = "PRAGMA busy_timeout=5000;";

/// Connections kept for a database file
const FILE_POOL_SIZE: usize = 4;

/// SQLite-backed implementation of [`DurableStore`]
pub struct SqliteStore {
    pool: Pool,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Open (or create) the database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        info!("Opening durable store at: {}", path.display());

        // Create the file and schema up front so a bad path fails here
        let conn = Connection::open(path)
            .map_err(|e| anyhow!("Failed to open durable store: {}", e))?;
        setup_connection(&conn, FILE_PRAGMAS)
            .map_err(|e| anyhow!("Failed to configure durable store: {}", e))?;
        drop(conn);

        let pool = build_pool(Config::new(path), FILE_POOL_SIZE, FILE_PRAGMAS)?;
        debug!("Durable schema ready");
        Ok(Self {
            pool,
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database.
    ///
    /// The pool holds a single connection: every connection to `:memory:`
    /// is its own database.
    pub fn open_in_memory() -> Result<Self> {
        let pool = build_pool(Config::new(":memory:"), 1, MEMORY_PRAGMAS)?;
        Ok(Self { pool, path: None })
    }

    /// Database file path, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure with a pooled connection on the blocking thread pool
    async fn interact<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Connection) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self
            .pool
            .get()
            .await
            .map_err(|e| anyhow!("Failed to get durable connection: {}", e))?;
        conn.interact(f)
            .await
            .map_err(|e| anyhow!("Durable store interaction failed: {}", e))?
    }

    async fn count(&self, sql: &'static str, context: &'static str) -> Result<u64> {
        self.interact(move |conn| {
            let count: i64 = conn
                .query_row(sql, [], |row| row.get(0))
                .map_err(|e| anyhow!("{}: {}", context, e))?;
            Ok(count as u64)
        })
        .await
    }
}

fn build_pool(config: Config, max_size: usize, pragmas: &'static str) -> Result<Pool> {
    config
        .builder(Runtime::Tokio1)
        .map_err(|e| anyhow!("Failed to create pool builder: {}", e))?
        .max_size(max_size)
        .post_create(post_create_hook(pragmas))
        .build()
        .map_err(|e| anyhow!("Failed to build connection pool: {}", e))
}

fn post_create_hook(pragmas: &'static str) -> Hook {
    Hook::async_fn(move |conn, _metrics| {
        Box::pin(async move {
            conn.interact(move |conn| setup_connection(conn, pragmas))
                .await
                .map_err(|e| HookError::Message(format!("interact failed: {e}").into()))?
                .map_err(|e| HookError::Message(format!("connection setup failed: {e}").into()))
        })
    })
}

fn setup_connection(conn: &Connection, pragmas: &str) -> rusqlite::Result<()> {
    conn.execute_batch(pragmas)?;
    conn.execute_batch(SCHEMA)
}

fn immediate<'a>(conn: &'a mut Connection, context: &str) -> Result<rusqlite::Transaction<'a>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| anyhow!("Failed to begin {}: {}", context, e))
}

fn upsert_row(conn: &Connection, record: &MemoryRecord) -> Result<i64> {
    let session = record.session_id.as_deref().unwrap_or("");
    let vector_column = vector_id_to_column(record.vector_id);

    // An already indexed entry is identified by its vector id
    if record.vector_id.is_some() {
        let existing: Option<i64> = conn
            .query_row(
                "SELECT id FROM memories WHERE vector_id = ?1 AND user_id = ?2",
                params![vector_column, record.user_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| anyhow!("Failed to look up vector id: {}", e))?;
        if let Some(id) = existing {
            conn.execute(
                "UPDATE memories SET result = ?2 WHERE id = ?1",
                params![id, record.result],
            )
            .map_err(|e| anyhow!("Failed to update memory: {}", e))?;
            return Ok(id);
        }
    }

    let id: i64 = conn
        .query_row(
            "INSERT INTO memories (user_id, session_id, query_text, result, created_at, vector_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (user_id, session_id, created_at, query_text) DO UPDATE SET
                 result = excluded.result,
                 vector_id = CASE WHEN excluded.vector_id >= 0
                                  THEN excluded.vector_id ELSE memories.vector_id END
             RETURNING id",
            params![
                record.user_id,
                session,
                record.query_text,
                record.result,
                record.created_at,
                vector_column
            ],
            |row| row.get(0),
        )
        .map_err(|e| anyhow!("Failed to upsert memory: {}", e))?;

    debug!("Upserted memory {} for user {}", id, record.user_id);
    Ok(id)
}

fn load_profile(conn: &Connection, user_id: &str) -> Result<Option<UserProfile>> {
    let header: Option<(i64, i64)> = conn
        .query_row(
            "SELECT last_update, edit_count FROM profiles WHERE user_id = ?1",
            params![user_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| anyhow!("Failed to get profile: {}", e))?;

    let Some((last_update, edit_count)) = header else {
        return Ok(None);
    };

    let mut stmt = conn
        .prepare("SELECT field, value FROM profile_fields WHERE user_id = ?1")
        .map_err(|e| anyhow!("Failed to prepare field query: {}", e))?;
    let rows = stmt
        .query_map(params![user_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })
        .map_err(|e| anyhow!("Failed to read profile fields: {}", e))?;

    let mut fields = BTreeMap::new();
    for row in rows {
        let (field, raw) = row.map_err(|e| anyhow!("Failed to read field: {}", e))?;
        let value = serde_json::from_str(&raw)
            .map_err(|e| anyhow!("Failed to decode field {}: {}", field, e))?;
        fields.insert(field, value);
    }

    Ok(Some(UserProfile {
        user_id: user_id.to_string(),
        fields,
        last_update,
        edit_count: edit_count as u64,
    }))
}

fn query_records(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<MemoryRecord>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| anyhow!("Failed to prepare memory query: {}", e))?;
    let rows = stmt
        .query_map(params, row_to_record)
        .map_err(|e| anyhow!("Failed to query memories: {}", e))?;
    rows.collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| anyhow!("Failed to read memory row: {}", e))
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MemoryRecord> {
    let session: String = row.get(2)?;
    Ok(MemoryRecord {
        entry_id: id_from_column(row.get(0)?),
        user_id: row.get(1)?,
        session_id: if session.is_empty() { None } else { Some(session) },
        query_text: row.get(3)?,
        result: row.get(4)?,
        created_at: row.get(5)?,
        vector_id: vector_id_from_column(row.get(6)?),
    })
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn upsert_memory(&self, record: &MemoryRecord) -> Result<i64> {
        let record = record.clone();
        self.interact(move |conn| upsert_row(conn, &record)).await
    }

    async fn upsert_batch(&self, records: &[MemoryRecord]) -> Result<Vec<i64>> {
        let records = records.to_vec();
        self.interact(move |conn| {
            let tx = immediate(conn, "batch upsert")?;
            let ids = records
                .iter()
                .map(|record| upsert_row(&tx, record))
                .collect::<Result<Vec<_>>>()?;
            tx.commit()
                .map_err(|e| anyhow!("Failed to commit batch upsert: {}", e))?;
            Ok(ids)
        })
        .await
    }

    async fn attach_vector(&self, entry_id: i64, vector_id: VectorId) -> Result<bool> {
        self.interact(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE memories SET vector_id = ?2 WHERE id = ?1",
                    params![entry_id, vector_id as i64],
                )
                .map_err(|e| anyhow!("Failed to attach vector: {}", e))?;
            Ok(updated > 0)
        })
        .await
    }

    async fn detach_all_vectors(&self) -> Result<u64> {
        self.interact(|conn| {
            let updated = conn
                .execute(
                    "UPDATE memories SET vector_id = ?1 WHERE vector_id >= 0",
                    params![UNASSIGNED_ID],
                )
                .map_err(|e| anyhow!("Failed to detach vectors: {}", e))?;
            Ok(updated as u64)
        })
        .await
    }

    async fn get_memory(&self, entry_id: i64) -> Result<Option<MemoryRecord>> {
        self.interact(move |conn| {
            conn.query_row(
                &format!("SELECT {} FROM memories WHERE id = ?1", MEMORY_COLUMNS),
                params![entry_id],
                row_to_record,
            )
            .optional()
            .map_err(|e| anyhow!("Failed to get memory: {}", e))
        })
        .await
    }

    async fn list_memories(&self, user_id: &str, limit: usize) -> Result<Vec<MemoryRecord>> {
        let user_id = user_id.to_string();
        self.interact(move |conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {} FROM memories WHERE user_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
                    MEMORY_COLUMNS
                ),
                params![user_id, limit as i64],
            )
        })
        .await
    }

    async fn list_unindexed(&self, limit: usize) -> Result<Vec<MemoryRecord>> {
        self.interact(move |conn| {
            query_records(
                conn,
                &format!(
                    "SELECT {} FROM memories WHERE vector_id < 0 ORDER BY id ASC LIMIT ?1",
                    MEMORY_COLUMNS
                ),
                params![limit as i64],
            )
        })
        .await
    }

    async fn count_memories(&self) -> Result<u64> {
        self.count("SELECT COUNT(*) FROM memories", "Failed to count memories")
            .await
    }

    async fn count_unindexed(&self) -> Result<u64> {
        self.count(
            "SELECT COUNT(*) FROM memories WHERE vector_id < 0",
            "Failed to count unindexed memories",
        )
        .await
    }

    async fn delete_memory(&self, user_id: &str, entry_id: i64) -> Result<Option<MemoryRecord>> {
        let user_id = user_id.to_string();
        self.interact(move |conn| {
            let tx = immediate(conn, "delete")?;
            let record = tx
                .query_row(
                    &format!(
                        "SELECT {} FROM memories WHERE id = ?1 AND user_id = ?2",
                        MEMORY_COLUMNS
                    ),
                    params![entry_id, user_id],
                    row_to_record,
                )
                .optional()
                .map_err(|e| anyhow!("Failed to get memory: {}", e))?;

            if record.is_some() {
                tx.execute("DELETE FROM memories WHERE id = ?1", params![entry_id])
                    .map_err(|e| anyhow!("Failed to delete memory: {}", e))?;
            }
            tx.commit()
                .map_err(|e| anyhow!("Failed to commit delete: {}", e))?;

            if record.is_some() {
                debug!("Deleted memory {} for user {}", entry_id, user_id);
            }
            Ok(record)
        })
        .await
    }

    async fn count_before(&self, cutoff: i64) -> Result<u64> {
        self.interact(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memories WHERE created_at < ?1",
                    params![cutoff],
                    |row| row.get(0),
                )
                .map_err(|e| anyhow!("Failed to count old entries: {}", e))?;
            Ok(count as u64)
        })
        .await
    }

    async fn prune_before(&self, cutoff: i64) -> Result<Vec<MemoryRecord>> {
        self.interact(move |conn| {
            let tx = immediate(conn, "prune")?;
            let removed = query_records(
                &tx,
                &format!(
                    "SELECT {} FROM memories WHERE created_at < ?1 ORDER BY id ASC",
                    MEMORY_COLUMNS
                ),
                params![cutoff],
            )?;
            tx.execute("DELETE FROM memories WHERE created_at < ?1", params![cutoff])
                .map_err(|e| anyhow!("Failed to prune memories: {}", e))?;
            tx.commit()
                .map_err(|e| anyhow!("Failed to commit prune: {}", e))?;

            if !removed.is_empty() {
                info!("Pruned {} memories created before {}", removed.len(), cutoff);
            }
            Ok(removed)
        })
        .await
    }

    async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>> {
        let user_id = user_id.to_string();
        self.interact(move |conn| load_profile(conn, &user_id)).await
    }

    async fn ensure_profile(&self, user_id: &str, now: i64) -> Result<UserProfile> {
        let user_id = user_id.to_string();
        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO profiles (user_id, last_update, edit_count) VALUES (?1, ?2, 0)
                 ON CONFLICT (user_id) DO NOTHING",
                params![user_id, now],
            )
            .map_err(|e| anyhow!("Failed to create profile: {}", e))?;

            load_profile(conn, &user_id)?
                .ok_or_else(|| anyhow!("Profile not found after create: {}", user_id))
        })
        .await
    }

    async fn update_profile_field(
        &self,
        user_id: &str,
        field: &str,
        value: &serde_json::Value,
        timestamp: i64,
    ) -> Result<bool> {
        let user_id = user_id.to_string();
        let field = field.to_string();
        let value = value.to_string();
        self.interact(move |conn| {
            let tx = immediate(conn, "profile update")?;

            tx.execute(
                "INSERT INTO profiles (user_id, last_update, edit_count) VALUES (?1, ?2, 0)
                 ON CONFLICT (user_id) DO NOTHING",
                params![user_id, timestamp],
            )
            .map_err(|e| anyhow!("Failed to create profile: {}", e))?;

            let applied = tx
                .execute(
                    "INSERT INTO profile_fields (user_id, field, value, updated_at) VALUES (?1, ?2, ?3, ?4)
                     ON CONFLICT (user_id, field) DO UPDATE SET
                         value = excluded.value,
                         updated_at = excluded.updated_at
                     WHERE excluded.updated_at >= profile_fields.updated_at",
                    params![user_id, field, value, timestamp],
                )
                .map_err(|e| anyhow!("Failed to write profile field: {}", e))?;

            if applied > 0 {
                tx.execute(
                    "UPDATE profiles SET edit_count = edit_count + 1,
                                         last_update = MAX(last_update, ?2)
                     WHERE user_id = ?1",
                    params![user_id, timestamp],
                )
                .map_err(|e| anyhow!("Failed to bump profile: {}", e))?;
            }

            tx.commit()
                .map_err(|e| anyhow!("Failed to commit profile update: {}", e))?;

            if applied == 0 {
                debug!("Ignored stale write to {}.{} at {}", user_id, field, timestamp);
            }
            Ok(applied > 0)
        })
        .await
    }

    async fn append_history(&self, user_id: &str, entry: &HistoryEntry) -> Result<()> {
        let user_id = user_id.to_string();
        let entry = entry.clone();
        self.interact(move |conn| {
            conn.execute(
                "INSERT INTO profile_history (user_id, field, value, timestamp) VALUES (?1, ?2, ?3, ?4)",
                params![user_id, entry.field, entry.value.to_string(), entry.timestamp],
            )
            .map_err(|e| anyhow!("Failed to append history: {}", e))?;
            Ok(())
        })
        .await
    }

    async fn history(&self, user_id: &str, limit: usize) -> Result<Vec<HistoryEntry>> {
        let user_id = user_id.to_string();
        self.interact(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT field, value, timestamp FROM profile_history
                     WHERE user_id = ?1 ORDER BY id DESC LIMIT ?2",
                )
                .map_err(|e| anyhow!("Failed to prepare history query: {}", e))?;
            let rows = stmt
                .query_map(params![user_id, limit as i64], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                })
                .map_err(|e| anyhow!("Failed to query history: {}", e))?;

            let mut entries = Vec::new();
            for row in rows {
                let (field, raw, timestamp) =
                    row.map_err(|e| anyhow!("Failed to read history: {}", e))?;
                let value = serde_json::from_str(&raw)
                    .map_err(|e| anyhow!("Failed to decode history value: {}", e))?;
                entries.push(HistoryEntry {
                    field,
                    value,
                    timestamp,
                });
            }
            Ok(entries)
        })
        .await
    }

    async fn total_interactions(&self, user_id: &str) -> Result<u64> {
        let user_id = user_id.to_string();
        self.interact(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memories WHERE user_id = ?1",
                    params![user_id],
                    |row| row.get(0),
                )
                .map_err(|e| anyhow!("Failed to count interactions: {}", e))?;
            Ok(count as u64)
        })
        .await
    }

    async fn recent_interactions(&self, user_id: &str, window_days: u32) -> Result<u64> {
        let user_id = user_id.to_string();
        let cutoff = now_ts() - i64::from(window_days) * 86_400;
        self.interact(move |conn| {
            let count: i64 = conn
                .query_row(
                    "SELECT COUNT(*) FROM memories WHERE user_id = ?1 AND created_at >= ?2",
                    params![user_id, cutoff],
                    |row| row.get(0),
                )
                .map_err(|e| anyhow!("Failed to count recent interactions: {}", e))?;
            Ok(count as u64)
        })
        .await
    }

    async fn delete_user(&self, user_id: &str) -> Result<u64> {
        let user_id = user_id.to_string();
        self.interact(move |conn| {
            let tx = immediate(conn, "user delete")?;

            let removed = tx
                .execute("DELETE FROM memories WHERE user_id = ?1", params![user_id])
                .map_err(|e| anyhow!("Failed to delete memories: {}", e))?;
            for table in ["profiles", "profile_fields", "profile_history"] {
                tx.execute(
                    &format!("DELETE FROM {} WHERE user_id = ?1", table),
                    params![user_id],
                )
                .map_err(|e| anyhow!("Failed to delete from {}: {}", table, e))?;
            }
            tx.commit()
                .map_err(|e| anyhow!("Failed to commit user delete: {}", e))?;

            info!("Deleted {} durable memories for user {}", removed, user_id);
            Ok(removed as u64)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    fn record(user: &str, session: Option<&str>, text: &str, ts: i64) -> MemoryRecord {
        MemoryRecord {
            entry_id: None,
            user_id: user.to_string(),
            session_id: session.map(str::to_string),
            query_text: text.to_string(),
            result: b"{}".to_vec(),
            created_at: ts,
            vector_id: None,
        }
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_natural_key() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = record("u1", Some("s1"), "what is rust?", 100);

        let first = store.upsert_memory(&rec).await.unwrap();
        let second = store.upsert_memory(&rec).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(store.count_memories().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_session_is_idempotent_too() {
        let store = SqliteStore::open_in_memory().unwrap();
        let rec = record("u1", None, "hello", 100);

        store.upsert_memory(&rec).await.unwrap();
        store.upsert_memory(&rec).await.unwrap();

        assert_eq!(store.count_memories().await.unwrap(), 1);
        let listed = store.list_memories("u1", 10).await.unwrap();
        assert_eq!(listed[0].session_id, None);
    }

    #[tokio::test]
    async fn test_ids_are_monotonic() {
        let store = SqliteStore::open_in_memory().unwrap();
        let a = store.upsert_memory(&record("u1", None, "a", 1)).await.unwrap();
        let b = store.upsert_memory(&record("u1", None, "b", 2)).await.unwrap();
        store.delete_memory("u1", b).await.unwrap();
        let c = store.upsert_memory(&record("u1", None, "c", 3)).await.unwrap();
        assert!(a < b && b < c);
    }

    #[tokio::test]
    async fn test_attach_vector_and_unindexed() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.upsert_memory(&record("u1", None, "a", 1)).await.unwrap();
        store.upsert_memory(&record("u1", None, "b", 2)).await.unwrap();

        assert_eq!(store.count_unindexed().await.unwrap(), 2);
        assert!(store.attach_vector(id, 42).await.unwrap());
        assert_eq!(store.count_unindexed().await.unwrap(), 1);
        assert!(!store.attach_vector(9999, 1).await.unwrap());

        assert_eq!(store.detach_all_vectors().await.unwrap(), 1);
        assert_eq!(store.count_unindexed().await.unwrap(), 2);
        store.attach_vector(id, 42).await.unwrap();

        // A re-upsert without a vector id keeps the attached one
        store.upsert_memory(&record("u1", None, "a", 1)).await.unwrap();
        let got = store.get_memory(id).await.unwrap().unwrap();
        assert_eq!(got.vector_id, Some(42));
    }

    #[tokio::test]
    async fn test_upsert_by_vector_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut rec = record("u1", None, "a", 1);
        let id = store.upsert_memory(&rec).await.unwrap();
        store.attach_vector(id, 5).await.unwrap();

        rec.vector_id = Some(5);
        rec.created_at = 2;
        rec.result = b"\"new\"".to_vec();
        assert_eq!(store.upsert_memory(&rec).await.unwrap(), id);
        assert_eq!(store.count_memories().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_delete_memory_checks_owner() {
        let store = SqliteStore::open_in_memory().unwrap();
        let id = store.upsert_memory(&record("u1", None, "a", 1)).await.unwrap();

        assert!(store.delete_memory("u2", id).await.unwrap().is_none());
        assert!(store.delete_memory("u1", id).await.unwrap().is_some());
        assert_eq!(store.count_memories().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_profile_last_write_wins() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert!(store.get_profile("u1").await.unwrap().is_none());

        let created = store.ensure_profile("u1", 10).await.unwrap();
        assert!(created.fields.is_empty());
        assert_eq!(created.edit_count, 0);

        assert!(store
            .update_profile_field("u1", "tone", &serde_json::json!("formal"), 20)
            .await
            .unwrap());
        assert!(!store
            .update_profile_field("u1", "tone", &serde_json::json!("casual"), 15)
            .await
            .unwrap());
        assert!(store
            .update_profile_field("u1", "lang", &serde_json::json!("en"), 18)
            .await
            .unwrap());

        let profile = store.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.fields["tone"], serde_json::json!("formal"));
        assert_eq!(profile.fields["lang"], serde_json::json!("en"));
        assert_eq!(profile.edit_count, 2);
        assert_eq!(profile.last_update, 20);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        for (i, v) in ["a", "b", "c"].iter().enumerate() {
            store
                .append_history(
                    "u1",
                    &HistoryEntry {
                        field: "f".into(),
                        value: serde_json::json!(v),
                        timestamp: i as i64,
                    },
                )
                .await
                .unwrap();
        }
        let history = store.history("u1", 2).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].value, serde_json::json!("c"));
    }

    #[tokio::test]
    async fn test_interaction_counters() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = now_ts();
        store.upsert_memory(&record("u1", None, "new", now)).await.unwrap();
        store
            .upsert_memory(&record("u1", None, "old", now - 30 * 86_400))
            .await
            .unwrap();
        store.upsert_memory(&record("u2", None, "other", now)).await.unwrap();

        assert_eq!(store.total_interactions("u1").await.unwrap(), 2);
        assert_eq!(store.recent_interactions("u1", 7).await.unwrap(), 1);
        assert_eq!(store.total_interactions("nobody").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_delete_user_removes_everything() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_memory(&record("u1", None, "a", 1)).await.unwrap();
        store.upsert_memory(&record("u2", None, "b", 1)).await.unwrap();
        store
            .update_profile_field("u1", "f", &serde_json::json!(1), 1)
            .await
            .unwrap();

        assert_eq!(store.delete_user("u1").await.unwrap(), 1);
        assert!(store.get_profile("u1").await.unwrap().is_none());
        assert_eq!(store.total_interactions("u2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune_before_cutoff() {
        let store = SqliteStore::open_in_memory().unwrap();
        store.upsert_memory(&record("u1", None, "old", 10)).await.unwrap();
        store.upsert_memory(&record("u1", None, "new", 100)).await.unwrap();

        assert_eq!(store.count_before(50).await.unwrap(), 1);
        let removed = store.prune_before(50).await.unwrap();
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].query_text, "old");
        assert_eq!(store.count_memories().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reopen_file_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.sqlite3");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.upsert_memory(&record("u1", None, "a", 1)).await.unwrap();
        }
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.count_memories().await.unwrap(), 1);
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn test_batch_upsert_returns_ids_in_order() {
        let store = SqliteStore::open_in_memory().unwrap();
        let batch = vec![
            record("u1", Some("s1"), "a", 3),
            record("u1", Some("s1"), "b", 1),
            record("u1", Some("s1"), "c", 2),
        ];

        let ids = store.upsert_batch(&batch).await.unwrap();
        assert_eq!(ids.len(), 3);
        assert!(ids.windows(2).all(|w| w[0] < w[1]));

        // Replaying the batch is idempotent
        assert_eq!(store.upsert_batch(&batch).await.unwrap(), ids);
        assert_eq!(store.count_memories().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_failed_batch_writes_nothing() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .interact(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_poison BEFORE INSERT ON memories
                     WHEN NEW.query_text = 'poison'
                     BEGIN SELECT RAISE(ABORT, 'rejected'); END;",
                )
                .map_err(|e| anyhow!("{}", e))
            })
            .await
            .unwrap();

        let batch = vec![
            record("u1", Some("s1"), "fine", 1),
            record("u1", Some("s1"), "poison", 2),
        ];
        assert!(store.upsert_batch(&batch).await.is_err());
        assert_eq!(store.count_memories().await.unwrap(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_on_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(&dir.path().join("memory.sqlite3")).unwrap());

        let mut handles = Vec::new();
        for writer in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let session = format!("s{}", writer);
                for i in 0..25 {
                    let rec = record("u1", Some(session.as_str()), &format!("q{}", i), i);
                    store.upsert_memory(&rec).await.unwrap();
                }
                let field = format!("w{}", writer);
                store
                    .update_profile_field("u1", &field, &serde_json::json!(writer), 1)
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(store.count_memories().await.unwrap(), 200);
        let profile = store.get_profile("u1").await.unwrap().unwrap();
        assert_eq!(profile.fields.len(), 8);
        assert_eq!(profile.edit_count, 8);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn test_queries_leave_the_runtime_free() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());

        let slow = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .interact(|conn| {
                        conn.query_row(
                            "WITH RECURSIVE c(x) AS (
                                 SELECT 1 UNION ALL SELECT x + 1 FROM c WHERE x < 3000000
                             )
                             SELECT COUNT(*) FROM c",
                            [],
                            |row| row.get::<_, i64>(0),
                        )
                        .map_err(|e| anyhow!("{}", e))
                    })
                    .await
                    .unwrap();
                Instant::now()
            })
        };
        let tick = tokio::spawn(async {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Instant::now()
        });

        let slow_done = slow.await.unwrap();
        let tick_done = tick.await.unwrap();
        assert!(tick_done < slow_done);
    }
}
