//! ============================================================================
//! Engine Configuration - Defaults and environment overrides
//! ============================================================================
//! Default paths: ~/.recall/staging.redb and ~/.recall/memory.sqlite3
//! (override via RECALL_STAGING_PATH / RECALL_DURABLE_PATH env vars)
//! ============================================================================

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::retry::RetryConfig;
use crate::types::{EngineError, EngineResult};

/// Default number of pending entries per session before an inline flush
pub const DEFAULT_FLUSH_SIZE: usize = 20;

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIM: usize = 384;

/// Configuration for a [`crate::MemoryEngine`]
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// redb file backing the staging buffer (None = default location)
    pub staging_path: Option<PathBuf>,
    /// SQLite file for the durable tier (None = default location)
    pub durable_path: Option<PathBuf>,
    /// Pending entries per session that trigger an inline flush
    pub flush_size: usize,
    /// Period of the background flush loop
    pub flush_interval: Duration,
    /// Dimension shared by the embedding port and the vector index
    pub embedding_dim: usize,
    /// Maximum records held by the vector index before eviction
    pub index_capacity: usize,
    /// Number of index worker tasks
    pub index_workers: usize,
    /// Bound of the index job queue
    pub index_queue_capacity: usize,
    /// Deadline applied to every recall (None = no deadline)
    pub recall_timeout: Option<Duration>,
    /// Coarse candidates below this cosine similarity are dropped (None = keep all)
    pub min_similarity: Option<f32>,
    /// Window used by the retention ratio
    pub retention_window_days: u32,
    /// Maximum unindexed entries re-submitted per sweep
    pub reindex_batch: usize,
    pub retry: RetryConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            staging_path: None,
            durable_path: None,
            flush_size: DEFAULT_FLUSH_SIZE,
            flush_interval: Duration::from_secs(5),
            embedding_dim: DEFAULT_EMBEDDING_DIM,
            index_capacity: 100_000,
            index_workers: 2,
            index_queue_capacity: 256,
            recall_timeout: None,
            min_similarity: None,
            retention_window_days: 7,
            reindex_batch: 100,
            retry: RetryConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overridden by `RECALL_*` env vars
    pub fn from_env() -> EngineResult<Self> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("RECALL_STAGING_PATH") {
            config.staging_path = Some(PathBuf::from(path));
        }
        if let Ok(path) = std::env::var("RECALL_DURABLE_PATH") {
            config.durable_path = Some(PathBuf::from(path));
        }
        if let Some(v) = env_parse::<usize>("RECALL_FLUSH_SIZE")? {
            config.flush_size = v;
        }
        if let Some(v) = env_parse::<u64>("RECALL_FLUSH_INTERVAL_SECS")? {
            config.flush_interval = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<usize>("RECALL_EMBEDDING_DIM")? {
            config.embedding_dim = v;
        }
        if let Some(v) = env_parse::<usize>("RECALL_INDEX_CAPACITY")? {
            config.index_capacity = v;
        }
        if let Some(v) = env_parse::<usize>("RECALL_INDEX_WORKERS")? {
            config.index_workers = v;
        }
        if let Some(v) = env_parse::<usize>("RECALL_INDEX_QUEUE")? {
            config.index_queue_capacity = v;
        }
        if let Some(v) = env_parse::<u64>("RECALL_TIMEOUT_MS")? {
            config.recall_timeout = Some(Duration::from_millis(v));
        }
        if let Some(v) = env_parse::<f32>("RECALL_MIN_SIMILARITY")? {
            config.min_similarity = Some(v);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject values the engine cannot run with
    pub fn validate(&self) -> EngineResult<()> {
        if self.flush_size == 0 {
            return Err(EngineError::Configuration("flush_size must be at least 1".into()));
        }
        if self.embedding_dim == 0 {
            return Err(EngineError::Configuration("embedding_dim must be at least 1".into()));
        }
        if self.index_capacity == 0 {
            return Err(EngineError::Configuration("index_capacity must be at least 1".into()));
        }
        if self.index_workers == 0 || self.index_queue_capacity == 0 {
            return Err(EngineError::Configuration(
                "index_workers and index_queue_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Resolve the staging file path, creating ~/.recall when needed
    pub fn resolved_staging_path(&self) -> EngineResult<PathBuf> {
        match &self.staging_path {
            Some(p) => Ok(p.clone()),
            None => Ok(data_dir()?.join("staging.redb")),
        }
    }

    /// Resolve the durable database path, creating ~/.recall when needed
    pub fn resolved_durable_path(&self) -> EngineResult<PathBuf> {
        match &self.durable_path {
            Some(p) => Ok(p.clone()),
            None => Ok(data_dir()?.join("memory.sqlite3")),
        }
    }
}

fn data_dir() -> EngineResult<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| EngineError::Configuration("Cannot determine home directory".into()))?;
    let dir = home.join(".recall");
    std::fs::create_dir_all(&dir).map_err(|e| {
        EngineError::Configuration(format!("Failed to create .recall directory: {}", e))
    })?;
    Ok(dir)
}

fn env_parse<T: FromStr>(key: &str) -> EngineResult<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| EngineError::Configuration(format!("Invalid {}='{}': {}", key, raw, e))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = EngineConfig::default();
        assert_eq!(config.flush_size, 20);
        assert_eq!(config.embedding_dim, 384);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_flush_size() {
        let config = EngineConfig {
            flush_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_explicit_paths_are_used() {
        let config = EngineConfig {
            staging_path: Some(PathBuf::from("/tmp/s.redb")),
            durable_path: Some(PathBuf::from("/tmp/d.sqlite3")),
            ..Default::default()
        };
        assert_eq!(config.resolved_staging_path().unwrap(), PathBuf::from("/tmp/s.redb"));
        assert_eq!(config.resolved_durable_path().unwrap(), PathBuf::from("/tmp/d.sqlite3"));
    }

    #[test]
    fn test_env_parse_reports_bad_values() {
        std::env::set_var("RECALL_TEST_BAD_NUMBER", "twenty");
        let parsed = env_parse::<usize>("RECALL_TEST_BAD_NUMBER");
        assert!(matches!(parsed, Err(EngineError::Configuration(_))));
        std::env::remove_var("RECALL_TEST_BAD_NUMBER");
        assert!(env_parse::<usize>("RECALL_TEST_BAD_NUMBER").unwrap().is_none());
    }
}
