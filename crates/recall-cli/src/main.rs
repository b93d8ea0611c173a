// ============================================================================
// recall-db: CLI inspection tool for the recall memory tiers
// ============================================================================
// Usage:
//   recall-db stats                            Show staging and durable counts
//   recall-db pending                          List staged, unflushed entries
//   recall-db flush [--session S]              Drain staged entries to SQLite
//   recall-db retention --user U               Retention ratio and profile decay
//   recall-db profile --user U                 Show a user's profile and history
//   recall-db export --user U                  Export a user's memory as JSON
//   recall-db prune --older-than 30            Delete old durable entries
// ============================================================================

use anyhow::Result;
use chrono::{TimeZone, Utc};
use clap::{Parser, Subcommand};
use recall_core::memory::{decay, store::COLLECTION_NAME};
use recall_core::{
    now_ts, DurableStore, EngineConfig, QdrantIndex, SqliteStore, StagingBuffer, VectorIndex,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Recall memory inspection tool
#[derive(Parser)]
#[command(name = "recall-db", version, about = "Inspect and manage the recall memory tiers")]
struct Cli {
    /// Staging file (default: ~/.recall/staging.redb)
    #[arg(long, global = true)]
    staging_path: Option<PathBuf>,

    /// Durable database (default: ~/.recall/memory.sqlite3)
    #[arg(long, global = true)]
    durable_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show staging and durable statistics
    Stats,

    /// List staged entries that have not reached the durable tier
    Pending,

    /// Flush staged entries to the durable tier
    Flush {
        /// Only flush this session
        #[arg(long)]
        session: Option<String>,
    },

    /// Show a user's retention ratio and profile decay
    Retention {
        #[arg(long)]
        user: String,
    },

    /// Show a user's profile fields and edit history
    Profile {
        #[arg(long)]
        user: String,

        /// Maximum history lines
        #[arg(long, default_value = "20")]
        history: usize,
    },

    /// Export a user's entries and profile as JSON
    Export {
        #[arg(long)]
        user: String,

        /// Maximum entries, newest first
        #[arg(long, default_value = "1000")]
        limit: usize,
    },

    /// Delete durable entries older than a number of days
    Prune {
        #[arg(long, default_value = "30")]
        older_than: u32,

        /// Also delete the pruned vectors from this Qdrant instance
        #[arg(long)]
        qdrant_url: Option<String>,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn init_logging() -> Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive("recall_core=warn".parse()?)
        .add_directive("recall_db=info".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    init_logging()?;

    let cli = Cli::parse();
    let mut config = EngineConfig::from_env()?;
    if let Some(path) = cli.staging_path {
        config.staging_path = Some(path);
    }
    if let Some(path) = cli.durable_path {
        config.durable_path = Some(path);
    }

    let durable = Arc::new(SqliteStore::open(&config.resolved_durable_path()?)?);

    match cli.command {
        Commands::Stats => cmd_stats(&config, durable).await,
        Commands::Pending => cmd_pending(&config, durable).await,
        Commands::Flush { session } => cmd_flush(&config, durable, session).await,
        Commands::Retention { user } => cmd_retention(&config, durable.as_ref(), &user).await,
        Commands::Profile { user, history } => cmd_profile(durable.as_ref(), &user, history).await,
        Commands::Export { user, limit } => cmd_export(durable.as_ref(), &user, limit).await,
        Commands::Prune {
            older_than,
            qdrant_url,
            dry_run,
        } => cmd_prune(&config, durable.as_ref(), older_than, qdrant_url, dry_run).await,
    }
}

fn open_staging(config: &EngineConfig, durable: Arc<SqliteStore>) -> Result<StagingBuffer> {
    Ok(StagingBuffer::open(
        &config.resolved_staging_path()?,
        durable,
        config.flush_size,
    )?)
}

async fn cmd_stats(config: &EngineConfig, durable: Arc<SqliteStore>) -> Result<()> {
    let total = durable.count_memories().await?;
    let unindexed = durable.count_unindexed().await?;
    let staging = open_staging(config, durable.clone())?;
    let staged = staging.stats().await?;

    println!("=== Recall Memory Stats ===");
    println!("Staging: {}", staging.path().display());
    if let Some(path) = durable.path() {
        println!("Durable: {}", path.display());
    }
    println!();
    println!("Staged rows:     {}", staged.staged_rows);
    for (session, count) in &staged.sessions {
        println!("  {:24} {}", session, count);
    }
    println!("Durable entries: {}", total);
    println!("  unindexed      {}", unindexed);

    Ok(())
}

async fn cmd_pending(config: &EngineConfig, durable: Arc<SqliteStore>) -> Result<()> {
    let staging = open_staging(config, durable)?;
    let rows = staging.staged_rows().await?;

    if rows.is_empty() {
        println!("No staged entries.");
        return Ok(());
    }

    println!(
        "{:<20}  {:<16}  {:<22}  {}",
        "SESSION", "USER", "STAGED AT", "QUERY"
    );
    println!("{}", "-".repeat(90));

    for (session, row) in &rows {
        let query = row.query_text.chars().take(30).collect::<String>();
        println!(
            "{:<20}  {:<16}  {:<22}  {}",
            session,
            row.user_id,
            format_timestamp(row.timestamp),
            query
        );
    }

    println!("\nTotal: {} staged entries", rows.len());
    Ok(())
}

async fn cmd_flush(
    config: &EngineConfig,
    durable: Arc<SqliteStore>,
    session: Option<String>,
) -> Result<()> {
    let staging = open_staging(config, durable)?;
    let report = staging.flush_to_durable(session.as_deref()).await?;
    info!(
        "Flush finished: {} flushed, {} sessions failed",
        report.flushed.len(),
        report.failed_sessions.len()
    );

    println!("Flushed {} entries", report.flushed.len());
    if !report.is_clean() {
        println!(
            "Sessions left staged: {}",
            report.failed_sessions.join(", ")
        );
    }
    if !report.flushed.is_empty() {
        println!("Flushed entries are indexed on the engine's next reindex sweep.");
    }
    Ok(())
}

async fn cmd_retention(config: &EngineConfig, durable: &SqliteStore, user: &str) -> Result<()> {
    let recent = durable
        .recent_interactions(user, config.retention_window_days)
        .await?;
    let total = durable.total_interactions(user).await?;

    println!("User:        {}", user);
    println!(
        "Retention:   {:.3} ({} of {} interactions in the last {} days)",
        decay::retention(recent, total),
        recent,
        total,
        config.retention_window_days
    );

    match durable.get_profile(user).await? {
        Some(profile) => println!(
            "Decay:       {:.3} (last update {})",
            decay::DecayModel::default().decay(&profile, now_ts()),
            format_timestamp(profile.last_update)
        ),
        None => println!("Decay:       - (no profile)"),
    }
    Ok(())
}

async fn cmd_profile(durable: &SqliteStore, user: &str, history: usize) -> Result<()> {
    let Some(profile) = durable.get_profile(user).await? else {
        println!("No profile for user {}.", user);
        return Ok(());
    };

    println!("=== Profile: {} ===", profile.user_id);
    println!("Last update: {}", format_timestamp(profile.last_update));
    println!("Edits:       {}", profile.edit_count);
    println!();
    for (field, value) in &profile.fields {
        println!("  {:20} {}", field, value);
    }

    let lines = durable.history(user, history).await?;
    if !lines.is_empty() {
        println!("\nHistory (newest first):");
        for line in &lines {
            println!(
                "  {}  {} = {}",
                format_timestamp(line.timestamp),
                line.field,
                line.value
            );
        }
    }
    Ok(())
}

async fn cmd_export(durable: &SqliteStore, user: &str, limit: usize) -> Result<()> {
    let entries: Vec<_> = durable
        .list_memories(user, limit)
        .await?
        .into_iter()
        .map(|record| record.into_entry())
        .collect();
    let profile = durable.get_profile(user).await?;
    let history = durable.history(user, limit).await?;

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "user_id": user,
        "entries": entries,
        "profile": profile,
        "history": history,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

async fn cmd_prune(
    config: &EngineConfig,
    durable: &SqliteStore,
    older_than: u32,
    qdrant_url: Option<String>,
    dry_run: bool,
) -> Result<()> {
    let cutoff = now_ts() - i64::from(older_than) * 86_400;

    if dry_run {
        println!("=== DRY RUN: no data will be deleted ===\n");
        let count = durable.count_before(cutoff).await?;
        println!(
            "Would prune {} entries older than {} days (before {})",
            count,
            older_than,
            format_timestamp(cutoff)
        );
        return Ok(());
    }

    let removed = durable.prune_before(cutoff).await?;
    info!("Pruned {} durable entries before {}", removed.len(), cutoff);
    println!(
        "Pruned {} entries (older than {} days)",
        removed.len(),
        older_than
    );

    let vector_ids: Vec<_> = removed.iter().filter_map(|r| r.vector_id).collect();
    match qdrant_url {
        Some(url) if !vector_ids.is_empty() => {
            let index = QdrantIndex::new(&url, COLLECTION_NAME, config.embedding_dim).await?;
            index.delete(&vector_ids).await?;
            println!("Deleted {} vectors from {}", vector_ids.len(), url);
        }
        None if !vector_ids.is_empty() => {
            println!(
                "{} pruned entries had vectors; pass --qdrant-url to delete them from Qdrant",
                vector_ids.len()
            );
        }
        _ => {}
    }
    Ok(())
}
