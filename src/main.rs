use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mysql_async::Pool;
use tracing::{info, warn};

use mysql_sync::binlog::{
    BinlogEngine, DirectApplySink, EventFilter, EventSink, JournalSink, TailerConfig,
};
use mysql_sync::checkpoint::{current_source_position, CheckpointStore};
use mysql_sync::config::MigrationConfig;
use mysql_sync::journal::JournalWriter;
use mysql_sync::metadata::MetadataReader;
use mysql_sync::progress::ProgressStore;
use mysql_sync::replay::Replayer;
use mysql_sync::snapshot::SnapshotEngine;

/// Default location of the snapshot progress database, next to the process.
const PROGRESS_DB_PATH: &str = "./migration_progress.db";

#[derive(Parser)]
#[command(name = "mysql-sync")]
#[command(about = "MySQL-to-MySQL replication: resumable snapshot plus binlog tailing")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the full snapshot: schema phase, then batched data copy
    Snapshot {
        /// Path to the properties configuration file
        #[arg(long, default_value = "config.properties")]
        config: PathBuf,
    },
    /// Tail the source binlog and journal (or directly apply) its events
    Tail {
        #[arg(long, default_value = "config.properties")]
        config: PathBuf,

        /// Apply events straight to the target instead of journaling them
        #[arg(long)]
        direct: bool,
    },
    /// Replay journaled SQL against the target, gated by the checkpoint
    Replay {
        #[arg(long, default_value = "config.properties")]
        config: PathBuf,
    },
    /// Print snapshot progress and the stored checkpoint as JSON
    Status {
        #[arg(long, default_value = "config.properties")]
        config: PathBuf,
    },
    /// Reset a failed table's progress so the next snapshot re-copies it
    Reset {
        #[arg(long, default_value = "config.properties")]
        config: PathBuf,

        /// Table whose progress record should be reset
        #[arg(long)]
        table: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Snapshot { config } => run_snapshot(&MigrationConfig::load(config)?).await,
        Commands::Tail { config, direct } => run_tail(&MigrationConfig::load(config)?, direct).await,
        Commands::Replay { config } => run_replay(&MigrationConfig::load(config)?).await,
        Commands::Status { config } => run_status(&MigrationConfig::load(config)?).await,
        Commands::Reset { config, table } => run_reset(&MigrationConfig::load(config)?, &table),
    }
}

async fn run_snapshot(config: &MigrationConfig) -> Result<()> {
    info!(
        "starting snapshot from {}:{}/{} to {}:{}/{}",
        config.source.host,
        config.source.port,
        config.source.database,
        config.target.host,
        config.target.port,
        config.target.database
    );

    let source = Pool::new(config.source.opts());
    let target = Pool::new(config.target.opts());

    // Record the snapshot start position BEFORE any row is read, so the
    // replayer can catch up on everything that changes during the copy.
    if config.enable_incremental {
        let checkpoints = CheckpointStore::open(&config.checkpoint_db_path)?;
        let mut conn = source.get_conn().await?;
        let position = current_source_position(&mut conn).await?;
        checkpoints.save(&position)?;
        info!("snapshot start position recorded: {position}");
    }

    let reader = MetadataReader::new(source.clone(), config.source.database.clone());
    let tables = reader.list_tables().await?;
    info!("found {} tables to migrate", tables.len());

    let mut metas = Vec::with_capacity(tables.len());
    for table in &tables {
        metas.push(reader.table_meta(table).await?);
    }

    let progress = if config.enable_resume {
        Some(ProgressStore::open(PROGRESS_DB_PATH)?)
    } else {
        None
    };
    let engine = SnapshotEngine::new(source.clone(), target.clone(), config, progress.as_ref());

    if config.create_tables {
        engine.migrate_schema(&metas).await?;
    } else {
        info!("schema phase disabled by configuration");
    }

    if config.migrate_data {
        let summary = engine.migrate_data(&reader, &metas).await?;
        info!(
            "snapshot complete: {} rows copied across {} tables ({} rows failed, {} tables failed)",
            summary.copied_rows, summary.tables, summary.failed_rows, summary.failed_tables
        );
    } else {
        info!("data phase disabled by configuration");
    }

    if let Some(ref progress) = progress {
        print_progress_summary(progress)?;
    }

    source.disconnect().await.ok();
    target.disconnect().await.ok();
    Ok(())
}

async fn run_tail(config: &MigrationConfig, direct: bool) -> Result<()> {
    // Resume from the stored checkpoint when one exists; otherwise start at
    // the source's current position.
    let start_position = match CheckpointStore::open(&config.checkpoint_db_path)?.load()? {
        Some(position) => {
            info!("resuming tail from checkpoint {position}");
            Some(position)
        }
        None => {
            warn!("no checkpoint recorded; tailing from the source's current position");
            None
        }
    };

    let sink: Box<dyn EventSink> = if direct {
        info!("direct-apply sink targeting {}", config.target.host);
        Box::new(DirectApplySink::new(Pool::new(config.target.opts())))
    } else {
        info!("journal sink writing to {}", config.sql_directory);
        Box::new(JournalSink::new(JournalWriter::new(&config.sql_directory)?))
    };

    let filter = EventFilter::new(
        config.included_databases.clone(),
        config.included_tables.clone(),
    );
    let mut engine = BinlogEngine::new(
        TailerConfig::new(config.source.clone(), start_position),
        filter,
    );
    engine.start(sink)?;

    info!("tailing binlog; press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("failed to install Ctrl+C handler")?;
    info!("received interrupt, stopping tail");
    engine.stop().await;
    Ok(())
}

async fn run_replay(config: &MigrationConfig) -> Result<()> {
    let target = Pool::new(config.target.opts());
    let checkpoints = CheckpointStore::open(&config.checkpoint_db_path)?;

    let mut replayer = Replayer::new(
        target,
        checkpoints,
        &config.sql_directory,
        Duration::from_millis(config.scan_interval_ms),
    );
    let running = replayer.running_flag();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, stopping replayer");
            running.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    });

    replayer.run().await
}

async fn run_status(config: &MigrationConfig) -> Result<()> {
    let progress = ProgressStore::open(PROGRESS_DB_PATH)?;
    let records = progress.get_all()?;
    println!("{}", serde_json::to_string_pretty(&records)?);

    let checkpoints = CheckpointStore::open(&config.checkpoint_db_path)?;
    match checkpoints.load()? {
        Some(position) => println!("checkpoint: {position}"),
        None => println!("checkpoint: none"),
    }
    Ok(())
}

fn run_reset(_config: &MigrationConfig, table: &str) -> Result<()> {
    let progress = ProgressStore::open(PROGRESS_DB_PATH)?;
    progress.reset(table)?;
    println!("progress reset for {table}");
    Ok(())
}

fn print_progress_summary(progress: &ProgressStore) -> Result<()> {
    let records = progress.get_all()?;
    if records.is_empty() {
        return Ok(());
    }

    info!("========== migration progress ==========");
    let mut completed = 0;
    let mut failed = 0;
    for record in &records {
        let percent = if record.total_rows > 0 {
            record.migrated_rows as f64 / record.total_rows as f64 * 100.0
        } else {
            100.0
        };
        info!(
            "{}: {} {}/{} rows ({percent:.2}%)",
            record.table_name,
            record.status.as_str(),
            record.migrated_rows,
            record.total_rows
        );
        match record.status {
            mysql_sync::progress::TableStatus::Completed => completed += 1,
            mysql_sync::progress::TableStatus::Failed => failed += 1,
            _ => {}
        }
    }
    info!(
        "{} tables: {completed} completed, {failed} failed",
        records.len()
    );
    Ok(())
}
