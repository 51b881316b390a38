//! catalogsync worker - runs catalog imports and sync-queue drains against
//! Postgres.

mod csv_input;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;

use catalogsync_catalog::{check_headers, validate_batch};
use catalogsync_core::JobId;
use catalogsync_infra::db;
use catalogsync_infra::jobs::{JobFilter, JobKind, JobStatus, JobStore};
use catalogsync_infra::{
    DatabaseConfig, Engine, EngineConfig, PostgresCatalogStore, PostgresJobStore, PostgresSyncQueue, RunSummary,
};
use catalogsync_observability::LogFormat;

type PgEngine = Engine<PostgresJobStore, PostgresCatalogStore, PostgresSyncQueue>;

#[derive(Parser, Debug)]
#[command(name = "catalogsync-worker")]
#[command(author, version, about = "Catalog import and sync worker")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log output format (json or pretty)
    #[arg(long, env = "CATALOGSYNC_LOG_FORMAT", global = true)]
    log_format: Option<LogFormat>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Check a CSV file without touching storage
    Validate {
        file: PathBuf,
    },

    /// Import a CSV file as a new job
    Import {
        file: PathBuf,

        /// Refuse to start if pre-flight validation finds any error
        #[arg(long)]
        strict: bool,

        #[arg(long)]
        created_by: Option<String>,
    },

    /// Continue an interrupted import from where it stopped
    Resume {
        job_id: JobId,
        /// The file the job was submitted with
        file: PathBuf,
    },

    /// Re-attempt the retryable failures of a finished import
    Retry {
        job_id: JobId,
        file: PathBuf,
    },

    /// Drain the sync queue
    Sync {
        /// Process one batch and exit
        #[arg(long)]
        once: bool,

        /// Entries per batch (defaults to CATALOGSYNC_SYNC_BATCH_LIMIT)
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show one job, or list recent jobs
    Status {
        job_id: Option<JobId>,

        #[arg(long)]
        kind: Option<JobKind>,

        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    catalogsync_observability::init_with(cli.log_format.unwrap_or_default());

    match cli.command {
        // Validation needs no database.
        Command::Validate { file } => validate(&file),
        command => run(command).await,
    }
}

async fn run(command: Command) -> Result<()> {
    let config = EngineConfig::from_env()?;
    let engine = connect(config.clone()).await?;

    match command {
        Command::Validate { file } => validate(&file),
        Command::Import {
            file,
            strict,
            created_by,
        } => import(&engine, &file, strict, created_by).await,
        Command::Resume { job_id, file } => {
            let input = csv_input::read_path(&file)?;
            let summary = interruptible(&engine, job_id, engine.resume_import(job_id, input.rows)).await?;
            print_json(&summary)
        }
        Command::Retry { job_id, file } => {
            let input = csv_input::read_path(&file)?;
            let summary = engine.retry_failed(job_id, input.rows).await?;
            print_json(&summary)
        }
        Command::Sync { once, limit } => sync(&engine, &config, once, limit).await,
        Command::Status {
            job_id,
            kind,
            status,
            limit,
        } => match job_id {
            Some(job_id) => print_json(&engine.job_report(job_id).await?),
            None => {
                let jobs = engine
                    .jobs()
                    .list_jobs(JobFilter {
                        kind,
                        status,
                        limit: Some(limit),
                    })
                    .await?;
                print_json(&jobs)
            }
        },
    }
}

async fn connect(config: EngineConfig) -> Result<PgEngine> {
    let db_config = DatabaseConfig::from_env()?;
    let pool = db::connect(&db_config)
        .await
        .context("cannot connect to the database")?;
    db::ensure_schema(&pool).await?;
    info!(max_connections = db_config.max_connections, "database ready");

    let engine = Engine::new(
        std::sync::Arc::new(PostgresJobStore::new(pool.clone())),
        PostgresCatalogStore::new(pool.clone()),
        PostgresSyncQueue::new(pool),
        config,
    )?;
    Ok(engine)
}

fn validate(file: &Path) -> Result<()> {
    let input = csv_input::read_path(file)?;
    let report = validate_batch(input.headers.as_slice(), &input.rows);
    print_json(&report)?;
    if !report.is_valid {
        bail!("{} has {} validation error(s)", file.display(), report.errors.len());
    }
    Ok(())
}

async fn import(engine: &PgEngine, file: &Path, strict: bool, created_by: Option<String>) -> Result<()> {
    let input = csv_input::read_path(file)?;

    let headers = check_headers(input.headers.as_slice());
    if !headers.is_complete() {
        let missing: Vec<&str> = headers.missing_required.iter().map(|f| f.header()).collect();
        bail!("missing required column(s): {}", missing.join(", "));
    }
    if strict {
        let report = validate_batch(input.headers.as_slice(), &input.rows);
        if !report.is_valid {
            print_json(&report)?;
            bail!("validation failed; nothing imported");
        }
    }

    let job = engine.submit_import(&input.rows, created_by).await?;
    info!(job_id = %job.id, uuid = %job.uuid, rows = input.rows.len(), "import started");
    let summary = interruptible(engine, job.id, engine.run_import(job.id, input.rows)).await?;
    print_json(&summary)
}

/// Run `work`, cancelling the job on Ctrl-C and waiting for it to stop.
async fn interruptible<F>(engine: &PgEngine, job_id: JobId, work: F) -> Result<RunSummary>
where
    F: std::future::Future<Output = Result<RunSummary, catalogsync_infra::EngineError>>,
{
    tokio::pin!(work);
    let summary = tokio::select! {
        result = &mut work => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!(job_id = %job_id, "interrupt received; cancelling job");
            if let Err(e) = engine.cancel(job_id) {
                tracing::warn!(job_id = %job_id, error = %e, "cancel failed");
            }
            work.await?
        }
    };
    Ok(summary)
}

async fn sync(engine: &PgEngine, config: &EngineConfig, once: bool, limit: Option<usize>) -> Result<()> {
    let limit = limit.unwrap_or(config.sync_batch_limit);
    loop {
        match engine.run_sync(limit, Some("sync-worker".to_string())).await? {
            Some(summary) => {
                info!(
                    job_id = %summary.job.id,
                    succeeded = summary.counters.succeeded,
                    failed = summary.counters.failed,
                    "sync batch finished"
                );
                if once {
                    return print_json(&summary);
                }
            }
            None if once => {
                info!("sync queue is empty");
                return Ok(());
            }
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(config.sync_poll_interval) => {}
                    _ = tokio::signal::ctrl_c() => {
                        info!("interrupt received; stopping sync worker");
                        return Ok(());
                    }
                }
            }
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
