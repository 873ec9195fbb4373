//! CLI commands implementation.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use console::style;

use crate::jobs::{enqueue_job, job_store_options, summarize_jobs, CommandHandler, Job};
use crate::store::{run_migrations, AsyncSqlitePool, MetricsRegistry, Store};
use crate::worker::{Resetter, Worker, WorkerOptions};

const JOBS_QUEUE: &str = "jobs";

#[derive(Parser)]
#[command(name = "taskmill")]
#[command(about = "Relational-database-backed distributed work queue")]
#[command(version)]
pub struct Cli {
    /// Path to the SQLite database
    #[arg(long, global = true, env = "TASKMILL_DATABASE", default_value = "taskmill.sqlite3")]
    database: String,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Check if verbose mode is enabled (for early logging setup).
pub fn is_verbose() -> bool {
    std::env::args().any(|arg| arg == "-v" || arg == "--verbose")
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database
    Init,

    /// Enqueue a shell command as a job
    Enqueue {
        /// Shell command to run
        command: String,
        /// Delay processing by this many seconds
        #[arg(short, long)]
        delay: Option<u64>,
    },

    /// Show queue status
    Status,

    /// Run a worker pool against the jobs queue
    Work {
        /// Number of concurrent handlers
        #[arg(short = 'n', long, default_value = "4")]
        handlers: usize,
        /// Poll interval in milliseconds when the queue is empty
        #[arg(long, default_value = "1000")]
        interval_ms: u64,
        /// Heartbeat interval in seconds
        #[arg(long, default_value = "5")]
        heartbeat_secs: u64,
        /// Fail a job that runs longer than this many seconds
        #[arg(long)]
        max_runtime_secs: Option<u64>,
        /// Interval between stalled-record sweeps in seconds
        #[arg(long, default_value = "30")]
        reset_interval_secs: u64,
    },

    /// Requeue or fail stalled jobs once and exit
    Reset,
}

/// Run the CLI.
pub async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init(&cli.database).await,
        Commands::Enqueue { command, delay } => cmd_enqueue(&cli.database, &command, delay).await,
        Commands::Status => cmd_status(&cli.database).await,
        Commands::Work {
            handlers,
            interval_ms,
            heartbeat_secs,
            max_runtime_secs,
            reset_interval_secs,
        } => {
            cmd_work(
                &cli.database,
                handlers,
                Duration::from_millis(interval_ms),
                Duration::from_secs(heartbeat_secs),
                max_runtime_secs.map(Duration::from_secs),
                Duration::from_secs(reset_interval_secs),
            )
            .await
        }
        Commands::Reset => cmd_reset(&cli.database).await,
    }
}

fn open_store(database: &str) -> anyhow::Result<(AsyncSqlitePool, Arc<Store<Job>>)> {
    let pool = AsyncSqlitePool::new(database);
    let store = Store::new(pool.clone(), job_store_options(JOBS_QUEUE), &MetricsRegistry::new())?;
    Ok((pool, Arc::new(store)))
}

async fn cmd_init(database: &str) -> anyhow::Result<()> {
    let pool = AsyncSqlitePool::new(database);
    run_migrations(pool.database_url()).await?;
    println!("{} Database initialized: {}", style("✓").green(), database);
    Ok(())
}

async fn cmd_enqueue(database: &str, command: &str, delay: Option<u64>) -> anyhow::Result<()> {
    let pool = AsyncSqlitePool::new(database);
    let process_after =
        delay.map(|secs| chrono::Utc::now() + chrono::Duration::seconds(secs as i64));
    let id = enqueue_job(&pool, command, process_after).await?;
    println!("{} Enqueued job {}", style("✓").green(), id);
    Ok(())
}

async fn cmd_status(database: &str) -> anyhow::Result<()> {
    let (pool, store) = open_store(database)?;
    let summary = summarize_jobs(&pool).await?;
    let dequeuable = store.queued_count(false, &[]).await?;
    let oldest = store.max_duration_in_queue().await?;

    println!("{} Queue status", style("→").cyan());
    println!("  queued:     {}", summary.queued);
    println!("  processing: {}", summary.processing);
    println!("  errored:    {}", summary.errored);
    println!("  failed:     {}", summary.failed);
    println!("  completed:  {}", summary.completed);
    println!("  canceled:   {}", summary.canceled);
    println!("  dequeuable now: {}", dequeuable);
    println!("  oldest waiting: {}s", oldest.as_secs());
    Ok(())
}

async fn cmd_work(
    database: &str,
    handlers: usize,
    interval: Duration,
    heartbeat_interval: Duration,
    maximum_runtime: Option<Duration>,
    reset_interval: Duration,
) -> anyhow::Result<()> {
    let (_pool, store) = open_store(database)?;

    let mut options = WorkerOptions::new("taskmill-worker");
    options.num_handlers = handlers;
    options.interval = interval;
    options.heartbeat_interval = heartbeat_interval;
    options.maximum_runtime_per_job = maximum_runtime;

    let handler = Arc::new(CommandHandler::new(
        store.clone(),
        options.worker_hostname.clone(),
    ));
    let worker = Worker::new(store.clone(), handler, options).start();
    let resetter = Resetter::new(store.clone(), reset_interval).start();

    println!(
        "{} Worker running with {} handlers (Ctrl-C to stop)",
        style("→").cyan(),
        handlers
    );
    tokio::signal::ctrl_c().await?;
    println!("\n{} Shutting down...", style("→").cyan());

    worker.stop().await;
    resetter.stop().await;
    println!("{} Stopped", style("✓").green());
    Ok(())
}

async fn cmd_reset(database: &str) -> anyhow::Result<()> {
    let (_pool, store) = open_store(database)?;
    let (reset, failed) = store.reset_stalled().await?;

    println!("{} Stalled-record sweep", style("→").cyan());
    println!("  requeued: {}", reset.len());
    println!("  failed:   {}", failed.len());
    for (id, age) in reset {
        println!("  job {} requeued after {}s without heartbeat", id, age.as_secs());
    }
    for (id, age) in failed {
        println!("  job {} failed after {}s without heartbeat", id, age.as_secs());
    }
    Ok(())
}
