//! CLI command definitions for taskforge.
//!
//! Provides commands for running a worker host, enqueuing tasks, and
//! inspecting or administering the queue.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::info;

use crate::coordinator::{HostConfig, HttpTaskSource, SourceIngest, WorkerHost};
use crate::scheduler::{NewTask, RetryPolicy, SchedulingStrategy, TaskStatus};
use crate::storage::{StoreConfig, TaskStore};
use crate::worker::WorkerRegistry;

/// Default queue database path.
const DEFAULT_DB: &str = "taskforge.db";

/// Embedded task queue and worker coordinator.
#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Persistent task queue with subprocess workers")]
#[command(version)]
#[command(
    long_about = "taskforge stores tasks in a single SQLite file, lets worker hosts claim them \
atomically, and routes each claimed task to a configured worker executable.\n\nExample usage:\n  \
taskforge enqueue scrape.page --params '{\"url\": \"https://example.com\"}'\n  \
taskforge run --config workers.yaml --concurrency 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the queue database file.
    #[arg(long, default_value = DEFAULT_DB, env = "TASKFORGE_DB", global = true)]
    pub db: PathBuf,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run a worker host: claim tasks and dispatch them to workers.
    Run(RunArgs),

    /// Enqueue a task.
    #[command(alias = "add")]
    Enqueue(EnqueueArgs),

    /// Show queue counts and registered hosts.
    Status,

    /// List tasks, optionally filtered by status.
    #[command(alias = "ls")]
    Tasks(TasksArgs),

    /// Show one task and its audit log.
    Show(ShowArgs),

    /// Cancel a queued task.
    Cancel(TaskIdArg),

    /// Requeue a dead task with a fresh retry budget.
    Requeue(TaskIdArg),

    /// Checkpoint the database and prune old log entries.
    Maintain(MaintainArgs),
}

/// Arguments for `taskforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Worker configuration file (YAML or JSON).
    #[arg(short, long)]
    pub config: PathBuf,

    /// Number of concurrent claim loops.
    #[arg(short = 'n', long, default_value_t = 4)]
    pub concurrency: usize,

    /// Scheduling strategy: fifo, lifo, priority, weighted-random.
    #[arg(short, long, default_value = "lifo")]
    pub strategy: String,

    /// Lease duration in seconds.
    #[arg(long, default_value_t = 60)]
    pub lease_seconds: u64,

    /// Heartbeat interval in seconds.
    #[arg(long, default_value_t = 15)]
    pub heartbeat_seconds: u64,

    /// Host identity; defaults to a generated id.
    #[arg(long)]
    pub host_id: Option<String>,

    /// Base URL of an external task source to mirror into the queue.
    #[arg(long)]
    pub source_url: Option<String>,

    /// Poll interval for the external source in seconds.
    #[arg(long, default_value_t = 5)]
    pub source_poll_seconds: u64,
}

/// Arguments for `taskforge enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Task type; must match a worker's task_types to be processed.
    pub task_type: String,

    /// JSON payload for the task.
    #[arg(short, long, default_value = "{}")]
    pub params: String,

    /// Priority; lower values are served first under the priority strategy.
    #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
    pub priority: i32,

    /// Retry budget.
    #[arg(long, default_value_t = 3)]
    pub max_attempts: u32,

    /// Delay before the task becomes claimable, in seconds.
    #[arg(long)]
    pub delay_seconds: Option<u64>,

    /// Idempotency key; repeated enqueues with the same key store one task.
    #[arg(short, long)]
    pub key: Option<String>,
}

/// Arguments for `taskforge tasks`.
#[derive(Parser, Debug)]
pub struct TasksArgs {
    /// Filter by status: queued, leased, succeeded, failed, dead.
    #[arg(short, long)]
    pub status: Option<String>,

    /// Maximum number of rows.
    #[arg(long, default_value_t = 20)]
    pub limit: i64,

    /// Output JSON instead of a table.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `taskforge show`.
#[derive(Parser, Debug)]
pub struct ShowArgs {
    /// Task id.
    pub id: i64,

    /// Output JSON instead of text.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// A single task id argument.
#[derive(Parser, Debug)]
pub struct TaskIdArg {
    /// Task id.
    pub id: i64,
}

/// Arguments for `taskforge maintain`.
#[derive(Parser, Debug)]
pub struct MaintainArgs {
    /// Delete log entries older than this many days.
    #[arg(long, default_value_t = 7)]
    pub prune_days: u64,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before
/// running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let store = TaskStore::open(&cli.db, StoreConfig::default())
        .await
        .with_context(|| format!("opening task store at {}", cli.db.display()))?;

    match cli.command {
        Commands::Run(args) => run_host_command(store, args).await,
        Commands::Enqueue(args) => run_enqueue_command(store, args).await,
        Commands::Status => run_status_command(store).await,
        Commands::Tasks(args) => run_tasks_command(store, args).await,
        Commands::Show(args) => run_show_command(store, args).await,
        Commands::Cancel(args) => {
            store.cancel(args.id).await?;
            println!("task {} cancelled", args.id);
            Ok(())
        }
        Commands::Requeue(args) => {
            store.requeue_dead(args.id).await?;
            println!("task {} requeued", args.id);
            Ok(())
        }
        Commands::Maintain(args) => run_maintain_command(store, args).await,
    }
}

async fn run_host_command(store: TaskStore, args: RunArgs) -> anyhow::Result<()> {
    let registry = WorkerRegistry::load(&args.config)
        .with_context(|| format!("loading worker config from {}", args.config.display()))?;
    let strategy = SchedulingStrategy::from_str(&args.strategy)?;

    let mut host_config = HostConfig::new(args.concurrency)
        .with_strategy(strategy)
        .with_lease_duration(Duration::from_secs(args.lease_seconds))
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_seconds));
    if let Some(host_id) = args.host_id {
        host_config = host_config.with_host_id(host_id);
    }

    let mut host = WorkerHost::new(host_config, store.clone(), registry, RetryPolicy::default());

    let ingest = match args.source_url {
        Some(url) => {
            let source = HttpTaskSource::new(url, Duration::from_secs(30))?;
            Some(tokio::spawn(
                SourceIngest::new(
                    store,
                    Arc::new(source),
                    Duration::from_secs(args.source_poll_seconds),
                    host.shutdown_signal(),
                )
                .run(),
            ))
        }
        None => None,
    };

    host.start().await?;

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutdown signal received");

    host.shutdown().await?;
    if let Some(ingest) = ingest {
        let _ = ingest.await;
    }

    let stats = host.stats();
    println!(
        "processed {} task(s): {} succeeded, {} failed",
        stats.total_processed(),
        stats.tasks_succeeded,
        stats.tasks_failed
    );
    Ok(())
}

async fn run_enqueue_command(store: TaskStore, args: EnqueueArgs) -> anyhow::Result<()> {
    let params: serde_json::Value =
        serde_json::from_str(&args.params).context("parsing --params as JSON")?;

    let mut task = NewTask::new(&args.task_type, params)
        .with_priority(args.priority)
        .with_max_attempts(args.max_attempts);
    if let Some(delay) = args.delay_seconds {
        task = task.with_run_after(chrono::Utc::now() + chrono::Duration::seconds(delay as i64));
    }
    if let Some(key) = args.key {
        task = task.with_idempotency_key(key);
    }

    let enqueued = store.enqueue(task).await?;
    if enqueued.deduplicated {
        println!("task {} already enqueued (idempotency key match)", enqueued.id);
    } else {
        println!("task {} enqueued", enqueued.id);
    }
    Ok(())
}

async fn run_status_command(store: TaskStore) -> anyhow::Result<()> {
    let stats = store.stats().await?;
    println!("queued:    {}", stats.queued);
    println!("leased:    {}", stats.leased);
    println!("succeeded: {}", stats.succeeded);
    println!("failed:    {}", stats.failed);
    println!("dead:      {}", stats.dead);
    println!("total:     {}", stats.total());

    let workers = store.list_workers().await?;
    if !workers.is_empty() {
        let now = chrono::Utc::now();
        println!();
        println!("hosts:");
        for worker in workers {
            let liveness = if worker.is_dead(now, chrono::Duration::seconds(60)) {
                "  (dead?)"
            } else {
                ""
            };
            println!(
                "  {}  last heartbeat {}{}  [{}]",
                worker.worker_id,
                worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC"),
                liveness,
                worker.capabilities.join(", ")
            );
        }
    }
    Ok(())
}

async fn run_tasks_command(store: TaskStore, args: TasksArgs) -> anyhow::Result<()> {
    let status = match &args.status {
        Some(s) => Some(TaskStatus::from_str(s)?),
        None => None,
    };
    let tasks = store.list_tasks(status, args.limit).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    if tasks.is_empty() {
        println!("no tasks");
        return Ok(());
    }
    for task in tasks {
        println!(
            "{:>6}  {:<10}  {:<24}  prio {:>4}  attempts {}/{}",
            task.id,
            task.status.as_str(),
            task.task_type,
            task.priority,
            task.attempts,
            task.max_attempts
        );
    }
    Ok(())
}

async fn run_show_command(store: TaskStore, args: ShowArgs) -> anyhow::Result<()> {
    let task = store.task(args.id).await?;
    let log = store.task_log(args.id).await?;

    if args.json {
        let combined = serde_json::json!({ "task": task, "log": log });
        println!("{}", serde_json::to_string_pretty(&combined)?);
        return Ok(());
    }

    println!("task {}: {} [{}]", task.id, task.task_type, task.status);
    println!("  priority:     {}", task.priority);
    println!("  attempts:     {}/{}", task.attempts, task.max_attempts);
    println!("  params:       {}", task.params);
    if let Some(result) = &task.result {
        println!("  result:       {result}");
    }
    if let Some(error) = &task.last_error {
        println!("  last error:   {error}");
    }
    if let Some(locked_by) = &task.locked_by {
        println!("  locked by:    {locked_by}");
    }
    println!();
    println!("log:");
    for entry in log {
        println!(
            "  {}  {:<13}  {}",
            entry.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.event,
            entry.detail.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

async fn run_maintain_command(store: TaskStore, args: MaintainArgs) -> anyhow::Result<()> {
    if args.prune_days == 0 {
        bail!("--prune-days must be at least 1");
    }
    let pruned = store
        .prune_logs(chrono::Duration::days(args.prune_days as i64))
        .await?;
    store.checkpoint().await?;
    println!("pruned {pruned} log entries, checkpoint complete");
    Ok(())
}
