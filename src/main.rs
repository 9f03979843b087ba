//! # Tablift — ETL task scheduler
//!
//! Polls the task table for due cron schedules, queues executions through a
//! durable dispatch queue, and runs them against the external ETL engine
//! with a worker pool.
//!
//! Usage:
//!   tablift                                  # Run the scheduler daemon
//!   tablift --add-task nightly --cron "0 2 * * *"
//!   tablift --trigger 3                      # Queue a manual run of task 3
//!   tablift --list-tasks
//!   tablift --status

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use tablift_core::TabliftConfig;
use tablift_scheduler::poller::spawn_poller;
use tablift_scheduler::worker::WorkerPool;
use tablift_scheduler::{
    DispatchQueue, EngineRunner, ExecStatus, PipelineDb, Poller, QueueMonitor, Schedule, Store,
    Task, TemplateGenerator, TriggerType,
};

#[derive(Parser)]
#[command(name = "tablift", version, about = "Tablift — ETL task scheduler")]
struct Cli {
    /// Config file (default: ~/.tablift/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Database path (default: ~/.tablift/tablift.db)
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Create a task and exit (requires --cron unless manual-only)
    #[arg(long, value_name = "NAME")]
    add_task: Option<String>,

    /// Cron expression for --add-task (5 or 6 fields)
    #[arg(long, default_value = "")]
    cron: String,

    /// Source descriptor JSON for --add-task
    #[arg(long)]
    source: Option<String>,

    /// Target descriptor JSON for --add-task
    #[arg(long)]
    target: Option<String>,

    /// Queue a manual run of the given task id and exit
    #[arg(long, value_name = "TASK_ID")]
    trigger: Option<i64>,

    /// List tasks and exit
    #[arg(long)]
    list_tasks: bool,

    /// Show queue depth and execution counts and exit
    #[arg(long)]
    status: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        "tablift=debug,tablift_scheduler=debug"
    } else {
        "tablift=info,tablift_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config = match &cli.config {
        Some(path) => TabliftConfig::load_from(path)?,
        None => TabliftConfig::load()?,
    };

    let db_path = cli
        .db_path
        .clone()
        .unwrap_or_else(TabliftConfig::default_db_path);
    let db = PipelineDb::open(&db_path)?;
    let store = Store::new(&db);
    let queue = DispatchQueue::new(&db);

    if let Some(name) = &cli.add_task {
        if !cli.cron.is_empty() {
            // Reject unparseable schedules up front instead of at poll time.
            Schedule::parse(&cli.cron).map_err(|e| anyhow::anyhow!("{e}"))?;
        }
        let mut task = Task::new(name, &cli.cron);
        if let Some(source) = &cli.source {
            task.source = serde_json::from_str(source)?;
        }
        if let Some(target) = &cli.target {
            task.target = serde_json::from_str(target)?;
        }
        let id = store.create_task(&task).await?;
        println!("Created task {id} ('{name}')");
        return Ok(());
    }

    if cli.list_tasks {
        for task in store.list_tasks().await? {
            let next = task
                .next_fire
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into());
            println!(
                "{:>4}  {:<24} {:<16} {:<12} next: {}",
                task.id,
                task.name,
                if task.cron_expression.is_empty() {
                    "(manual)"
                } else {
                    &task.cron_expression
                },
                task.status.code(),
                next
            );
        }
        return Ok(());
    }

    if cli.status {
        let waiting = store.executions_by_status(ExecStatus::Waiting).await?.len();
        let running = store.executions_by_status(ExecStatus::Running).await?.len();
        println!("Queue depth : {}", queue.len().await?);
        println!("Waiting     : {waiting}");
        println!("Running     : {running}");
        return Ok(());
    }

    if let Some(task_id) = cli.trigger {
        let monitor = Arc::new(QueueMonitor::new());
        let poller = Poller::new(
            store.clone(),
            queue.clone(),
            monitor,
            Arc::new(TemplateGenerator),
            config.scheduler.reconcile_after_secs,
        );
        let execution_id = poller.trigger(task_id, TriggerType::Manual).await?;
        println!("Queued execution {execution_id} for task {task_id}");
        return Ok(());
    }

    // Daemon mode.
    tracing::info!("Tablift v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Database: {}", db_path.display());
    tracing::info!("Engine home: {}", config.engine.home);

    let monitor = Arc::new(QueueMonitor::new());
    let runner = EngineRunner::new(&config.engine);
    if !runner.home_exists() {
        tracing::warn!(
            "Engine home {} does not exist; executions will fail pre-flight",
            config.engine.home
        );
    }

    let poller = Arc::new(Poller::new(
        store.clone(),
        queue.clone(),
        monitor.clone(),
        Arc::new(TemplateGenerator),
        config.scheduler.reconcile_after_secs,
    ));
    let pool = WorkerPool::new(
        store.clone(),
        queue.clone(),
        monitor.clone(),
        runner,
        TabliftConfig::home_dir().join("logs"),
        &config.scheduler,
    );

    // Backfill next-fire bookkeeping before the first poll.
    poller.run_init_scan().await;

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let poller_handle = spawn_poller(poller, &config.scheduler, shutdown_rx.clone());
    let worker_handles = pool.spawn(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested, draining workers");
    shutdown_tx.send(true)?;

    let _ = poller_handle.await;
    pool.join(worker_handles).await;
    tracing::info!("Stopped");
    Ok(())
}
