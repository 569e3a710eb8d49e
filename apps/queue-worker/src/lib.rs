//! Queue Worker Service
//!
//! Runs jobs from the configured queue connection and gives operators
//! commands to inspect queues and manage failed jobs.
//!
//! ## Architecture
//!
//! ```text
//! QUEUE_CONNECTION (memory | database | redis | amqp | jetstream)
//!   ↓ pop (queues polled in priority order)
//! Worker (middleware, timeout, retries, backoff)
//!   ↓ success → ack        failure → retry or failed-job store
//! HandlerRegistry (job_type → handler)
//! ```
//!
//! Unique-job locks, overlap locks, rate-limit counters and cancellation
//! flags live in the store chosen by `QUEUE_LOCK_STORE` (Redis whenever
//! `REDIS_URL` is set). Every worker and dispatcher of the process shares it.
//!
//! ## Commands
//!
//! - `work`: process jobs until a signal or a configured limit
//! - `size` / `clear`: inspect or empty a queue
//! - `push`: enqueue a job from the command line
//! - `failed list|retry|forget|flush`: manage permanently failed jobs

pub mod jobs;

use axum::Router;
use clap::{Parser, Subcommand};
use core_config::server::ServerConfig;
use core_config::{Environment, FromEnv};
use eyre::{Result, WrapErr, bail};
use queue_worker::{
    BrokerPool, HandlerRegistry, HealthState, Job, LockStore, LockStoreConfig, QueueBackend, QueueConnectionConfig,
    QueueManager, Worker, WorkerOptions, health_router, init_metrics,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(name = "queue-worker")]
#[command(about = "Process queued jobs and manage failed jobs")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Process jobs until stopped
    Work {
        /// Queues to poll, highest priority first. Defaults to QUEUE_NAMES.
        #[arg(short, long, value_delimiter = ',')]
        queues: Option<Vec<String>>,

        /// Process a single job and exit
        #[arg(long)]
        once: bool,

        /// Exit once every queue is empty
        #[arg(long)]
        stop_when_empty: bool,

        /// Exit after this many jobs
        #[arg(long)]
        max_jobs: Option<u64>,

        /// Exit after this many seconds
        #[arg(long)]
        max_time: Option<u64>,

        /// Keep working while paused
        #[arg(long)]
        force: bool,
    },

    /// Show the number of jobs on a queue
    Size {
        /// Queue name. Defaults to the connection's default queue.
        queue: Option<String>,
    },

    /// Delete every job on a queue
    Clear {
        queue: Option<String>,

        /// Required in production
        #[arg(long)]
        force: bool,
    },

    /// Push a job
    Push {
        job_type: String,

        /// JSON payload
        #[arg(default_value = "{}")]
        payload: String,

        #[arg(short, long)]
        queue: Option<String>,

        /// Seconds before the job becomes available
        #[arg(long, default_value_t = 0)]
        delay: u64,

        #[arg(long)]
        tries: Option<u32>,

        #[arg(long, default_value_t = 0)]
        priority: i32,
    },

    /// Manage failed jobs
    Failed {
        #[command(subcommand)]
        command: FailedCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum FailedCommand {
    /// List failed jobs, newest first
    List,

    /// Push failed jobs back onto their queue (`all` for every record)
    Retry {
        #[arg(required = true)]
        ids: Vec<String>,
    },

    /// Delete a failed job record
    Forget { id: String },

    /// Delete every failed job record
    Flush,
}

/// Run the queue worker command line
///
/// Sets up env-aware logging, connects the backend selected by
/// `QUEUE_CONNECTION` and dispatches the sub-command.
pub async fn run(cli: Cli) -> Result<()> {
    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    let connection =
        QueueConnectionConfig::from_env().wrap_err("Failed to load queue connection configuration")?;
    let pool = BrokerPool::new();
    info!(driver = connection.driver(), "Connecting queue backend");
    let backend = connection
        .connect(&pool)
        .await
        .wrap_err_with(|| format!("Failed to connect {} queue backend", connection.driver()))?;

    let lock_config = LockStoreConfig::from_env().wrap_err("Failed to load lock store configuration")?;
    if !lock_config.is_shared() && connection.driver() != "memory" {
        warn!(
            driver = connection.driver(),
            "Locks are process-local; unique jobs, overlap locks and rate limits are not shared with other workers"
        );
    }
    let locks = lock_config
        .connect()
        .await
        .wrap_err_with(|| format!("Failed to connect {} lock store", lock_config.driver()))?;

    match cli.command {
        Commands::Work {
            queues,
            once,
            stop_when_empty,
            max_jobs,
            max_time,
            force,
        } => {
            let mut options = WorkerOptions::from_env().wrap_err("Failed to load worker configuration")?;
            if let Some(queues) = queues {
                options = options.with_queues(queues);
            }
            if let Some(max_jobs) = max_jobs {
                options = options.with_max_jobs(max_jobs);
            }
            if let Some(max_time) = max_time {
                options = options.with_max_time(Duration::from_secs(max_time));
            }
            let stop_when_empty = stop_when_empty || options.stop_when_empty;
            options = options.with_stop_when_empty(stop_when_empty).with_force(force);

            if once {
                let worker = build_worker(backend, locks, jobs::registry(), options);
                let ran = worker.run_next_job().await;
                info!(ran, "Single job run finished");
                return Ok(());
            }
            work(backend, locks, jobs::registry(), options).await
        }
        Commands::Size { queue } => {
            let size = backend.size(queue.as_deref()).await?;
            println!("{size}");
            Ok(())
        }
        Commands::Clear { queue, force } => {
            if environment.is_production() && !force {
                bail!("Refusing to clear a queue in production without --force");
            }
            let queue = queue.as_deref().unwrap_or(backend.default_queue()).to_string();
            let removed = backend.clear(Some(&queue)).await?;
            info!(queue = %queue, removed, "Cleared queue");
            println!("Cleared {removed} jobs from [{queue}]");
            Ok(())
        }
        Commands::Push {
            job_type,
            payload,
            queue,
            delay,
            tries,
            priority,
        } => {
            let job = build_job(&job_type, &payload, queue, delay, tries, priority)?;
            let manager = QueueManager::new(backend).with_lock_store(locks);
            match manager.dispatch(&job).await? {
                Some(id) => println!("{id}"),
                None => warn!(job_type = %job_type, "Job was not queued"),
            }
            Ok(())
        }
        Commands::Failed { command } => failed(backend.as_ref(), command).await,
    }
}

/// Worker that keeps its locks in `locks`
pub fn build_worker(
    backend: Arc<dyn QueueBackend>,
    locks: Arc<dyn LockStore>,
    registry: HandlerRegistry,
    options: WorkerOptions,
) -> Worker {
    Worker::new(backend, registry, options).with_lock_store(locks)
}

/// Run a worker with health endpoints until a signal or a configured limit
/// stops it.
pub async fn work(
    backend: Arc<dyn QueueBackend>,
    locks: Arc<dyn LockStore>,
    registry: HandlerRegistry,
    options: WorkerOptions,
) -> Result<()> {
    init_metrics().wrap_err("Failed to install Prometheus recorder")?;

    let server = ServerConfig::from_env().wrap_err("Failed to load health server configuration")?;
    let health_state = HealthState::new(
        Arc::clone(&backend),
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        options.queues.clone(),
    );
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, server).await {
            error!(error = %e, "Health server failed");
        }
    });

    let worker = build_worker(backend, locks, registry, options);
    let handle = worker.handle();
    tokio::spawn(async move {
        if let Err(e) = shutdown_signal().await {
            error!("Error waiting for shutdown signal: {}", e);
        }
        handle.stop();
    });

    let reason = worker.run().await;
    info!(reason = reason.as_str(), processed = worker.processed(), "Queue worker stopped");
    Ok(())
}

/// Serve `/health`, `/ready` and `/metrics`
async fn start_health_server(health_state: HealthState, server: ServerConfig) -> Result<()> {
    let app: Router = health_router(health_state);

    let addr = server.address();
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(addr = %addr, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = signal::ctrl_c();

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .wrap_err("Failed to install SIGTERM handler")?;

    #[cfg(unix)]
    let terminate = terminate.recv();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Option<()>>();

    tokio::select! {
        result = ctrl_c => {
            result.wrap_err("Failed to listen for Ctrl+C")?;
            info!("Received Ctrl+C, finishing the current job before shutdown...");
        },
        _ = terminate => {
            info!("Received SIGTERM, finishing the current job before shutdown...");
        },
    }

    Ok(())
}

fn build_job(
    job_type: &str,
    payload: &str,
    queue: Option<String>,
    delay: u64,
    tries: Option<u32>,
    priority: i32,
) -> Result<Job> {
    let payload: serde_json::Value = serde_json::from_str(payload).wrap_err("Payload is not valid JSON")?;
    let mut job = Job::raw(job_type, payload).delay(delay).priority(priority);
    if let Some(queue) = queue {
        job = job.on_queue(queue);
    }
    if let Some(tries) = tries {
        job = job.tries(tries);
    }
    Ok(job)
}

async fn failed(backend: &dyn QueueBackend, command: FailedCommand) -> Result<()> {
    let store = backend.failed_store();
    match command {
        FailedCommand::List => {
            let records = store.all().await?;
            if records.is_empty() {
                println!("No failed jobs");
            }
            for record in records {
                println!(
                    "{}  {}  {}/{}  {}  {}",
                    record.id,
                    record.failed_at.to_rfc3339(),
                    record.connection,
                    record.queue,
                    record.job_id,
                    record.summary()
                );
            }
        }
        FailedCommand::Retry { ids } => {
            let retried = retry_failed(backend, &ids).await?;
            println!("Retried {} failed jobs", retried.len());
        }
        FailedCommand::Forget { id } => {
            if !store.forget(&id).await? {
                bail!("No failed job matches id {id}");
            }
            println!("Deleted failed job {id}");
        }
        FailedCommand::Flush => {
            let removed = store.flush().await?;
            println!("Deleted {removed} failed jobs");
        }
    }
    Ok(())
}

/// Push failed jobs back onto the queue they failed on with their attempts
/// reset, then delete their records. Returns the ids of the pushed jobs.
pub async fn retry_failed(backend: &dyn QueueBackend, ids: &[String]) -> Result<Vec<String>> {
    let store = backend.failed_store();
    let records = if ids.iter().any(|id| id == "all") {
        store.all().await?
    } else {
        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            match store.find(id).await? {
                Some(record) => records.push(record),
                None => warn!(failed_id = %id, "No failed job matches id"),
            }
        }
        records
    };

    let mut pushed = Vec::with_capacity(records.len());
    for record in records {
        let job = record
            .retryable_job()
            .wrap_err_with(|| format!("Failed job {} has an unreadable payload", record.id))?;
        let id = backend.push(&job, Some(&record.queue)).await?;
        store.forget(&record.id).await?;
        info!(failed_id = %record.id, job_id = %id, queue = %record.queue, "Failed job pushed back");
        pushed.push(id);
    }
    Ok(pushed)
}
