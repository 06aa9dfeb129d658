//! CLI command definitions and dispatch.
//!
//! The binary is an operations tool over a running queue: inspect state,
//! remove or clear queued work, and run a worker loop. Handler execution
//! requires embedding the library; the `run-workers` command starts a
//! worker with an empty registry, which still drives the delayed-task
//! promoter and the reaper.

use clap::Parser;
use tracing::warn;

use crate::config::{QueueConfig, DEFAULT_STREAM_TIMEOUT};
use crate::engine::TaskQueue;

/// Redis-backed distributed task queue for ML inference workers.
#[derive(Parser)]
#[command(name = "taskforge")]
#[command(about = "Operate a Redis-backed distributed task queue")]
#[command(version)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis host.
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Redis port.
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Redis logical database index.
    #[arg(long, global = true)]
    pub db: Option<i64>,

    /// Redis password.
    #[arg(long, global = true)]
    pub password: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Show queue, processing, delayed, and worker counts.
    Status,

    /// List every task waiting in the main queue.
    #[command(name = "list-queued")]
    ListQueued,

    /// Remove a queued task by id.
    #[command(name = "remove-task")]
    RemoveTask {
        /// Id of the task to remove.
        task_id: String,
    },

    /// Delete the main queue and the queued-index.
    #[command(name = "clear-queue")]
    ClearQueue,

    /// Run a worker loop until interrupted.
    #[command(name = "run-workers")]
    RunWorkers {
        /// Advisory worker count; one cooperative loop runs per process.
        #[arg(long, default_value_t = 1)]
        workers: usize,
    },

    /// Wait for one task's result and print it.
    Result {
        /// Id of the task to wait for.
        task_id: String,

        /// Wait budget in seconds.
        #[arg(long, default_value_t = DEFAULT_STREAM_TIMEOUT.as_secs())]
        timeout: u64,
    },
}

/// Parses command-line arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses arguments and runs the selected command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Runs the selected command with pre-parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = build_config(&cli)?;
    let engine = TaskQueue::connect(config).await?;

    match cli.command {
        Commands::Status => {
            let queued = engine.store().queue_len().await?;
            let processing = engine.store().processing_members().await?.len();
            let delayed = engine.store().delayed_len().await?;
            let history = engine.history_count().await?;
            let workers = engine.workers().await?;

            println!("queued:     {queued}");
            println!("processing: {processing}");
            println!("delayed:    {delayed}");
            println!("history:    {history}");
            println!("workers:    {}", workers.len());
            for worker in workers {
                println!(
                    "  {} [{}] tasks: {}",
                    worker.worker_id,
                    worker.status,
                    worker.allowed_tasks.join(", ")
                );
            }
        }
        Commands::ListQueued => {
            let tasks = engine.all_queued().await?;
            if tasks.is_empty() {
                println!("queue is empty");
            }
            for task in tasks {
                println!(
                    "{}  {}  queued_at={}",
                    task.task_id,
                    task.task_name,
                    task.queued_at.map(|t| t.to_string()).unwrap_or_default()
                );
            }
        }
        Commands::RemoveTask { task_id } => {
            if engine.remove_from_queue(&task_id).await? {
                println!("removed {task_id}");
            } else {
                println!("{task_id} not found in queue");
            }
        }
        Commands::ClearQueue => {
            engine.delete_queue().await?;
            println!("queue cleared");
        }
        Commands::RunWorkers { workers } => {
            warn!("No handlers are registered in the CLI worker; tasks will be pushed back");
            let handle = engine.start_workers(workers);
            tokio::signal::ctrl_c().await?;
            println!("shutting down");
            handle.shutdown().await;
        }
        Commands::Result { task_id, timeout } => {
            let value = engine
                .wait_result(&task_id, std::time::Duration::from_secs(timeout))
                .await?;
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
    }

    Ok(())
}

fn build_config(cli: &Cli) -> anyhow::Result<QueueConfig> {
    let mut config = QueueConfig::from_env()?;
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(db) = cli.db {
        config.db = db;
    }
    if let Some(password) = &cli.password {
        config.password = Some(password.clone());
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_subcommands() {
        let cli = Cli::try_parse_from(["taskforge", "status"]).expect("parse");
        assert!(matches!(cli.command, Commands::Status));
        assert_eq!(cli.log_level, "info");

        let cli = Cli::try_parse_from(["taskforge", "remove-task", "abc-123"]).expect("parse");
        match cli.command {
            Commands::RemoveTask { task_id } => assert_eq!(task_id, "abc-123"),
            _ => panic!("expected remove-task"),
        }

        let cli =
            Cli::try_parse_from(["taskforge", "run-workers", "--workers", "4"]).expect("parse");
        match cli.command {
            Commands::RunWorkers { workers } => assert_eq!(workers, 4),
            _ => panic!("expected run-workers"),
        }
    }

    #[test]
    fn test_cli_connection_flags_are_global() {
        let cli = Cli::try_parse_from([
            "taskforge",
            "status",
            "--host",
            "redis.internal",
            "--port",
            "6380",
        ])
        .expect("parse");

        assert_eq!(cli.host.as_deref(), Some("redis.internal"));
        assert_eq!(cli.port, Some(6380));
        assert!(cli.db.is_none());
    }
}
