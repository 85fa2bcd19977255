//! Backup Worker - Main entry point
//!
//! One invocation runs at most one job for at most one time budget, then
//! exits. Cron (or the scheduler service) calls it again to continue.

use anyhow::Result;
use backup_engine::job::{JobType, NewJob};
use backup_engine::{utils, Config, Worker};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reap stale jobs and run the next runnable one
    RunNext,
    /// Run one job by id
    Run { id: i64 },
    /// Queue a new job
    Enqueue {
        /// backup, restore, download, reindex, retention-cleanup, ...
        job_type: JobType,
        target: String,
        /// Job parameters as a JSON object
        #[arg(long)]
        data: Option<String>,
    },
    /// Ask a job to stop
    Abort { id: i64 },
    /// Reset a job to pending with a fresh workspace
    StartOver { id: i64 },
    /// Show the most recent jobs
    List {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a job's log
    Log {
        id: i64,
        #[arg(long, default_value_t = 200)]
        limit: usize,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, config.log.file.as_deref())?;

    tracing::debug!(
        "backup-worker v{} (worker_id: {})",
        env!("CARGO_PKG_VERSION"),
        config.worker.id
    );

    let worker = Worker::open(config)?;
    let queue = worker.queue();

    match args.command {
        Command::RunNext => print_json(&worker.run_next()?)?,
        Command::Run { id } => print_json(&worker.run_job(id)?)?,
        Command::Enqueue { job_type, target, data } => {
            let item_data = match data {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::json!({}),
            };
            let job = queue.enqueue(NewJob { job_type, target_id: target, item_data })?;
            tracing::info!(job_id = job.id, "Queued {} job for {}", job.job_type, job.target_id);
            print_json(&job)?;
        }
        Command::Abort { id } => print_json(&queue.abort(id)?)?,
        Command::StartOver { id } => print_json(&queue.start_over(id)?)?,
        Command::List { limit } => print_json(&queue.list(limit)?)?,
        Command::Log { id, limit } => print_json(&queue.logs(id, limit)?)?,
    }

    Ok(())
}
