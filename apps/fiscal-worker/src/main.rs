//! # fiscal-worker
//!
//! Command-line entry point of the fiscal pipeline.
//!
//! ```text
//! fiscal-worker [--config fiscal.toml] run-batch [--max 10]
//! fiscal-worker enqueue <sale_id> [--priority high|normal|low]
//! fiscal-worker status <sale_id>
//! fiscal-worker health
//! ```
//!
//! Every command prints one JSON document on stdout; logs go to stderr.
//! `health` exits non-zero when the authority or the database is down.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use titan_core::JobPriority;
use titan_db::Database;
use titan_fiscal::{FiscalConfig, FiscalService};

/// Titan fiscal worker - issues authority invoices for completed sales
#[derive(Parser)]
#[command(name = "fiscal-worker")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to fiscal.toml (defaults to the platform config directory)
    #[arg(long, env = "TITAN_FISCAL_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process one batch of due jobs
    RunBatch {
        /// Maximum jobs to process (defaults to queue.batch_size)
        #[arg(long)]
        max: Option<u32>,
    },
    /// Schedule a completed sale for invoicing
    Enqueue {
        sale_id: String,

        #[arg(long, default_value = "normal")]
        priority: JobPriority,
    },
    /// Show the fiscal status of a sale
    Status { sale_id: String },
    /// Check the authority, the connection pool and the database
    Health,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing();

    let config = FiscalConfig::load(cli.config.clone()).context("loading fiscal config")?;
    let db = Database::new(config.database.to_db_config())
        .await
        .context("opening database")?;
    let service = FiscalService::from_config(&config, db)
        .await
        .context("starting fiscal service")?;

    let code = match cli.command {
        Command::RunBatch { max } => {
            let report = service.run_batch(max).await?;
            print_json(&report)?;
            ExitCode::SUCCESS
        }
        Command::Enqueue { sale_id, priority } => {
            let ticket = service.enqueue(&sale_id, priority).await?;
            print_json(&ticket)?;
            ExitCode::SUCCESS
        }
        Command::Status { sale_id } => {
            let view = service.status(&sale_id).await?;
            print_json(&view)?;
            ExitCode::SUCCESS
        }
        Command::Health => {
            let health = service.health().await;
            print_json(&health)?;
            if health.is_healthy() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
    };

    service.database().close().await;
    info!("Fiscal worker finished");
    Ok(code)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,titan=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
