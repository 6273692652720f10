//! Flowtrail CLI
//!
//! Maintenance and inspection commands against a flowtrail SQLite database:
//! - Retention cleanup
//! - Per-process statistics
//! - Flow listings and log trails

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use flowtrail_core::{
    ConfigHandle, Configuration, FlowFilter, FlowStatus, FlowTrail, LogLevel, TrackingStore,
};
use flowtrail_store::SqliteStore;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

const DEFAULT_DATABASE_URL: &str = "sqlite://flowtrail.db?mode=rwc";

#[derive(Parser, Debug)]
#[command(name = "flowtrail")]
#[command(about = "Inspect and maintain a flowtrail tracking database")]
struct Args {
    #[command(subcommand)]
    command: Commands,

    /// Database URL
    #[arg(long, env = "FLOWTRAIL_DATABASE_URL", default_value = DEFAULT_DATABASE_URL)]
    database_url: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Delete flows older than the retention window
    Cleanup {
        /// Age in days (defaults to FLOWTRAIL_RETENTION_DAYS)
        #[arg(long)]
        days: Option<u32>,
    },
    /// Show execution statistics for one process
    Stats {
        /// Process identifier, e.g. Billing::InvoiceJob
        identifier: String,
    },
    /// List recent flows, newest first
    Flows {
        /// Only flows of this process identifier
        #[arg(long)]
        process: Option<String>,

        /// running, completed, failed or skipped
        #[arg(long)]
        status: Option<FlowStatus>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Print the log trail of one flow
    Logs {
        flow_id: Uuid,

        /// Minimum level: debug, info, warn or error
        #[arg(long)]
        level: Option<LogLevel>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("flowtrail_cli=info".parse()?)
                .add_directive("flowtrail_core=info".parse()?)
                .add_directive("flowtrail_store=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    // before parsing, so env-file values reach clap's `env` fallbacks
    if let Some(path) = flowtrail_core::load_environment() {
        debug!("Environment loaded from {}", path.display());
    }
    let args = Args::parse();

    let url = args.database_url;
    let store = Arc::new(
        SqliteStore::new(&url)
            .await
            .with_context(|| format!("Failed to open tracking database at {}", url))?,
    );
    let trail = FlowTrail::new(store.clone(), ConfigHandle::new(Configuration::from_env()));

    match args.command {
        Commands::Cleanup { days } => {
            let deleted = trail.cleanup(days).await?;
            info!("Cleanup removed {} flows", deleted);
            println!("{}", serde_json::json!({ "deleted_flows": deleted }));
        }
        Commands::Stats { identifier } => {
            let stats = trail
                .process_stats(&identifier)
                .await?
                .with_context(|| format!("Unknown process: {}", identifier))?;
            let mut report = serde_json::to_value(&stats)?;
            report["success_rate"] = serde_json::json!(stats.success_rate());
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Flows { process, status, limit } => {
            let mut filter = FlowFilter::default().with_limit(limit);
            if let Some(identifier) = process {
                let process = store
                    .get_process_by_identifier(&identifier)
                    .await?
                    .with_context(|| format!("Unknown process: {}", identifier))?;
                filter.process_id = Some(process.id);
            }
            if let Some(status) = status {
                filter = filter.with_status(status);
            }
            let flows = store.list_flows(&filter).await?;
            println!("{}", serde_json::to_string_pretty(&flows)?);
        }
        Commands::Logs { flow_id, level } => {
            if store.get_flow(flow_id).await?.is_none() {
                anyhow::bail!("Unknown flow: {}", flow_id);
            }
            for entry in store.list_log_entries(flow_id, level).await? {
                println!(
                    "{} {:>5} {}",
                    entry.logged_at.to_rfc3339(),
                    entry.level.as_str().to_uppercase(),
                    entry.message
                );
            }
        }
    }

    Ok(())
}
