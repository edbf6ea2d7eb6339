//! Mediastage CLI - stage remote media objects on local disk

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use mediastage::config::Config;
use mediastage::error::Result;
use mediastage::quota::QuotaStatus;
use mediastage::service::StagingService;
use mediastage::types::Artifact;

/// Mediastage - fetch, stage and cache remote media objects
#[derive(Parser)]
#[command(name = "mediastage")]
#[command(about = "Fetch remote media objects into a quota-bounded staging directory")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Print results as JSON lines
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Ingest one or more object IDs
    Ingest {
        /// Object IDs to fetch
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Run a single reclaim sweep over the staging root
    Reclaim,
    /// Keep the reclaimer running and ingest IDs read from stdin, one per line
    Run,
    /// Show staging disk usage against the quota ceiling
    Usage,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!("Config loaded: {:?}", config);

    let service = StagingService::start(config).await?;
    let outcome = match cli.command {
        Command::Ingest { ids } => ingest(&service, ids, cli.json).await,
        Command::Reclaim => reclaim(&service, cli.json).await,
        Command::Run => serve_stdin(&service, cli.json).await,
        Command::Usage => usage(&service, cli.json).await,
    };
    service.shutdown().await;
    outcome
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mediastage=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

async fn ingest(service: &StagingService, ids: Vec<String>, json: bool) -> Result<()> {
    let results = service.ingest_all(ids).await;
    for (id, result) in &results {
        report(id, result, json);
    }
    first_failure(results)
}

/// The first failed ingestion's error, unchanged, or `Ok` if all succeeded.
fn first_failure(results: Vec<(String, Result<Artifact>)>) -> Result<()> {
    let total = results.len();
    let mut errors = results.into_iter().filter_map(|(_, r)| r.err());
    let Some(first) = errors.next() else {
        return Ok(());
    };
    tracing::error!("{} of {} ingestions failed", errors.count() + 1, total);
    Err(first)
}

async fn reclaim(service: &StagingService, json: bool) -> Result<()> {
    let report = service.reclaim_once().await?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "scanned": report.scanned,
                "removed": report.removed,
                "vanished": report.vanished,
                "failed": report.failed,
            })
        );
    } else {
        println!(
            "Scanned {} files: removed {}, already gone {}, failed {}",
            report.scanned, report.removed, report.vanished, report.failed
        );
    }
    Ok(())
}

async fn serve_stdin(service: &StagingService, json: bool) -> Result<()> {
    tracing::info!(
        "Reading object IDs from stdin, staging under {}",
        service.config().staging.root.display()
    );
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted, shutting down");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                let id = line.trim();
                if id.is_empty() {
                    continue;
                }
                let result = service.ingest(id).await;
                report(id, &result, json);
            }
        }
    }
    Ok(())
}

async fn usage(service: &StagingService, json: bool) -> Result<()> {
    let status = service.quota_status().await?;
    let (used, ceiling, exceeded) = match status {
        QuotaStatus::Ok { used, ceiling } => (used, ceiling, false),
        QuotaStatus::Exceeded { used, ceiling } => (used, ceiling, true),
    };
    if json {
        println!(
            "{}",
            serde_json::json!({ "used": used, "ceiling": ceiling, "exceeded": exceeded })
        );
    } else {
        let state = if exceeded { "EXCEEDED" } else { "ok" };
        println!("{used} of {ceiling} bytes used ({state})");
    }
    Ok(())
}

fn report(id: &str, result: &Result<Artifact>, json: bool) {
    match (result, json) {
        (Ok(artifact), true) => match serde_json::to_string(artifact) {
            Ok(line) => println!("{line}"),
            Err(e) => eprintln!("{id}: failed to encode result: {e}"),
        },
        (Ok(artifact), false) => {
            let location = artifact
                .staged_path
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "memory cache".to_string());
            println!("{}: {} bytes from {}", id, artifact.size, location);
        }
        (Err(e), true) => {
            println!("{}", serde_json::json!({ "id": id, "error": e.to_string() }));
        }
        (Err(e), false) => eprintln!("{id}: {e}"),
    }
}
