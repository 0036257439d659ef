mod config;

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use harrow_client::ClientRegistry;
use harrow_core::HostRegistry;

use crate::config::HarvestFile;

#[derive(Parser)]
#[command(name = "harrow", version, about = "Rotating, retrying web scraper")]
struct Cli {
    /// Path to the JSON harvest file
    #[arg(short, long, global = true, env = "HARROW_CONFIG")]
    config: Option<PathBuf>,

    /// Number of concurrent workers (overrides the harvest file)
    #[arg(short, long, global = true, env = "HARROW_THREADS")]
    threads: Option<usize>,

    /// Run tasks one at a time
    #[arg(long, global = true, env = "HARROW_DEBUG", default_value_t = false)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape URLs with the most specific matching source
    Scrape {
        /// Target URLs
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Call an endpoint source, filling its URL template
    Endpoint {
        /// Endpoint source name
        #[arg(short, long)]
        source: String,

        /// Template parameters as key=value
        #[arg(value_parser = parse_param)]
        params: Vec<(String, String)>,
    },

    /// Show the host ring the harvest file produces
    Hosts,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Logs go to stderr; stdout carries JSON results
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("harrow=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let path = cli
        .config
        .clone()
        .context("No harvest file given. Pass --config or set HARROW_CONFIG.")?;
    let mut file = HarvestFile::load(&path)?;
    if let Some(threads) = cli.threads {
        file.pool.num_workers = threads;
    }
    if cli.debug {
        file.pool.debug = true;
    }

    match cli.command {
        Commands::Scrape { urls } => {
            let registry = ClientRegistry::new();
            let result = cmd_scrape(&file, &registry, urls).await;
            registry.release_browser().await;
            result?;
        }
        Commands::Endpoint { source, params } => {
            let registry = ClientRegistry::new();
            let result = cmd_endpoint(&file, &registry, &source, params.into_iter().collect()).await;
            registry.release_browser().await;
            result?;
        }
        Commands::Hosts => cmd_hosts(&file)?,
    }

    Ok(())
}

async fn cmd_scrape(file: &HarvestFile, registry: &ClientRegistry, urls: Vec<String>) -> Result<()> {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("Interrupted, stopping after in-flight requests");
                cancel.cancel();
            }
        }
    });

    let harvester = file
        .build_harvester(registry)
        .await?
        .with_cancel_token(cancel);
    let reports = harvester.scrape_many(urls).await.context("Harvest aborted")?;

    let failed = reports.iter().filter(|r| !r.is_ok()).count();
    if failed > 0 {
        tracing::warn!("{failed} of {} URLs failed", reports.len());
    }

    println!("{}", serde_json::to_string_pretty(&reports)?);
    Ok(())
}

async fn cmd_endpoint(
    file: &HarvestFile,
    registry: &ClientRegistry,
    source: &str,
    params: BTreeMap<String, String>,
) -> Result<()> {
    let harvester = file.build_harvester(registry).await?;
    let fields = harvester
        .call_endpoint(source, &params)
        .await
        .with_context(|| format!("Endpoint {source:?} failed"))?;

    println!("{}", serde_json::to_string_pretty(&fields)?);
    Ok(())
}

fn cmd_hosts(file: &HarvestFile) -> Result<()> {
    let hosts = HostRegistry::new(&file.hosts_config()).hosts();
    for host in &hosts {
        tracing::info!("{host}");
    }
    println!("{}", serde_json::to_string_pretty(&hosts)?);
    Ok(())
}

/// `id=42` -> `("id", "42")`
fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got {raw:?}")),
    }
}
