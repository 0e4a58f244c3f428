// =============================================================================
// Meridian — multi-stage trading-signal pipeline
// =============================================================================
//
// Ingests market data from multiple exchanges, computes indicators,
// generates and vets trade candidates, decides them against open positions,
// dispatches prioritized notifications, and adapts its parameters from
// realized outcomes.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod config;
mod errors;
mod indicators;
mod learning;
mod market_data;
mod metrics;
mod output;
mod params;
mod pipeline;
mod policy;
mod prefilter;
mod regime;
mod signal_gen;
mod types;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::PipelineConfig;
use crate::learning::history::SignalHistory;
use crate::market_data::{ExchangeFeed, WsTickFeed};
use crate::output::dispatch::LogNotificationSink;
use crate::params::{Consumer, ParameterStore};
use crate::pipeline::Pipeline;
use crate::policy::book::PositionBook;

#[derive(Parser)]
#[command(name = "meridian", about = "Multi-stage trading-signal pipeline")]
struct Cli {
    /// Path to the pipeline config file.
    #[arg(long, default_value = "meridian.json", env = "MERIDIAN_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the pipeline and run until Ctrl+C (default).
    Run,
    /// Print persisted pipeline state: parameter versions, outcome count,
    /// open positions.
    Inspect,
    /// Re-activate a previously published parameter-set version.
    Rollback {
        #[arg(long)]
        version: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut cfg = PipelineConfig::load(&cli.config).unwrap_or_else(|e| {
        warn!(error = %e, "failed to load config, using defaults");
        PipelineConfig::default()
    });
    cfg.apply_env_overrides();

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run(cfg).await,
        Command::Inspect => inspect(cfg),
        Command::Rollback { version } => rollback(cfg, version),
    }
}

async fn run(cfg: PipelineConfig) -> anyhow::Result<()> {
    info!(
        symbols = ?cfg.symbols,
        timeframes = ?cfg.timeframes,
        exchanges = cfg.ingest.exchanges.len(),
        "meridian starting"
    );

    let feeds: Vec<Arc<dyn ExchangeFeed>> = cfg
        .ingest
        .exchanges
        .iter()
        .map(|endpoint| {
            Arc::new(WsTickFeed::new(
                endpoint.id.clone(),
                endpoint.url.clone(),
                cfg.symbols.clone(),
            )) as Arc<dyn ExchangeFeed>
        })
        .collect();

    let pipeline = Arc::new(Pipeline::build(cfg, Arc::new(LogNotificationSink))?);
    let handles = pipeline.clone().run(feeds).await?;

    info!("all phases running; press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received; draining");

    pipeline.shutdown();
    for handle in handles {
        let _ = tokio::time::timeout(std::time::Duration::from_secs(5), handle).await;
    }

    info!("meridian shut down");
    Ok(())
}

fn inspect(cfg: PipelineConfig) -> anyhow::Result<()> {
    if cfg.data_dir.is_empty() {
        anyhow::bail!("no data_dir configured; nothing to inspect");
    }

    let params = ParameterStore::open(&cfg.data_dir)?;
    let history = SignalHistory::open(&cfg.data_dir)?;
    let book = PositionBook::open(&cfg.data_dir)?;

    let (active_version, active) = params.get(Consumer::SignalGen);
    let summary = serde_json::json!({
        "parameter_versions": params.versions(),
        "active_version": active_version,
        "active_parameters": active.parameters,
        "recorded_outcomes": history.len(),
        "open_positions": book.snapshot(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn rollback(cfg: PipelineConfig, version: u64) -> anyhow::Result<()> {
    if cfg.data_dir.is_empty() {
        anyhow::bail!("no data_dir configured; nothing to roll back");
    }

    let params = ParameterStore::open(&cfg.data_dir)?;
    params.rollback(version)?;
    info!(version, "parameter set rolled back");
    println!("rolled back to parameter version {version}");
    Ok(())
}
