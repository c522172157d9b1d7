//! Up/down window trader - entry point.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

/// Up/down binary market trader
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via UPDOWN_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    updown_telemetry::init_logging()?;

    info!("Starting updown-bot v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > UPDOWN_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("UPDOWN_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = updown_bot::AppConfig::from_file(&config_path)?;
    info!(?config.mode, markets = config.markets.len(), "Configuration loaded");

    let app = updown_bot::Application::new(config)?;

    let shutdown = app.shutdown_token();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Signal handler failed, shutting down");
        } else {
            info!("Ctrl-C received, shutting down");
        }
        shutdown.cancel();
    });

    let report = app.run().await?;

    for summary in &report.cycles {
        info!(
            cycle = %summary.window.cycle,
            slug = %summary.window.slug,
            fills = summary.fills,
            realized_pnl = %summary.realized_pnl,
            held = %summary.held,
            "Cycle result"
        );
    }
    for claim in &report.pending_claims {
        warn!(
            condition = %claim.condition_id,
            stage = %claim.stage,
            "Claim still pending at exit"
        );
    }

    Ok(())
}
