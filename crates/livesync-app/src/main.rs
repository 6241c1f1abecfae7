//! livesync - entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

/// Default log filter when `RUST_LOG` is unset.
const DEFAULT_LOG_FILTER: &str = "info,livesync=debug";

/// Live account dashboard pipeline
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (can also be set via LIVESYNC_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // TLS provider must be installed before any wss:// connection
    livesync_ws::init_crypto();

    let args = Args::parse();

    livesync_telemetry::init_logging(DEFAULT_LOG_FILTER)?;

    info!("Starting livesync v{}", env!("CARGO_PKG_VERSION"));

    // CLI arg > LIVESYNC_CONFIG env var > default
    let config_path = args
        .config
        .or_else(|| std::env::var("LIVESYNC_CONFIG").ok())
        .unwrap_or_else(|| "config/default.toml".to_string());

    info!(config_path = %config_path, "Loading configuration");
    let config = livesync_app::AppConfig::load(&config_path)?;
    info!(
        accounts = config.accounts.len(),
        stream_url = %config.stream.url,
        api_url = %config.api.base_url,
        "Configuration loaded"
    );

    let mut app = livesync_app::Application::new(config)?;
    app.start()?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    app.stop().await;
    Ok(())
}
