use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;

use stepflow::config::Config;
use stepflow::server;

#[derive(Parser)]
#[command(name = "stepflow")]
#[command(version, about = "Runs commands, parses step markers from their output, streams live state")]
struct Cli {
    /// Root of the database and log/artifact tree (overrides STORAGE_PATH).
    #[arg(long)]
    storage_path: Option<PathBuf>,

    /// REST listener port (overrides HTTP_PORT).
    #[arg(long)]
    http_port: Option<u16>,

    /// WebSocket listener port (overrides WS_PORT).
    #[arg(long)]
    ws_port: Option<u16>,

    /// Bind on all interfaces and allow any CORS origin.
    #[arg(long)]
    dev: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = Config::from_env().context("configuration error")?;
    if let Some(storage_path) = cli.storage_path {
        config.storage_path = storage_path;
    }
    if let Some(http_port) = cli.http_port {
        config.http_port = http_port;
    }
    if let Some(ws_port) = cli.ws_port {
        config.ws_port = ws_port;
    }
    config.dev_mode = cli.dev;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("stepflow={}", config.log_level).into()),
        )
        .init();

    tracing::info!(
        storage = %config.storage_path.display(),
        http_port = config.http_port,
        ws_port = config.ws_port,
        "starting stepflow monitor"
    );

    server::start_server(config).await
}
