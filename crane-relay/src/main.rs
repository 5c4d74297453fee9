//! crane-relay binary entry point.
//!
//! Usage:
//! ```bash
//! crane-relay --config relay.toml
//! crane-relay --bind 127.0.0.1:9000
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use webcrane_relay::config::Config;
use webcrane_relay::server::CraneRelay;

/// Room relay for webcrane publishers and subscribers.
#[derive(Parser, Debug)]
#[command(name = "crane-relay")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults are used when it does not exist)
    #[arg(short, long, default_value = "relay.toml")]
    config: PathBuf,

    /// Override the WebSocket bind address
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = if cli.config.exists() {
        Config::from_file(&cli.config)
            .with_context(|| format!("loading {}", cli.config.display()))?
    } else {
        tracing::info!("No config at {}, using defaults", cli.config.display());
        Config::default()
    };
    if let Some(bind) = cli.bind {
        config.server.bind_address = bind;
    }

    tracing::info!("crane-relay v{}", env!("CARGO_PKG_VERSION"));
    Arc::new(CraneRelay::new(config)).run().await?;
    Ok(())
}
