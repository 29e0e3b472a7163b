//! # Herald Server
//!
//! WebSocket notification relay. Clients connect to `/ws/notify/{to}` and
//! receive every notification addressed to `{to}` (or to `all`).
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! herald
//!
//! # Run with custom config
//! herald --config /path/to/herald.toml
//!
//! # Show options
//! herald --help
//!
//! # Run with environment variables
//! HERALD_PORT=8080 HERALD_HOST=0.0.0.0 herald
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Herald notification relay.
#[derive(Debug, Parser)]
#[command(name = "herald", version, about = "WebSocket notification relay addressed by recipient")]
struct Args {
    /// Path to a TOML configuration file. Defaults to the first of
    /// herald.toml, /etc/herald/herald.toml, ~/.config/herald/herald.toml.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=debug,herald_core=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = match args.config {
        Some(path) => config::Config::from_file(path)?,
        None => config::Config::load()?,
    };

    tracing::info!("Starting Herald server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    handlers::run_server(config).await?;

    Ok(())
}
