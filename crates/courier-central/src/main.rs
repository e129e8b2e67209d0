//! Central post office binary.
//!
//! # Usage
//!
//! ```bash
//! courier-central --config central.json
//! courier-central --config central.json --log-level debug
//! ```

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use courier_central::{Central, CentralConfig, FileStore, SystemProbe};
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Courier central post office
#[derive(Parser, Debug)]
#[command(name = "courier-central")]
#[command(about = "Star-topology message broker for Courier post offices")]
#[command(version)]
struct Args {
    /// Path to the JSON configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    tracing::info!(config = %args.config.display(), "central post office starting");

    let config = CentralConfig::load(&args.config)?;
    let store = Arc::new(FileStore::new(&args.config));

    let central = Central::bind(config, store, Arc::new(SystemProbe)).await?;
    tracing::info!(address = %central.local_addr()?, "listening");

    tokio::select! {
        result = central.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
        }
    }

    Ok(())
}
