//! dmd - Diagnostic Manager Daemon
//!
//! Serves UDS over DoIP until interrupted.
//!
//! # Usage
//!
//! ```bash
//! ./dmd --config /etc/dmd/dmd.toml
//! ./dmd --config /etc/dmd/dmd.yaml --port 13401 --verbose
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dmd::{Daemon, DaemonConfig};

#[derive(Parser, Debug)]
#[command(name = "dmd")]
#[command(about = "Diagnostic manager daemon serving UDS over DoIP")]
struct Args {
    /// Configuration file (TOML or YAML)
    #[arg(short, long)]
    config: PathBuf,

    /// Override the DoIP listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Enable debug output
    #[arg(short, long)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn init_logging(args: &Args) {
    let default = if args.verbose {
        "dmd=debug,dm_server=debug"
    } else {
        "dmd=info,dm_server=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default.into());
    let registry = tracing_subscriber::registry().with(filter);
    if args.log_json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    info!(config = %args.config.display(), "Loading configuration");
    let mut config = DaemonConfig::load(&args.config)
        .with_context(|| format!("Failed to load {}", args.config.display()))?;
    if let Some(port) = args.port {
        config.doip.port = port;
    }

    let daemon = Daemon::start(config)
        .await
        .context("Failed to start diagnostic manager")?;
    info!(address = %daemon.local_addr(), "Press Ctrl+C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Shutting down");
    daemon.shutdown().await;
    Ok(())
}
