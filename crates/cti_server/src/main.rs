//! cti-server - correlation server for host-telemetry agents.

use anyhow::{Context, Result};
use clap::Parser;
use cti_core::{Server, ServerConfig};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

#[derive(Parser)]
#[command(name = "cti-server")]
#[command(about = "Host-telemetry and threat-intelligence correlation server", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to the INI configuration file
    #[arg(short, long, default_value = "data/server.ini")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = ServerConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    init_logging(config.server.logfile.as_deref())?;

    let server = Server::new(config).context("assembling server")?;
    let cancel = server.cancellation_token();

    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(%e, "could not listen for shutdown signal");
            return;
        }
        warn!("termination signal received, shutting down");
        cancel.cancel();
    });

    server.run().await?;
    Ok(())
}

/// Installs the tracing subscriber; `RUST_LOG` overrides the default level.
fn init_logging(logfile: Option<&std::path::Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match logfile {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}
