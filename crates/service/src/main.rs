//! Flight bridge daemon (flightbridged)

#![deny(static_mut_refs)]
#![deny(clippy::unwrap_used)]

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use flight_bridge_service::{BridgeConfig, BridgeDaemon, detect_once, init_logging, shutdown_signal};

#[derive(Parser)]
#[command(name = "flightbridged")]
#[command(about = "Stream flight simulator telemetry to WebSocket subscribers")]
#[command(version)]
struct Args {
    /// Configuration file (created with defaults if missing)
    #[arg(long, env = "FLIGHT_BRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the subscriber listen address
    #[arg(long)]
    listen: Option<SocketAddr>,

    /// Verbose logging (repeat for more)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Detect the running simulator once, print it and exit
    #[arg(long)]
    detect_once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, origin) = match &args.config {
        Some(path) => BridgeConfig::load_from_path(path).await?,
        None => BridgeConfig::load().await?,
    };
    if let Some(listen) = args.listen {
        config.broadcast.listen_address = listen;
    }

    init_logging(&config.logging, args.verbose)?;
    info!("Starting flight bridge v{}", env!("CARGO_PKG_VERSION"));
    origin.log();

    if args.detect_once {
        config.validate()?;
        let kind = detect_once(&config).await?;
        println!("{kind}");
        return Ok(());
    }

    let daemon = BridgeDaemon::bind(config).await?;
    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown.send(());
    });

    daemon.run().await
}
