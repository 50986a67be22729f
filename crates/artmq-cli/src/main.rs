//! artnet2mqtt - bridge an Art-Net lighting network to an MQTT broker
//!
//! Discovered Art-Net output ports are announced as MQTT topics; channel
//! values published to those topics are sent to the lighting network.

use anyhow::{Context, Result};
use artmq_bridge::{ArtNetTransport, BridgeController, MqttBus};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;

use config::Config;

/// Art-Net <-> MQTT bridge
#[derive(Parser)]
#[command(name = "artnet2mqtt")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "configs/conf.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    /// Output logs as JSON
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)?;

    let level = cli.log_level.as_deref().unwrap_or(&config.logger.level);
    setup_logging(level, cli.json_logs)?;
    debug!("Configuration loaded from {}", cli.config.display());

    let transport = Arc::new(ArtNetTransport::new(config.artnet_config()));
    let bus = Arc::new(MqttBus::new(config.mqtt_config()));
    let controller = BridgeController::new(config.bridge_config(), transport, bus)
        .context("invalid bridge configuration")?;

    controller
        .start()
        .await
        .context("failed to start the bridge")?;

    wait_for_shutdown().await?;
    info!("Received shutdown signal");

    controller.stop().await.context("failed to stop the bridge")?;
    info!("shutdown complete");
    Ok(())
}

fn setup_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to parse log level")?;

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false).compact())
            .init();
    }

    Ok(())
}

/// Ctrl-C, plus SIGTERM and SIGHUP on unix
#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
    let mut hup = signal(SignalKind::hangup()).context("Failed to listen for SIGHUP")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("Failed to listen for ctrl+c")?,
        _ = term.recv() => {}
        _ = hup.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for ctrl+c")
}
