//! DeckVolt daemon - Main entry point
//!
//! Runs the voltage engine until SIGINT/SIGTERM, then stops dynamic control
//! (cores back to 0 mV) and exits.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use deckvolt_common::config::resolve_state_dir;
use deckvolt_engine::config::EngineConfig;
use deckvolt_engine::hardware::linux::read_product_name;
use deckvolt_engine::hardware::sim::SimulatedHardware;
use deckvolt_engine::hardware::Hardware;
use deckvolt_engine::limits::{PlatformLimits, PlatformModel};
use deckvolt_engine::Engine;
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for deckvolt
#[derive(Parser, Debug)]
#[command(name = "deckvolt")]
#[command(about = "Dynamic CPU voltage engine")]
#[command(version)]
struct Args {
    /// Configuration file (TOML)
    #[arg(short, long, env = "DECKVOLT_CONFIG")]
    config: Option<PathBuf>,

    /// Directory for persisted state
    #[arg(short, long, env = "DECKVOLT_STATE_DIR")]
    state_dir: Option<PathBuf>,

    /// Run against simulated hardware
    #[arg(long)]
    simulate: bool,

    /// Allow offsets down to -100 mV
    #[arg(long)]
    expert: bool,

    /// Start dynamic control with the stored config
    #[arg(long)]
    autostart: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "deckvolt_engine=info,deckvolt_common=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    info!("Starting DeckVolt {}", env!("CARGO_PKG_VERSION"));

    let settings =
        EngineConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let state_dir = resolve_state_dir(args.state_dir.as_deref(), settings.state_dir.as_deref());
    info!("State directory: {}", state_dir.display());

    let (hardware, model) = if args.simulate {
        info!("Using simulated hardware");
        let sim = Arc::new(SimulatedHardware::new(settings.core_count));
        (Hardware::simulated(sim), PlatformModel::Lcd)
    } else {
        let model = read_product_name(&settings.hardware.sysfs_root)
            .map(|name| PlatformModel::from_product_name(&name))
            .unwrap_or(PlatformModel::Unknown);
        if settings.hardware.voltage_command.is_empty() {
            warn!("No voltage_command configured; voltage writes will fail");
        }
        (Hardware::linux(&settings.hardware), model)
    };
    let limits = PlatformLimits::for_model(model, args.expert || settings.expert_mode)
        .with_core_count(settings.core_count);
    info!(
        "Platform {:?}: floor {} mV on {} cores",
        limits.model, limits.min_voltage_mv, limits.core_count
    );

    let engine = Engine::open(settings, hardware, limits, &state_dir)
        .await
        .context("Failed to initialize engine")?;

    if args.autostart {
        match engine.start_stored().await {
            Ok(report) => info!("Dynamic control active on {} cores", report.cores_configured),
            Err(e) => warn!("Autostart failed: {}", e),
        }
    }

    shutdown_signal().await;
    engine.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
