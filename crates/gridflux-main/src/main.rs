// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of GridFlux.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

mod config;

use anyhow::Result;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::FmtSubscriber;

use gridflux_core::{JsonStatisticsStore, SyncCoordinator, SyncError};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Handle command line arguments
    let args: Vec<String> = std::env::args().collect();
    let mut config_path_arg: Option<String> = None;
    let mut run_once = false;
    let mut index = 1;
    while index < args.len() {
        match args[index].as_str() {
            "--help" | "-h" => {
                println!("GridFlux - Utility Meter Statistics Synchronization");
                println!("Version: {VERSION}");
                println!();
                println!("Usage: gridflux [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -h, --help           Print this help message");
                println!("  -v, --version        Print version");
                println!("  -c, --config <PATH>  Config file (default: gridflux.json,");
                println!("                       or the GRIDFLUX_CONFIG environment variable)");
                println!("      --once           Run a single cycle and exit");
                return Ok(());
            }
            "--version" | "-v" => {
                println!("{VERSION}");
                return Ok(());
            }
            "--config" | "-c" => {
                index += 1;
                config_path_arg = args.get(index).cloned();
            }
            "--once" => run_once = true,
            other => {
                eprintln!("ignoring unknown argument {other:?}");
            }
        }
        index += 1;
    }

    // Initialize tracing with env filter support
    // Respects RUST_LOG environment variable
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = config::resolve_config_path(config_path_arg.as_deref());
    let app_config = config::load_config(&config_path)?;

    info!("🚀 Starting GridFlux - Utility Meter Statistics Synchronization");
    info!("📋 Configuration Summary:");
    info!("   Meters: {}", app_config.meters.len());
    for meter in &app_config.meters {
        info!(
            "     - {} ({:?}) - every {} day(s) of history at {:?} resolution",
            meter.ean,
            meter.meter_type,
            meter.effective_days_back(),
            meter.effective_granularity()
        );
    }
    info!(
        "   Update interval: {} min",
        app_config.system.update_interval_minutes
    );
    info!("   State directory: {}", app_config.system.state_dir.display());

    let mut coordinators = Vec::new();
    for meter in &app_config.meters {
        let store = JsonStatisticsStore::new(app_config.state_path(&meter.ean));
        coordinators.push(SyncCoordinator::new(meter.clone(), store)?);
    }

    let interval = Duration::from_secs(app_config.system.update_interval_minutes * 60);
    loop {
        for coordinator in &mut coordinators {
            match coordinator.run_cycle().await {
                Ok(report) => {
                    info!(
                        "📊 {} → {}: {} reading(s), {} point(s) appended",
                        report.window_from,
                        report.window_until,
                        report.readings,
                        report.points_appended
                    );
                }
                Err(SyncError::ReauthRequired) => {
                    error!(
                        "❌ Credentials rejected; update the config file and restart"
                    );
                }
                Err(err) => {
                    error!("❌ Sync cycle failed: {err}");
                }
            }
        }
        if run_once {
            break;
        }
        info!(
            "💤 Next cycle in {} min",
            app_config.system.update_interval_minutes
        );
        tokio::time::sleep(interval).await;
    }
    Ok(())
}
