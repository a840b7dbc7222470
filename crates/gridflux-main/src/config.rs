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

//! Application configuration loading and validation

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::warn;

use gridflux_types::MeterConfig;

/// Default config path, overridable with `GRIDFLUX_CONFIG`.
const DEFAULT_CONFIG_PATH: &str = "gridflux.json";

fn default_update_interval_minutes() -> u64 {
    60
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".")
}

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Meters to synchronize (one or more)
    pub meters: Vec<MeterConfig>,

    /// System configuration
    #[serde(default)]
    pub system: SystemConfig,
}

/// System configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Minutes between synchronization cycles. The provider publishes
    /// validated data with a delay of a day or more, so anything below an
    /// hour only burns requests.
    #[serde(default = "default_update_interval_minutes")]
    pub update_interval_minutes: u64,

    /// Directory the per-meter statistics files live in.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            update_interval_minutes: default_update_interval_minutes(),
            state_dir: default_state_dir(),
        }
    }
}

impl AppConfig {
    /// Statistics file for one meter.
    pub fn state_path(&self, ean: &str) -> PathBuf {
        self.system.state_dir.join(format!("gridflux-{ean}.json"))
    }
}

/// Resolve the config path: explicit CLI arg, then env, then the default.
pub fn resolve_config_path(cli_path: Option<&str>) -> PathBuf {
    if let Some(path) = cli_path {
        return PathBuf::from(path);
    }
    std::env::var("GRIDFLUX_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
}

/// Load and validate the configuration file.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &AppConfig) -> Result<()> {
    if config.meters.is_empty() {
        bail!("config must define at least one meter");
    }
    for meter in &config.meters {
        if meter.email.is_empty() || meter.password.is_empty() {
            bail!("meter {} is missing credentials", meter.ean);
        }
        if meter.meter_serial.is_empty() {
            bail!("meter {} is missing a meter serial number", meter.ean);
        }
        if meter.ean.len() != 18 || !meter.ean.chars().all(|c| c.is_ascii_digit()) {
            warn!(
                "EAN {:?} does not look like an 18-digit connection point code",
                meter.ean
            );
        }
        if meter.timezone.parse::<chrono_tz::Tz>().is_err() {
            warn!(
                "unknown timezone {:?} for meter {}, falling back to UTC",
                meter.timezone, meter.ean
            );
        }
    }
    Ok(())
}
