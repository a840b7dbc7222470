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

//! Meter configuration and fetch-window derivation

use chrono::{DateTime, Duration, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// Gas readings are published with roughly a 72h delay and only at daily
/// resolution, so a gas meter always looks back at least this far.
pub const GAS_MIN_LOOKBACK_DAYS: u32 = 7;

/// Hard bounds on the configurable lookback.
pub const MIN_LOOKBACK_DAYS: u32 = 1;
pub const MAX_LOOKBACK_DAYS: u32 = 31;

fn default_timezone() -> String {
    "Europe/Brussels".to_string()
}

fn default_days_back() -> u32 {
    7
}

/// Which kind of meter this instance synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MeterType {
    #[default]
    Electricity,
    Gas,
}

/// Interval resolution requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    QuarterHour,
    #[default]
    Daily,
}

impl Granularity {
    /// Wire code used by the measurement-history query.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuarterHour => "3",
            Self::Daily => "4",
        }
    }
}

/// Which of the two duplicate gas channels is canonical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum GasUnit {
    #[default]
    #[serde(rename = "kwh")]
    Kwh,
    #[serde(rename = "m3")]
    CubicMeters,
}

/// Configuration for one account/meter pair.
///
/// `email` and `password` are only ever used for transmission to the identity
/// provider; they must never appear in logs or diagnostics output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterConfig {
    pub email: String,
    pub password: String,

    /// 18-digit EAN identifying the connection point.
    pub ean: String,

    /// Serial number of the physical meter behind the EAN.
    pub meter_serial: String,

    #[serde(default)]
    pub meter_type: MeterType,

    /// IANA timezone the provider reports local dates in.
    #[serde(default = "default_timezone")]
    pub timezone: String,

    /// How many days of history to re-fetch each cycle (1-31). Over-fetching
    /// is intentional: late and corrected data shows up days after the fact.
    #[serde(default = "default_days_back")]
    pub days_back: u32,

    #[serde(default)]
    pub granularity: Granularity,

    #[serde(default)]
    pub gas_unit: GasUnit,
}

impl MeterConfig {
    /// Resolve the configured timezone, falling back to UTC for unknown names.
    pub fn resolve_timezone(&self) -> Tz {
        self.timezone.parse().unwrap_or(chrono_tz::UTC)
    }

    /// Lookback after clamping and the gas minimum.
    pub fn effective_days_back(&self) -> u32 {
        let clamped = self.days_back.clamp(MIN_LOOKBACK_DAYS, MAX_LOOKBACK_DAYS);
        match self.meter_type {
            MeterType::Gas => clamped.max(GAS_MIN_LOOKBACK_DAYS),
            MeterType::Electricity => clamped,
        }
    }

    /// Granularity after the gas override (gas has no sub-daily data).
    pub fn effective_granularity(&self) -> Granularity {
        match self.meter_type {
            MeterType::Gas => Granularity::Daily,
            MeterType::Electricity => self.granularity,
        }
    }
}

/// Date range and resolution for one history request, in provider-local time.
#[derive(Debug, Clone)]
pub struct FetchWindow {
    pub start: DateTime<Tz>,
    pub end: DateTime<Tz>,
    pub granularity: Granularity,
}

impl FetchWindow {
    /// Derive the effective window for a meter at the given instant.
    ///
    /// Start is local midnight `days_back` days ago, end is the last
    /// millisecond of the current local day, mirroring the portal's own
    /// request shape.
    pub fn for_meter(config: &MeterConfig, now: DateTime<Utc>) -> Self {
        let tz = config.resolve_timezone();
        let local_now = now.with_timezone(&tz);
        let days_back = i64::from(config.effective_days_back());

        let start_date = (local_now - Duration::days(days_back)).date_naive();
        let start = tz
            .from_local_datetime(&start_date.and_time(NaiveTime::MIN))
            .earliest()
            .unwrap_or(local_now - Duration::days(days_back));
        let end_time = NaiveTime::from_hms_milli_opt(23, 59, 59, 999).unwrap_or(NaiveTime::MIN);
        let end = tz
            .from_local_datetime(&local_now.date_naive().and_time(end_time))
            .latest()
            .unwrap_or(local_now);

        Self {
            start,
            end,
            granularity: config.effective_granularity(),
        }
    }

    /// `historyFrom` query value (local ISO-8601 with milliseconds).
    pub fn history_from(&self) -> String {
        self.start.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
    }

    /// `historyUntil` query value.
    pub fn history_until(&self) -> String {
        self.end.format("%Y-%m-%dT%H:%M:%S%.3f%:z").to_string()
    }

    pub fn days_back(&self) -> i64 {
        (self.end.date_naive() - self.start.date_naive()).num_days()
    }
}
