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

//! Interval readings and cumulative statistic value types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::MeterType;

/// Tagged channel of a single provider-reported datum.
///
/// The provider encodes these as numeric direction/tariff/unit codes; the
/// fetcher maps the codes to variants and anything it does not recognize
/// lands in `Other` so the normalizer can drop it with a counter instead of
/// failing the whole cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Explicit untariffed consumption total (kWh).
    Consumption,
    /// High-tariff (day) consumption (kWh).
    TariffHigh,
    /// Low-tariff (night) consumption (kWh).
    TariffLow,
    /// Grid injection (kWh).
    Injection,
    /// Gas volume (m3), reported alongside the kWh conversion.
    Volume,
    /// Unrecognized direction/unit combination.
    Other,
}

/// One raw datum from a history fetch. Transient: lives only between fetch
/// and normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawInterval {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub channel: Channel,
}

/// Canonical per-timestamp reading after normalization.
///
/// Invariant: exactly one canonical consumption value per timestamp. For gas
/// meters the injection and tariff fields are always zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedReading {
    pub timestamp: DateTime<Utc>,
    pub meter_type: MeterType,
    pub consumption_kwh: f64,
    pub injection_kwh: f64,
    pub tariff_high_kwh: f64,
    pub tariff_low_kwh: f64,
}

/// Logical sensor stream fed by the merger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    ConsumptionTotal,
    InjectionTotal,
    TariffHigh,
    TariffLow,
}

impl StreamKind {
    /// Stable identifier used as the persistence key.
    pub fn stream_id(&self) -> &'static str {
        match self {
            Self::ConsumptionTotal => "consumption_total",
            Self::InjectionTotal => "injection_total",
            Self::TariffHigh => "consumption_high",
            Self::TariffLow => "consumption_low",
        }
    }

    /// Per-interval delta this stream accumulates from a reading.
    pub fn delta_for(&self, reading: &NormalizedReading) -> f64 {
        match self {
            Self::ConsumptionTotal => reading.consumption_kwh,
            Self::InjectionTotal => reading.injection_kwh,
            Self::TariffHigh => reading.tariff_high_kwh,
            Self::TariffLow => reading.tariff_low_kwh,
        }
    }

    /// Streams a meter of the given type feeds. Gas has no injection and no
    /// tariff split.
    pub fn for_meter(meter_type: MeterType) -> &'static [StreamKind] {
        match meter_type {
            MeterType::Electricity => &[
                Self::ConsumptionTotal,
                Self::InjectionTotal,
                Self::TariffHigh,
                Self::TariffLow,
            ],
            MeterType::Gas => &[Self::ConsumptionTotal],
        }
    }
}

/// Persistent cumulative record for one stream.
///
/// `last_known_total` never decreases; `last_timestamp` is the newest
/// interval already folded in, used to absorb overlapping fetch windows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CumulativeStatistic {
    pub stream_id: String,
    pub last_known_total: f64,
    pub last_timestamp: Option<DateTime<Utc>>,
}

impl CumulativeStatistic {
    /// Zero state for a stream that has never been merged into.
    pub fn empty(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
            last_known_total: 0.0,
            last_timestamp: None,
        }
    }
}

/// One appended point of a cumulative series.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatisticPoint {
    pub timestamp: DateTime<Utc>,
    pub total: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_ids_are_stable() {
        assert_eq!(StreamKind::ConsumptionTotal.stream_id(), "consumption_total");
        assert_eq!(StreamKind::InjectionTotal.stream_id(), "injection_total");
        assert_eq!(StreamKind::TariffHigh.stream_id(), "consumption_high");
        assert_eq!(StreamKind::TariffLow.stream_id(), "consumption_low");
    }

    #[test]
    fn test_gas_feeds_consumption_only() {
        assert_eq!(
            StreamKind::for_meter(MeterType::Gas),
            &[StreamKind::ConsumptionTotal]
        );
        assert_eq!(StreamKind::for_meter(MeterType::Electricity).len(), 4);
    }

    #[test]
    fn test_delta_selection() {
        let reading = NormalizedReading {
            timestamp: Utc::now(),
            meter_type: MeterType::Electricity,
            consumption_kwh: 5.0,
            injection_kwh: 1.5,
            tariff_high_kwh: 3.0,
            tariff_low_kwh: 2.0,
        };
        assert_eq!(StreamKind::ConsumptionTotal.delta_for(&reading), 5.0);
        assert_eq!(StreamKind::InjectionTotal.delta_for(&reading), 1.5);
        assert_eq!(StreamKind::TariffHigh.delta_for(&reading), 3.0);
        assert_eq!(StreamKind::TariffLow.delta_for(&reading), 2.0);
    }
}
