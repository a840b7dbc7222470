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

//! Normalization of raw provider intervals into canonical readings.
//!
//! Electricity intervals arrive split across tariff channels, sometimes with
//! an additional explicit consumption total for the same timestamp. Gas
//! intervals arrive twice, once in kWh and once in m3. Normalization
//! collapses both shapes into exactly one [`NormalizedReading`] per
//! timestamp, sorted ascending.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use tracing::warn;

use gridflux_types::{Channel, GasUnit, MeterType, NormalizedReading, RawInterval};

/// Explicit total and tariff sum are allowed to disagree by rounding noise
/// before the mismatch counter fires.
const TARIFF_TOLERANCE: f64 = 1e-6;

/// Result of one normalization pass, with the counters a cycle report needs.
#[derive(Debug, Default)]
pub struct NormalizeOutcome {
    /// Canonical readings, ascending by timestamp.
    pub readings: Vec<NormalizedReading>,
    /// Timestamps where the explicit consumption total disagreed with the
    /// tariff sum beyond tolerance. The explicit total wins.
    pub tariff_mismatches: usize,
    /// Values dropped because their channel could not be placed.
    pub dropped: usize,
}

#[derive(Debug, Default)]
struct Accumulator {
    explicit_consumption: Option<f64>,
    tariff_high: f64,
    tariff_low: f64,
    has_tariff: bool,
    injection: f64,
    volume: Option<f64>,
}

/// Collapse raw intervals into one canonical reading per timestamp.
pub fn normalize(
    raw: &[RawInterval],
    meter_type: MeterType,
    gas_unit: GasUnit,
) -> NormalizeOutcome {
    let mut buckets: BTreeMap<DateTime<Utc>, Accumulator> = BTreeMap::new();
    let mut dropped = 0_usize;

    for interval in raw {
        let bucket = buckets.entry(interval.timestamp).or_default();
        match interval.channel {
            Channel::Consumption => {
                bucket.explicit_consumption =
                    Some(bucket.explicit_consumption.unwrap_or(0.0) + interval.value);
            }
            Channel::TariffHigh => {
                bucket.tariff_high += interval.value;
                bucket.has_tariff = true;
            }
            Channel::TariffLow => {
                bucket.tariff_low += interval.value;
                bucket.has_tariff = true;
            }
            Channel::Injection => bucket.injection += interval.value,
            Channel::Volume => {
                bucket.volume = Some(bucket.volume.unwrap_or(0.0) + interval.value);
            }
            Channel::Other => dropped += 1,
        }
    }

    let mut outcome = NormalizeOutcome {
        dropped,
        ..NormalizeOutcome::default()
    };

    for (timestamp, bucket) in buckets {
        let reading = match meter_type {
            MeterType::Electricity => {
                electricity_reading(timestamp, &bucket, &mut outcome.tariff_mismatches)
            }
            MeterType::Gas => gas_reading(timestamp, &bucket, gas_unit),
        };
        match reading {
            Some(reading) => outcome.readings.push(reading),
            None => outcome.dropped += 1,
        }
    }

    if outcome.tariff_mismatches > 0 {
        warn!(
            "⚠️ {} interval(s) had a consumption total disagreeing with the tariff sum",
            outcome.tariff_mismatches
        );
    }
    outcome
}

fn electricity_reading(
    timestamp: DateTime<Utc>,
    bucket: &Accumulator,
    tariff_mismatches: &mut usize,
) -> Option<NormalizedReading> {
    let tariff_sum = bucket.tariff_high + bucket.tariff_low;
    let consumption = match bucket.explicit_consumption {
        Some(total) => {
            if bucket.has_tariff && (total - tariff_sum).abs() > TARIFF_TOLERANCE {
                *tariff_mismatches += 1;
            }
            total
        }
        None => tariff_sum,
    };
    if bucket.explicit_consumption.is_none() && !bucket.has_tariff && bucket.injection == 0.0 {
        return None;
    }
    Some(NormalizedReading {
        timestamp,
        meter_type: MeterType::Electricity,
        consumption_kwh: consumption,
        injection_kwh: bucket.injection,
        tariff_high_kwh: bucket.tariff_high,
        tariff_low_kwh: bucket.tariff_low,
    })
}

/// Gas publishes the same interval twice (kWh and m3); keep the configured
/// unit and fall back to whichever one arrived when the preferred is absent.
/// Gas kWh values sometimes carry a tariff code even though gas has no
/// tariff split, so every consumption-direction kWh channel counts toward
/// the energy sum.
fn gas_reading(
    timestamp: DateTime<Utc>,
    bucket: &Accumulator,
    gas_unit: GasUnit,
) -> Option<NormalizedReading> {
    let kwh = if bucket.explicit_consumption.is_some() || bucket.has_tariff {
        Some(
            bucket.explicit_consumption.unwrap_or(0.0) + bucket.tariff_high + bucket.tariff_low,
        )
    } else {
        None
    };
    let consumption = match gas_unit {
        GasUnit::Kwh => kwh.or(bucket.volume),
        GasUnit::CubicMeters => bucket.volume.or(kwh),
    }?;
    Some(NormalizedReading {
        timestamp,
        meter_type: MeterType::Gas,
        consumption_kwh: consumption,
        injection_kwh: 0.0,
        tariff_high_kwh: 0.0,
        tariff_low_kwh: 0.0,
    })
}
