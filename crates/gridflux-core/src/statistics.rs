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

//! Idempotent merge of normalized readings into cumulative statistics.
//!
//! Fetch windows deliberately overlap from cycle to cycle; the merge absorbs
//! the overlap by skipping every reading at or before the stream's
//! `last_timestamp`. Replaying the same window is therefore a no-op, and the
//! cumulative total never decreases.

use async_trait::async_trait;
use tracing::debug;

use gridflux_types::{CumulativeStatistic, NormalizedReading, StatisticPoint, StreamKind};

use crate::errors::StoreError;

/// Outcome of merging one batch of readings into one stream.
#[derive(Debug)]
pub struct MergeResult {
    /// Updated cumulative record to persist.
    pub statistic: CumulativeStatistic,
    /// New points, ascending, one per reading that was actually folded in.
    pub points: Vec<StatisticPoint>,
    /// Readings skipped because the stream had already absorbed them.
    pub skipped: usize,
    /// Negative per-interval deltas clamped to zero (provider corrections).
    pub clamped: usize,
}

/// Fold readings into a stream's cumulative series.
///
/// `readings` must be ascending by timestamp, which [`crate::normalize`]
/// guarantees. The input statistic is not mutated; persistence only happens
/// once the caller stores the returned record, so an interrupted cycle leaves
/// the stream exactly where it was.
pub fn merge(
    existing: &CumulativeStatistic,
    readings: &[NormalizedReading],
    kind: StreamKind,
) -> MergeResult {
    let mut statistic = existing.clone();
    let mut points = Vec::new();
    let mut skipped = 0_usize;
    let mut clamped = 0_usize;

    for reading in readings {
        if let Some(last) = statistic.last_timestamp
            && reading.timestamp <= last
        {
            skipped += 1;
            continue;
        }
        let mut delta = kind.delta_for(reading);
        if delta < 0.0 {
            clamped += 1;
            delta = 0.0;
        }
        statistic.last_known_total += delta;
        statistic.last_timestamp = Some(reading.timestamp);
        points.push(StatisticPoint {
            timestamp: reading.timestamp,
            total: statistic.last_known_total,
        });
    }

    if skipped > 0 || clamped > 0 {
        debug!(
            "stream {}: {} overlapping reading(s) skipped, {} negative delta(s) clamped",
            statistic.stream_id, skipped, clamped
        );
    }
    MergeResult {
        statistic,
        points,
        skipped,
        clamped,
    }
}

/// Persistence seam for cumulative statistics.
///
/// `append` must be atomic per call: either the updated record and all its
/// points land, or nothing does.
#[async_trait]
pub trait StatisticsStore: Send + Sync {
    /// Load the cumulative record for a stream, `None` if never merged into.
    async fn load(&self, stream_id: &str) -> Result<Option<CumulativeStatistic>, StoreError>;

    /// Persist the updated record and append its new points.
    async fn append(
        &self,
        statistic: &CumulativeStatistic,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError>;

    /// Full stored series for a stream, oldest first.
    async fn series(&self, stream_id: &str) -> Result<Vec<StatisticPoint>, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use gridflux_types::MeterType;

    fn ts(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 15, 0, minute, 0).unwrap()
    }

    fn reading(minute: u32, consumption: f64) -> NormalizedReading {
        NormalizedReading {
            timestamp: ts(minute),
            meter_type: MeterType::Electricity,
            consumption_kwh: consumption,
            injection_kwh: 0.0,
            tariff_high_kwh: consumption,
            tariff_low_kwh: 0.0,
        }
    }

    #[test]
    fn test_merge_accumulates_from_empty() {
        let existing = CumulativeStatistic::empty("consumption_total");
        let readings = vec![reading(0, 0.5), reading(15, 0.25)];

        let result = merge(&existing, &readings, StreamKind::ConsumptionTotal);
        assert_eq!(result.points.len(), 2);
        assert_eq!(result.points[0].total, 0.5);
        assert_eq!(result.points[1].total, 0.75);
        assert_eq!(result.statistic.last_known_total, 0.75);
        assert_eq!(result.statistic.last_timestamp, Some(ts(15)));
        assert_eq!(result.skipped, 0);
    }

    #[test]
    fn test_merge_is_idempotent_for_replayed_windows() {
        let existing = CumulativeStatistic::empty("consumption_total");
        let readings = vec![reading(0, 0.5), reading(15, 0.25)];

        let first = merge(&existing, &readings, StreamKind::ConsumptionTotal);
        let second = merge(&first.statistic, &readings, StreamKind::ConsumptionTotal);

        assert!(second.points.is_empty());
        assert_eq!(second.skipped, 2);
        assert_eq!(second.statistic, first.statistic);
    }

    #[test]
    fn test_merge_absorbs_partial_overlap() {
        let existing = CumulativeStatistic::empty("consumption_total");
        let first = merge(
            &existing,
            &[reading(0, 0.5)],
            StreamKind::ConsumptionTotal,
        );

        let overlap = vec![reading(0, 0.5), reading(15, 0.25)];
        let second = merge(&first.statistic, &overlap, StreamKind::ConsumptionTotal);

        assert_eq!(second.skipped, 1);
        assert_eq!(second.points.len(), 1);
        assert_eq!(second.statistic.last_known_total, 0.75);
    }

    #[test]
    fn test_merge_clamps_negative_deltas() {
        let existing = CumulativeStatistic::empty("consumption_total");
        let readings = vec![reading(0, 0.5), reading(15, -0.3), reading(30, 0.1)];

        let result = merge(&existing, &readings, StreamKind::ConsumptionTotal);
        assert_eq!(result.clamped, 1);
        // total never decreases
        assert_eq!(result.points[1].total, 0.5);
        assert!((result.statistic.last_known_total - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_merge_does_not_mutate_input() {
        let existing = CumulativeStatistic::empty("consumption_total");
        let _ = merge(&existing, &[reading(0, 1.0)], StreamKind::ConsumptionTotal);
        assert_eq!(existing.last_known_total, 0.0);
        assert!(existing.last_timestamp.is_none());
    }

    #[test]
    fn test_merge_selects_stream_delta() {
        let existing = CumulativeStatistic::empty("consumption_high");
        let result = merge(&existing, &[reading(0, 0.5)], StreamKind::TariffHigh);
        assert_eq!(result.statistic.last_known_total, 0.5);

        let low = merge(
            &CumulativeStatistic::empty("consumption_low"),
            &[reading(0, 0.5)],
            StreamKind::TariffLow,
        );
        assert_eq!(low.statistic.last_known_total, 0.0);
    }
}
