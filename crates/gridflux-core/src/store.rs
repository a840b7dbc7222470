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

//! Statistics persistence backends.
//!
//! [`JsonStatisticsStore`] keeps all streams of one meter in a single JSON
//! file, rewritten atomically (temp file + rename) on every append so a crash
//! mid-write can never leave a torn state behind. [`MemoryStatisticsStore`]
//! backs tests.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::debug;

use gridflux_types::{CumulativeStatistic, StatisticPoint};

use crate::errors::StoreError;
use crate::statistics::StatisticsStore;

/// Points older than this (relative to the newest point of the stream) are
/// pruned on append to keep the state file bounded.
const MAX_STORED_DAYS: i64 = 60;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StreamRecord {
    statistic: Option<CumulativeStatistic>,
    #[serde(default)]
    points: Vec<StatisticPoint>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreState {
    #[serde(default)]
    streams: HashMap<String, StreamRecord>,
}

/// File-backed store, one JSON file per meter.
#[derive(Debug)]
pub struct JsonStatisticsStore {
    path: PathBuf,
    // serializes the read-modify-write of the state file
    lock: Mutex<()>,
}

impl JsonStatisticsStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_state(&self) -> Result<StoreState, StoreError> {
        if !self.path.exists() {
            return Ok(StoreState::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(StoreState::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    fn write_state(&self, state: &StoreState) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let tmp = temp_path(&self.path);
        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(ToOwned::to_owned).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn prune(points: &mut Vec<StatisticPoint>) {
    let Some(newest) = points.iter().map(|p| p.timestamp).max() else {
        return;
    };
    let cutoff = newest - Duration::days(MAX_STORED_DAYS);
    let before = points.len();
    points.retain(|p| p.timestamp >= cutoff);
    if points.len() < before {
        debug!("pruned {} stored point(s) past the retention window", before - points.len());
    }
}

#[async_trait]
impl StatisticsStore for JsonStatisticsStore {
    async fn load(&self, stream_id: &str) -> Result<Option<CumulativeStatistic>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.read_state()?;
        Ok(state
            .streams
            .get(stream_id)
            .and_then(|record| record.statistic.clone()))
    }

    async fn append(
        &self,
        statistic: &CumulativeStatistic,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut state = self.read_state()?;
        let record = state
            .streams
            .entry(statistic.stream_id.clone())
            .or_default();
        record.statistic = Some(statistic.clone());
        record.points.extend_from_slice(points);
        record.points.sort_by_key(|p| p.timestamp);
        record.points.dedup_by_key(|p| p.timestamp);
        prune(&mut record.points);
        self.write_state(&state)
    }

    async fn series(&self, stream_id: &str) -> Result<Vec<StatisticPoint>, StoreError> {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        let state = self.read_state()?;
        Ok(state
            .streams
            .get(stream_id)
            .map(|record| record.points.clone())
            .unwrap_or_default())
    }
}

/// In-memory store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStatisticsStore {
    state: Mutex<HashMap<String, StreamRecord>>,
}

impl MemoryStatisticsStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StatisticsStore for MemoryStatisticsStore {
    async fn load(&self, stream_id: &str) -> Result<Option<CumulativeStatistic>, StoreError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .get(stream_id)
            .and_then(|record| record.statistic.clone()))
    }

    async fn append(
        &self,
        statistic: &CumulativeStatistic,
        points: &[StatisticPoint],
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let record = state.entry(statistic.stream_id.clone()).or_default();
        record.statistic = Some(statistic.clone());
        record.points.extend_from_slice(points);
        record.points.sort_by_key(|p| p.timestamp);
        record.points.dedup_by_key(|p| p.timestamp);
        Ok(())
    }

    async fn series(&self, stream_id: &str) -> Result<Vec<StatisticPoint>, StoreError> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        Ok(state
            .get(stream_id)
            .map(|record| record.points.clone())
            .unwrap_or_default())
    }
}
