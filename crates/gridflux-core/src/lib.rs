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

//! Synchronization core: normalization of raw interval data, idempotent
//! merge into cumulative statistics, persistence, and the cycle coordinator.

pub mod coordinator;
pub mod errors;
pub mod normalize;
pub mod statistics;
pub mod store;

pub use coordinator::{CycleReport, DiagnosticsSnapshot, LatestDaySummary, SyncCoordinator};
pub use errors::{StoreError, SyncError};
pub use normalize::{NormalizeOutcome, normalize};
pub use statistics::{MergeResult, StatisticsStore, merge};
pub use store::{JsonStatisticsStore, MemoryStatisticsStore};
