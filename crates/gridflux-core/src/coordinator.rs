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

//! Synchronization coordinator.
//!
//! One cycle is: ensure a valid credential, fetch the overlapping history
//! window, normalize, merge every stream, persist. Transient provider
//! failures are retried with exponential backoff inside the cycle; a 401 on
//! the history endpoint burns the cached credential and forces exactly one
//! re-authentication before giving up. Configured secrets are spent on at
//! most one rejected login: after that every cycle reports `ReauthRequired`
//! until [`SyncCoordinator::update_credentials`] supplies fresh ones.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use gridflux_fluvius::{AuthClient, AuthError, CredentialVault, FetchError, FluviusClient};
use gridflux_types::{
    CumulativeStatistic, FetchWindow, MeterConfig, NormalizedReading, RawInterval, StatisticPoint,
    StreamKind,
};

use crate::errors::SyncError;
use crate::normalize::normalize;
use crate::statistics::{StatisticsStore, merge};

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Secrets-free snapshot of the meter's state after a cycle, in the shape
/// the host's diagnostics dump expects. Never carries password or tokens.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    pub ean: String,
    pub meter_serial: String,
    /// Cumulative total per stream after the merge, `(stream_id, total)`.
    pub cached_totals: Vec<(String, f64)>,
    /// Per-metric summary of the newest normalized local day.
    pub latest_day: Option<LatestDaySummary>,
}

/// Per-metric sums for the newest day that produced readings.
#[derive(Debug, Clone, Serialize)]
pub struct LatestDaySummary {
    pub date: NaiveDate,
    pub consumption_kwh: f64,
    pub injection_kwh: f64,
    pub tariff_high_kwh: f64,
    pub tariff_low_kwh: f64,
}

/// What one completed cycle did: the appended points per stream, the
/// diagnostics snapshot, and the normalize/merge counters.
#[derive(Debug, Clone)]
pub struct CycleReport {
    /// Points actually persisted this cycle, keyed by stream id.
    pub appended: HashMap<String, Vec<StatisticPoint>>,
    pub diagnostics: DiagnosticsSnapshot,
    pub window_from: String,
    pub window_until: String,
    pub raw_intervals: usize,
    pub readings: usize,
    pub points_appended: usize,
    pub overlap_skipped: usize,
    pub tariff_mismatches: usize,
    pub dropped: usize,
    pub clamped: usize,
}

/// Drives the sync cycle for one meter.
pub struct SyncCoordinator<S: StatisticsStore> {
    auth: AuthClient,
    client: FluviusClient,
    vault: CredentialVault,
    config: MeterConfig,
    store: S,
    backoff: Duration,
    /// Whether the configured secrets may still be spent on a full login.
    /// Cleared on the first rejected login so stale credentials are never
    /// retried silently.
    secrets_fresh: bool,
}

impl<S: StatisticsStore> SyncCoordinator<S> {
    pub fn new(config: MeterConfig, store: S) -> Result<Self, SyncError> {
        let auth = AuthClient::new().map_err(map_auth_error)?;
        let client =
            FluviusClient::new(&config.ean, &config.meter_serial).map_err(map_fetch_error)?;
        Ok(Self {
            auth,
            client,
            vault: CredentialVault::new(),
            config,
            store,
            backoff: BASE_BACKOFF,
            secrets_fresh: true,
        })
    }

    /// Point both clients at a different portal base (tests).
    pub fn with_portal(
        config: MeterConfig,
        store: S,
        portal_base: &str,
    ) -> Result<Self, SyncError> {
        let auth = AuthClient::with_portal(portal_base).map_err(map_auth_error)?;
        let client = FluviusClient::with_base_url(portal_base, &config.ean, &config.meter_serial)
            .map_err(map_fetch_error)?;
        Ok(Self {
            auth,
            client,
            vault: CredentialVault::new(),
            config,
            store,
            backoff: BASE_BACKOFF,
            secrets_fresh: true,
        })
    }

    /// Override the retry backoff base (tests).
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Install fresh secrets after a `ReauthRequired`, re-arming the login
    /// path for the next cycle.
    pub fn update_credentials(&mut self, email: impl Into<String>, password: impl Into<String>) {
        self.config.email = email.into();
        self.config.password = password.into();
        self.vault.clear();
        self.secrets_fresh = true;
    }

    /// Run one full synchronization cycle.
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SyncError> {
        let window = FetchWindow::for_meter(&self.config, Utc::now());
        info!(
            "🔄 Sync cycle for EAN {}: {} → {}",
            self.config.ean,
            window.history_from(),
            window.history_until()
        );

        let raw = self.fetch_with_retry(&window).await?;
        let raw_intervals = raw.len();

        let outcome = normalize(&raw, self.config.meter_type, self.config.gas_unit);
        debug!(
            "normalized {} raw interval(s) into {} reading(s)",
            raw_intervals,
            outcome.readings.len()
        );

        let mut appended: HashMap<String, Vec<StatisticPoint>> = HashMap::new();
        let mut points_appended = 0_usize;
        let mut overlap_skipped = 0_usize;
        let mut clamped = 0_usize;
        let mut cached_totals = Vec::new();
        for kind in StreamKind::for_meter(self.config.meter_type) {
            let stream_id = kind.stream_id();
            let existing = self
                .store
                .load(stream_id)
                .await?
                .unwrap_or_else(|| CumulativeStatistic::empty(stream_id));
            let result = merge(&existing, &outcome.readings, *kind);
            overlap_skipped += result.skipped;
            clamped += result.clamped;
            cached_totals.push((stream_id.to_string(), result.statistic.last_known_total));
            if result.points.is_empty() {
                continue;
            }
            points_appended += result.points.len();
            self.store.append(&result.statistic, &result.points).await?;
            debug!(
                "stream {stream_id}: appended {} point(s), total now {:.3}",
                result.points.len(),
                result.statistic.last_known_total
            );
            appended.insert(stream_id.to_string(), result.points);
        }

        let report = CycleReport {
            appended,
            diagnostics: DiagnosticsSnapshot {
                ean: self.config.ean.clone(),
                meter_serial: self.config.meter_serial.clone(),
                cached_totals,
                latest_day: self.latest_day_summary(&outcome.readings),
            },
            window_from: window.history_from(),
            window_until: window.history_until(),
            raw_intervals,
            readings: outcome.readings.len(),
            points_appended,
            overlap_skipped,
            tariff_mismatches: outcome.tariff_mismatches,
            dropped: outcome.dropped,
            clamped,
        };
        info!(
            "✅ Cycle complete for EAN {}: {} reading(s), {} point(s) appended, {} overlapping skipped",
            self.config.ean, report.readings, report.points_appended, report.overlap_skipped
        );
        Ok(report)
    }

    /// Sum the per-metric values of the newest local day with readings.
    fn latest_day_summary(&self, readings: &[NormalizedReading]) -> Option<LatestDaySummary> {
        let tz = self.config.resolve_timezone();
        let date = readings
            .last()
            .map(|r| r.timestamp.with_timezone(&tz).date_naive())?;
        let mut summary = LatestDaySummary {
            date,
            consumption_kwh: 0.0,
            injection_kwh: 0.0,
            tariff_high_kwh: 0.0,
            tariff_low_kwh: 0.0,
        };
        for reading in readings {
            if reading.timestamp.with_timezone(&tz).date_naive() != date {
                continue;
            }
            summary.consumption_kwh += reading.consumption_kwh;
            summary.injection_kwh += reading.injection_kwh;
            summary.tariff_high_kwh += reading.tariff_high_kwh;
            summary.tariff_low_kwh += reading.tariff_low_kwh;
        }
        Some(summary)
    }

    /// Fetch the window, retrying transient failures and allowing exactly one
    /// forced re-authentication on a 401.
    async fn fetch_with_retry(
        &mut self,
        window: &FetchWindow,
    ) -> Result<Vec<RawInterval>, SyncError> {
        let secrets = (self.config.email.clone(), self.config.password.clone());
        let mut reauth_forced = false;

        for attempt in 1..=MAX_ATTEMPTS {
            let fresh_secrets = self
                .secrets_fresh
                .then_some((secrets.0.as_str(), secrets.1.as_str()));
            let credential = match self.auth.ensure_valid(&mut self.vault, fresh_secrets).await {
                Ok(credential) => credential,
                Err(AuthError::Unavailable(reason)) => {
                    self.wait_or_fail(attempt, &reason).await?;
                    continue;
                }
                Err(AuthError::InvalidCredentials) => {
                    // one shot per set of secrets
                    self.secrets_fresh = false;
                    warn!("login rejected, holding off until fresh credentials are supplied");
                    return Err(SyncError::ReauthRequired);
                }
                Err(err) => return Err(map_auth_error(err)),
            };

            match self.client.fetch_history(&credential, window).await {
                Ok(intervals) => return Ok(intervals),
                Err(FetchError::Unauthorized) => {
                    // token accepted locally but rejected remotely
                    self.vault.clear();
                    if reauth_forced {
                        return Err(SyncError::ReauthRequired);
                    }
                    reauth_forced = true;
                    warn!("history endpoint rejected the token, forcing re-authentication");
                }
                Err(FetchError::Unavailable(reason)) => {
                    self.wait_or_fail(attempt, &reason).await?;
                }
                Err(err @ FetchError::Malformed(_)) => return Err(map_fetch_error(err)),
            }
        }
        Err(SyncError::Unavailable(format!(
            "gave up after {MAX_ATTEMPTS} attempts"
        )))
    }

    async fn wait_or_fail(&self, attempt: u32, reason: &str) -> Result<(), SyncError> {
        if attempt >= MAX_ATTEMPTS {
            return Err(SyncError::Unavailable(format!(
                "gave up after {MAX_ATTEMPTS} attempts: {reason}"
            )));
        }
        let delay = self.backoff * 2_u32.saturating_pow(attempt - 1);
        warn!(
            "💤 Provider unavailable ({reason}), retrying in {:.1}s (attempt {attempt}/{MAX_ATTEMPTS})",
            delay.as_secs_f64()
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

fn map_auth_error(err: AuthError) -> SyncError {
    match err {
        AuthError::InvalidCredentials | AuthError::ReauthRequired => SyncError::ReauthRequired,
        AuthError::Unavailable(reason) => SyncError::Unavailable(reason),
        AuthError::Protocol(reason) => SyncError::Protocol(reason),
    }
}

fn map_fetch_error(err: FetchError) -> SyncError {
    match err {
        FetchError::Unauthorized => SyncError::ReauthRequired,
        FetchError::Unavailable(reason) => SyncError::Unavailable(reason),
        FetchError::Malformed(reason) => SyncError::Protocol(reason),
    }
}
