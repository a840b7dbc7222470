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

//! Windowed interval-history fetching from the consumer portal.
//!
//! The measurement endpoint returns an array of day blocks, each carrying a
//! list of values tagged with numeric direction (`dc`), tariff (`t`) and
//! unit (`u`) codes. This module flattens those blocks into [`RawInterval`]s
//! tagged with a decoded [`Channel`]; anything it cannot place keeps flowing
//! as [`Channel::Other`] so one odd datum never fails a cycle.

use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use gridflux_types::{Channel, FetchWindow, RawInterval};

use crate::auth::{Credential, DEFAULT_PORTAL_URL, TIMEOUT, USER_AGENT};
use crate::errors::FetchError;

const UNIT_KWH: i64 = 3;
const UNIT_CUBIC_METERS: i64 = 5;
const DIRECTION_INJECTION: i64 = 2;
const TARIFF_HIGH: i64 = 1;
const TARIFF_LOW: i64 = 2;

/// Metering-history client for one meter.
#[derive(Debug, Clone)]
pub struct FluviusClient {
    http: Client,
    base_url: String,
    ean: String,
    meter_serial: String,
}

#[derive(Debug, Deserialize)]
struct RawMeasurementDay {
    /// Interval start timestamp, local ISO-8601.
    #[serde(default)]
    d: Option<String>,
    /// Interval end timestamp. Unused, present for completeness of the wire
    /// shape.
    #[serde(default)]
    #[allow(dead_code)]
    de: Option<String>,
    #[serde(default)]
    v: Vec<RawMeasurementValue>,
}

#[derive(Debug, Deserialize)]
struct RawMeasurementValue {
    /// Direction code: 0/1 consumption, 2 injection.
    #[serde(default)]
    dc: Option<i64>,
    /// Tariff code: 1 high (day), 2 low (night).
    #[serde(default)]
    t: Option<i64>,
    /// Unit code: 3 kWh, 5 m3.
    #[serde(default)]
    u: Option<i64>,
    /// Measured value.
    #[serde(default)]
    v: Option<f64>,
}

impl FluviusClient {
    pub fn new(ean: impl Into<String>, meter_serial: impl Into<String>) -> Result<Self, FetchError> {
        Self::with_base_url(DEFAULT_PORTAL_URL, ean, meter_serial)
    }

    /// Point the client at a different portal base (tests).
    pub fn with_base_url(
        base_url: impl Into<String>,
        ean: impl Into<String>,
        meter_serial: impl Into<String>,
    ) -> Result<Self, FetchError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| FetchError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            ean: ean.into(),
            meter_serial: meter_serial.into(),
        })
    }

    /// Fetch the interval history for one window.
    ///
    /// An empty payload is a normal outcome (the provider publishes validated
    /// data with a delay of a day or more) and yields an empty vector, never
    /// an error.
    pub async fn fetch_history(
        &self,
        credential: &Credential,
        window: &FetchWindow,
    ) -> Result<Vec<RawInterval>, FetchError> {
        let url = format!(
            "{}/verbruik/api/meter-measurement-history/{}",
            self.base_url, self.ean
        );
        debug!(
            "📊 Fetching history for EAN {}: {} → {}",
            self.ean,
            window.history_from(),
            window.history_until()
        );
        let response = self
            .http
            .get(&url)
            .query(&[
                ("historyFrom", window.history_from()),
                ("historyUntil", window.history_until()),
                ("granularity", window.granularity.code().to_string()),
                ("asServiceProvider", "false".to_string()),
                ("meterSerialNumber", self.meter_serial.clone()),
            ])
            .bearer_auth(&credential.access_token)
            .send()
            .await
            .map_err(|e| FetchError::Unavailable(e.to_string()))?;

        let status = response.status();
        match status {
            StatusCode::OK => {}
            StatusCode::UNAUTHORIZED => return Err(FetchError::Unauthorized),
            s if s.is_server_error() => {
                return Err(FetchError::Unavailable(format!(
                    "metering API returned {s}"
                )));
            }
            s => {
                let body = response.text().await.unwrap_or_default();
                return Err(FetchError::Malformed(format!(
                    "metering API returned {s}: {}",
                    snippet(&body, 200)
                )));
            }
        }

        let days: Vec<RawMeasurementDay> = response
            .json()
            .await
            .map_err(|e| FetchError::Malformed(format!("undecodable history payload: {e}")))?;

        let mut intervals = Vec::new();
        let mut skipped = 0_usize;
        for day in days {
            let Some(raw_timestamp) = day.d.as_deref() else {
                skipped += day.v.len();
                continue;
            };
            let Some(timestamp) = parse_timestamp(raw_timestamp) else {
                debug!("skipping block with unparseable timestamp {raw_timestamp:?}");
                skipped += day.v.len();
                continue;
            };
            for value in day.v {
                let Some(measured) = value.v else {
                    skipped += 1;
                    continue;
                };
                intervals.push(RawInterval {
                    timestamp,
                    value: measured,
                    channel: channel_from_codes(value.dc, value.t, value.u),
                });
            }
        }
        if skipped > 0 {
            warn!("dropped {skipped} history values without timestamp or value");
        }
        info!(
            "📥 Received {} raw intervals for EAN {}",
            intervals.len(),
            self.ean
        );
        Ok(intervals)
    }
}

/// Map the provider's direction/tariff/unit codes to a channel.
fn channel_from_codes(dc: Option<i64>, t: Option<i64>, u: Option<i64>) -> Channel {
    if u == Some(UNIT_CUBIC_METERS) {
        return Channel::Volume;
    }
    if u != Some(UNIT_KWH) {
        return Channel::Other;
    }
    match dc {
        Some(DIRECTION_INJECTION) => Channel::Injection,
        Some(0 | 1) => match t {
            Some(TARIFF_HIGH) => Channel::TariffHigh,
            Some(TARIFF_LOW) => Channel::TariffLow,
            _ => Channel::Consumption,
        },
        _ => Channel::Other,
    }
}

/// Timestamps arrive either with an explicit offset or naive local-ish; naive
/// values are taken as UTC and corrected downstream by the window semantics.
fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

fn snippet(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use gridflux_types::{Granularity, MeterConfig};
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn credential() -> Credential {
        Credential {
            access_token: "bearer-token".to_string(),
            refresh_token: None,
            expires_at: Utc::now() + Duration::hours(1),
            scope: String::new(),
        }
    }

    fn window() -> FetchWindow {
        let config: MeterConfig = serde_json::from_value(json!({
            "email": "user@example.com",
            "password": "secret",
            "ean": "541448800000000000",
            "meter_serial": "SN-1",
            "days_back": 2
        }))
        .unwrap();
        FetchWindow::for_meter(&config, Utc::now())
    }

    #[test]
    fn test_channel_decoding() {
        assert_eq!(channel_from_codes(Some(0), Some(1), Some(3)), Channel::TariffHigh);
        assert_eq!(channel_from_codes(Some(1), Some(2), Some(3)), Channel::TariffLow);
        assert_eq!(channel_from_codes(Some(0), None, Some(3)), Channel::Consumption);
        assert_eq!(channel_from_codes(Some(2), Some(1), Some(3)), Channel::Injection);
        assert_eq!(channel_from_codes(Some(0), Some(1), Some(5)), Channel::Volume);
        assert_eq!(channel_from_codes(Some(9), None, Some(3)), Channel::Other);
        assert_eq!(channel_from_codes(None, None, None), Channel::Other);
    }

    #[test]
    fn test_timestamp_parsing() {
        let with_offset = parse_timestamp("2026-01-15T00:00:00.000+01:00").unwrap();
        assert_eq!(
            with_offset,
            Utc.with_ymd_and_hms(2026, 1, 14, 23, 0, 0).unwrap()
        );

        let naive = parse_timestamp("2026-01-15T00:15:00").unwrap();
        assert_eq!(naive, Utc.with_ymd_and_hms(2026, 1, 15, 0, 15, 0).unwrap());

        assert!(parse_timestamp("yesterday").is_none());
    }

    #[tokio::test]
    async fn test_fetch_history_decodes_payload() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/verbruik/api/meter-measurement-history/541448800000000000")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("granularity".to_string(), "3".to_string()),
                Matcher::UrlEncoded("asServiceProvider".to_string(), "false".to_string()),
                Matcher::UrlEncoded("meterSerialNumber".to_string(), "SN-1".to_string()),
            ]))
            .match_header("authorization", "Bearer bearer-token")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!([
                    {
                        "d": "2026-01-15T00:00:00.000+01:00",
                        "de": "2026-01-15T00:15:00.000+01:00",
                        "v": [
                            {"dc": 0, "t": 1, "u": 3, "v": 0.25},
                            {"dc": 2, "t": 1, "u": 3, "v": 0.05},
                            {"dc": 0, "t": 1, "u": 3, "v": null}
                        ]
                    },
                    {
                        "d": "not-a-timestamp",
                        "v": [{"dc": 0, "t": 1, "u": 3, "v": 1.0}]
                    }
                ])
                .to_string(),
            )
            .create_async()
            .await;

        let mut window = window();
        window.granularity = Granularity::QuarterHour;
        let client =
            FluviusClient::with_base_url(server.url(), "541448800000000000", "SN-1").unwrap();
        let intervals = client.fetch_history(&credential(), &window).await.unwrap();

        assert_eq!(intervals.len(), 2);
        assert_eq!(intervals[0].channel, Channel::TariffHigh);
        assert_eq!(intervals[0].value, 0.25);
        assert_eq!(intervals[1].channel, Channel::Injection);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_history_empty_payload_is_ok() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/verbruik/api/meter-measurement-history/541448800000000000")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("[]")
            .create_async()
            .await;

        let client =
            FluviusClient::with_base_url(server.url(), "541448800000000000", "SN-1").unwrap();
        let intervals = client.fetch_history(&credential(), &window()).await.unwrap();
        assert!(intervals.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_history_unauthorized() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/verbruik/api/meter-measurement-history/541448800000000000")
            .match_query(Matcher::Any)
            .with_status(401)
            .create_async()
            .await;

        let client =
            FluviusClient::with_base_url(server.url(), "541448800000000000", "SN-1").unwrap();
        let result = client.fetch_history(&credential(), &window()).await;
        assert!(matches!(result, Err(FetchError::Unauthorized)));
    }

    #[tokio::test]
    async fn test_fetch_history_server_error_is_retryable() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/verbruik/api/meter-measurement-history/541448800000000000")
            .match_query(Matcher::Any)
            .with_status(503)
            .create_async()
            .await;

        let client =
            FluviusClient::with_base_url(server.url(), "541448800000000000", "SN-1").unwrap();
        let result = client.fetch_history(&credential(), &window()).await;
        assert!(matches!(result, Err(FetchError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_fetch_history_malformed_payload() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/verbruik/api/meter-measurement-history/541448800000000000")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body("{\"unexpected\": true}")
            .create_async()
            .await;

        let client =
            FluviusClient::with_base_url(server.url(), "541448800000000000", "SN-1").unwrap();
        let result = client.fetch_history(&credential(), &window()).await;
        assert!(matches!(result, Err(FetchError::Malformed(_))));
    }
}
