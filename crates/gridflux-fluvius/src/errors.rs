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

//! Error types for the provider client

use thiserror::Error;

/// Failures of the login/refresh state machine.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The identity provider rejected the supplied credentials (4xx).
    #[error("identity provider rejected the credentials")]
    InvalidCredentials,

    /// The B2C pipeline did not behave as expected (missing redirect, code,
    /// settings payload or token body). Not retryable.
    #[error("authentication protocol error: {0}")]
    Protocol(String),

    /// Network failure or identity-provider 5xx. Retryable.
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),

    /// Silent refresh is no longer possible and no fresh secrets were
    /// supplied; the host must prompt for credentials.
    #[error("re-authentication required")]
    ReauthRequired,
}

/// Failures of a windowed history fetch.
#[derive(Debug, Error)]
pub enum FetchError {
    /// 401 despite a locally valid token; the caller should force one
    /// refresh and retry once.
    #[error("history request was rejected as unauthorized")]
    Unauthorized,

    /// Network failure or metering API 5xx. Retryable.
    #[error("metering API unavailable: {0}")]
    Unavailable(String),

    /// The payload could not be parsed or the request was structurally
    /// rejected. Not retryable.
    #[error("malformed metering response: {0}")]
    Malformed(String),
}
