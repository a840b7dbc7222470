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

//! Error types for the synchronization core

use thiserror::Error;

/// Failures of the statistics persistence layer.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("statistics store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("statistics store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Failures of one synchronization cycle.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials were rejected and silent recovery is not possible; the
    /// host must obtain fresh secrets before the next cycle can succeed.
    #[error("re-authentication required")]
    ReauthRequired,

    /// The provider stayed unavailable across the whole retry budget.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider sent something structurally wrong. Not retryable.
    #[error("provider protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}
