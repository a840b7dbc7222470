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

//! Client for the Fluvius consumer portal: PKCE authentication against the
//! B2C identity provider and windowed interval-history fetching.

pub mod auth;
pub mod client;
pub mod errors;

pub use auth::{AuthClient, Credential, CredentialVault, PkcePair};
pub use client::FluviusClient;
pub use errors::{AuthError, FetchError};
