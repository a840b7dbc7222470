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

//! PKCE authentication against the portal's B2C identity provider.
//!
//! The portal exposes no official API; login walks the same pages the web
//! client does: MSAL config discovery, the authorize page (which embeds its
//! CSRF state as `var SETTINGS = {...};` inside the HTML), the SelfAsserted
//! credential POST, and a redirect chain that finally carries the
//! authorization code. Token refresh uses the standard refresh grant against
//! the same token endpoint.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use reqwest::{Client, StatusCode, Url, redirect};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{debug, info, warn};

use crate::errors::AuthError;

pub(crate) const DEFAULT_PORTAL_URL: &str = "https://mijn.fluvius.be";
const DEFAULT_AUTHORITY: &str =
    "https://login.fluvius.be/klanten.onmicrosoft.com/B2C_1A_customer_signup_signin";
const DEFAULT_REDIRECT_URI: &str = "https://mijn.fluvius.be/";
const DEFAULT_SCOPE: &str = "https://klanten.onmicrosoft.com/MijnFluvius/user_impersonation";

/// The portal checks for a browser-looking user agent.
pub(crate) const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36";

pub(crate) const TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

/// Tokens are treated as expired this long before the server says so.
const EXPIRY_MARGIN_SECS: i64 = 60;
const DEFAULT_TOKEN_LIFETIME_SECS: i64 = 3600;
const MAX_REDIRECT_HOPS: usize = 6;

/// A PKCE verifier/challenge pair (RFC 7636, S256).
#[derive(Clone, Debug)]
pub struct PkcePair {
    /// Random verifier string (base64url, no padding).
    pub verifier: String,
    /// SHA-256 challenge of the verifier (base64url, no padding).
    pub challenge: String,
}

impl PkcePair {
    /// Generate a fresh pair from 32 cryptographically-secure random bytes.
    pub fn generate() -> Self {
        let random_bytes: [u8; 32] = rand::random();
        let verifier = URL_SAFE_NO_PAD.encode(random_bytes);

        let mut hasher = Sha256::new();
        hasher.update(verifier.as_bytes());
        let challenge = URL_SAFE_NO_PAD.encode(hasher.finalize());

        Self { verifier, challenge }
    }
}

/// Bearer/refresh token set with its effective expiry.
///
/// `expires_at` already has the safety margin subtracted, so a credential is
/// usable exactly while `expires_at` lies in the future. Replaced whole on
/// every refresh, never mutated in place, and never persisted in clear form.
#[derive(Clone)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub scope: String,
}

impl Credential {
    fn from_token_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let lifetime = response
            .expires_in
            .map_or(DEFAULT_TOKEN_LIFETIME_SECS, |e| e.seconds());
        Self {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: now + Duration::seconds(lifetime - EXPIRY_MARGIN_SECS),
            scope: response.scope.unwrap_or_default(),
        }
    }

    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

// Tokens must never leak through Debug formatting in logs or diagnostics.
impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("scope", &self.scope)
            .finish()
    }
}

/// Holds the current credential for one account. Pure state, no side
/// effects; the coordinator's single-flight discipline serializes access.
#[derive(Debug, Default)]
pub struct CredentialVault {
    current: Option<Credential>,
}

impl CredentialVault {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<&Credential> {
        self.current.as_ref()
    }

    pub fn set(&mut self, credential: Credential) {
        self.current = Some(credential);
    }

    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<ExpiresIn>,
    #[serde(default)]
    scope: Option<String>,
}

// B2C tenants report expires_in either as a number or a decimal string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExpiresIn {
    Seconds(i64),
    Text(String),
}

impl ExpiresIn {
    fn seconds(&self) -> i64 {
        match self {
            Self::Seconds(s) => *s,
            Self::Text(t) => t.parse().unwrap_or(DEFAULT_TOKEN_LIFETIME_SECS),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct MsalConfig {
    client_id: Option<String>,
    authority: Option<String>,
    redirect_uri: Option<String>,
    scopes: Option<ScopeHint>,
    auth: Option<MsalAuthSection>,
    auth_request: Option<MsalAuthRequest>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default, rename_all = "camelCase")]
struct MsalAuthSection {
    client_id: Option<String>,
    authority: Option<String>,
    redirect_uri: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct MsalAuthRequest {
    scopes: Option<ScopeHint>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ScopeHint {
    List(Vec<String>),
    Spaced(String),
}

impl ScopeHint {
    fn items(&self) -> Vec<String> {
        match self {
            Self::List(list) => list.clone(),
            Self::Spaced(text) => text.split_whitespace().map(str::to_string).collect(),
        }
    }
}

impl MsalConfig {
    fn client_id(&self) -> Option<&str> {
        self.client_id
            .as_deref()
            .or_else(|| self.auth.as_ref().and_then(|a| a.client_id.as_deref()))
    }

    fn authority(&self) -> &str {
        self.authority
            .as_deref()
            .or_else(|| self.auth.as_ref().and_then(|a| a.authority.as_deref()))
            .unwrap_or(DEFAULT_AUTHORITY)
    }

    fn redirect_uri(&self) -> &str {
        self.redirect_uri
            .as_deref()
            .or_else(|| self.auth.as_ref().and_then(|a| a.redirect_uri.as_deref()))
            .unwrap_or(DEFAULT_REDIRECT_URI)
    }

    /// Merge the scope hints and make sure the scopes the token exchange
    /// depends on are always present.
    fn normalized_scopes(&self) -> String {
        let mut flat: Vec<String> = Vec::new();
        let hints = [
            self.scopes.as_ref(),
            self.auth_request.as_ref().and_then(|r| r.scopes.as_ref()),
        ];
        for hint in hints.into_iter().flatten() {
            for scope in hint.items() {
                if !flat.contains(&scope) {
                    flat.push(scope);
                }
            }
        }
        for required in ["openid", "offline_access", DEFAULT_SCOPE] {
            if !flat.iter().any(|s| s == required) {
                flat.push(required.to_string());
            }
        }
        flat.join(" ")
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct B2cSettings {
    csrf: Option<String>,
    #[serde(rename = "transId")]
    trans_id: Option<String>,
    api: Option<String>,
    hosts: Option<B2cHosts>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct B2cHosts {
    policy: Option<String>,
    tenant: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct SaFields {
    #[serde(rename = "AttributeFields")]
    attribute_fields: Vec<AttributeField>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct AttributeField {
    #[serde(rename = "ID")]
    id: Option<String>,
    #[serde(rename = "IS_PASSWORD")]
    is_password: bool,
}

impl SaFields {
    /// The first attribute field carries the login, the flagged one the
    /// password.
    fn resolve_fields(&self) -> Result<(String, String), AuthError> {
        let login = self
            .attribute_fields
            .first()
            .and_then(|f| f.id.clone())
            .ok_or_else(|| AuthError::Protocol("SA_FIELDS.AttributeFields is empty".to_string()))?;
        let password = self
            .attribute_fields
            .iter()
            .find(|f| f.is_password)
            .and_then(|f| f.id.clone())
            .ok_or_else(|| {
                AuthError::Protocol("unable to detect the password field identifier".to_string())
            })?;
        Ok((login, password))
    }
}

/// PKCE auth client for the identity provider.
#[derive(Debug, Clone)]
pub struct AuthClient {
    /// Follows redirects; used for the authorize page and form posts.
    http: Client,
    /// Redirects disabled; used to capture the authorization code.
    http_no_redirect: Client,
    portal_base: String,
}

impl AuthClient {
    pub fn new() -> Result<Self, AuthError> {
        Self::with_portal(DEFAULT_PORTAL_URL)
    }

    /// Point the whole flow at a different portal base (tests).
    pub fn with_portal(portal_base: impl Into<String>) -> Result<Self, AuthError> {
        let http = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| AuthError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        let http_no_redirect = Client::builder()
            .user_agent(USER_AGENT)
            .cookie_store(true)
            .redirect(redirect::Policy::none())
            .timeout(TIMEOUT)
            .build()
            .map_err(|e| AuthError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            http_no_redirect,
            portal_base: portal_base.into().trim_end_matches('/').to_string(),
        })
    }

    /// Return a usable credential, refreshing or re-authenticating as needed.
    ///
    /// A still-valid credential is returned unchanged. An expiring one goes
    /// through the silent refresh grant. When refresh is rejected, a full
    /// login is attempted only with `fresh_secrets` supplied by the caller;
    /// stale secrets are never retried silently. Transient failures leave
    /// the vault untouched so the caller can retry; everything else clears
    /// it.
    pub async fn ensure_valid(
        &self,
        vault: &mut CredentialVault,
        fresh_secrets: Option<(&str, &str)>,
    ) -> Result<Credential, AuthError> {
        let now = Utc::now();
        if let Some(credential) = vault.get() {
            if credential.is_valid(now) {
                return Ok(credential.clone());
            }
            if let Some(refresh_token) = credential.refresh_token.clone() {
                debug!("access token expiring, attempting silent refresh");
                match self.refresh(&refresh_token).await {
                    Ok(refreshed) => {
                        info!("🔑 Token refreshed, valid until {}", refreshed.expires_at);
                        vault.set(refreshed.clone());
                        return Ok(refreshed);
                    }
                    Err(AuthError::Unavailable(reason)) => {
                        return Err(AuthError::Unavailable(reason));
                    }
                    Err(err) => {
                        warn!("silent refresh rejected: {err}");
                    }
                }
            }
        }

        vault.clear();
        match fresh_secrets {
            Some((email, password)) => {
                let credential = self.login(email, password).await?;
                vault.set(credential.clone());
                Ok(credential)
            }
            None => Err(AuthError::ReauthRequired),
        }
    }

    /// Full authorization-code-with-PKCE login.
    pub async fn login(&self, email: &str, password: &str) -> Result<Credential, AuthError> {
        info!("🔐 Starting PKCE login");
        let msal = self.fetch_msal_config().await?;
        let authority = msal.authority().trim_end_matches('/').to_string();
        let client_id = msal
            .client_id()
            .ok_or_else(|| AuthError::Protocol("MSAL config does not expose a clientId".to_string()))?
            .to_string();
        let redirect_uri = msal.redirect_uri().to_string();
        let scopes = msal.normalized_scopes();

        let pkce = PkcePair::generate();
        let state = random_urlsafe(32);
        let nonce = random_urlsafe(32);

        let authorize_url = build_authorize_url(
            &authority,
            &client_id,
            &redirect_uri,
            &scopes,
            &pkce.challenge,
            &state,
            &nonce,
            email,
        )?;
        debug!("fetching B2C authorize page");
        let response = self.http.get(authorize_url).send().await.map_err(net_err)?;
        if response.status().is_server_error() {
            return Err(AuthError::Unavailable(format!(
                "authorize page returned {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(AuthError::Protocol(format!(
                "authorize page returned {}",
                response.status()
            )));
        }
        let current_url = response.url().clone();
        let html = response.text().await.map_err(net_err)?;

        let settings: B2cSettings = extract_json_variable("SETTINGS", &html)?;
        let sa_fields: SaFields = extract_json_variable("SA_FIELDS", &html)?;
        let (login_field, password_field) = sa_fields.resolve_fields()?;

        let missing_keys =
            || AuthError::Protocol("B2C settings payload is missing required keys".to_string());
        let csrf = settings.csrf.clone().ok_or_else(missing_keys)?;
        let trans_id = settings.trans_id.clone().ok_or_else(missing_keys)?;
        let hosts = settings.hosts.as_ref().ok_or_else(missing_keys)?;
        let policy = hosts.policy.clone().ok_or_else(missing_keys)?;
        let tenant_path = hosts.tenant.clone().ok_or_else(missing_keys)?;

        let tenant_base = build_tenant_base(&current_url, &tenant_path)?;
        debug!("submitting credentials to SelfAsserted endpoint");
        self.submit_credentials(
            &tenant_base,
            &login_field,
            &password_field,
            email,
            password,
            &csrf,
            &trans_id,
            &policy,
        )
        .await?;

        debug!("finalising session at CombinedSigninAndSignup/confirmed");
        let combined_api = settings.api.as_deref().unwrap_or("CombinedSigninAndSignup");
        let confirm_url = build_confirm_url(&tenant_base, combined_api, &csrf, &trans_id, &policy)?;
        let (code, redirect_seen) = self
            .follow_redirects_for_code(&confirm_url, &state, &current_url)
            .await?;

        debug!("exchanging authorization code for tokens");
        let effective_redirect = if redirect_uri.is_empty() {
            redirect_seen
        } else {
            redirect_uri
        };
        let credential = self
            .exchange_code(&authority, &client_id, &effective_redirect, &scopes, &pkce.verifier, &code)
            .await?;
        info!("✅ Login complete, token valid until {}", credential.expires_at);
        Ok(credential)
    }

    /// Silent refresh via the refresh grant.
    pub async fn refresh(&self, refresh_token: &str) -> Result<Credential, AuthError> {
        let msal = self.fetch_msal_config().await?;
        let authority = msal.authority().trim_end_matches('/').to_string();
        let client_id = msal
            .client_id()
            .ok_or_else(|| AuthError::Protocol("MSAL config does not expose a clientId".to_string()))?
            .to_string();
        let scopes = msal.normalized_scopes();

        let token_url = format!("{authority}/oauth2/v2.0/token");
        let params = [
            ("client_id", client_id.as_str()),
            ("scope", scopes.as_str()),
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        let response = self
            .http
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(net_err)?;
        self.credential_from_token_response(response).await
    }

    async fn fetch_msal_config(&self) -> Result<MsalConfig, AuthError> {
        let url = format!("{}/api/global/msal/config", self.portal_base);
        let response = self.http.get(&url).send().await.map_err(net_err)?;
        if response.status().is_server_error() {
            return Err(AuthError::Unavailable(format!(
                "MSAL config endpoint returned {}",
                response.status()
            )));
        }
        if !response.status().is_success() {
            return Err(AuthError::Protocol(format!(
                "MSAL config endpoint returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| AuthError::Protocol(format!("failed to parse MSAL config: {e}")))
    }

    #[allow(clippy::too_many_arguments)]
    async fn submit_credentials(
        &self,
        tenant_base: &str,
        login_field: &str,
        password_field: &str,
        email: &str,
        password: &str,
        csrf: &str,
        trans_id: &str,
        policy: &str,
    ) -> Result<(), AuthError> {
        let submit_url = format!("{tenant_base}/SelfAsserted");
        let form = [
            ("request_type", "RESPONSE"),
            (login_field, email),
            (password_field, password),
        ];
        let response = self
            .http
            .post(&submit_url)
            .query(&[("tx", trans_id), ("p", policy)])
            .header("X-CSRF-TOKEN", csrf)
            .header("X-Requested-With", "XMLHttpRequest")
            .header("Accept", "application/json, text/javascript, */*; q=0.01")
            .form(&form)
            .send()
            .await
            .map_err(net_err)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(AuthError::Unavailable(format!(
                "credential submission returned {status}"
            )));
        }
        if status.is_client_error() {
            return Err(AuthError::InvalidCredentials);
        }
        let body = response.text().await.map_err(net_err)?;
        let value: serde_json::Value = serde_json::from_str(&body).map_err(|_| {
            AuthError::Protocol(format!(
                "credential submission returned non-JSON: {}",
                snippet(&body, 200)
            ))
        })?;
        let status_value = match value.get("status") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        if status_value != "200" && status_value != "success" {
            warn!("credential submission rejected with status {status_value:?}");
            return Err(AuthError::InvalidCredentials);
        }
        Ok(())
    }

    /// Follow the post-confirmation redirect chain by hand until the
    /// authorization code shows up in a query string.
    async fn follow_redirects_for_code(
        &self,
        start_url: &Url,
        expected_state: &str,
        origin_url: &Url,
    ) -> Result<(String, String), AuthError> {
        let mut origin = origin_url.clone();
        origin.set_path("/");
        origin.set_query(None);
        origin.set_fragment(None);

        let mut next_url = start_url.clone();
        for _ in 0..MAX_REDIRECT_HOPS {
            let response = self
                .http_no_redirect
                .get(next_url.clone())
                .send()
                .await
                .map_err(net_err)?;
            if !response.status().is_redirection() {
                return Err(AuthError::Protocol(
                    "authorization pipeline did not redirect to redirect_uri".to_string(),
                ));
            }
            let location = response
                .headers()
                .get(reqwest::header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    AuthError::Protocol("redirect response missing Location header".to_string())
                })?;
            let absolute = origin.join(location).map_err(|e| {
                AuthError::Protocol(format!("unresolvable redirect target {location:?}: {e}"))
            })?;

            let code = absolute
                .query_pairs()
                .find(|(k, _)| k == "code")
                .map(|(_, v)| v.into_owned());
            if let Some(code) = code {
                let returned_state = absolute
                    .query_pairs()
                    .find(|(k, _)| k == "state")
                    .map(|(_, v)| v.into_owned());
                if let Some(returned) = returned_state
                    && returned != expected_state
                {
                    return Err(AuthError::Protocol(
                        "state returned by B2C does not match the request state".to_string(),
                    ));
                }
                let mut seen = absolute.clone();
                seen.set_query(None);
                seen.set_fragment(None);
                return Ok((code, seen.to_string()));
            }
            next_url = absolute;
        }
        Err(AuthError::Protocol(
            "failed to capture the authorization code after multiple redirects".to_string(),
        ))
    }

    async fn exchange_code(
        &self,
        authority: &str,
        client_id: &str,
        redirect_uri: &str,
        scopes: &str,
        verifier: &str,
        code: &str,
    ) -> Result<Credential, AuthError> {
        let token_url = format!("{authority}/oauth2/v2.0/token");
        let params = [
            ("client_id", client_id),
            ("scope", scopes),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("grant_type", "authorization_code"),
            ("code_verifier", verifier),
        ];
        let response = self
            .http
            .post(&token_url)
            .form(&params)
            .send()
            .await
            .map_err(net_err)?;
        self.credential_from_token_response(response).await
    }

    async fn credential_from_token_response(
        &self,
        response: reqwest::Response,
    ) -> Result<Credential, AuthError> {
        let status = response.status();
        if status.is_server_error() {
            return Err(AuthError::Unavailable(format!(
                "token endpoint returned {status}"
            )));
        }
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            debug!("token endpoint rejection ({status}): {}", snippet(&body, 200));
            return Err(AuthError::InvalidCredentials);
        }
        if status != StatusCode::OK {
            return Err(AuthError::Protocol(format!(
                "token endpoint returned {status}"
            )));
        }
        let token: TokenResponse = response
            .json()
            .await
            .map_err(|e| AuthError::Protocol(format!("failed to parse token response: {e}")))?;
        Ok(Credential::from_token_response(token, Utc::now()))
    }
}

fn net_err(err: reqwest::Error) -> AuthError {
    AuthError::Unavailable(err.to_string())
}

fn snippet(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

fn random_urlsafe(length: usize) -> String {
    let random_bytes: [u8; 32] = rand::random();
    let mut encoded = URL_SAFE_NO_PAD.encode(random_bytes);
    encoded.truncate(length);
    encoded
}

#[allow(clippy::too_many_arguments)]
fn build_authorize_url(
    authority: &str,
    client_id: &str,
    redirect_uri: &str,
    scopes: &str,
    challenge: &str,
    state: &str,
    nonce: &str,
    login_hint: &str,
) -> Result<Url, AuthError> {
    let mut url = Url::parse(&format!("{authority}/oauth2/v2.0/authorize"))
        .map_err(|e| AuthError::Protocol(format!("invalid authority {authority:?}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", redirect_uri)
        .append_pair("response_type", "code")
        .append_pair("response_mode", "query")
        .append_pair("scope", scopes)
        .append_pair("code_challenge", challenge)
        .append_pair("code_challenge_method", "S256")
        .append_pair("state", state)
        .append_pair("nonce", nonce)
        .append_pair("prompt", "login")
        .append_pair("client_info", "1")
        .append_pair("login_hint", login_hint);
    Ok(url)
}

fn build_tenant_base(current_url: &Url, tenant_path: &str) -> Result<String, AuthError> {
    if tenant_path.starts_with("http") {
        return Ok(tenant_path.trim_end_matches('/').to_string());
    }
    let mut origin = current_url.clone();
    origin.set_path("/");
    origin.set_query(None);
    origin.set_fragment(None);
    let joined = origin
        .join(tenant_path.trim_start_matches('/'))
        .map_err(|e| AuthError::Protocol(format!("invalid tenant path {tenant_path:?}: {e}")))?;
    Ok(joined.to_string().trim_end_matches('/').to_string())
}

fn build_confirm_url(
    tenant_base: &str,
    combined_api: &str,
    csrf: &str,
    trans_id: &str,
    policy: &str,
) -> Result<Url, AuthError> {
    let base = format!(
        "{tenant_base}/api/{}/confirmed",
        combined_api.trim_matches('/')
    );
    let mut url = Url::parse(&base)
        .map_err(|e| AuthError::Protocol(format!("invalid confirm URL {base:?}: {e}")))?;
    url.query_pairs_mut()
        .append_pair("rememberMe", "false")
        .append_pair("csrf_token", csrf)
        .append_pair("tx", trans_id)
        .append_pair("p", policy);
    Ok(url)
}

fn extract_json_variable<T: serde::de::DeserializeOwned>(
    name: &str,
    html: &str,
) -> Result<T, AuthError> {
    let pattern = Regex::new(&format!(r"(?s)var {name}\s*=\s*(\{{.*?\}});"))
        .map_err(|e| AuthError::Protocol(format!("invalid scrape pattern for {name}: {e}")))?;
    let payload = pattern
        .captures(html)
        .and_then(|captures| captures.get(1))
        .ok_or_else(|| {
            AuthError::Protocol(format!("unable to locate `{name}` payload inside the login page"))
        })?;
    serde_json::from_str(payload.as_str())
        .map_err(|e| AuthError::Protocol(format!("failed to parse `{name}` payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server, ServerGuard};
    use serde_json::json;

    fn credential(expires_at: DateTime<Utc>, refresh_token: Option<&str>) -> Credential {
        Credential {
            access_token: "access".to_string(),
            refresh_token: refresh_token.map(str::to_string),
            expires_at,
            scope: "openid".to_string(),
        }
    }

    #[test]
    fn test_pkce_pair_is_base64url_no_padding() {
        let pair = PkcePair::generate();
        for value in [&pair.verifier, &pair.challenge] {
            assert!(!value.contains('+'));
            assert!(!value.contains('/'));
            assert!(!value.contains('='));
            // 32 bytes in base64url = 43 characters without padding
            assert_eq!(value.len(), 43);
        }
    }

    #[test]
    fn test_pkce_challenge_matches_verifier_hash() {
        let pair = PkcePair::generate();
        let mut hasher = Sha256::new();
        hasher.update(pair.verifier.as_bytes());
        assert_eq!(pair.challenge, URL_SAFE_NO_PAD.encode(hasher.finalize()));
    }

    #[test]
    fn test_pkce_pairs_are_unique() {
        let a = PkcePair::generate();
        let b = PkcePair::generate();
        assert_ne!(a.verifier, b.verifier);
    }

    #[test]
    fn test_credential_expiry_has_safety_margin() {
        let now = Utc::now();
        let credential = Credential::from_token_response(
            TokenResponse {
                access_token: "tok".to_string(),
                refresh_token: None,
                expires_in: Some(ExpiresIn::Seconds(3600)),
                scope: None,
            },
            now,
        );
        assert_eq!(credential.expires_at, now + Duration::seconds(3540));
    }

    #[test]
    fn test_expires_in_accepts_decimal_string() {
        let credential = Credential::from_token_response(
            TokenResponse {
                access_token: "tok".to_string(),
                refresh_token: None,
                expires_in: Some(ExpiresIn::Text("86400".to_string())),
                scope: None,
            },
            Utc::now(),
        );
        assert!(credential.is_valid(Utc::now() + Duration::hours(23)));
    }

    #[test]
    fn test_vault_replace_and_clear() {
        let mut vault = CredentialVault::new();
        assert!(vault.get().is_none());
        vault.set(credential(Utc::now() + Duration::hours(1), None));
        assert!(vault.get().is_some());
        vault.clear();
        assert!(vault.get().is_none());
    }

    #[test]
    fn test_debug_redacts_tokens() {
        let formatted = format!("{:?}", credential(Utc::now(), Some("refresh")));
        assert!(!formatted.contains("access"));
        assert!(!formatted.contains("refresh\""));
        assert!(formatted.contains("<redacted>"));
    }

    #[test]
    fn test_scope_normalization_appends_required_scopes() {
        let config: MsalConfig = serde_json::from_value(json!({
            "clientId": "abc",
            "scopes": ["profile"]
        }))
        .unwrap();
        let scopes = config.normalized_scopes();
        assert!(scopes.starts_with("profile"));
        assert!(scopes.contains("openid"));
        assert!(scopes.contains("offline_access"));
        assert!(scopes.contains(DEFAULT_SCOPE));
    }

    #[test]
    fn test_extract_json_variable() {
        let html = r#"<html><script>var SETTINGS = {"csrf": "token", "transId": "tx"};</script></html>"#;
        let settings: B2cSettings = extract_json_variable("SETTINGS", html).unwrap();
        assert_eq!(settings.csrf.as_deref(), Some("token"));
        assert_eq!(settings.trans_id.as_deref(), Some("tx"));

        let missing: Result<B2cSettings, _> = extract_json_variable("SA_FIELDS", html);
        assert!(matches!(missing, Err(AuthError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_ensure_valid_returns_cached_credential() {
        let client = AuthClient::with_portal("http://localhost:1").unwrap();
        let mut vault = CredentialVault::new();
        vault.set(credential(Utc::now() + Duration::hours(1), None));

        let result = client.ensure_valid(&mut vault, None).await.unwrap();
        assert_eq!(result.access_token, "access");
        assert!(result.expires_at > Utc::now());
    }

    #[tokio::test]
    async fn test_ensure_valid_without_credential_or_secrets() {
        let client = AuthClient::with_portal("http://localhost:1").unwrap();
        let mut vault = CredentialVault::new();

        let result = client.ensure_valid(&mut vault, None).await;
        assert!(matches!(result, Err(AuthError::ReauthRequired)));
        assert!(vault.get().is_none());
    }

    #[tokio::test]
    async fn test_ensure_valid_expired_without_refresh_token() {
        let client = AuthClient::with_portal("http://localhost:1").unwrap();
        let mut vault = CredentialVault::new();
        vault.set(credential(Utc::now() - Duration::hours(1), None));

        let result = client.ensure_valid(&mut vault, None).await;
        assert!(matches!(result, Err(AuthError::ReauthRequired)));
        assert!(vault.get().is_none(), "stale credential must be discarded");
    }

    #[tokio::test]
    async fn test_ensure_valid_transient_refresh_failure_keeps_vault() {
        let mut server = Server::new_async().await;
        let _msal = mock_msal_config(&mut server).await;
        let _token = server
            .mock("POST", "/tenant/policy/oauth2/v2.0/token")
            .with_status(503)
            .create_async()
            .await;

        let client = AuthClient::with_portal(server.url()).unwrap();
        let mut vault = CredentialVault::new();
        vault.set(credential(Utc::now() - Duration::hours(1), Some("refresh")));

        let result = client.ensure_valid(&mut vault, None).await;
        assert!(matches!(result, Err(AuthError::Unavailable(_))));
        assert!(vault.get().is_some(), "transient failure must not burn the vault");
    }

    #[tokio::test]
    async fn test_refresh_uses_refresh_grant() {
        let mut server = Server::new_async().await;
        let _msal = mock_msal_config(&mut server).await;
        let token = server
            .mock("POST", "/tenant/policy/oauth2/v2.0/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".to_string(), "refresh_token".to_string()),
                Matcher::UrlEncoded("refresh_token".to_string(), "old-refresh".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "access_token": "new-access",
                    "refresh_token": "new-refresh",
                    "expires_in": 3600,
                    "scope": "openid"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = AuthClient::with_portal(server.url()).unwrap();
        let refreshed = client.refresh("old-refresh").await.unwrap();
        assert_eq!(refreshed.access_token, "new-access");
        assert_eq!(refreshed.refresh_token.as_deref(), Some("new-refresh"));
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_refresh_rejection_is_invalid_credentials() {
        let mut server = Server::new_async().await;
        let _msal = mock_msal_config(&mut server).await;
        let _token = server
            .mock("POST", "/tenant/policy/oauth2/v2.0/token")
            .with_status(400)
            .with_body(json!({"error": "invalid_grant"}).to_string())
            .create_async()
            .await;

        let client = AuthClient::with_portal(server.url()).unwrap();
        let result = client.refresh("stale").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_full_login_flow() {
        let mut server = Server::new_async().await;
        let _msal = mock_msal_config(&mut server).await;
        let _authorize = mock_authorize_page(&mut server).await;
        let _submit = server
            .mock("POST", "/tenant/SelfAsserted")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"status": "200"}).to_string())
            .create_async()
            .await;
        let _confirm = server
            .mock("GET", "/tenant/api/CombinedSigninAndSignup/confirmed")
            .match_query(Matcher::Any)
            .with_status(302)
            .with_header("location", "/?code=auth-code-123")
            .create_async()
            .await;
        let token = server
            .mock("POST", "/tenant/policy/oauth2/v2.0/token")
            .match_body(Matcher::AllOf(vec![
                Matcher::UrlEncoded("grant_type".to_string(), "authorization_code".to_string()),
                Matcher::UrlEncoded("code".to_string(), "auth-code-123".to_string()),
            ]))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "access_token": "bearer-token",
                    "refresh_token": "refresh-token",
                    "expires_in": 3600,
                    "scope": "openid"
                })
                .to_string(),
            )
            .create_async()
            .await;

        let client = AuthClient::with_portal(server.url()).unwrap();
        let credential = client.login("user@example.com", "hunter2").await.unwrap();
        assert_eq!(credential.access_token, "bearer-token");
        assert_eq!(credential.refresh_token.as_deref(), Some("refresh-token"));
        assert!(credential.is_valid(Utc::now()));
        token.assert_async().await;
    }

    #[tokio::test]
    async fn test_login_rejected_credentials() {
        let mut server = Server::new_async().await;
        let _msal = mock_msal_config(&mut server).await;
        let _authorize = mock_authorize_page(&mut server).await;
        let _submit = server
            .mock("POST", "/tenant/SelfAsserted")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"status": "400", "message": "wrong password"}).to_string())
            .create_async()
            .await;

        let client = AuthClient::with_portal(server.url()).unwrap();
        let result = client.login("user@example.com", "wrong").await;
        assert!(matches!(result, Err(AuthError::InvalidCredentials)));
    }

    #[tokio::test]
    async fn test_login_without_redirect_is_protocol_error() {
        let mut server = Server::new_async().await;
        let _msal = mock_msal_config(&mut server).await;
        let _authorize = mock_authorize_page(&mut server).await;
        let _submit = server
            .mock("POST", "/tenant/SelfAsserted")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(json!({"status": "200"}).to_string())
            .create_async()
            .await;
        let _confirm = server
            .mock("GET", "/tenant/api/CombinedSigninAndSignup/confirmed")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("<html>no redirect</html>")
            .create_async()
            .await;

        let client = AuthClient::with_portal(server.url()).unwrap();
        let result = client.login("user@example.com", "hunter2").await;
        assert!(matches!(result, Err(AuthError::Protocol(_))));
    }

    async fn mock_msal_config(server: &mut ServerGuard) -> mockito::Mock {
        let url = server.url();
        server
            .mock("GET", "/api/global/msal/config")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                json!({
                    "clientId": "client-abc",
                    "authority": format!("{url}/tenant/policy"),
                    "redirectUri": format!("{url}/"),
                    "scopes": ["openid"]
                })
                .to_string(),
            )
            .create_async()
            .await
    }

    async fn mock_authorize_page(server: &mut ServerGuard) -> mockito::Mock {
        let settings = json!({
            "csrf": "csrf-token",
            "transId": "tx-1",
            "api": "CombinedSigninAndSignup",
            "hosts": {"policy": "b2c_1a_signin", "tenant": "/tenant/"}
        });
        let sa_fields = json!({
            "AttributeFields": [
                {"ID": "signInName", "IS_PASSWORD": false},
                {"ID": "password", "IS_PASSWORD": true}
            ]
        });
        let html = format!(
            "<html><script>var SETTINGS = {settings};\nvar SA_FIELDS = {sa_fields};</script></html>"
        );
        server
            .mock("GET", "/tenant/policy/oauth2/v2.0/authorize")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_header("content-type", "text/html")
            .with_body(html)
            .create_async()
            .await
    }
}
