//! # session
//!
//! Provider session management: REST login, credential ownership and the
//! periodic renewal that keeps the streaming feed alive across credential
//! expiry.
//!
//! Credentials ถูกถือ in-process ใน [`SessionManager`] (ไม่ publish ผ่าน
//! store แล้วให้ consumer วน poll) — ผู้ใช้ขอผ่าน [`SessionManager::credentials`]
//! และ login ที่ fail ชั่วคราวจะ retry แบบ bounded + backoff จนได้ผลแพ้ชนะ
//! ชัดเจน ไม่มี silent retry loop

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::models::{IgAccount, LoginSession, SessionCredentials};

pub mod renewal;
pub mod stream;

pub use renewal::{RenewalConfig, RenewalCoordinator, RenewalOutcome};
pub use stream::{wait_for_status, LightStream, StreamConfig, StreamTransport, TransportStatus};

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SessionError {
    /// Every bounded login attempt failed.
    #[error("authentication failed after {attempts} attempts: {reason}")]
    AuthFailed { attempts: u32, reason: String },

    /// The provider answered the login call with a non-success status.
    #[error("login rejected: HTTP {0}")]
    LoginRejected(u16),

    /// Login response carried no `CST` / `X-SECURITY-TOKEN` headers.
    #[error("session tokens missing from login response")]
    MissingTokens,

    /// An operation needing credentials ran before the first login.
    #[error("no active session — authenticate first")]
    NotAuthenticated,

    /// The transport did not reach the wanted status within the bound.
    #[error("transport did not reach {want:?} within {waited:?}")]
    StatusTimeout { want: TransportStatus, waited: Duration },

    /// Streaming transport failure (connect/handshake/send).
    #[error("transport error: {0}")]
    Transport(String),

    /// Provider REST call failed.
    #[error("provider request failed: {0}")]
    Http(#[from] reqwest::Error),
}

// ─── Config ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// REST base, e.g. `https://demo-api.ig.com/gateway/deal`.
    pub base_url:       String,
    pub api_key:        String,
    pub identifier:     String,
    pub password:       String,
    /// Credential lifetime — one renewal cycle per period (23 h).
    pub renew_period:   Duration,
    /// Bound on every transport status wait during renewal.
    pub status_timeout: Duration,
    /// จำนวนครั้ง login สูงสุดก่อนตัดสินว่า cycle fail.
    pub auth_attempts:  u32,
    /// Initial backoff between login attempts (doubles per attempt).
    pub auth_backoff:   Duration,
}

impl SessionConfig {
    pub fn from_env() -> Self {
        let is_demo = std::env::var("IG_IS_DEMO")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);
        let host = std::env::var("IG_BASE_URL")
            .unwrap_or_else(|_| "api.ig.com/gateway/deal".to_string());

        Self {
            base_url:       format!("https://{}{host}", if is_demo { "demo-" } else { "" }),
            api_key:        std::env::var("IG_API_KEY").unwrap_or_default(),
            identifier:     std::env::var("IG_IDENTIFIER").unwrap_or_default(),
            password:       std::env::var("IG_PASSWORD").unwrap_or_default(),
            renew_period:   Duration::from_secs(env_u64("SESSION_RENEW_SECS", 23 * 3600)),
            status_timeout: Duration::from_secs(env_u64("SESSION_STATUS_WAIT_SECS", 60)),
            auth_attempts:  env_u32("SESSION_AUTH_ATTEMPTS", 4),
            auth_backoff:   Duration::from_secs(env_u64("SESSION_AUTH_BACKOFF_SECS", 2)),
        }
    }
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

// ─── Provider seam ────────────────────────────────────────────────────────────

/// What the renewal coordinator needs from the REST side of the provider.
#[async_trait]
pub trait SessionProvider: Send + Sync {
    /// Obtain fresh session credentials. May fail transiently; the concrete
    /// implementation retries a bounded number of times before giving up.
    async fn authenticate(&self) -> Result<LoginSession, SessionError>;

    /// Raw per-instrument market metadata document.
    async fn market_info(&self, epic: &str) -> Result<String, SessionError>;
}

// ─── SessionManager ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LoginBody {
    lightstreamer_endpoint: String,
    accounts:               Vec<IgAccount>,
}

pub struct SessionManager {
    config:  SessionConfig,
    http:    reqwest::Client,
    current: RwLock<Option<LoginSession>>,
}

impl SessionManager {
    pub fn new(config: SessionConfig, http: reqwest::Client) -> Self {
        Self { config, http, current: RwLock::new(None) }
    }

    /// Current credentials, if a login has succeeded.
    pub async fn credentials(&self) -> Option<SessionCredentials> {
        self.current.read().await.as_ref().map(|s| s.credentials.clone())
    }

    /// One raw login round trip.
    async fn try_login(&self) -> Result<LoginSession, SessionError> {
        let url = format!("{}/session?fetchSessionTokens=true", self.config.base_url);
        let response = self
            .http
            .post(&url)
            .header("Accept", "application/json; charset=UTF-8")
            .header("X-IG-API-KEY", &self.config.api_key)
            .header("Version", "1")
            .json(&serde_json::json!({
                "encryptedPassword": false,
                "identifier": self.config.identifier,
                "password":   self.config.password,
            }))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(SessionError::LoginRejected(response.status().as_u16()));
        }

        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let cst            = header("cst").ok_or(SessionError::MissingTokens)?;
        let security_token = header("x-security-token").ok_or(SessionError::MissingTokens)?;

        let body: LoginBody = response.json().await?;
        Ok(LoginSession {
            credentials:            SessionCredentials { cst, security_token },
            lightstreamer_endpoint: body.lightstreamer_endpoint,
            accounts:               body.accounts,
        })
    }

    async fn authed_get(&self, url: &str) -> Result<reqwest::Response, SessionError> {
        let creds = self.credentials().await.ok_or(SessionError::NotAuthenticated)?;
        let response = self
            .http
            .get(url)
            .header("Accept", "application/json; charset=UTF-8")
            .header("X-IG-API-KEY", &self.config.api_key)
            .header("CST", &creds.cst)
            .header("X-SECURITY-TOKEN", &creds.security_token)
            .send()
            .await?;
        Ok(response)
    }

    /// Market search for the HTTP boundary (`GET /api/market`).
    pub async fn market_search(
        &self,
        term: Option<&str>,
    ) -> Result<serde_json::Value, SessionError> {
        let url = match term {
            Some(term) => format!("{}/markets?searchTerm={term}", self.config.base_url),
            None       => format!("{}/markets", self.config.base_url),
        };
        Ok(self.authed_get(&url).await?.json().await?)
    }
}

#[async_trait]
impl SessionProvider for SessionManager {
    /// Bounded-retry login: fail fast with a terminal error instead of
    /// retrying silently forever.
    async fn authenticate(&self) -> Result<LoginSession, SessionError> {
        info!("authenticating with provider");
        let mut backoff = self.config.auth_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.config.auth_attempts {
            match self.try_login().await {
                Ok(session) => {
                    info!(
                        accounts = session.accounts.len(),
                        endpoint = %session.lightstreamer_endpoint,
                        "✅ logged in — session tokens refreshed"
                    );
                    *self.current.write().await = Some(session.clone());
                    return Ok(session);
                }
                Err(e) => {
                    warn!(attempt, max = self.config.auth_attempts, error = %e,
                          "authentication attempt failed");
                    last_error = e.to_string();
                    if attempt < self.config.auth_attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }

        Err(SessionError::AuthFailed {
            attempts: self.config.auth_attempts,
            reason:   last_error,
        })
    }

    async fn market_info(&self, epic: &str) -> Result<String, SessionError> {
        let url = format!("{}/markets/{epic}", self.config.base_url);
        Ok(self.authed_get(&url).await?.text().await?)
    }
}
