//! Account authorization and session caching.
//!
//! A [`SessionManager`] exchanges the long-lived account credentials for a
//! time-bounded authorization token and caches it until shortly before the
//! service would expire it. Each client owns exactly one manager; clones of
//! the client share it.

use crate::error::{read_json, Result};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use reqwest::header::AUTHORIZATION;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, instrument};

/// Default account authorization endpoint base
pub const DEFAULT_AUTH_URL: &str = "https://api.backblazeb2.com/b2api/v2";
/// API version path appended to the `apiUrl` returned by authorization
pub const API_VERSION_PATH: &str = "/b2api/v2";
/// Validity window of an account authorization token
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(24 * 60 * 60);
/// Margin subtracted from the validity window to avoid expiring mid-call
pub const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(60);

/// Account credentials used for authorization.
///
/// The application key is never printed, logged or serialized.
#[derive(Clone)]
pub struct ClientIdentity {
    key_id: String,
    application_key: String,
}

impl ClientIdentity {
    pub fn new(key_id: impl Into<String>, application_key: impl Into<String>) -> Self {
        Self {
            key_id: key_id.into(),
            application_key: application_key.into(),
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// `Authorization` header value for `b2_authorize_account`
    pub(crate) fn basic_auth_header(&self) -> String {
        let raw = format!("{}:{}", self.key_id, self.application_key);
        format!("Basic {}", STANDARD.encode(raw))
    }
}

impl fmt::Debug for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientIdentity")
            .field("key_id", &self.key_id)
            .field("application_key", &"<redacted>")
            .finish()
    }
}

/// A live authorization session
#[derive(Debug, Clone)]
pub struct AuthSession {
    /// Account the token belongs to
    pub account_id: Option<String>,
    /// Base URL for named API operations, including the version path
    pub api_url: String,
    /// Base URL for downloads
    pub download_url: String,
    /// Token sent on every API call
    pub authorization_token: String,
    /// Instant after which the session must be rebuilt
    pub expires_at: DateTime<Utc>,
    /// Part size the service recommends for large files
    pub recommended_part_size: Option<u64>,
    /// Smallest part size the service accepts
    pub absolute_minimum_part_size: Option<u64>,
}

impl AuthSession {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

/// `b2_authorize_account` response body
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AuthorizeAccountResponse {
    #[serde(default)]
    account_id: Option<String>,
    api_url: String,
    download_url: String,
    authorization_token: String,
    #[serde(default)]
    recommended_part_size: Option<u64>,
    #[serde(default)]
    absolute_minimum_part_size: Option<u64>,
}

/// Timing settings for a session manager
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Account authorization endpoint base (without the operation name)
    pub auth_url: String,
    /// How long the service keeps a token valid
    pub ttl: Duration,
    /// Subtracted from `ttl` when computing `expires_at`
    pub safety_margin: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            auth_url: DEFAULT_AUTH_URL.to_string(),
            ttl: DEFAULT_SESSION_TTL,
            safety_margin: DEFAULT_SAFETY_MARGIN,
        }
    }
}

impl SessionSettings {
    /// Effective lifetime of a cached session
    pub fn lifetime(&self) -> Duration {
        self.ttl.saturating_sub(self.safety_margin)
    }
}

/// Acquires and caches the authorization session for one credential pair.
///
/// The cache lock is never held across the authorization request. Two
/// callers that both see an expired session will both authorize and the
/// later write wins; either session is valid.
pub struct SessionManager {
    http: reqwest::Client,
    identity: ClientIdentity,
    settings: SessionSettings,
    current: RwLock<Option<AuthSession>>,
}

impl SessionManager {
    pub fn new(http: reqwest::Client, identity: ClientIdentity, settings: SessionSettings) -> Self {
        Self {
            http,
            identity,
            settings,
            current: RwLock::new(None),
        }
    }

    /// Return the cached session, authorizing first if there is none or it
    /// has expired.
    pub async fn ensure_session(&self) -> Result<AuthSession> {
        if let Some(session) = self.current.read().await.as_ref() {
            if !session.is_expired() {
                return Ok(session.clone());
            }
            debug!(expires_at = %session.expires_at, "Authorization session expired");
        }

        self.authorize().await
    }

    /// Authorize unconditionally and replace the cached session.
    #[instrument(skip(self), fields(key_id = %self.identity.key_id()))]
    pub async fn authorize(&self) -> Result<AuthSession> {
        let url = format!("{}/b2_authorize_account", self.settings.auth_url);

        let response = self
            .http
            .get(&url)
            .header(AUTHORIZATION, self.identity.basic_auth_header())
            .send()
            .await?;
        let body: AuthorizeAccountResponse = read_json(response).await?;

        let issued_at = Utc::now();
        let lifetime = chrono::Duration::from_std(self.settings.lifetime())
            .unwrap_or_else(|_| chrono::Duration::zero());

        let session = AuthSession {
            account_id: body.account_id,
            api_url: format!("{}{}", body.api_url.trim_end_matches('/'), API_VERSION_PATH),
            download_url: body.download_url,
            authorization_token: body.authorization_token,
            expires_at: issued_at + lifetime,
            recommended_part_size: body.recommended_part_size,
            absolute_minimum_part_size: body.absolute_minimum_part_size,
        };

        *self.current.write().await = Some(session.clone());
        metrics::counter!("b2.auth.refreshes").increment(1);

        info!(
            api_url = %session.api_url,
            expires_at = %session.expires_at,
            "Account authorized"
        );

        Ok(session)
    }

    /// Drop the cached session so the next call authorizes again
    pub async fn invalidate(&self) {
        *self.current.write().await = None;
    }

    /// Snapshot of the cached session, if any
    pub async fn current(&self) -> Option<AuthSession> {
        self.current.read().await.clone()
    }
}
