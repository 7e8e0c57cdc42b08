//! Error type shared by every B2 operation.
//!
//! Any `Err` returned by this crate is the single failure outcome of the call.
//! Variants only record where the failure came from so callers can log it;
//! the retry loop treats them all the same unless classification is enabled.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

/// Result type for B2 operations
pub type Result<T> = std::result::Result<T, B2Error>;

/// Errors that can occur while talking to the B2 service
#[derive(Error, Debug)]
pub enum B2Error {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("B2 API error (status {status}, code {code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Failed to decode B2 response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Coarse failure classification, consulted only when error classification
/// is switched on for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network hiccups, 5xx responses, expired tokens
    Transient,
    /// Bad credentials, malformed requests, missing objects
    Permanent,
    /// HTTP 429 / `too_many_requests`
    RateLimited,
}

/// Error body returned by the B2 API on non-2xx responses
#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl B2Error {
    /// Build an API error from a status code and raw response body
    pub fn api(status: u16, body: &str) -> Self {
        let parsed: Option<ApiErrorBody> = serde_json::from_str(body).ok();
        let (code, message) = match parsed {
            Some(b) => (
                b.code.unwrap_or_else(|| "unknown".to_string()),
                b.message.unwrap_or_default(),
            ),
            None => ("unknown".to_string(), body.to_string()),
        };
        Self::Api {
            status,
            code,
            message,
        }
    }

    /// Create an invalid input error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidInput(message.into())
    }

    /// HTTP status of an API error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// True when the service rejected the session token as expired
    pub fn is_expired_token(&self) -> bool {
        matches!(self, Self::Api { status: 401, code, .. } if code == "expired_auth_token")
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Http(_) => FailureKind::Transient,
            Self::Api { status, code, .. } => match *status {
                429 => FailureKind::RateLimited,
                408 | 500..=599 => FailureKind::Transient,
                401 if code == "expired_auth_token" => FailureKind::Transient,
                _ if code == "too_many_requests" => FailureKind::RateLimited,
                _ => FailureKind::Permanent,
            },
            Self::Decode(_) | Self::InvalidInput(_) => FailureKind::Permanent,
        }
    }

    /// Whether a classified retry loop should try again after this error
    pub fn is_retryable(&self) -> bool {
        self.kind() != FailureKind::Permanent
    }
}

/// Read a response, turning non-2xx statuses into [`B2Error::Api`] and
/// decoding the body as JSON otherwise.
pub(crate) async fn read_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;
    if !status.is_success() {
        return Err(B2Error::api(status.as_u16(), &body));
    }
    Ok(serde_json::from_str(&body)?)
}

/// Read a response body as raw bytes, turning non-2xx statuses into
/// [`B2Error::Api`]. Used for downloads, whose body is file content.
pub(crate) async fn read_bytes(response: reqwest::Response) -> Result<Bytes> {
    let status = response.status();
    let body = response.bytes().await?;
    if !status.is_success() {
        return Err(B2Error::api(status.as_u16(), &String::from_utf8_lossy(&body)));
    }
    Ok(body)
}
