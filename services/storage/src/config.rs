use crate::retry::RetryPolicy;
use crate::session::{DEFAULT_AUTH_URL, DEFAULT_SAFETY_MARGIN, DEFAULT_SESSION_TTL};
use crate::upload::{ChecksumMode, MIN_PART_SIZE};
use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the B2 client
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// B2 account and endpoint configuration
    pub b2: B2Config,
    /// Retry configuration
    #[serde(default)]
    pub retry: RetryConfig,
    /// Large file upload configuration
    #[serde(default)]
    pub upload: UploadConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (json, pretty)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Prometheus exporter port; no exporter when unset
    #[serde(default)]
    pub metrics_port: Option<u16>,
}

/// B2 account configuration
#[derive(Clone, Deserialize)]
pub struct B2Config {
    /// Application key id
    pub key_id: String,
    /// Application key (secret)
    pub application_key: String,
    /// Default bucket for uploads
    #[serde(default)]
    pub bucket_id: Option<String>,
    /// Account authorization endpoint base
    #[serde(default = "default_auth_url")]
    pub auth_url: String,
    /// Validity window of an authorization token in seconds
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
    /// Margin subtracted from the validity window in seconds
    #[serde(default = "default_session_safety_margin_secs")]
    pub session_safety_margin_secs: u64,
    /// Per-request timeout in seconds (transport default when unset)
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,
}

/// Retry configuration for named operations and part uploads
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Attempts per operation, including the first
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Fixed delay between attempts in milliseconds
    #[serde(default = "default_retry_delay_ms")]
    pub delay_ms: u64,
    /// Only retry transient and rate-limited failures
    #[serde(default)]
    pub classify_errors: bool,
}

/// Large file upload configuration
#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Floor applied to the recommended part size (5MB minimum)
    #[serde(default = "default_min_part_size")]
    pub min_part_size_bytes: u64,
    /// Parts uploaded at once; 1 keeps parts strictly sequential
    #[serde(default = "default_part_concurrency")]
    pub part_concurrency: usize,
    /// Part checksum mode (do_not_verify, sha1)
    #[serde(default)]
    pub checksum: ChecksumMode,
    /// Cancel the unfinished large file when the upload fails
    #[serde(default)]
    pub cancel_on_failure: bool,
    /// Content type sent when starting a large file
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

// Default value functions
fn default_service_name() -> String {
    "b2-storage-client".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

fn default_auth_url() -> String {
    DEFAULT_AUTH_URL.to_string()
}

fn default_session_ttl_secs() -> u64 {
    DEFAULT_SESSION_TTL.as_secs() // 24h
}

fn default_session_safety_margin_secs() -> u64 {
    DEFAULT_SAFETY_MARGIN.as_secs()
}

fn default_max_attempts() -> u32 {
    crate::retry::DEFAULT_MAX_ATTEMPTS
}

fn default_retry_delay_ms() -> u64 {
    crate::retry::DEFAULT_DELAY_MS
}

fn default_min_part_size() -> u64 {
    MIN_PART_SIZE // 5MB
}

fn default_part_concurrency() -> usize {
    1
}

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            metrics_port: None,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_retry_delay_ms(),
            classify_errors: false,
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            min_part_size_bytes: default_min_part_size(),
            part_concurrency: default_part_concurrency(),
            checksum: ChecksumMode::default(),
            cancel_on_failure: false,
            content_type: default_content_type(),
        }
    }
}

impl std::fmt::Debug for B2Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("B2Config")
            .field("key_id", &self.key_id)
            .field("application_key", &"<redacted>")
            .field("bucket_id", &self.bucket_id)
            .field("auth_url", &self.auth_url)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("session_safety_margin_secs", &self.session_safety_margin_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Config {
    /// Load configuration from config files and environment.
    ///
    /// Sources, later overriding earlier:
    /// 1. `config/b2` (any format supported by the `config` crate)
    /// 2. `/etc/b2/client`
    /// 3. Environment variables, e.g. `B2CLIENT__B2__KEY_ID` -> `b2.key_id`
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/b2").required(false))
            .add_source(config::File::with_name("/etc/b2/client").required(false))
            .add_source(
                config::Environment::with_prefix("B2CLIENT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.b2.key_id.is_empty() {
            return Err(ConfigValidationError::MissingField("b2.key_id".to_string()));
        }

        if self.b2.application_key.is_empty() {
            return Err(ConfigValidationError::MissingField(
                "b2.application_key".to_string(),
            ));
        }

        if !self.b2.auth_url.starts_with("http://") && !self.b2.auth_url.starts_with("https://") {
            return Err(ConfigValidationError::InvalidValue {
                field: "b2.auth_url".to_string(),
                message: "URL must start with http:// or https://".to_string(),
            });
        }

        if self.b2.session_safety_margin_secs >= self.b2.session_ttl_secs {
            return Err(ConfigValidationError::InvalidValue {
                field: "b2.session_safety_margin_secs".to_string(),
                message: "Safety margin must be shorter than the session TTL".to_string(),
            });
        }

        if self.retry.max_attempts == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "retry.max_attempts".to_string(),
                message: "At least one attempt is required".to_string(),
            });
        }

        if self.upload.min_part_size_bytes < MIN_PART_SIZE {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.min_part_size_bytes".to_string(),
                message: format!("Part size floor must be at least {} bytes", MIN_PART_SIZE),
            });
        }

        if self.upload.part_concurrency == 0 {
            return Err(ConfigValidationError::InvalidValue {
                field: "upload.part_concurrency".to_string(),
                message: "Part concurrency must be greater than 0".to_string(),
            });
        }

        Ok(())
    }

    /// Get the retry policy
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.retry.max_attempts,
            Duration::from_millis(self.retry.delay_ms),
        )
    }

    /// Get session TTL as Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.b2.session_ttl_secs)
    }

    /// Get session safety margin as Duration
    pub fn session_safety_margin(&self) -> Duration {
        Duration::from_secs(self.b2.session_safety_margin_secs)
    }

    /// Get request timeout as Duration, if configured
    pub fn request_timeout(&self) -> Option<Duration> {
        self.b2.request_timeout_secs.map(Duration::from_secs)
    }
}

/// Configuration validation errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigValidationError {
    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config() -> Config {
        Config {
            service: ServiceConfig::default(),
            b2: B2Config {
                key_id: "0012345".to_string(),
                application_key: "K001secret".to_string(),
                bucket_id: Some("bucket-1".to_string()),
                auth_url: default_auth_url(),
                session_ttl_secs: default_session_ttl_secs(),
                session_safety_margin_secs: default_session_safety_margin_secs(),
                request_timeout_secs: None,
            },
            retry: RetryConfig::default(),
            upload: UploadConfig::default(),
        }
    }

    #[test]
    fn test_default_values() {
        assert_eq!(default_max_attempts(), 3);
        assert_eq!(default_retry_delay_ms(), 1000);
        assert_eq!(default_min_part_size(), 5 * 1024 * 1024);
        assert_eq!(default_session_ttl_secs(), 86_400);
        assert_eq!(default_session_safety_margin_secs(), 60);
        assert_eq!(default_part_concurrency(), 1);
    }

    #[test]
    fn test_valid_config() {
        let config = create_test_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_key_id() {
        let mut config = create_test_config();
        config.b2.key_id = String::new();
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::MissingField(_))
        ));
    }

    #[test]
    fn test_part_size_floor_below_service_minimum() {
        let mut config = create_test_config();
        config.upload.min_part_size_bytes = 1024;
        assert!(matches!(
            config.validate(),
            Err(ConfigValidationError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let mut config = create_test_config();
        config.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_margin_must_be_shorter_than_ttl() {
        let mut config = create_test_config();
        config.b2.session_safety_margin_secs = config.b2.session_ttl_secs;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_application_key() {
        let config = create_test_config();
        let printed = format!("{:?}", config.b2);
        assert!(!printed.contains("K001secret"));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let mut config = create_test_config();
        config.retry.max_attempts = 5;
        config.retry.delay_ms = 250;
        let policy = config.retry_policy();
        assert_eq!(policy.max_attempts(), 5);
        assert_eq!(policy.delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: Config = config::Config::builder()
            .set_override("b2.key_id", "id")
            .unwrap()
            .set_override("b2.application_key", "key")
            .unwrap()
            .set_override("upload.checksum", "sha1")
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.b2.auth_url, DEFAULT_AUTH_URL);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.upload.checksum, ChecksumMode::Sha1);
        assert_eq!(config.upload.content_type, "application/octet-stream");
        assert!(config.b2.bucket_id.is_none());
    }
}
