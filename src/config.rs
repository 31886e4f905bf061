//! Configuration management for the peerlink agent.
//!
//! Configuration is set via environment variables:
//! - `PLATFORM_URL` - Required. Base URL of the collaboration platform.
//! - `PLATFORM_API_KEY` - Optional. Global key used for registration if the
//!   deployment requires it. Instance-scoped keys are issued at registration.
//! - `AGENT_NAME` - Optional. Local agent name. Defaults to `peerlink-agent`.
//! - `AGENT_ENDPOINT_URL` - Optional. Callback URL advertised at registration.
//! - `AGENT_CAPABILITIES` - Optional. Comma-separated capability tags.
//! - `HTTP_TIMEOUT_SECS` - Optional. Timeout for short platform calls. Default `10`.
//! - `CALL_TIMEOUT_SECS` - Optional. Per-attempt timeout for relayed peer calls. Default `30`.
//! - `RESPONSE_TIMEOUT_SECS` - Optional. How long to await a correlated response. Default `45`.
//! - `MAX_RETRIES` - Optional. Retry attempts beyond the first for peer calls. Default `3`.
//! - `HEARTBEAT_INTERVAL_SECS` - Optional. Default `30`.
//! - `DISCOVERY_INTERVAL_SECS` - Optional. Default `60`.
//! - `POLL_INTERVAL_SECS` - Optional. Inbox poll cadence. Default `2`.
//! - `LOOP_JITTER_MS` - Optional. Random jitter added to each periodic wakeup. Default `0`.

use std::time::Duration;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Platform base URL, validated, without a trailing slash
    pub platform_url: String,

    /// Optional deployment-global API key used for registration
    pub platform_api_key: Option<String>,

    /// Local agent name (instance names are derived from it)
    pub agent_name: String,

    /// Callback URL advertised to the platform, if any
    pub endpoint_url: Option<String>,

    /// Capability tags advertised at registration
    pub capabilities: Vec<String>,

    /// Timeout for short platform calls (ping, discovery, inbox fetch)
    pub http_timeout: Duration,

    /// Per-attempt timeout when relaying a request to a peer
    pub call_timeout: Duration,

    /// How long a caller waits for a correlated response
    pub response_timeout: Duration,

    /// Retry attempts beyond the first for peer calls
    pub max_retries: u32,

    /// Heartbeat cadence
    pub heartbeat_interval: Duration,

    /// Peer discovery refresh cadence
    pub discovery_interval: Duration,

    /// Inbox poll cadence
    pub poll_interval: Duration,

    /// Random jitter added to each periodic wakeup
    pub loop_jitter: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `PLATFORM_URL` is not set, and
    /// `ConfigError::InvalidValue` if a value fails to parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let platform_url = std::env::var("PLATFORM_URL")
            .map_err(|_| ConfigError::MissingEnvVar("PLATFORM_URL".to_string()))?;
        let platform_url = normalize_url("PLATFORM_URL", &platform_url)?;

        let agent_name =
            std::env::var("AGENT_NAME").unwrap_or_else(|_| "peerlink-agent".to_string());

        let capabilities = std::env::var("AGENT_CAPABILITIES")
            .map(|v| {
                v.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            platform_url,
            platform_api_key: std::env::var("PLATFORM_API_KEY").ok(),
            agent_name,
            endpoint_url: std::env::var("AGENT_ENDPOINT_URL").ok(),
            capabilities,
            http_timeout: secs_var("HTTP_TIMEOUT_SECS", 10)?,
            call_timeout: secs_var("CALL_TIMEOUT_SECS", 30)?,
            response_timeout: secs_var("RESPONSE_TIMEOUT_SECS", 45)?,
            max_retries: parse_var("MAX_RETRIES", 3u32)?,
            heartbeat_interval: secs_var("HEARTBEAT_INTERVAL_SECS", 30)?,
            discovery_interval: secs_var("DISCOVERY_INTERVAL_SECS", 60)?,
            poll_interval: secs_var("POLL_INTERVAL_SECS", 2)?,
            loop_jitter: Duration::from_millis(parse_var("LOOP_JITTER_MS", 0u64)?),
        })
    }

    /// Create a config pointing at a specific platform (useful for testing).
    pub fn new(platform_url: impl Into<String>) -> Self {
        Self {
            platform_url: platform_url.into().trim_end_matches('/').to_string(),
            platform_api_key: None,
            agent_name: "peerlink-agent".to_string(),
            endpoint_url: None,
            capabilities: Vec::new(),
            http_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(30),
            response_timeout: Duration::from_secs(45),
            max_retries: 3,
            heartbeat_interval: Duration::from_secs(30),
            discovery_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(2),
            loop_jitter: Duration::ZERO,
        }
    }
}

/// Validate an absolute URL and strip any trailing slash so endpoint paths
/// can be appended with plain formatting.
fn normalize_url(name: &str, value: &str) -> Result<String, ConfigError> {
    Url::parse(value).map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string()))?;
    Ok(value.trim_end_matches('/').to_string())
}

fn secs_var(name: &str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_var(name, default)?))
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(v) => v
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}
