//! Configuration module for the forwarder.
//!
//! This module loads the connector settings from environment variables once at
//! startup and produces an immutable [`ConnectorConfig`] snapshot that is passed
//! by reference to every component.

use std::env;
use std::time::Duration;

/// Default number of startup dial attempts beyond the first
const DEFAULT_CONNECTION_MAX_RETRIES: u32 = 10;

/// Default wait between startup dial attempts, in seconds
const DEFAULT_CONNECTION_RETRY_WAIT_SECS: u64 = 1;

/// Default sender buffer limit in bytes (1 MiB)
pub const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;

/// Default sender retry backoff in milliseconds
const DEFAULT_RETRY_WAIT_MS: u64 = 1000;

/// Default sender retry ceiling; effectively "retry forever"
pub const DEFAULT_MAX_RETRIES: u32 = i32::MAX as u32;

/// Default per-write timeout in seconds
const DEFAULT_WRITE_TIMEOUT_SECS: u64 = 3;

/// Default routing tag prefix
pub const DEFAULT_TAG_PREFIX: &str = "docker";

/// Configuration for the forwarder.
///
/// All settings can be configured via environment variables:
/// - `CONNECTION_MAX_RETRIES`: startup dial attempts beyond the first (default: 10)
/// - `CONNECTION_RETRY_WAIT`: seconds between startup dial attempts (default: 1)
/// - `FLUENTD_BUFFER_LIMIT`: sender buffer size in bytes (default: 1048576)
/// - `FLUENTD_RETRY_WAIT`: sender retry backoff in milliseconds (default: 1000)
/// - `FLUENTD_MAX_RETRIES`: sender retry ceiling (default: 2147483647)
/// - `FLUENTD_ASYNC_CONNECT`: connect/reconnect off the delivery path (default: false)
/// - `FLUENTD_SUBSECOND_PRECISION`: send EventTime timestamps (default: false)
/// - `FLUENTD_REQUEST_ACK`: require a chunk ack per record (default: false)
/// - `FLUENTD_WRITE_TIMEOUT`: per-write timeout in seconds (default: 3)
/// - `TAG_PREFIX`: routing tag prefix (default: docker)
/// - `TAG_SUFFIX_LABEL`: container label used as tag suffix (default: none)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorConfig {
    /// Startup dial attempts beyond the first
    pub connection_max_retries: u32,

    /// Wait between startup dial attempts
    pub connection_retry_wait: Duration,

    /// Maximum bytes held in the sender's pending buffer
    pub buffer_limit: usize,

    /// Base backoff between sender retries
    pub retry_wait: Duration,

    /// Maximum sender retries per flush
    pub max_retries: u32,

    /// Connect and reconnect in the background instead of inside `post`
    pub async_connect: bool,

    /// Encode timestamps with nanosecond precision
    pub subsecond_precision: bool,

    /// Request an acknowledgment for every record
    pub request_ack: bool,

    /// Timeout applied to each network write
    pub write_timeout: Duration,

    /// Routing tag prefix
    pub tag_prefix: String,

    /// Container label key whose value becomes the tag suffix
    pub tag_suffix_label: String,
}

/// Error type for configuration loading failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    pub message: String,
    pub env_var: Option<String>,
}

impl ConfigError {
    /// Create an error not tied to a particular variable.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: None,
        }
    }

    fn for_var(env_var: &str, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            env_var: Some(env_var.to_string()),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.env_var {
            Some(var) => write!(f, "Configuration error for {}: {}", var, self.message),
            None => write!(f, "Configuration error: {}", self.message),
        }
    }
}

impl std::error::Error for ConfigError {}

impl ConnectorConfig {
    /// Load configuration from process environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if any numeric or boolean variable is malformed.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key/value source.
    ///
    /// Unset and empty values fall back to their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.is_empty());

        let connection_max_retries = parse_u32(
            "CONNECTION_MAX_RETRIES",
            get("CONNECTION_MAX_RETRIES"),
            DEFAULT_CONNECTION_MAX_RETRIES,
        )?;
        let connection_retry_wait = Duration::from_secs(parse_u64(
            "CONNECTION_RETRY_WAIT",
            get("CONNECTION_RETRY_WAIT"),
            DEFAULT_CONNECTION_RETRY_WAIT_SECS,
        )?);

        let buffer_limit = parse_u64(
            "FLUENTD_BUFFER_LIMIT",
            get("FLUENTD_BUFFER_LIMIT"),
            DEFAULT_BUFFER_LIMIT as u64,
        )?;
        if buffer_limit == 0 {
            return Err(ConfigError::for_var(
                "FLUENTD_BUFFER_LIMIT",
                "buffer limit must be greater than 0",
            ));
        }
        let buffer_limit = usize::try_from(buffer_limit).map_err(|_| {
            ConfigError::for_var("FLUENTD_BUFFER_LIMIT", "buffer limit is too large")
        })?;

        let retry_wait = Duration::from_millis(parse_u64(
            "FLUENTD_RETRY_WAIT",
            get("FLUENTD_RETRY_WAIT"),
            DEFAULT_RETRY_WAIT_MS,
        )?);
        let max_retries = parse_u32(
            "FLUENTD_MAX_RETRIES",
            get("FLUENTD_MAX_RETRIES"),
            DEFAULT_MAX_RETRIES,
        )?;

        let async_connect = parse_bool(
            "FLUENTD_ASYNC_CONNECT",
            get("FLUENTD_ASYNC_CONNECT"),
            false,
        )?;
        let subsecond_precision = parse_bool(
            "FLUENTD_SUBSECOND_PRECISION",
            get("FLUENTD_SUBSECOND_PRECISION"),
            false,
        )?;
        let request_ack = parse_bool("FLUENTD_REQUEST_ACK", get("FLUENTD_REQUEST_ACK"), false)?;

        let write_timeout = Duration::from_secs(parse_u64(
            "FLUENTD_WRITE_TIMEOUT",
            get("FLUENTD_WRITE_TIMEOUT"),
            DEFAULT_WRITE_TIMEOUT_SECS,
        )?);

        let tag_prefix = get("TAG_PREFIX").unwrap_or_else(|| DEFAULT_TAG_PREFIX.to_string());
        let tag_suffix_label = get("TAG_SUFFIX_LABEL").unwrap_or_default();

        Ok(Self {
            connection_max_retries,
            connection_retry_wait,
            buffer_limit,
            retry_wait,
            max_retries,
            async_connect,
            subsecond_precision,
            request_ack,
            write_timeout,
            tag_prefix,
            tag_suffix_label,
        })
    }
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            connection_max_retries: DEFAULT_CONNECTION_MAX_RETRIES,
            connection_retry_wait: Duration::from_secs(DEFAULT_CONNECTION_RETRY_WAIT_SECS),
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            retry_wait: Duration::from_millis(DEFAULT_RETRY_WAIT_MS),
            max_retries: DEFAULT_MAX_RETRIES,
            async_connect: false,
            subsecond_precision: false,
            request_ack: false,
            write_timeout: Duration::from_secs(DEFAULT_WRITE_TIMEOUT_SECS),
            tag_prefix: DEFAULT_TAG_PREFIX.to_string(),
            tag_suffix_label: String::new(),
        }
    }
}

fn parse_u64(env_var: &str, value: Option<String>, default: u64) -> Result<u64, ConfigError> {
    match value {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::for_var(env_var, format!("'{}' is not a valid number", value))),
        None => Ok(default),
    }
}

fn parse_u32(env_var: &str, value: Option<String>, default: u32) -> Result<u32, ConfigError> {
    let parsed = parse_u64(env_var, value, u64::from(default))?;
    u32::try_from(parsed).map_err(|_| {
        ConfigError::for_var(env_var, format!("{} exceeds maximum ({})", parsed, u32::MAX))
    })
}

/// Parse a boolean using the same spellings as Go's `strconv.ParseBool`.
fn parse_bool(env_var: &str, value: Option<String>, default: bool) -> Result<bool, ConfigError> {
    let Some(value) = value else {
        return Ok(default);
    };

    match value.as_str() {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Ok(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Ok(false),
        _ => Err(ConfigError::for_var(
            env_var,
            format!("'{}' is not a valid boolean", value),
        )),
    }
}
