//! Settings management utilities

use crate::{OddsError, Result};
use std::env;

/// Environment variable expansion utility
pub struct EnvExpander;

impl EnvExpander {
    /// Expand `${VAR_NAME}` references in a string
    pub fn expand(input: &str) -> Result<String> {
        let mut result = input.to_string();

        while let Some(start) = result.find("${") {
            let end = result[start..]
                .find('}')
                .ok_or_else(|| OddsError::Config("Unclosed environment variable reference".to_string()))?;
            let var_name = &result[start + 2..start + end];
            let var_value = env::var(var_name)
                .map_err(|_| OddsError::Config(format!("Environment variable '{}' not found", var_name)))?;

            result.replace_range(start..start + end + 1, &var_value);
        }

        Ok(result)
    }

    /// Expand an optional value in place
    pub fn expand_opt(value: &mut Option<String>) -> Result<()> {
        if let Some(inner) = value.as_mut() {
            *inner = Self::expand(inner)?;
        }
        Ok(())
    }
}

/// Configuration validation utilities
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a provider identifier: non-empty, alphanumeric plus `-` and `_`
    pub fn validate_provider_id(id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(OddsError::Config("Provider id cannot be empty".to_string()).into());
        }

        if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(OddsError::Config(format!(
                "Provider id '{}' must contain only alphanumeric characters, '-' or '_'",
                id
            ))
            .into());
        }

        Ok(())
    }

    /// Validate a ratio value (0.0 to 1.0)
    pub fn validate_ratio(value: f64, name: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&value) {
            return Err(OddsError::Config(format!("{} must be between 0.0 and 1.0", name)).into());
        }
        Ok(())
    }

    /// Validate a positive value
    pub fn validate_positive(value: f64, name: &str) -> Result<()> {
        if value <= 0.0 {
            return Err(OddsError::Config(format!("{} must be positive", name)).into());
        }
        Ok(())
    }

    /// Validate a URL format
    pub fn validate_url(url: &str, name: &str) -> Result<()> {
        if url.is_empty() {
            return Err(OddsError::Config(format!("{} cannot be empty", name)).into());
        }

        let parsed = url::Url::parse(url)
            .map_err(|e| OddsError::Config(format!("{} must be a valid URL: {}", name, e)))?;

        match parsed.scheme() {
            "http" | "https" | "ws" | "wss" => Ok(()),
            scheme => Err(OddsError::Config(format!("{} has unsupported scheme '{}'", name, scheme)).into()),
        }
    }
}

/// Configuration defaults
pub struct ConfigDefaults;

impl ConfigDefaults {
    /// Per-adapter initialization timeout in seconds
    pub const INIT_TIMEOUT_SECS: u64 = 10;

    /// Provider health-check interval in seconds
    pub const PROVIDER_HEALTH_INTERVAL_SECS: u64 = 300;

    /// Errors tolerated before a provider is flagged as `error`
    pub const ERROR_THRESHOLD: u32 = 5;

    /// Default provider request cap per minute
    pub const REQUESTS_PER_MINUTE: u32 = 60;

    /// Default provider request cap per hour
    pub const REQUESTS_PER_HOUR: u32 = 1000;

    /// Default provider request timeout in seconds
    pub const REQUEST_TIMEOUT_SECS: u64 = 10;

    /// Transport connect timeout in seconds
    pub const CONNECTION_TIMEOUT_SECS: u64 = 10;

    /// Default reconnection rounds
    pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

    /// Backoff base in milliseconds
    pub const BASE_BACKOFF_MS: u64 = 1_000;

    /// Backoff ceiling in milliseconds
    pub const MAX_BACKOFF_MS: u64 = 30_000;

    /// Transport health-check interval in seconds
    pub const TRANSPORT_HEALTH_INTERVAL_SECS: u64 = 30;

    /// Heartbeat interval in seconds
    pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

    /// Ping timeout in seconds
    pub const PING_TIMEOUT_SECS: u64 = 5;

    /// Outbound socket messages per minute
    pub const MAX_MESSAGES_PER_MINUTE: u32 = 100;

    /// Age after which a stream or poll is considered stale, in seconds
    pub const STALE_AFTER_SECS: u64 = 120;

    /// Polling interval in milliseconds
    pub const POLL_INTERVAL_MS: u64 = 10_000;

    /// Polling backoff ceiling in milliseconds
    pub const MAX_POLL_INTERVAL_MS: u64 = 60_000;

    /// Consecutive polling failures before polling gives up
    pub const MAX_POLL_RETRIES: u32 = 5;

    /// Relative odds change considered significant
    pub const CHANGE_THRESHOLD: f64 = 0.05;

    /// Default total stake used for arbitrage sizing
    pub const TOTAL_STAKE: f64 = 100.0;
}
