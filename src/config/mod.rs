//! Configuration management module

pub mod settings;

pub use settings::*;

use crate::{providers::ProviderKind, transport::TransportMethod, OddsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure for the aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatorConfig {
    /// Configured odds providers
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    /// Provider manager configuration
    #[serde(default)]
    pub manager: ManagerConfig,
    /// Live connection configuration
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Arbitrage sizing configuration
    #[serde(default)]
    pub arbitrage: ArbitrageSettings,
    /// Logging and metrics configuration
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// How a provider authenticates its requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthMethod {
    /// No authentication
    None,
    /// Static API key header
    ApiKey,
    /// HMAC-signed requests
    Hmac,
    /// Token sent in the socket handshake
    Token,
}

impl std::fmt::Display for AuthMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthMethod::None => write!(f, "none"),
            AuthMethod::ApiKey => write!(f, "api_key"),
            AuthMethod::Hmac => write!(f, "hmac"),
            AuthMethod::Token => write!(f, "token"),
        }
    }
}

/// Individual provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider id
    pub id: String,
    /// Human readable name
    pub name: String,
    /// Adapter implementation to use
    pub kind: ProviderKind,
    /// Base endpoint (REST base URL or websocket URL)
    pub base_url: String,
    /// Authentication method
    #[serde(default = "default_auth_method")]
    pub auth_method: AuthMethod,
    /// API key or socket token, `${VAR}` references are expanded
    #[serde(default)]
    pub api_key: Option<String>,
    /// HMAC secret, `${VAR}` references are expanded
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Request cap per minute
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,
    /// Request cap per hour
    #[serde(default = "default_requests_per_hour")]
    pub requests_per_hour: u32,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Whether the provider is registered at startup
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ProviderConfig {
    /// Minimal configuration for a provider at `base_url`
    pub fn new(id: &str, kind: ProviderKind, base_url: &str) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            kind,
            base_url: base_url.to_string(),
            auth_method: AuthMethod::None,
            api_key: None,
            secret_key: None,
            requests_per_minute: ConfigDefaults::REQUESTS_PER_MINUTE,
            requests_per_hour: ConfigDefaults::REQUESTS_PER_HOUR,
            request_timeout_secs: ConfigDefaults::REQUEST_TIMEOUT_SECS,
            enabled: true,
        }
    }

    /// Request timeout as a duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Provider manager configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Interval between provider health sweeps in seconds
    pub health_check_interval_secs: u64,
    /// Per-adapter initialization timeout in seconds
    pub init_timeout_secs: u64,
    /// Errors tolerated before a provider status flips to `error`
    pub error_threshold: u32,
    /// Whether the secondary aggregator is consulted
    pub fallback_enabled: bool,
    /// Secondary aggregator base URL
    pub fallback_url: Option<String>,
    /// Secondary aggregator API key
    pub fallback_api_key: Option<String>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: ConfigDefaults::PROVIDER_HEALTH_INTERVAL_SECS,
            init_timeout_secs: ConfigDefaults::INIT_TIMEOUT_SECS,
            error_threshold: ConfigDefaults::ERROR_THRESHOLD,
            fallback_enabled: true,
            fallback_url: None,
            fallback_api_key: None,
        }
    }
}

/// Live connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// Transport attempted first
    pub preferred_method: TransportMethod,
    /// Order in which transports are walked after a failure
    pub fallback_order: Vec<TransportMethod>,
    /// Whether to walk the fallback order at all
    pub fallback_enabled: bool,
    /// Full fallback rounds attempted before giving up
    pub max_reconnect_attempts: u32,
    /// Backoff base in milliseconds
    pub base_backoff_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_backoff_ms: u64,
    /// Interval between transport health checks in seconds
    pub health_check_interval_secs: u64,
    /// Per-transport connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Websocket transport settings
    pub socket: SocketConfig,
    /// Push-stream transport settings
    pub stream: StreamConfig,
    /// Polling transport settings
    pub polling: PollingConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            preferred_method: TransportMethod::Socket,
            fallback_order: vec![TransportMethod::Socket, TransportMethod::Stream, TransportMethod::Polling],
            fallback_enabled: true,
            max_reconnect_attempts: ConfigDefaults::MAX_RECONNECT_ATTEMPTS,
            base_backoff_ms: ConfigDefaults::BASE_BACKOFF_MS,
            max_backoff_ms: ConfigDefaults::MAX_BACKOFF_MS,
            health_check_interval_secs: ConfigDefaults::TRANSPORT_HEALTH_INTERVAL_SECS,
            connect_timeout_secs: ConfigDefaults::CONNECTION_TIMEOUT_SECS,
            socket: SocketConfig::default(),
            stream: StreamConfig::default(),
            polling: PollingConfig::default(),
        }
    }
}

impl ConnectionConfig {
    /// Methods in the order a fresh round tries them
    ///
    /// The preferred method always comes first; the fallback order follows
    /// with duplicates removed.
    pub fn attempt_order(&self) -> Vec<TransportMethod> {
        let mut order = vec![self.preferred_method];
        if self.fallback_enabled {
            for method in &self.fallback_order {
                if !order.contains(method) {
                    order.push(*method);
                }
            }
        }
        order
    }

    /// Backoff before reconnect round `round` (1-based)
    pub fn backoff_for_round(&self, round: u32) -> Duration {
        let exponent = round.saturating_sub(1).min(31);
        let delay = self.base_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_backoff_ms))
    }

    /// Validate transport ordering and timing
    pub fn validate(&self) -> Result<()> {
        if self.preferred_method == TransportMethod::None {
            return Err(OddsError::Config("Preferred method cannot be 'none'".to_string()).into());
        }

        if self.fallback_enabled && self.fallback_order.is_empty() {
            return Err(OddsError::Config("Fallback order cannot be empty".to_string()).into());
        }

        let mut seen = HashSet::new();
        for method in &self.fallback_order {
            if *method == TransportMethod::None {
                return Err(OddsError::Config("Fallback order cannot contain 'none'".to_string()).into());
            }
            if !seen.insert(*method) {
                return Err(OddsError::Config(format!("Fallback order lists '{}' twice", method)).into());
            }
        }

        if self.connect_timeout_secs == 0 {
            return Err(OddsError::Config("Connect timeout must be greater than 0".to_string()).into());
        }

        if self.base_backoff_ms == 0 || self.max_backoff_ms < self.base_backoff_ms {
            return Err(OddsError::Config("Backoff must satisfy 0 < base <= max".to_string()).into());
        }

        if self.socket.max_messages_per_minute == 0 {
            return Err(OddsError::Config("Outbound message cap must be greater than 0".to_string()).into());
        }

        if self.polling.interval_ms == 0 || self.polling.max_interval_ms < self.polling.interval_ms {
            return Err(OddsError::Config("Polling interval must satisfy 0 < interval <= max".to_string()).into());
        }

        ConfigValidator::validate_ratio(self.polling.change_threshold, "Polling change threshold")?;

        Ok(())
    }
}

/// Websocket transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// Websocket URL
    pub url: String,
    /// Token sent in the auth handshake
    pub auth_token: Option<String>,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Ping round-trip timeout in seconds
    pub ping_timeout_secs: u64,
    /// Outbound message cap per minute
    pub max_messages_per_minute: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8080/live".to_string(),
            auth_token: None,
            heartbeat_interval_secs: ConfigDefaults::HEARTBEAT_INTERVAL_SECS,
            ping_timeout_secs: ConfigDefaults::PING_TIMEOUT_SECS,
            max_messages_per_minute: ConfigDefaults::MAX_MESSAGES_PER_MINUTE,
        }
    }
}

/// Server-push stream transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Event-stream URL
    pub url: String,
    /// Seconds without an event before the stream is unhealthy
    pub stale_after_secs: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8080/stream".to_string(),
            stale_after_secs: ConfigDefaults::STALE_AFTER_SECS,
        }
    }
}

/// Polling transport settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Base polling interval in milliseconds
    pub interval_ms: u64,
    /// Backoff ceiling in milliseconds
    pub max_interval_ms: u64,
    /// Consecutive failures before polling stops
    pub max_retries: u32,
    /// Relative change that counts as significant
    pub change_threshold: f64,
    /// Seconds without a successful poll before polling is unhealthy
    pub stale_after_secs: u64,
    /// Restrict polling to one sport
    pub sport: Option<String>,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_ms: ConfigDefaults::POLL_INTERVAL_MS,
            max_interval_ms: ConfigDefaults::MAX_POLL_INTERVAL_MS,
            max_retries: ConfigDefaults::MAX_POLL_RETRIES,
            change_threshold: ConfigDefaults::CHANGE_THRESHOLD,
            stale_after_secs: ConfigDefaults::STALE_AFTER_SECS,
            sport: None,
        }
    }
}

/// Arbitrage sizing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbitrageSettings {
    /// Total stake split across legs
    pub total_stake: f64,
    /// Results below this profit percentage are discarded
    pub min_profit_percentage: f64,
}

impl Default for ArbitrageSettings {
    fn default() -> Self {
        Self {
            total_stake: ConfigDefaults::TOTAL_STAKE,
            min_profit_percentage: 0.0,
        }
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    /// Default log level
    pub log_level: String,
    /// Log file path
    pub log_file: String,
    /// Enable the Prometheus exporter
    pub enable_metrics: bool,
    /// Prometheus listener address
    pub metrics_addr: String,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: "logs/odds-aggregator.log".to_string(),
            enable_metrics: false,
            metrics_addr: "127.0.0.1:9000".to_string(),
        }
    }
}

impl AggregatorConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path)
            .map_err(|e| OddsError::Config(format!("Failed to read config file: {}", e)))?;

        let mut config: AggregatorConfig =
            toml::from_str(&content).map_err(|e| OddsError::Config(format!("Failed to parse config: {}", e)))?;

        config.expand_env_vars()?;

        Ok(config)
    }

    /// Load a config file layered with `ODDS__SECTION__KEY` environment overrides
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("ODDS")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| OddsError::Config(format!("Failed to build config: {}", e)))?;

        let mut config: AggregatorConfig = settings
            .try_deserialize()
            .map_err(|e| OddsError::Config(format!("Failed to parse config: {}", e)))?;

        config.expand_env_vars()?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let mut ids = HashSet::new();
        for provider in &self.providers {
            ConfigValidator::validate_provider_id(&provider.id)?;
            ConfigValidator::validate_url(&provider.base_url, &format!("Provider '{}' base_url", provider.id))?;

            if !ids.insert(provider.id.as_str()) {
                return Err(OddsError::Config(format!("Duplicate provider id '{}'", provider.id)).into());
            }

            if provider.requests_per_minute == 0 || provider.requests_per_hour == 0 {
                return Err(OddsError::Config(format!(
                    "Provider '{}' rate limits must be greater than 0",
                    provider.id
                ))
                .into());
            }

            if provider.auth_method == AuthMethod::Hmac && provider.secret_key.is_none() {
                return Err(OddsError::Config(format!(
                    "Provider '{}' uses HMAC auth but has no secret_key",
                    provider.id
                ))
                .into());
            }
        }

        if self.manager.init_timeout_secs == 0 {
            return Err(OddsError::Config("Init timeout must be greater than 0".to_string()).into());
        }

        if self.manager.health_check_interval_secs == 0 {
            return Err(OddsError::Config("Health check interval must be greater than 0".to_string()).into());
        }

        if let Some(url) = &self.manager.fallback_url {
            ConfigValidator::validate_url(url, "Fallback URL")?;
        }

        self.connection.validate()?;

        ConfigValidator::validate_positive(self.arbitrage.total_stake, "Total stake")?;

        Ok(())
    }

    /// Enabled providers only
    pub fn enabled_providers(&self) -> impl Iterator<Item = &ProviderConfig> {
        self.providers.iter().filter(|p| p.enabled)
    }

    fn expand_env_vars(&mut self) -> Result<()> {
        for provider in &mut self.providers {
            EnvExpander::expand_opt(&mut provider.api_key)?;
            EnvExpander::expand_opt(&mut provider.secret_key)?;
        }
        EnvExpander::expand_opt(&mut self.manager.fallback_api_key)?;
        EnvExpander::expand_opt(&mut self.connection.socket.auth_token)?;
        Ok(())
    }
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            providers: Vec::new(),
            manager: ManagerConfig::default(),
            connection: ConnectionConfig::default(),
            arbitrage: ArbitrageSettings::default(),
            monitoring: MonitoringConfig::default(),
        }
    }
}

fn default_auth_method() -> AuthMethod {
    AuthMethod::None
}

fn default_requests_per_minute() -> u32 {
    ConfigDefaults::REQUESTS_PER_MINUTE
}

fn default_requests_per_hour() -> u32 {
    ConfigDefaults::REQUESTS_PER_HOUR
}

fn default_request_timeout_secs() -> u64 {
    ConfigDefaults::REQUEST_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}
