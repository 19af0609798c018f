//! Odds Aggregator
//!
//! Ingests live odds from multiple independent providers, keeps one coherent
//! aggregated view under partial and total provider failure, and computes
//! cross-provider arbitrage opportunities from that view. Live updates are
//! delivered over one logical channel backed by a websocket, a server-push
//! stream, or interval polling, with ordered fallback between them.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aggregation;
pub mod config;
pub mod events;
pub mod providers;
pub mod strategy;
pub mod transport;
pub mod utils;

// Re-export commonly used types
pub use aggregation::{AggregatedMarket, ProviderManager};
pub use config::AggregatorConfig;
pub use events::EventBus;
pub use providers::{ProviderAdapter, ProviderHandle, ProviderStatus, Quote};
pub use strategy::{ArbitrageCalculator, ArbitrageResult};
pub use transport::{ConnectionManager, ConnectionState, TransportMethod};

/// Result type used throughout the application
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the aggregation system
#[derive(thiserror::Error, Debug)]
pub enum OddsError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(String),

    /// Data parsing error
    #[error("Data parsing error: {0}")]
    DataParsing(String),

    /// Network or timeout failure inside a provider adapter
    #[error("Transient provider error ({provider}): {message}")]
    TransientAdapter {
        /// Provider that failed
        provider: String,
        /// Failure description
        message: String,
    },

    /// Transport authentication was rejected or never completed
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Local rate limit pre-check refused the request
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// Malformed outbound payload
    #[error("Validation error: {0}")]
    Validation(String),

    /// Every transport failed for every allowed reconnect round
    #[error("Exhausted retries after {attempts} attempts")]
    ExhaustedRetries {
        /// Number of rounds attempted
        attempts: u32,
    },

    /// No primary provider is healthy
    #[error("All providers unhealthy")]
    AllProvidersUnhealthy,

    /// Timeout error
    #[error("Timeout error: {0}")]
    Timeout(String),
}

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");
