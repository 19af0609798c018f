//! Provider adapter traits and common types

use crate::{config::AuthMethod, OddsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Provider adapter trait
///
/// One implementation per external provider. The wire protocol is private to
/// the implementation; callers only see quotes, events and health.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Provider id
    fn id(&self) -> &str;

    /// Prepare the adapter (connect, verify credentials)
    async fn initialize(&self) -> Result<()>;

    /// Fetch current odds, optionally filtered by sport and event
    async fn get_odds(&self, sport: Option<&str>, event: Option<&str>) -> Result<Vec<Quote>>;

    /// Fetch upcoming and live events, optionally filtered by sport
    async fn get_events(&self, sport: Option<&str>) -> Result<Vec<SportEvent>>;

    /// Fetch the sport keys this provider covers
    async fn get_sports(&self) -> Result<Vec<String>>;

    /// Probe the provider; `true` when it is reachable and serving
    async fn check_health(&self) -> bool;

    /// Snapshot of the provider handle
    fn get_status(&self) -> ProviderHandle;

    /// Record a failure against this provider
    fn handle_error(&self, error: &anyhow::Error);

    /// Clear the error count and restore `active`
    fn reset_error_count(&self);

    /// Disconnect capability for push-based adapters
    fn as_disconnectable(&self) -> Option<&dyn Disconnectable> {
        None
    }
}

/// Capability for adapters holding a persistent connection
#[async_trait]
pub trait Disconnectable: Send + Sync {
    /// Close the connection and stop background tasks
    async fn disconnect(&self) -> Result<()>;
}

/// A single price from one provider for one outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    /// Provider that quoted the price
    pub provider_id: String,
    /// Sport key
    pub sport: String,
    /// Event id
    pub event: String,
    /// Market key (e.g. `h2h`)
    pub market: String,
    /// Outcome name
    pub outcome: String,
    /// Decimal odds, always > 0
    pub odds: f64,
    /// When the provider produced the price
    pub timestamp: DateTime<Utc>,
    /// Whether the event is in play
    pub is_live: bool,
}

impl Quote {
    /// Create a quote stamped now; rejects non-positive or non-finite odds
    pub fn new(provider_id: &str, sport: &str, event: &str, market: &str, outcome: &str, odds: f64) -> Result<Self> {
        if !odds.is_finite() || odds <= 0.0 {
            return Err(OddsError::DataParsing(format!(
                "Invalid odds {} for {}/{}/{} from {}",
                odds, event, market, outcome, provider_id
            ))
            .into());
        }

        Ok(Self {
            provider_id: provider_id.to_string(),
            sport: sport.to_string(),
            event: event.to_string(),
            market: market.to_string(),
            outcome: outcome.to_string(),
            odds,
            timestamp: Utc::now(),
            is_live: false,
        })
    }

    /// Set the in-play flag
    pub fn live(mut self, is_live: bool) -> Self {
        self.is_live = is_live;
        self
    }

    /// Set the provider timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// `1 / odds`
    pub fn implied_probability(&self) -> f64 {
        1.0 / self.odds
    }

    /// Whether the quote still satisfies the odds invariant
    pub fn is_valid(&self) -> bool {
        self.odds.is_finite() && self.odds > 0.0
    }

    /// Identity of the quote ignoring its price
    pub fn key(&self) -> QuoteKey {
        QuoteKey {
            provider_id: self.provider_id.clone(),
            event: self.event.clone(),
            market: self.market.clone(),
            outcome: self.outcome.clone(),
        }
    }
}

/// Identity of a quote: provider plus event/market/outcome
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QuoteKey {
    /// Provider id
    pub provider_id: String,
    /// Event id
    pub event: String,
    /// Market key
    pub market: String,
    /// Outcome name
    pub outcome: String,
}

/// A sporting event offered by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SportEvent {
    /// Event id
    pub id: String,
    /// Sport key
    pub sport: String,
    /// Display name
    pub name: String,
    /// Home participant
    pub home_team: Option<String>,
    /// Away participant
    pub away_team: Option<String>,
    /// Scheduled start
    pub commence_time: Option<DateTime<Utc>>,
    /// Whether the event is in play
    pub is_live: bool,
}

/// Provider status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderStatus {
    /// Serving requests
    Active,
    /// Not initialized or shut down
    Inactive,
    /// Error count exceeded the threshold
    Error,
}

impl fmt::Display for ProviderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderStatus::Active => write!(f, "active"),
            ProviderStatus::Inactive => write!(f, "inactive"),
            ProviderStatus::Error => write!(f, "error"),
        }
    }
}

/// Static settings carried on a provider handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// Request cap per minute
    pub requests_per_minute: u32,
    /// Request cap per hour
    pub requests_per_hour: u32,
    /// Authentication method
    pub auth_method: AuthMethod,
    /// Base endpoint
    pub base_url: String,
}

/// Provider identity and health snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderHandle {
    /// Provider id
    pub id: String,
    /// Display name
    pub name: String,
    /// Rate limits, auth method and endpoint
    pub config: ProviderSettings,
    /// Current status
    pub status: ProviderStatus,
    /// Consecutive errors since the last success or reset
    pub error_count: u32,
    /// Most recent error message
    pub last_error: Option<String>,
    /// Last successful exchange with the provider
    pub last_sync: Option<DateTime<Utc>>,
}
