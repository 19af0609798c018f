//! Secondary odds source consulted when the primary adapters come up empty

use crate::{
    config::{AuthMethod, ManagerConfig, ProviderConfig},
    providers::{api_key::ApiKeyProvider, ProviderAdapter, ProviderKind, Quote, SportEvent},
    Result,
};
use async_trait::async_trait;
use tracing::info;

/// Fallback source contract
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FallbackSource: Send + Sync {
    /// Fetch odds, optionally filtered by sport and event
    async fn get_odds(&self, sport: Option<String>, event: Option<String>) -> Result<Vec<Quote>>;

    /// Fetch events, optionally filtered by sport
    async fn get_events(&self, sport: Option<String>) -> Result<Vec<SportEvent>>;
}

/// Fallback backed by an aggregator speaking the key-authenticated REST format
pub struct HttpFallbackSource {
    inner: ApiKeyProvider,
}

impl HttpFallbackSource {
    /// Fallback source id used in logs and metrics
    pub const ID: &'static str = "fallback";

    /// Create a fallback source at `base_url`
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let mut config = ProviderConfig::new(Self::ID, ProviderKind::ApiKey, base_url);
        config.name = "Fallback aggregator".to_string();
        if api_key.is_some() {
            config.auth_method = AuthMethod::ApiKey;
        }
        config.api_key = api_key;

        Ok(Self {
            inner: ApiKeyProvider::new(config)?,
        })
    }

    /// Build from manager settings; `None` when the fallback is disabled or has no URL
    pub fn from_config(config: &ManagerConfig) -> Result<Option<Self>> {
        if !config.fallback_enabled {
            return Ok(None);
        }
        match &config.fallback_url {
            Some(url) => {
                info!("Fallback source configured at {}", url);
                Ok(Some(Self::new(url, config.fallback_api_key.clone())?))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl FallbackSource for HttpFallbackSource {
    async fn get_odds(&self, sport: Option<String>, event: Option<String>) -> Result<Vec<Quote>> {
        self.inner.get_odds(sport.as_deref(), event.as_deref()).await
    }

    async fn get_events(&self, sport: Option<String>) -> Result<Vec<SportEvent>> {
        self.inner.get_events(sport.as_deref()).await
    }
}
