//! REST provider authenticated with a static API key header

use crate::{
    config::ProviderConfig,
    providers::{core::ProviderCore, traits::*},
    Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};

const API_KEY_HEADER: &str = "x-api-key";

/// Provider speaking the key-authenticated REST format
pub struct ApiKeyProvider {
    core: ProviderCore,
}

impl ApiKeyProvider {
    /// Create a new API-key provider
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Ok(Self {
            core: ProviderCore::new(&config)?,
        })
    }

    /// Create with a custom error threshold
    pub fn with_error_threshold(config: ProviderConfig, threshold: u32) -> Result<Self> {
        Ok(Self {
            core: ProviderCore::new(&config)?.with_error_threshold(threshold),
        })
    }

    fn get(&self, url: url::Url) -> reqwest::RequestBuilder {
        let request = self.core.http().get(url);
        match &self.core.config().api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    async fn fetch_odds(&self, sport: Option<&str>, event: Option<&str>) -> Result<Vec<Quote>> {
        let url = self.core.endpoint("/odds", &[("sport", sport), ("event", event)])?;
        let events: Vec<OddsEventRow> = self.core.send_json(self.get(url)).await?;
        Ok(flatten_odds(self.core.id(), events))
    }
}

#[async_trait]
impl ProviderAdapter for ApiKeyProvider {
    fn id(&self) -> &str {
        self.core.id()
    }

    async fn initialize(&self) -> Result<()> {
        info!("Initializing provider {}...", self.core.id());
        let sports = self.get_sports().await?;
        info!("Provider {} ready, {} sports available", self.core.id(), sports.len());
        Ok(())
    }

    async fn get_odds(&self, sport: Option<&str>, event: Option<&str>) -> Result<Vec<Quote>> {
        debug!("Fetching odds from {} (sport={:?}, event={:?})", self.core.id(), sport, event);
        let quotes = self.fetch_odds(sport, event).await?;
        self.core.record_success();
        Ok(quotes)
    }

    async fn get_events(&self, sport: Option<&str>) -> Result<Vec<SportEvent>> {
        let url = self.core.endpoint("/events", &[("sport", sport)])?;
        let rows: Vec<EventRow> = self.core.send_json(self.get(url)).await?;
        self.core.record_success();
        Ok(rows.into_iter().map(EventRow::into_event).collect())
    }

    async fn get_sports(&self) -> Result<Vec<String>> {
        let url = self.core.endpoint("/sports", &[])?;
        let rows: Vec<SportRow> = self.core.send_json(self.get(url)).await?;
        self.core.record_success();
        Ok(rows.into_iter().filter(|s| s.active).map(|s| s.key).collect())
    }

    async fn check_health(&self) -> bool {
        match self.core.endpoint("/health", &[]) {
            Ok(url) => self.core.probe(self.get(url)).await,
            Err(_) => false,
        }
    }

    fn get_status(&self) -> ProviderHandle {
        self.core.snapshot()
    }

    fn handle_error(&self, error: &anyhow::Error) {
        self.core.record_error(error);
    }

    fn reset_error_count(&self) {
        self.core.reset_errors();
    }
}

/// One event with its markets, as served by `/odds`
#[derive(Debug, Deserialize)]
pub(crate) struct OddsEventRow {
    pub event_id: String,
    #[serde(default)]
    pub sport: String,
    /// Set by multi-bookmaker aggregators; overrides the provider id
    #[serde(default)]
    pub bookmaker: Option<String>,
    #[serde(default)]
    pub live: bool,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub markets: Vec<MarketRow>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct MarketRow {
    pub key: String,
    #[serde(default)]
    pub outcomes: Vec<OutcomeRow>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct OutcomeRow {
    pub name: String,
    pub price: f64,
}

#[derive(Debug, Deserialize)]
pub(crate) struct EventRow {
    pub id: String,
    #[serde(default)]
    pub sport: String,
    pub home_team: Option<String>,
    pub away_team: Option<String>,
    pub commence_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub live: bool,
}

impl EventRow {
    pub(crate) fn into_event(self) -> SportEvent {
        let name = match (&self.home_team, &self.away_team) {
            (Some(home), Some(away)) => format!("{} vs {}", home, away),
            _ => self.id.clone(),
        };
        SportEvent {
            id: self.id,
            sport: self.sport,
            name,
            home_team: self.home_team,
            away_team: self.away_team,
            commence_time: self.commence_time,
            is_live: self.live,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SportRow {
    key: String,
    #[serde(default = "default_active")]
    active: bool,
}

fn default_active() -> bool {
    true
}

/// Flatten event rows into quotes, dropping prices that break the odds invariant
pub(crate) fn flatten_odds(provider_id: &str, events: Vec<OddsEventRow>) -> Vec<Quote> {
    let mut quotes = Vec::new();
    for event in events {
        let provider = event.bookmaker.as_deref().unwrap_or(provider_id);
        let timestamp = event.last_update.unwrap_or_else(Utc::now);
        for market in &event.markets {
            for outcome in &market.outcomes {
                match Quote::new(provider, &event.sport, &event.event_id, &market.key, &outcome.name, outcome.price) {
                    Ok(quote) => quotes.push(quote.live(event.live).at(timestamp)),
                    Err(e) => debug!("Skipping quote: {}", e),
                }
            }
        }
    }
    quotes
}
