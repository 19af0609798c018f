//! REST provider with HMAC-SHA256 signed requests

use crate::{
    config::{ConfigDefaults, ProviderConfig},
    providers::{core::ProviderCore, traits::*},
    OddsError, Result,
};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{debug, info};
use url::Url;

type HmacSha256 = Hmac<Sha256>;

/// Provider whose requests carry a timestamped HMAC signature
pub struct HmacProvider {
    core: ProviderCore,
    api_key: String,
    secret_key: String,
}

impl HmacProvider {
    /// Create a new signed provider; both key and secret are required
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Self::with_error_threshold(config, ConfigDefaults::ERROR_THRESHOLD)
    }

    /// Create with a custom error threshold
    pub fn with_error_threshold(config: ProviderConfig, threshold: u32) -> Result<Self> {
        let api_key = config
            .api_key
            .clone()
            .ok_or_else(|| OddsError::Config(format!("Provider '{}' requires api_key", config.id)))?;
        let secret_key = config
            .secret_key
            .clone()
            .ok_or_else(|| OddsError::Config(format!("Provider '{}' requires secret_key", config.id)))?;

        Ok(Self {
            core: ProviderCore::new(&config)?.with_error_threshold(threshold),
            api_key,
            secret_key,
        })
    }

    /// Signature over `timestamp + METHOD + path?query`, base64 encoded
    pub fn sign(secret: &str, timestamp: i64, method: &str, path_and_query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| OddsError::Config(format!("Invalid HMAC secret: {}", e)))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(method.as_bytes());
        mac.update(path_and_query.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    fn signed_get(&self, url: Url) -> Result<reqwest::RequestBuilder> {
        let timestamp = Utc::now().timestamp_millis();
        let path_and_query = match url.query() {
            Some(query) => format!("{}?{}", url.path(), query),
            None => url.path().to_string(),
        };
        let signature = Self::sign(&self.secret_key, timestamp, "GET", &path_and_query)?;

        Ok(self
            .core
            .http()
            .get(url)
            .header("X-API-KEY", &self.api_key)
            .header("X-TIMESTAMP", timestamp.to_string())
            .header("X-SIGNATURE", signature))
    }

    async fn fetch<T: serde::de::DeserializeOwned>(&self, path: &str, query: &[(&str, Option<&str>)]) -> Result<T> {
        let url = self.core.endpoint(path, query)?;
        let envelope: Envelope<T> = self.core.send_json(self.signed_get(url)?).await?;
        if !envelope.success {
            return Err(self.core.transient(
                envelope
                    .error
                    .unwrap_or_else(|| "Provider reported failure".to_string()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| self.core.transient("Response envelope has no data".to_string()))
    }
}

#[async_trait]
impl ProviderAdapter for HmacProvider {
    fn id(&self) -> &str {
        self.core.id()
    }

    async fn initialize(&self) -> Result<()> {
        info!("Initializing signed provider {}...", self.core.id());
        let status: StatusRow = self.fetch("/v1/status", &[]).await?;
        if status.status != "ok" {
            return Err(self.core.transient(format!("Provider status is '{}'", status.status)));
        }
        self.core.record_success();
        Ok(())
    }

    async fn get_odds(&self, sport: Option<&str>, event: Option<&str>) -> Result<Vec<Quote>> {
        debug!("Fetching signed odds from {}", self.core.id());
        let rows: Vec<PriceRow> = self
            .fetch("/v1/prices", &[("sport", sport), ("fixture_id", event)])
            .await?;
        self.core.record_success();

        let provider_id = self.core.id();
        Ok(rows
            .into_iter()
            .filter_map(|row| {
                Quote::new(provider_id, &row.sport, &row.fixture_id, &row.market, &row.selection, row.decimal_odds)
                    .map(|q| q.live(row.in_play).at(row.updated_at.unwrap_or_else(Utc::now)))
                    .map_err(|e| debug!("Skipping price: {}", e))
                    .ok()
            })
            .collect())
    }

    async fn get_events(&self, sport: Option<&str>) -> Result<Vec<SportEvent>> {
        let rows: Vec<FixtureRow> = self.fetch("/v1/fixtures", &[("sport", sport)]).await?;
        self.core.record_success();
        Ok(rows
            .into_iter()
            .map(|row| {
                let home = row.participants.first().cloned();
                let away = row.participants.get(1).cloned();
                SportEvent {
                    name: row.participants.join(" vs "),
                    id: row.fixture_id,
                    sport: row.sport,
                    home_team: home,
                    away_team: away,
                    commence_time: row.start_time,
                    is_live: row.in_play,
                }
            })
            .collect())
    }

    async fn get_sports(&self) -> Result<Vec<String>> {
        let sports: Vec<String> = self.fetch("/v1/sports", &[]).await?;
        self.core.record_success();
        Ok(sports)
    }

    async fn check_health(&self) -> bool {
        match self.fetch::<StatusRow>("/v1/status", &[]).await {
            Ok(status) => status.status == "ok",
            Err(e) => {
                debug!("Signed provider {} health check failed: {}", self.core.id(), e);
                false
            }
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

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StatusRow {
    status: String,
}

#[derive(Debug, Deserialize)]
struct PriceRow {
    fixture_id: String,
    #[serde(default)]
    sport: String,
    market: String,
    selection: String,
    decimal_odds: f64,
    #[serde(default)]
    in_play: bool,
    updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
struct FixtureRow {
    fixture_id: String,
    #[serde(default)]
    sport: String,
    #[serde(default)]
    participants: Vec<String>,
    start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    in_play: bool,
}
