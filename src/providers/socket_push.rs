//! Websocket push provider
//!
//! The provider streams price changes; the adapter keeps the latest price per
//! (event, market, outcome) and serves `get_odds` from that cache. A dropped
//! feed is reopened by the next health check unless the adapter was
//! disconnected on purpose.

use crate::{
    config::{ConfigDefaults, ProviderConfig},
    providers::{core::ProviderCore, traits::*},
    OddsError, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

type CacheKey = (String, String, String);

/// State shared between the adapter and its reader task
#[derive(Default)]
struct FeedState {
    quotes: DashMap<CacheKey, Quote>,
    events: DashMap<String, SportEvent>,
    connected: AtomicBool,
    closed: AtomicBool,
    last_message: Mutex<Option<Instant>>,
}

impl FeedState {
    fn touch(&self) {
        *self.last_message.lock() = Some(Instant::now());
    }

    fn apply(&self, provider_id: &str, text: &str) -> Result<usize> {
        let message: PushMessage = serde_json::from_str(text)
            .map_err(|e| OddsError::DataParsing(format!("Failed to parse push message: {}", e)))?;

        match message {
            PushMessage::Odds { data } => {
                let mut applied = 0;
                for row in data {
                    let quote = match Quote::new(provider_id, &row.sport, &row.event_id, &row.market, &row.outcome, row.price) {
                        Ok(quote) => quote.live(row.live).at(row.timestamp.unwrap_or_else(Utc::now)),
                        Err(e) => {
                            debug!("Skipping pushed quote: {}", e);
                            continue;
                        }
                    };
                    self.quotes
                        .insert((row.event_id.clone(), row.market.clone(), row.outcome.clone()), quote);
                    applied += 1;
                }
                Ok(applied)
            }
            PushMessage::Event { data } => {
                self.events.insert(data.id.clone(), data.into_event());
                Ok(1)
            }
            PushMessage::Suspend { event_id } => {
                self.quotes.retain(|(event, _, _), _| event != &event_id);
                Ok(0)
            }
            PushMessage::Heartbeat => Ok(0),
        }
    }
}

/// Adapter over a push-based websocket feed
pub struct SocketPushProvider {
    core: ProviderCore,
    state: Arc<FeedState>,
    reader: Mutex<Option<JoinHandle<()>>>,
    stale_after: Duration,
}

impl SocketPushProvider {
    /// Create a new push provider; nothing connects until `initialize`
    pub fn new(config: ProviderConfig) -> Result<Self> {
        Self::with_error_threshold(config, ConfigDefaults::ERROR_THRESHOLD)
    }

    /// Create with a custom error threshold
    pub fn with_error_threshold(config: ProviderConfig, threshold: u32) -> Result<Self> {
        Ok(Self {
            core: ProviderCore::new(&config)?.with_error_threshold(threshold),
            state: Arc::new(FeedState::default()),
            reader: Mutex::new(None),
            stale_after: Duration::from_secs(ConfigDefaults::STALE_AFTER_SECS),
        })
    }

    /// Whether the feed socket is open
    pub fn is_connected(&self) -> bool {
        self.state.connected.load(Ordering::Relaxed)
    }

    /// Number of cached quotes
    pub fn cached_quotes(&self) -> usize {
        self.state.quotes.len()
    }

    async fn connect(&self) -> Result<()> {
        let url = &self.core.config().base_url;
        let (stream, _) = timeout(self.core.config().request_timeout(), connect_async(url.as_str()))
            .await
            .map_err(|_| OddsError::Timeout(format!("Connecting to {} timed out", url)))?
            .map_err(|e| OddsError::Connection(format!("Websocket connect to {} failed: {}", url, e)))?;

        let (mut write, mut read) = stream.split();

        let subscribe = serde_json::json!({
            "type": "subscribe",
            "api_key": self.core.config().api_key,
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| OddsError::Connection(format!("Failed to send subscribe: {}", e)))?;

        self.state.connected.store(true, Ordering::Relaxed);
        self.state.touch();

        let state = Arc::clone(&self.state);
        let provider_id = self.core.id().to_string();
        let handle = tokio::spawn(async move {
            // Keep the write half alive for the lifetime of the reader
            let _write = write;
            while let Some(message) = read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        state.touch();
                        if let Err(e) = state.apply(&provider_id, &text) {
                            warn!(provider = %provider_id, "Dropping push message: {}", e);
                        }
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => state.touch(),
                    Ok(Message::Close(_)) => {
                        info!(provider = %provider_id, "Push feed closed by server");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(provider = %provider_id, "Push feed error: {}", e);
                        break;
                    }
                }
            }
            state.connected.store(false, Ordering::Relaxed);
        });

        if let Some(previous) = self.reader.lock().replace(handle) {
            previous.abort();
        }

        Ok(())
    }
}

#[async_trait]
impl ProviderAdapter for SocketPushProvider {
    fn id(&self) -> &str {
        self.core.id()
    }

    async fn initialize(&self) -> Result<()> {
        info!("Connecting push provider {}...", self.core.id());
        self.state.closed.store(false, Ordering::Relaxed);
        self.core.throttle().await;
        self.connect().await?;
        self.core.record_success();
        info!("Push provider {} connected", self.core.id());
        Ok(())
    }

    async fn get_odds(&self, sport: Option<&str>, event: Option<&str>) -> Result<Vec<Quote>> {
        if !self.is_connected() {
            return Err(self.core.transient("Push feed is not connected".to_string()));
        }

        let mut quotes: Vec<Quote> = self
            .state
            .quotes
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|q| sport.map_or(true, |s| q.sport == s))
            .filter(|q| event.map_or(true, |e| q.event == e))
            .collect();
        quotes.sort_by(|a, b| {
            (a.timestamp, &a.event, &a.market, &a.outcome).cmp(&(b.timestamp, &b.event, &b.market, &b.outcome))
        });

        self.core.record_success();
        Ok(quotes)
    }

    async fn get_events(&self, sport: Option<&str>) -> Result<Vec<SportEvent>> {
        if !self.is_connected() {
            return Err(self.core.transient("Push feed is not connected".to_string()));
        }

        let mut events: Vec<SportEvent> = self
            .state
            .events
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|e| sport.map_or(true, |s| e.sport == s))
            .collect();
        events.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(events)
    }

    async fn get_sports(&self) -> Result<Vec<String>> {
        let mut sports = BTreeSet::new();
        for entry in self.state.events.iter() {
            sports.insert(entry.value().sport.clone());
        }
        for entry in self.state.quotes.iter() {
            sports.insert(entry.value().sport.clone());
        }
        sports.remove("");
        Ok(sports.into_iter().collect())
    }

    async fn check_health(&self) -> bool {
        if !self.is_connected() {
            if self.state.closed.load(Ordering::Relaxed) {
                return false;
            }
            if let Err(e) = self.connect().await {
                warn!(provider = %self.core.id(), "Push feed reconnect failed: {}", e);
                return false;
            }
            info!("Push provider {} reconnected", self.core.id());
        }
        match *self.state.last_message.lock() {
            Some(at) => at.elapsed() < self.stale_after,
            None => false,
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

    fn as_disconnectable(&self) -> Option<&dyn Disconnectable> {
        Some(self)
    }
}

#[async_trait]
impl Disconnectable for SocketPushProvider {
    async fn disconnect(&self) -> Result<()> {
        self.state.closed.store(true, Ordering::Relaxed);
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
        self.state.connected.store(false, Ordering::Relaxed);
        self.core.set_status(ProviderStatus::Inactive);
        info!("Push provider {} disconnected", self.core.id());
        Ok(())
    }
}

impl Drop for SocketPushProvider {
    fn drop(&mut self) {
        if let Some(handle) = self.reader.lock().take() {
            handle.abort();
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum PushMessage {
    Odds { data: Vec<PushedQuote> },
    Event { data: super::api_key::EventRow },
    Suspend { event_id: String },
    Heartbeat,
}

#[derive(Debug, Deserialize)]
struct PushedQuote {
    event_id: String,
    #[serde(default)]
    sport: String,
    market: String,
    outcome: String,
    price: f64,
    #[serde(default)]
    live: bool,
    timestamp: Option<DateTime<Utc>>,
}
