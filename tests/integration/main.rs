//! Integration tests for the odds aggregator

mod test_connection_manager;
mod test_provider_manager;
mod test_push_provider;
mod test_socket_transport;

use async_trait::async_trait;
use odds_aggregator::{
    config::{ConnectionConfig, ProviderConfig},
    providers::{ApiKeyProvider, ProviderKind},
    transport::{ConnectionStatus, Transport, TransportEvent, TransportMethod},
    OddsError, Result,
};
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

/// Test utilities for integration tests
pub struct TestUtils;

impl TestUtils {
    /// Connection settings with short backoff and no background health ticks
    pub fn connection_config(max_rounds: u32) -> ConnectionConfig {
        ConnectionConfig {
            max_reconnect_attempts: max_rounds,
            base_backoff_ms: 10,
            max_backoff_ms: 40,
            connect_timeout_secs: 1,
            health_check_interval_secs: 3_600,
            ..ConnectionConfig::default()
        }
    }

    /// Key-authenticated adapter pointed at a mock server
    pub fn api_key_provider(id: &str, base_url: &str) -> Arc<ApiKeyProvider> {
        let config = ProviderConfig::new(id, ProviderKind::ApiKey, base_url);
        Arc::new(ApiKeyProvider::new(config).unwrap())
    }

    /// `/odds` body with one two-way market
    pub fn two_way_odds(event: &str, home: f64, away: f64) -> Value {
        json!([{
            "event_id": event,
            "sport": "soccer",
            "markets": [{
                "key": "h2h",
                "outcomes": [
                    {"name": "home", "price": home},
                    {"name": "away", "price": away}
                ]
            }]
        }])
    }

    /// Wait for a condition with timeout
    pub async fn wait_for_condition<F, Fut>(mut condition: F, timeout_ms: u64, check_interval_ms: u64) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        let start = tokio::time::Instant::now();
        let timeout = std::time::Duration::from_millis(timeout_ms);
        let interval = std::time::Duration::from_millis(check_interval_ms);

        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            tokio::time::sleep(interval).await;
        }

        false
    }
}

/// Transport whose connect outcomes are scripted up front
///
/// Once the script runs out, the last outcome repeats.
pub struct ScriptedTransport {
    method: TransportMethod,
    script: Mutex<VecDeque<bool>>,
    last: Mutex<bool>,
    status: RwLock<ConnectionStatus>,
    healthy: AtomicBool,
    connects: AtomicUsize,
    connect_delay: Mutex<Duration>,
    emitted: Mutex<Vec<(String, Value)>>,
    events: broadcast::Sender<TransportEvent>,
}

impl ScriptedTransport {
    pub fn new(method: TransportMethod, outcomes: &[bool]) -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            method,
            script: Mutex::new(outcomes.iter().copied().collect()),
            last: Mutex::new(outcomes.last().copied().unwrap_or(false)),
            status: RwLock::new(ConnectionStatus::Disconnected),
            healthy: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            connect_delay: Mutex::new(Duration::ZERO),
            emitted: Mutex::new(Vec::new()),
            events,
        })
    }

    pub fn always(method: TransportMethod, succeeds: bool) -> Arc<Self> {
        Self::new(method, &[succeeds])
    }

    /// Make every connect take `delay` before resolving
    pub fn set_connect_delay(&self, delay: Duration) {
        *self.connect_delay.lock() = delay;
    }

    pub fn connect_calls(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().clone()
    }

    /// Push an event as if the remote end produced it
    pub fn push(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn method(&self) -> TransportMethod {
        self.method
    }

    async fn connect(&self) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let succeeds = match self.script.lock().pop_front() {
            Some(outcome) => outcome,
            None => *self.last.lock(),
        };

        if succeeds {
            *self.status.write() = ConnectionStatus::Connected;
            Ok(())
        } else {
            *self.status.write() = ConnectionStatus::Error;
            Err(OddsError::Connection(format!("{} refused", self.method)).into())
        }
    }

    async fn disconnect(&self) -> Result<()> {
        *self.status.write() = ConnectionStatus::Disconnected;
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    fn is_healthy(&self) -> bool {
        self.status() == ConnectionStatus::Connected && self.healthy.load(Ordering::SeqCst)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: &str, payload: Value) -> bool {
        if self.status() != ConnectionStatus::Connected {
            return false;
        }
        self.emitted.lock().push((event.to_string(), payload));
        true
    }
}
