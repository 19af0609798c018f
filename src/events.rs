//! Typed event channels
//!
//! Each event kind has its own broadcast channel. Subscribers hold a
//! [`Subscription`]; dropping it unsubscribes. Publishing never blocks and
//! never fails when nobody is listening.

use crate::{
    providers::{ProviderHandle, Quote},
    transport::{ConnectionState, TransportMethod},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::warn;

const DEFAULT_CAPACITY: usize = 1024;

/// A quote whose price moved (or was seen for the first time)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsUpdate {
    /// New quote
    pub quote: Quote,
    /// Previous odds for the same key, if any
    pub previous_odds: Option<f64>,
    /// `(new - previous) / previous`, if there was a previous price
    pub change_ratio: Option<f64>,
}

impl OddsUpdate {
    /// Update for a quote with an optional previous price
    pub fn new(quote: Quote, previous_odds: Option<f64>) -> Self {
        let change_ratio = previous_odds
            .filter(|prev| *prev > 0.0)
            .map(|prev| (quote.odds - prev) / prev);
        Self {
            quote,
            previous_odds,
            change_ratio,
        }
    }
}

/// Outcome of one transport health check
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthReport {
    /// Transport checked
    pub method: TransportMethod,
    /// Whether the check passed
    pub healthy: bool,
    /// When the check ran
    pub checked_at: DateTime<Utc>,
    /// Failure reason, if any
    pub detail: Option<String>,
}

/// Receiving half of a typed channel
pub struct Subscription<T> {
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Next event; `None` once the bus is gone
    ///
    /// Events missed because the subscriber fell behind are skipped.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Subscriber lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Next event if one is already queued
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Stop receiving
    pub fn unsubscribe(self) {}
}

/// Event bus shared by the provider and connection managers
#[derive(Clone)]
pub struct EventBus {
    odds_update: broadcast::Sender<OddsUpdate>,
    connection_status: broadcast::Sender<ConnectionState>,
    health_check: broadcast::Sender<HealthReport>,
    provider_status_update: broadcast::Sender<ProviderHandle>,
}

impl EventBus {
    /// Create a bus whose channels buffer `capacity` events each
    pub fn new(capacity: usize) -> Self {
        Self {
            odds_update: broadcast::channel(capacity).0,
            connection_status: broadcast::channel(capacity).0,
            health_check: broadcast::channel(capacity).0,
            provider_status_update: broadcast::channel(capacity).0,
        }
    }

    /// Subscribe to `odds_update`
    pub fn subscribe_odds_updates(&self) -> Subscription<OddsUpdate> {
        Subscription {
            receiver: self.odds_update.subscribe(),
        }
    }

    /// Subscribe to `connection_status`
    pub fn subscribe_connection_status(&self) -> Subscription<ConnectionState> {
        Subscription {
            receiver: self.connection_status.subscribe(),
        }
    }

    /// Subscribe to `health_check`
    pub fn subscribe_health_checks(&self) -> Subscription<HealthReport> {
        Subscription {
            receiver: self.health_check.subscribe(),
        }
    }

    /// Subscribe to `provider_status_update`
    pub fn subscribe_provider_status(&self) -> Subscription<ProviderHandle> {
        Subscription {
            receiver: self.provider_status_update.subscribe(),
        }
    }

    /// Publish an odds update
    pub fn publish_odds_update(&self, update: OddsUpdate) {
        let _ = self.odds_update.send(update);
    }

    /// Publish a connection state change
    pub fn publish_connection_status(&self, state: ConnectionState) {
        let _ = self.connection_status.send(state);
    }

    /// Publish a health check result
    pub fn publish_health_check(&self, report: HealthReport) {
        let _ = self.health_check.send(report);
    }

    /// Publish a provider status change
    pub fn publish_provider_status(&self, handle: ProviderHandle) {
        let _ = self.provider_status_update.send(handle);
    }

    /// Number of live `odds_update` subscribers
    pub fn odds_subscriber_count(&self) -> usize {
        self.odds_update.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
