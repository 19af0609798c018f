//! Transport traits and connection state types

use crate::{events::OddsUpdate, providers::Quote, OddsError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::sync::broadcast;

/// Wire transport behind the live-update channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMethod {
    /// Persistent bidirectional websocket
    Socket,
    /// Server-push event stream
    Stream,
    /// Interval polling through the provider manager
    Polling,
    /// No transport active
    None,
}

impl fmt::Display for TransportMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportMethod::Socket => write!(f, "socket"),
            TransportMethod::Stream => write!(f, "stream"),
            TransportMethod::Polling => write!(f, "polling"),
            TransportMethod::None => write!(f, "none"),
        }
    }
}

impl std::str::FromStr for TransportMethod {
    type Err = OddsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "socket" => Ok(TransportMethod::Socket),
            "stream" => Ok(TransportMethod::Stream),
            "polling" => Ok(TransportMethod::Polling),
            "none" => Ok(TransportMethod::None),
            _ => Err(OddsError::Config(format!("Unknown transport method: {}", s))),
        }
    }
}

/// Connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Disconnected
    Disconnected,
    /// Connecting
    Connecting,
    /// Connected
    Connected,
    /// Error state
    Error,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Error => write!(f, "error"),
        }
    }
}

/// Snapshot of the logical live-update channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    /// Active transport
    pub method: TransportMethod,
    /// Channel status
    pub status: ConnectionStatus,
    /// Last measured round trip in milliseconds
    pub latency_ms: Option<u64>,
    /// When the state last changed
    pub last_update: DateTime<Utc>,
    /// Result of the last health check
    pub is_healthy: bool,
}

impl ConnectionState {
    /// State for `method` in `status`
    pub fn new(method: TransportMethod, status: ConnectionStatus) -> Self {
        Self {
            method,
            status,
            latency_ms: None,
            last_update: Utc::now(),
            is_healthy: status == ConnectionStatus::Connected,
        }
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        Self::new(TransportMethod::None, ConnectionStatus::Disconnected)
    }
}

/// Event reported by a transport to whoever subscribed
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// Transport status changed
    StatusChanged(ConnectionStatus),
    /// A price arrived
    OddsUpdate(OddsUpdate),
    /// Any other inbound message
    Message {
        /// Event kind
        event: String,
        /// Message body
        payload: serde_json::Value,
    },
    /// A ping round trip completed
    Latency(Duration),
    /// The transport lost its connection or gave up
    Disconnected {
        /// Why the connection ended
        reason: String,
    },
}

/// Common transport contract
///
/// Implementations own their background tasks; `disconnect` stops them.
/// Only the socket transport can send, so `emit` defaults to `false`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Which transport this is
    fn method(&self) -> TransportMethod;

    /// Open the connection
    async fn connect(&self) -> Result<()>;

    /// Close the connection and stop background tasks
    async fn disconnect(&self) -> Result<()>;

    /// Current status
    fn status(&self) -> ConnectionStatus;

    /// Whether the transport is delivering data
    fn is_healthy(&self) -> bool;

    /// Receive transport events
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Send an outbound message; `false` when nothing was sent
    fn emit(&self, _event: &str, _payload: serde_json::Value) -> bool {
        false
    }

    /// Last measured round trip
    fn latency(&self) -> Option<Duration> {
        None
    }
}

/// Source of odds for the polling transport
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OddsSource: Send + Sync {
    /// Fetch current odds, optionally for one sport
    async fn fetch_odds(&self, sport: Option<String>) -> Result<Vec<Quote>>;
}
