//! Bidirectional websocket transport
//!
//! Frames in both directions are JSON objects of the form
//! `{"type": <event>, "data": <payload>}`. When an auth token is configured
//! the transport sends `{"type":"auth","token":...}` right after the
//! handshake and waits for `auth_success` or `auth_error` before reporting
//! itself connected.

use crate::{
    config::SocketConfig,
    events::OddsUpdate,
    log_transport,
    providers::{Quote, QuoteKey},
    transport::{ConnectionStatus, Transport, TransportEvent, TransportMethod},
    utils::{metrics, RateLimiter},
    OddsError, Result,
};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::{stream::SplitStream, SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

type WsReader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

const NO_LATENCY: u64 = u64::MAX;

#[derive(Debug, Deserialize)]
struct Frame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    message: Option<String>,
}

/// Check an outbound payload against the rules for its event kind
///
/// Unknown event kinds only need an object payload.
pub fn validate_outbound(event: &str, payload: &Value) -> Result<()> {
    let invalid = |reason: &str| -> anyhow::Error { OddsError::Validation(format!("{}: {}", event, reason)).into() };

    let object = payload.as_object().ok_or_else(|| invalid("payload must be an object"))?;

    match event {
        "odds_update" => {
            for field in ["provider", "event", "market", "outcome"] {
                match object.get(field).and_then(Value::as_str) {
                    Some(value) if !value.is_empty() => {}
                    _ => return Err(invalid(&format!("missing '{}'", field))),
                }
            }
            match object.get("odds").and_then(Value::as_f64) {
                Some(odds) if odds > 0.0 && odds.is_finite() => Ok(()),
                _ => Err(invalid("odds must be a number > 0")),
            }
        }
        "heartbeat" | "ping" => match object.get("timestamp") {
            Some(Value::Number(_)) => Ok(()),
            _ => Err(invalid("timestamp must be numeric")),
        },
        "subscribe" => {
            let non_empty = |key: &str| {
                object
                    .get(key)
                    .and_then(Value::as_array)
                    .map_or(false, |items| !items.is_empty())
            };
            if non_empty("sports") || non_empty("events") {
                Ok(())
            } else {
                Err(invalid("needs a non-empty 'sports' or 'events' array"))
            }
        }
        _ => Ok(()),
    }
}

/// State shared with the reader, writer and heartbeat tasks
struct Shared {
    status: RwLock<ConnectionStatus>,
    authenticated: AtomicBool,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    rate_limiter: RateLimiter,
    events: broadcast::Sender<TransportEvent>,
    pending_pings: Mutex<HashMap<String, oneshot::Sender<()>>>,
    latency_ms: AtomicU64,
    messages_sent: AtomicU64,
    last_odds: DashMap<QuoteKey, f64>,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            log_transport!(debug, TransportMethod::Socket, status, "Socket status changed");
            let _ = self.events.send(TransportEvent::StatusChanged(status));
        }
    }

    fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    fn emit(&self, event: &str, payload: Value) -> bool {
        if self.status() != ConnectionStatus::Connected {
            metrics::record_emit_rejected("disconnected");
            return false;
        }
        if !self.authenticated.load(Ordering::SeqCst) {
            metrics::record_emit_rejected("unauthenticated");
            return false;
        }
        if let Err(e) = validate_outbound(event, &payload) {
            debug!("Rejected outbound message: {}", e);
            metrics::record_emit_rejected("invalid");
            return false;
        }

        let outbound = self.outbound.lock();
        let Some(sender) = outbound.as_ref().filter(|sender| !sender.is_closed()) else {
            metrics::record_emit_rejected("send_failed");
            return false;
        };
        if !self.rate_limiter.try_acquire() {
            warn!("Outbound rate limit exhausted, dropping '{}'", event);
            metrics::record_emit_rejected("rate_limited");
            return false;
        }

        let frame = json!({ "type": event, "data": payload }).to_string();
        let sent = sender.send(Message::Text(frame)).is_ok();
        drop(outbound);

        if sent {
            self.messages_sent.fetch_add(1, Ordering::Relaxed);
        } else {
            metrics::record_emit_rejected("send_failed");
        }
        sent
    }

    fn handle_frame(&self, text: &str) {
        let frame: Frame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Ignoring malformed socket frame: {}", e);
                return;
            }
        };

        let Frame { kind, data, .. } = frame;
        match kind.as_str() {
            "odds_update" => match serde_json::from_value::<Quote>(data) {
                Ok(quote) if quote.is_valid() => {
                    let previous = self.last_odds.insert(quote.key(), quote.odds);
                    let _ = self
                        .events
                        .send(TransportEvent::OddsUpdate(OddsUpdate::new(quote, previous)));
                }
                Ok(_) => debug!("Dropping pushed quote with invalid odds"),
                Err(e) => debug!("Dropping unparseable odds update: {}", e),
            },
            "pong" => {
                let id = data.get("id").and_then(Value::as_str).unwrap_or_default();
                if let Some(waiter) = self.pending_pings.lock().remove(id) {
                    let _ = waiter.send(());
                }
            }
            _ => {
                let _ = self.events.send(TransportEvent::Message {
                    event: kind.clone(),
                    payload: data,
                });
            }
        }
    }

    async fn ping(&self, ping_timeout: Duration) -> Result<Duration> {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().insert(id.clone(), tx);

        let started = Instant::now();
        let payload = json!({ "id": id, "timestamp": Utc::now().timestamp_millis() });
        if !self.emit("ping", payload) {
            self.pending_pings.lock().remove(&id);
            return Err(OddsError::Connection("Ping could not be sent".to_string()).into());
        }

        match timeout(ping_timeout, rx).await {
            Ok(Ok(())) => {
                let round_trip = started.elapsed();
                self.latency_ms.store(round_trip.as_millis() as u64, Ordering::Relaxed);
                let _ = self.events.send(TransportEvent::Latency(round_trip));
                Ok(round_trip)
            }
            Ok(Err(_)) => Err(OddsError::Connection("Connection closed before pong".to_string()).into()),
            Err(_) => {
                self.pending_pings.lock().remove(&id);
                Err(OddsError::Timeout(format!("Ping timed out after {:?}", ping_timeout)).into())
            }
        }
    }

    async fn read_loop(self: Arc<Self>, mut read: WsReader) {
        let reason = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => self.handle_frame(&text),
                Some(Ok(Message::Close(_))) | None => break "closed by server".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break format!("read error: {}", e),
            }
        };

        info!("Socket connection lost: {}", reason);
        self.authenticated.store(false, Ordering::SeqCst);
        self.outbound.lock().take();
        self.set_status(ConnectionStatus::Disconnected);
        let _ = self.events.send(TransportEvent::Disconnected { reason });
    }
}

/// Websocket transport with auth handshake, heartbeat and outbound throttle
pub struct SocketTransport {
    config: SocketConfig,
    connect_timeout: Duration,
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SocketTransport {
    /// Create a socket transport; nothing connects until `connect`
    pub fn new(config: SocketConfig, connect_timeout: Duration) -> Self {
        let (events, _) = broadcast::channel(1024);
        let rate_limiter = RateLimiter::per_minute(config.max_messages_per_minute);
        Self {
            config,
            connect_timeout,
            shared: Arc::new(Shared {
                status: RwLock::new(ConnectionStatus::Disconnected),
                authenticated: AtomicBool::new(false),
                outbound: Mutex::new(None),
                rate_limiter,
                events,
                pending_pings: Mutex::new(HashMap::new()),
                latency_ms: AtomicU64::new(NO_LATENCY),
                messages_sent: AtomicU64::new(0),
                last_odds: DashMap::new(),
            }),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Whether the auth handshake completed on the current connection
    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Messages handed to the writer since creation
    pub fn messages_sent(&self) -> u64 {
        self.shared.messages_sent.load(Ordering::Relaxed)
    }

    /// Outbound slots left in the current minute
    pub fn remaining_messages(&self) -> Option<u32> {
        self.shared.rate_limiter.remaining_in_minute()
    }

    /// Measure the round trip of a ping/pong exchange
    pub async fn ping(&self) -> Result<Duration> {
        self.shared
            .ping(Duration::from_secs(self.config.ping_timeout_secs))
            .await
    }

    async fn open(&self) -> Result<()> {
        let (stream, _) = connect_async(self.config.url.as_str())
            .await
            .map_err(|e| OddsError::Connection(format!("Websocket connect to {} failed: {}", self.config.url, e)))?;
        let (mut write, mut read) = stream.split();

        if let Some(token) = &self.config.auth_token {
            write
                .send(Message::Text(json!({ "type": "auth", "token": token }).to_string()))
                .await
                .map_err(|e| OddsError::Connection(format!("Failed to send auth: {}", e)))?;

            loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<Frame>(&text) {
                        Ok(frame) if frame.kind == "auth_success" => break,
                        Ok(frame) if frame.kind == "auth_error" => {
                            let reason = frame
                                .message
                                .or_else(|| frame.data.get("message").and_then(Value::as_str).map(str::to_string))
                                .unwrap_or_else(|| "rejected".to_string());
                            return Err(OddsError::Authentication(reason).into());
                        }
                        _ => debug!("Ignoring frame received before auth completed"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(OddsError::Connection("Socket closed during auth".to_string()).into());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(OddsError::Connection(format!("Auth read failed: {}", e)).into()),
                }
            }
        }

        self.shared.authenticated.store(true, Ordering::SeqCst);

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.shared.outbound.lock() = Some(tx);

        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = write.send(message).await {
                    warn!("Socket write failed: {}", e);
                    break;
                }
            }
        });

        let reader = tokio::spawn(Arc::clone(&self.shared).read_loop(read));

        let heartbeat_every = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));
        let ping_timeout = Duration::from_secs(self.config.ping_timeout_secs);
        let shared = Arc::clone(&self.shared);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + heartbeat_every, heartbeat_every);
            loop {
                ticker.tick().await;
                if !shared.authenticated.load(Ordering::SeqCst) {
                    continue;
                }
                shared.emit("heartbeat", json!({ "timestamp": Utc::now().timestamp_millis() }));
                match shared.ping(ping_timeout).await {
                    Ok(round_trip) => debug!("Socket round trip {:?}", round_trip),
                    Err(e) => error!("Heartbeat ping failed: {}", e),
                }
            }
        });

        let mut tasks = self.tasks.lock();
        for task in tasks.drain(..) {
            task.abort();
        }
        tasks.extend([writer, reader, heartbeat]);

        Ok(())
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.shared.outbound.lock().take();
        self.shared.pending_pings.lock().clear();
        self.shared.authenticated.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for SocketTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::Socket
    }

    async fn connect(&self) -> Result<()> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        self.shared.set_status(ConnectionStatus::Connecting);
        let result = match timeout(self.connect_timeout, self.open()).await {
            Ok(result) => result,
            Err(_) => Err(OddsError::Timeout(format!("Socket connect timed out after {:?}", self.connect_timeout)).into()),
        };

        match result {
            Ok(()) => {
                self.shared.set_status(ConnectionStatus::Connected);
                info!("Socket connected to {}", self.config.url);
                Ok(())
            }
            Err(e) => {
                self.stop_tasks();
                self.shared.set_status(ConnectionStatus::Error);
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_tasks();
        self.shared.set_status(ConnectionStatus::Disconnected);
        info!("Socket disconnected");
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.shared.status()
    }

    fn is_healthy(&self) -> bool {
        self.status() == ConnectionStatus::Connected && self.is_authenticated()
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn emit(&self, event: &str, payload: Value) -> bool {
        self.shared.emit(event, payload)
    }

    fn latency(&self) -> Option<Duration> {
        match self.shared.latency_ms.load(Ordering::Relaxed) {
            NO_LATENCY => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
