//! Server-push event stream transport (Server-Sent Events)

use crate::{
    config::StreamConfig,
    events::OddsUpdate,
    providers::Quote,
    transport::{ConnectionStatus, Transport, TransportEvent, TransportMethod},
    OddsError, Result,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, info, warn};

/// One parsed SSE frame
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    /// `event:` field, `message` when absent
    pub event: String,
    /// Joined `data:` lines
    pub data: String,
}

/// Incremental SSE parser; feed it bytes, take complete frames out
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    /// Append a chunk and return every frame it completed
    pub fn feed(&mut self, chunk: &str) -> Vec<SseFrame> {
        self.buffer.push_str(&chunk.replace("\r\n", "\n"));

        let mut frames = Vec::new();
        while let Some(end) = self.buffer.find("\n\n") {
            let block: String = self.buffer.drain(..end + 2).collect();
            if let Some(frame) = Self::parse_block(&block) {
                frames.push(frame);
            }
        }
        frames
    }

    fn parse_block(block: &str) -> Option<SseFrame> {
        let mut event = None;
        let mut data: Vec<&str> = Vec::new();

        for line in block.lines() {
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
                None => (line, ""),
            };
            match field {
                "event" => event = Some(value.to_string()),
                "data" => data.push(value),
                _ => {}
            }
        }

        if data.is_empty() {
            return None;
        }
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data: data.join("\n"),
        })
    }
}

struct Shared {
    status: RwLock<ConnectionStatus>,
    last_event: Mutex<Option<Instant>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            let _ = self.events.send(TransportEvent::StatusChanged(status));
        }
    }

    fn dispatch(&self, frame: SseFrame) {
        *self.last_event.lock() = Some(Instant::now());

        match frame.event.as_str() {
            "odds_update" => match serde_json::from_str::<Quote>(&frame.data) {
                Ok(quote) if quote.is_valid() => {
                    let _ = self.events.send(TransportEvent::OddsUpdate(OddsUpdate::new(quote, None)));
                }
                Ok(_) => debug!("Dropping streamed quote with invalid odds"),
                Err(e) => debug!("Dropping unparseable streamed quote: {}", e),
            },
            "heartbeat" => {}
            _ => {
                let payload = serde_json::from_str(&frame.data).unwrap_or(serde_json::Value::String(frame.data));
                let _ = self.events.send(TransportEvent::Message {
                    event: frame.event,
                    payload,
                });
            }
        }
    }
}

/// Receive-only transport over a Server-Sent Events endpoint
pub struct StreamTransport {
    config: StreamConfig,
    connect_timeout: Duration,
    http: reqwest::Client,
    shared: Arc<Shared>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl StreamTransport {
    /// Create a stream transport; nothing connects until `connect`
    pub fn new(config: StreamConfig, connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| OddsError::Connection(format!("Failed to create HTTP client: {}", e)))?;
        let (events, _) = broadcast::channel(1024);

        Ok(Self {
            config,
            connect_timeout,
            http,
            shared: Arc::new(Shared {
                status: RwLock::new(ConnectionStatus::Disconnected),
                last_event: Mutex::new(None),
                events,
            }),
            reader: Mutex::new(None),
        })
    }

    async fn open(&self) -> Result<reqwest::Response> {
        let response = self
            .http
            .get(&self.config.url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| OddsError::Connection(format!("Stream request to {} failed: {}", self.config.url, e)))?;

        if !response.status().is_success() {
            return Err(OddsError::Connection(format!("Stream endpoint returned {}", response.status())).into());
        }
        Ok(response)
    }

    fn stop_reader(&self) {
        if let Some(task) = self.reader.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl Transport for StreamTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::Stream
    }

    async fn connect(&self) -> Result<()> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        self.shared.set_status(ConnectionStatus::Connecting);
        let response = match timeout(self.connect_timeout, self.open()).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.shared.set_status(ConnectionStatus::Error);
                return Err(e);
            }
            Err(_) => {
                self.shared.set_status(ConnectionStatus::Error);
                return Err(OddsError::Timeout(format!("Stream connect timed out after {:?}", self.connect_timeout)).into());
            }
        };

        *self.shared.last_event.lock() = Some(Instant::now());
        self.shared.set_status(ConnectionStatus::Connected);
        info!("Stream connected to {}", self.config.url);

        let shared = Arc::clone(&self.shared);
        let task = tokio::spawn(async move {
            let mut body = response.bytes_stream();
            let mut parser = SseParser::default();

            let reason = loop {
                match body.next().await {
                    Some(Ok(chunk)) => {
                        for frame in parser.feed(&String::from_utf8_lossy(&chunk)) {
                            shared.dispatch(frame);
                        }
                    }
                    Some(Err(e)) => break format!("stream error: {}", e),
                    None => break "stream ended".to_string(),
                }
            };

            warn!("Event stream lost: {}", reason);
            shared.set_status(ConnectionStatus::Disconnected);
            let _ = shared.events.send(TransportEvent::Disconnected { reason });
        });

        if let Some(previous) = self.reader.lock().replace(task) {
            previous.abort();
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_reader();
        self.shared.set_status(ConnectionStatus::Disconnected);
        info!("Stream disconnected");
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        *self.shared.status.read()
    }

    fn is_healthy(&self) -> bool {
        if self.status() != ConnectionStatus::Connected {
            return false;
        }
        let stale_after = Duration::from_secs(self.config.stale_after_secs);
        self.shared
            .last_event
            .lock()
            .map_or(false, |at| at.elapsed() < stale_after)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for StreamTransport {
    fn drop(&mut self) {
        self.stop_reader();
    }
}
