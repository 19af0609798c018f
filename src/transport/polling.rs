//! Interval polling transport

use crate::{
    config::PollingConfig,
    events::OddsUpdate,
    providers::QuoteKey,
    transport::{ConnectionStatus, OddsSource, Transport, TransportEvent, TransportMethod},
    Result,
};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

struct Shared {
    status: RwLock<ConnectionStatus>,
    last_success: Mutex<Option<Instant>>,
    // Last emitted price per quote; small moves accumulate against it
    last_emitted: Mutex<HashMap<QuoteKey, f64>>,
    events: broadcast::Sender<TransportEvent>,
}

impl Shared {
    fn set_status(&self, status: ConnectionStatus) {
        let previous = std::mem::replace(&mut *self.status.write(), status);
        if previous != status {
            let _ = self.events.send(TransportEvent::StatusChanged(status));
        }
    }
}

/// Polls an [`OddsSource`] and emits significant price moves
pub struct PollingTransport {
    config: PollingConfig,
    source: Arc<dyn OddsSource>,
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingTransport {
    /// Create a polling transport over `source`
    pub fn new(config: PollingConfig, source: Arc<dyn OddsSource>) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            config,
            source,
            shared: Arc::new(Shared {
                status: RwLock::new(ConnectionStatus::Disconnected),
                last_success: Mutex::new(None),
                last_emitted: Mutex::new(HashMap::new()),
                events,
            }),
            task: Mutex::new(None),
        }
    }

    /// Whether `current` moved more than `threshold` relative to `previous`
    pub fn is_significant(previous: f64, current: f64, threshold: f64) -> bool {
        if previous <= 0.0 {
            return true;
        }
        ((current - previous) / previous).abs() > threshold
    }

    async fn run(config: PollingConfig, source: Arc<dyn OddsSource>, shared: Arc<Shared>) {
        let base = Duration::from_millis(config.interval_ms);
        let ceiling = Duration::from_millis(config.max_interval_ms);
        let mut interval = base;
        let mut failures = 0u32;

        loop {
            match source.fetch_odds(config.sport.clone()).await {
                Ok(quotes) => {
                    failures = 0;
                    interval = base;
                    *shared.last_success.lock() = Some(Instant::now());

                    let mut emitted = 0usize;
                    let updates: Vec<OddsUpdate> = {
                        let mut last_emitted = shared.last_emitted.lock();
                        quotes
                            .into_iter()
                            .filter(|q| q.is_valid())
                            .filter_map(|quote| {
                                let key = quote.key();
                                let previous = last_emitted.get(&key).copied();
                                let significant = previous
                                    .map_or(true, |prev| Self::is_significant(prev, quote.odds, config.change_threshold));
                                if !significant {
                                    return None;
                                }
                                last_emitted.insert(key, quote.odds);
                                Some(OddsUpdate::new(quote, previous))
                            })
                            .collect()
                    };

                    for update in updates {
                        emitted += 1;
                        let _ = shared.events.send(TransportEvent::OddsUpdate(update));
                    }
                    debug!("Poll complete, {} significant changes", emitted);
                }
                Err(e) => {
                    failures += 1;
                    interval = (interval * 2).min(ceiling);
                    warn!(
                        "Poll failed ({}/{}), next attempt in {:?}: {}",
                        failures, config.max_retries, interval, e
                    );

                    if failures >= config.max_retries {
                        let reason = format!("polling gave up after {} consecutive failures", failures);
                        error!("{}", reason);
                        shared.set_status(ConnectionStatus::Error);
                        let _ = shared.events.send(TransportEvent::Disconnected { reason });
                        return;
                    }
                }
            }

            tokio::time::sleep(interval).await;
        }
    }
}

#[async_trait]
impl Transport for PollingTransport {
    fn method(&self) -> TransportMethod {
        TransportMethod::Polling
    }

    async fn connect(&self) -> Result<()> {
        if self.status() == ConnectionStatus::Connected {
            return Ok(());
        }

        *self.shared.last_success.lock() = Some(Instant::now());
        self.shared.set_status(ConnectionStatus::Connected);

        let task = tokio::spawn(Self::run(
            self.config.clone(),
            Arc::clone(&self.source),
            Arc::clone(&self.shared),
        ));
        if let Some(previous) = self.task.lock().replace(task) {
            previous.abort();
        }

        info!("Polling every {}ms", self.config.interval_ms);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
        info!("Polling stopped");
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
            .last_success
            .lock()
            .map_or(false, |at| at.elapsed() < stale_after)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }
}
