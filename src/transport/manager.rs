//! Connection manager
//!
//! Keeps one logical live-update channel open over whichever transport
//! works. A round tries the preferred method, then walks the fallback order;
//! failed rounds back off exponentially and the manager gives up after the
//! configured number of rounds. When a transport drops or fails its health
//! check, the first round resumes after that method in the order and only
//! later rounds start over from the preferred method.

use crate::{
    config::ConnectionConfig,
    events::{EventBus, HealthReport},
    log_transport,
    transport::{
        ConnectionState, ConnectionStatus, OddsSource, PollingTransport, SocketTransport, StreamTransport, Transport,
        TransportEvent, TransportMethod,
    },
    utils::metrics,
    OddsError, Result,
};
use chrono::Utc;
use indexmap::IndexMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Default)]
struct Tasks {
    watcher: Option<JoinHandle<()>>,
    health: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_active(&mut self) {
        for task in [self.watcher.take(), self.health.take()].into_iter().flatten() {
            task.abort();
        }
    }
}

struct Inner {
    config: ConnectionConfig,
    transports: RwLock<IndexMap<TransportMethod, Arc<dyn Transport>>>,
    active: RwLock<Option<Arc<dyn Transport>>>,
    state: RwLock<ConnectionState>,
    events: EventBus,
    tasks: Mutex<Tasks>,
    stopped: AtomicBool,
    establish_lock: tokio::sync::Mutex<()>,
}

/// Owns the connection state and drives transport fallback
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Create a manager with no transports registered
    pub fn new(config: ConnectionConfig, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transports: RwLock::new(IndexMap::new()),
                active: RwLock::new(None),
                state: RwLock::new(ConnectionState::default()),
                events,
                tasks: Mutex::new(Tasks::default()),
                stopped: AtomicBool::new(false),
                establish_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Create a manager with socket, stream and polling transports
    pub fn from_config(config: ConnectionConfig, events: EventBus, source: Arc<dyn OddsSource>) -> Result<Self> {
        let connect_timeout = Duration::from_secs(config.connect_timeout_secs);
        let socket = SocketTransport::new(config.socket.clone(), connect_timeout);
        let stream = StreamTransport::new(config.stream.clone(), connect_timeout)?;
        let polling = PollingTransport::new(config.polling.clone(), source);

        let manager = Self::new(config, events);
        manager.register_transport(Arc::new(socket));
        manager.register_transport(Arc::new(stream));
        manager.register_transport(Arc::new(polling));
        Ok(manager)
    }

    /// Register a transport under its own method, replacing any existing one
    pub fn register_transport(&self, transport: Arc<dyn Transport>) {
        self.inner.transports.write().insert(transport.method(), transport);
    }

    /// Open the channel, walking the fallback order until a transport connects
    ///
    /// Fails with `ExhaustedRetries` once every round has failed; the state is
    /// then terminal `error` until the next explicit `connect`.
    pub async fn connect(&self) -> Result<()> {
        self.inner.stopped.store(false, Ordering::SeqCst);
        self.establish(None).await
    }

    /// Close the active transport and stop every timer and retry task
    pub async fn disconnect(&self) -> Result<()> {
        self.inner.stopped.store(true, Ordering::SeqCst);
        let active = self.inner.active.write().take();
        {
            let mut tasks = self.inner.tasks.lock();
            tasks.abort_active();
            if let Some(task) = tasks.reconnect.take() {
                task.abort();
            }
        }

        if let Some(transport) = active {
            if let Err(e) = transport.disconnect().await {
                warn!("Failed to disconnect {}: {}", transport.method(), e);
            }
        }

        self.set_state(TransportMethod::None, ConnectionStatus::Disconnected);
        info!("Connection manager disconnected");
        Ok(())
    }

    /// Send an outbound message through the socket transport
    ///
    /// Returns `false` unless the socket is the active transport and accepted
    /// the message.
    pub fn emit(&self, event: &str, payload: serde_json::Value) -> bool {
        match self.inner.active.read().as_ref() {
            Some(transport) if transport.method() == TransportMethod::Socket => transport.emit(event, payload),
            _ => {
                debug!("Dropping '{}': socket is not the active transport", event);
                false
            }
        }
    }

    /// Snapshot of the connection state
    pub fn state(&self) -> ConnectionState {
        self.inner.state.read().clone()
    }

    /// Active transport method
    pub fn active_method(&self) -> TransportMethod {
        self.inner
            .active
            .read()
            .as_ref()
            .map_or(TransportMethod::None, |t| t.method())
    }

    /// Run one health check against the active transport
    ///
    /// An unhealthy result starts the fallback procedure in the background.
    pub fn check_health(&self) -> bool {
        let Some(transport) = self.inner.active.read().clone() else {
            return false;
        };

        let method = transport.method();
        let healthy = transport.is_healthy();
        let latency_ms = transport.latency().map(|l| l.as_millis() as u64);

        {
            let mut state = self.inner.state.write();
            state.is_healthy = healthy;
            state.latency_ms = latency_ms.or(state.latency_ms);
        }

        self.inner.events.publish_health_check(HealthReport {
            method,
            healthy,
            checked_at: Utc::now(),
            detail: (!healthy).then(|| format!("{} transport failed its health check", method)),
        });

        if !healthy {
            log_transport!(warn, method, transport.status(), "Transport unhealthy, failing over");
            self.schedule_reconnect(method, "health check failed".to_string());
        }
        healthy
    }

    fn ensure_running(&self) -> Result<()> {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return Err(OddsError::Connection("Connection manager stopped".to_string()).into());
        }
        Ok(())
    }

    /// Walk the fallback order until a transport connects
    ///
    /// With `resume_after` set, the first round only tries the methods that
    /// follow it in the order.
    async fn establish(&self, resume_after: Option<TransportMethod>) -> Result<()> {
        let _guard = self.inner.establish_lock.lock().await;

        let order = self.inner.config.attempt_order();
        let rounds = self.inner.config.max_reconnect_attempts.max(1);
        let connect_timeout = Duration::from_secs(self.inner.config.connect_timeout_secs);

        for round in 1..=rounds {
            let candidates = match resume_after {
                Some(failed) if round == 1 => order
                    .iter()
                    .position(|method| *method == failed)
                    .map_or(&order[..], |index| &order[index + 1..]),
                _ => &order[..],
            };

            for method in candidates {
                self.ensure_running()?;

                let transport = match self.inner.transports.read().get(method) {
                    Some(transport) => Arc::clone(transport),
                    None => continue,
                };

                self.set_state(*method, ConnectionStatus::Connecting);
                let result = match tokio::time::timeout(connect_timeout, transport.connect()).await {
                    Ok(result) => result,
                    Err(_) => Err(OddsError::Timeout(format!("{} connect timed out", method)).into()),
                };

                match result {
                    Ok(()) => {
                        if self.activate(Arc::clone(&transport)) {
                            return Ok(());
                        }
                        debug!("Dropping {} connection opened after disconnect", method);
                        let _ = transport.disconnect().await;
                        self.set_state(TransportMethod::None, ConnectionStatus::Disconnected);
                        return Err(OddsError::Connection("Connection manager stopped".to_string()).into());
                    }
                    Err(e) => {
                        log_transport!(warn, method, ConnectionStatus::Error, round, error = %e, "Transport failed to connect");
                        let _ = transport.disconnect().await;
                        self.ensure_running()?;
                        self.set_state(*method, ConnectionStatus::Disconnected);
                    }
                }
            }

            if round < rounds {
                let backoff = self.inner.config.backoff_for_round(round);
                info!("All transports failed in round {}/{}, retrying in {:?}", round, rounds, backoff);
                tokio::time::sleep(backoff).await;
                self.ensure_running()?;
            }
        }

        error!("Exhausted retries after {} rounds", rounds);
        self.set_state(TransportMethod::None, ConnectionStatus::Error);
        Err(OddsError::ExhaustedRetries { attempts: rounds }.into())
    }

    /// Make `transport` the active one; `false` once the manager is stopped
    fn activate(&self, transport: Arc<dyn Transport>) -> bool {
        let method = transport.method();
        let mut active = self.inner.active.write();
        if self.inner.stopped.load(Ordering::SeqCst) {
            return false;
        }

        let receiver = transport.subscribe();
        *active = Some(Arc::clone(&transport));

        self.set_state(method, ConnectionStatus::Connected);
        if let Some(latency) = transport.latency() {
            self.inner.state.write().latency_ms = Some(latency.as_millis() as u64);
        }
        info!("Live channel up over {}", method);

        let watcher = tokio::spawn(Self::watch(Arc::downgrade(&self.inner), method, receiver));

        let period = Duration::from_secs(self.inner.config.health_check_interval_secs.max(1));
        let weak = Arc::downgrade(&self.inner);
        let health = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ConnectionManager { inner }.check_health();
            }
        });

        let mut tasks = self.inner.tasks.lock();
        tasks.abort_active();
        tasks.watcher = Some(watcher);
        tasks.health = Some(health);
        true
    }

    async fn watch(inner: Weak<Inner>, method: TransportMethod, mut receiver: broadcast::Receiver<TransportEvent>) {
        loop {
            let event = match receiver.recv().await {
                Ok(event) => event,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Transport event watcher lagged, skipped {}", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            let Some(inner) = inner.upgrade() else {
                break;
            };
            let manager = ConnectionManager { inner };

            match event {
                TransportEvent::OddsUpdate(update) => manager.inner.events.publish_odds_update(update),
                TransportEvent::Message { event, .. } => debug!("{} message '{}'", method, event),
                TransportEvent::StatusChanged(status) => debug!("{} reported {}", method, status),
                TransportEvent::Latency(round_trip) => {
                    let mut state = manager.inner.state.write();
                    if state.method == method {
                        state.latency_ms = Some(round_trip.as_millis() as u64);
                    }
                }
                TransportEvent::Disconnected { reason } => {
                    log_transport!(warn, method, ConnectionStatus::Disconnected, reason = %reason, "Transport dropped");
                    manager.schedule_reconnect(method, reason);
                    break;
                }
            }
        }
    }

    fn schedule_reconnect(&self, failed: TransportMethod, reason: String) {
        if self.inner.stopped.load(Ordering::SeqCst) {
            return;
        }

        let mut tasks = self.inner.tasks.lock();
        if tasks.reconnect.as_ref().map_or(false, |t| !t.is_finished()) {
            debug!("Reconnect already in progress");
            return;
        }

        let manager = self.clone();
        tasks.reconnect = Some(tokio::spawn(async move {
            {
                let mut tasks = manager.inner.tasks.lock();
                tasks.abort_active();
            }

            let previous = manager.inner.active.write().take();
            if let Some(transport) = previous {
                let _ = transport.disconnect().await;
            }
            manager.set_state(failed, ConnectionStatus::Disconnected);
            info!("Reconnecting after {} failure: {}", failed, reason);

            if let Err(e) = manager.establish(Some(failed)).await {
                error!("Reconnect failed: {}", e);
            }
        }));
    }

    fn set_state(&self, method: TransportMethod, status: ConnectionStatus) {
        let snapshot = {
            let mut state = self.inner.state.write();
            let latency_ms = if method == state.method { state.latency_ms } else { None };
            *state = ConnectionState {
                latency_ms,
                ..ConnectionState::new(method, status)
            };
            state.clone()
        };

        metrics::record_transport_state(&method.to_string(), status == ConnectionStatus::Connected);
        log_transport!(debug, method, status, "Connection state changed");
        self.inner.events.publish_connection_status(snapshot);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let mut tasks = self.tasks.lock();
        tasks.abort_active();
        if let Some(task) = tasks.reconnect.take() {
            task.abort();
        }
    }
}
