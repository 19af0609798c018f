//! Provider manager
//!
//! Owns the adapter registry, fans requests out to healthy adapters, tracks
//! health, consults the fallback source and hands merged quotes to the
//! arbitrage calculator. Adapter failures never reach callers; they become
//! health changes.

use super::market::{self, AggregatedMarket};
use crate::{
    config::{AggregatorConfig, ArbitrageSettings, ManagerConfig},
    events::EventBus,
    log_provider,
    providers::{
        FallbackSource, HttpFallbackSource, ProviderAdapter, ProviderFactory, ProviderHandle, Quote, SportEvent,
    },
    strategy::ArbitrageCalculator,
    transport::OddsSource,
    utils::metrics,
    OddsError, Result,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use indexmap::IndexMap;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct ProviderEntry {
    adapter: Arc<dyn ProviderAdapter>,
    healthy: bool,
    last_sync: Option<DateTime<Utc>>,
}

struct Inner {
    config: ManagerConfig,
    calculator: ArbitrageCalculator,
    registry: RwLock<IndexMap<String, ProviderEntry>>,
    fallback: Option<Arc<dyn FallbackSource>>,
    events: EventBus,
    initialized: AtomicBool,
    init_lock: tokio::sync::Mutex<()>,
    health_task: Mutex<Option<JoinHandle<()>>>,
    // Bumped on shutdown so in-flight fan-outs can discard their results
    epoch: AtomicU64,
}

/// Aggregates odds across provider adapters
#[derive(Clone)]
pub struct ProviderManager {
    inner: Arc<Inner>,
}

impl ProviderManager {
    /// Create an empty manager
    pub fn new(
        config: ManagerConfig,
        arbitrage: &ArbitrageSettings,
        events: EventBus,
        fallback: Option<Arc<dyn FallbackSource>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                calculator: ArbitrageCalculator::from_settings(arbitrage),
                registry: RwLock::new(IndexMap::new()),
                fallback,
                events,
                initialized: AtomicBool::new(false),
                init_lock: tokio::sync::Mutex::new(()),
                health_task: Mutex::new(None),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Build a manager with every enabled provider and the configured fallback
    pub async fn from_config(config: &AggregatorConfig, events: EventBus) -> Result<Self> {
        let fallback = HttpFallbackSource::from_config(&config.manager)?
            .map(|source| Arc::new(source) as Arc<dyn FallbackSource>);
        let manager = Self::new(config.manager.clone(), &config.arbitrage, events, fallback);

        for provider in config.enabled_providers() {
            let adapter = ProviderFactory::create(provider.clone(), config.manager.error_threshold)?;
            manager.add_provider(&provider.id, adapter).await;
        }

        Ok(manager)
    }

    /// Initialize every adapter and start the health loop
    ///
    /// Adapters are initialized concurrently with a per-adapter timeout. An
    /// adapter that fails or times out is marked unhealthy; this call itself
    /// never fails.
    pub async fn initialize(&self) {
        let _guard = self.inner.init_lock.lock().await;
        if self.is_initialized() {
            return;
        }

        let adapters = self.adapters(false).await;
        info!("Initializing {} providers...", adapters.len());

        let timeout = Duration::from_secs(self.inner.config.init_timeout_secs);
        let results = join_all(adapters.iter().map(|(id, adapter)| async move {
            let result = match tokio::time::timeout(timeout, adapter.initialize()).await {
                Ok(result) => result,
                Err(_) => Err(OddsError::Timeout(format!("Initialization of '{}' timed out", id)).into()),
            };
            (id, adapter, result)
        }))
        .await;

        for (id, adapter, result) in results {
            match result {
                Ok(()) => {
                    log_provider!(info, id, "initialize", "Provider initialized");
                    self.set_healthy(id, true).await;
                }
                Err(e) => {
                    log_provider!(warn, id, "initialize", error = %e, "Provider failed to initialize");
                    adapter.handle_error(&e);
                    self.set_healthy(id, false).await;
                }
            }
        }

        self.inner.initialized.store(true, Ordering::SeqCst);
        self.start_health_loop();

        info!(
            "Provider manager initialized: {}/{} providers healthy",
            self.healthy_provider_count().await,
            self.provider_count().await
        );
    }

    /// Whether `initialize` has completed since the last shutdown
    pub fn is_initialized(&self) -> bool {
        self.inner.initialized.load(Ordering::SeqCst)
    }

    /// Merged odds from every healthy adapter
    ///
    /// Falls back to the secondary source when no adapter is healthy or the
    /// merged result is empty. Never fails; an empty vector is a valid answer.
    pub async fn get_odds(&self, sport: Option<&str>, event: Option<&str>) -> Vec<Quote> {
        self.ensure_initialized().await;
        let epoch = self.inner.epoch.load(Ordering::SeqCst);

        let healthy = self.adapters(true).await;
        let mut quotes: Vec<Quote> = Vec::new();

        if !healthy.is_empty() {
            let results = join_all(
                healthy
                    .iter()
                    .map(|(id, adapter)| async move { (id, adapter, adapter.get_odds(sport, event).await) }),
            )
            .await;

            for (id, adapter, result) in results {
                match result {
                    Ok(batch) => {
                        debug!("Provider {} returned {} quotes", id, batch.len());
                        quotes.extend(batch);
                    }
                    Err(e) => self.exclude(id, adapter, &e, "get_odds").await,
                }
            }
        }

        if self.inner.epoch.load(Ordering::SeqCst) != epoch {
            debug!("Discarding odds fetched across a shutdown");
            return Vec::new();
        }

        let quotes = market::normalize(quotes);
        if !quotes.is_empty() {
            return quotes;
        }
        market::normalize(self.fallback_odds(sport, event).await)
    }

    /// Odds grouped by (event, market, outcome) with arbitrage attached
    pub async fn get_aggregated_odds(&self, sport: Option<&str>, event: Option<&str>) -> Vec<AggregatedMarket> {
        let quotes = self.get_odds(sport, event).await;
        let quote_count = quotes.len();
        let markets = market::aggregate(quotes, &self.inner.calculator);

        let opportunities: BTreeSet<(&str, &str)> = markets
            .iter()
            .filter(|m| m.arbitrage.is_some())
            .map(|m| (m.event.as_str(), m.market.as_str()))
            .collect();
        metrics::record_aggregation(quote_count, markets.len(), opportunities.len());

        markets
    }

    /// Events from every healthy adapter, deduplicated by id
    pub async fn get_events(&self, sport: Option<&str>) -> Vec<SportEvent> {
        self.ensure_initialized().await;

        let healthy = self.adapters(true).await;
        let results = join_all(
            healthy
                .iter()
                .map(|(id, adapter)| async move { (id, adapter, adapter.get_events(sport).await) }),
        )
        .await;

        let mut events: IndexMap<String, SportEvent> = IndexMap::new();
        for (id, adapter, result) in results {
            match result {
                Ok(batch) => {
                    for event in batch {
                        events.entry(event.id.clone()).or_insert(event);
                    }
                }
                Err(e) => self.exclude(id, adapter, &e, "get_events").await,
            }
        }

        if events.is_empty() {
            if let Some(fallback) = &self.inner.fallback {
                metrics::record_fallback_used();
                match fallback.get_events(sport.map(str::to_string)).await {
                    Ok(batch) => {
                        for event in batch {
                            events.entry(event.id.clone()).or_insert(event);
                        }
                    }
                    Err(e) => warn!("Fallback events fetch failed: {}", e),
                }
            }
        }

        events.into_values().collect()
    }

    /// Union of sport keys across healthy adapters
    pub async fn get_sports(&self) -> Vec<String> {
        self.ensure_initialized().await;

        let healthy = self.adapters(true).await;
        let results = join_all(
            healthy
                .iter()
                .map(|(id, adapter)| async move { (id, adapter, adapter.get_sports().await) }),
        )
        .await;

        let mut sports = BTreeSet::new();
        for (id, adapter, result) in results {
            match result {
                Ok(batch) => sports.extend(batch),
                Err(e) => self.exclude(id, adapter, &e, "get_sports").await,
            }
        }
        sports.into_iter().collect()
    }

    /// Probe one provider and update its health; unknown ids report `false`
    pub async fn check_provider_health(&self, id: &str) -> bool {
        let adapter = match self.inner.registry.read().await.get(id) {
            Some(entry) => Arc::clone(&entry.adapter),
            None => return false,
        };

        let healthy = adapter.check_health().await;
        if healthy {
            adapter.reset_error_count();
        } else {
            adapter.handle_error(
                &OddsError::TransientAdapter {
                    provider: id.to_string(),
                    message: "Health check failed".to_string(),
                }
                .into(),
            );
        }

        self.set_healthy(id, healthy).await;
        healthy
    }

    /// Probe every provider concurrently
    pub async fn check_all_health(&self) -> IndexMap<String, bool> {
        let ids: Vec<String> = self.inner.registry.read().await.keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.check_provider_health(id))).await;
        ids.into_iter().zip(results).collect()
    }

    /// Register an adapter under `id`, replacing any existing one
    ///
    /// When the manager is already initialized the adapter is initialized
    /// right away; otherwise it waits for `initialize`.
    pub async fn add_provider(&self, id: &str, adapter: Arc<dyn ProviderAdapter>) {
        let replaced = self.inner.registry.write().await.insert(
            id.to_string(),
            ProviderEntry {
                adapter: Arc::clone(&adapter),
                healthy: false,
                last_sync: None,
            },
        );
        if let Some(previous) = replaced {
            Self::disconnect_adapter(id, &previous.adapter).await;
        }
        info!("Provider {} registered", id);

        if self.is_initialized() {
            let timeout = Duration::from_secs(self.inner.config.init_timeout_secs);
            let result = match tokio::time::timeout(timeout, adapter.initialize()).await {
                Ok(result) => result,
                Err(_) => Err(OddsError::Timeout(format!("Initialization of '{}' timed out", id)).into()),
            };
            match result {
                Ok(()) => self.set_healthy(id, true).await,
                Err(e) => {
                    log_provider!(warn, id, "initialize", error = %e, "Provider failed to initialize");
                    adapter.handle_error(&e);
                    self.set_healthy(id, false).await;
                }
            }
        }
    }

    /// Remove an adapter, disconnecting it if it holds a connection
    pub async fn remove_provider(&self, id: &str) -> bool {
        let removed = self.inner.registry.write().await.shift_remove(id);
        match removed {
            Some(entry) => {
                Self::disconnect_adapter(id, &entry.adapter).await;
                metrics::record_provider_health(id, false);
                info!("Provider {} removed", id);
                true
            }
            None => false,
        }
    }

    /// Stop the health loop, disconnect adapters and mark the manager uninitialized
    pub async fn shutdown(&self) {
        info!("Shutting down provider manager...");
        if let Some(task) = self.inner.health_task.lock().take() {
            task.abort();
        }
        self.inner.epoch.fetch_add(1, Ordering::SeqCst);

        let adapters = self.adapters(false).await;
        for (id, adapter) in &adapters {
            Self::disconnect_adapter(id, adapter).await;
        }

        for entry in self.inner.registry.write().await.values_mut() {
            entry.healthy = false;
        }
        self.inner.initialized.store(false, Ordering::SeqCst);
        info!("Provider manager stopped");
    }

    /// Number of registered providers
    pub async fn provider_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    /// Number of providers currently considered healthy
    pub async fn healthy_provider_count(&self) -> usize {
        self.inner.registry.read().await.values().filter(|e| e.healthy).count()
    }

    /// Handles for every provider in registration order
    pub async fn provider_statuses(&self) -> Vec<ProviderHandle> {
        self.inner
            .registry
            .read()
            .await
            .values()
            .map(|entry| {
                let mut handle = entry.adapter.get_status();
                if entry.last_sync > handle.last_sync {
                    handle.last_sync = entry.last_sync;
                }
                handle
            })
            .collect()
    }

    /// Whether provider `id` is currently considered healthy
    pub async fn is_provider_healthy(&self, id: &str) -> bool {
        self.inner.registry.read().await.get(id).map_or(false, |e| e.healthy)
    }

    async fn ensure_initialized(&self) {
        if !self.is_initialized() {
            self.initialize().await;
        }
    }

    async fn adapters(&self, healthy_only: bool) -> Vec<(String, Arc<dyn ProviderAdapter>)> {
        self.inner
            .registry
            .read()
            .await
            .iter()
            .filter(|(_, entry)| !healthy_only || entry.healthy)
            .map(|(id, entry)| (id.clone(), Arc::clone(&entry.adapter)))
            .collect()
    }

    async fn exclude(&self, id: &str, adapter: &Arc<dyn ProviderAdapter>, error: &anyhow::Error, operation: &str) {
        log_provider!(warn, id, operation, error = %error, "Provider call failed, excluding until healthy");
        adapter.handle_error(error);
        self.set_healthy(id, false).await;
    }

    async fn set_healthy(&self, id: &str, healthy: bool) {
        let flipped = {
            let mut registry = self.inner.registry.write().await;
            let Some(entry) = registry.get_mut(id) else {
                return;
            };
            if healthy {
                entry.last_sync = Some(Utc::now());
            }
            let flipped = entry.healthy != healthy;
            entry.healthy = healthy;
            flipped.then(|| {
                let mut handle = entry.adapter.get_status();
                if entry.last_sync > handle.last_sync {
                    handle.last_sync = entry.last_sync;
                }
                handle
            })
        };

        metrics::record_provider_health(id, healthy);
        if let Some(handle) = flipped {
            log_provider!(info, id, "health", healthy, status = %handle.status, "Provider health changed");
            self.inner.events.publish_provider_status(handle);
        }
    }

    async fn fallback_odds(&self, sport: Option<&str>, event: Option<&str>) -> Vec<Quote> {
        let Some(fallback) = &self.inner.fallback else {
            return Vec::new();
        };

        metrics::record_fallback_used();
        info!("Consulting fallback source");
        match fallback
            .get_odds(sport.map(str::to_string), event.map(str::to_string))
            .await
        {
            Ok(quotes) => quotes,
            Err(e) => {
                warn!("Fallback odds fetch failed: {}", e);
                Vec::new()
            }
        }
    }

    async fn disconnect_adapter(id: &str, adapter: &Arc<dyn ProviderAdapter>) {
        if let Some(connection) = adapter.as_disconnectable() {
            if let Err(e) = connection.disconnect().await {
                warn!("Failed to disconnect provider {}: {}", id, e);
            }
        }
    }

    fn start_health_loop(&self) {
        let period = Duration::from_secs(self.inner.config.health_check_interval_secs.max(1));
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let manager = ProviderManager { inner };
                let results = manager.check_all_health().await;
                debug!(
                    "Health sweep: {}/{} providers healthy",
                    results.values().filter(|h| **h).count(),
                    results.len()
                );
            }
        });

        if let Some(previous) = self.inner.health_task.lock().replace(task) {
            previous.abort();
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
    }
}

#[async_trait]
impl OddsSource for ProviderManager {
    async fn fetch_odds(&self, sport: Option<String>) -> Result<Vec<Quote>> {
        let quotes = self.get_odds(sport.as_deref(), None).await;
        if quotes.is_empty() && self.healthy_provider_count().await == 0 {
            return Err(OddsError::AllProvidersUnhealthy.into());
        }
        Ok(quotes)
    }
}
