//! Shared state embedded in every provider adapter
//!
//! Holds the status handle, the request throttle and the HTTP client, so the
//! concrete adapters only carry their own wire-format code.

use crate::{
    config::{ConfigDefaults, ProviderConfig},
    providers::{ProviderHandle, ProviderSettings, ProviderStatus},
    utils::{metrics, RateLimiter},
    OddsError, Result,
};
use chrono::Utc;
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use std::time::Instant;
use tracing::{debug, warn};
use url::Url;

/// Status, throttling and HTTP plumbing shared by adapters
pub struct ProviderCore {
    config: ProviderConfig,
    handle: RwLock<ProviderHandle>,
    rate_limiter: RateLimiter,
    error_threshold: u32,
    http: reqwest::Client,
}

impl ProviderCore {
    /// Build the core for a provider configuration
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| OddsError::Connection(format!("Failed to create HTTP client: {}", e)))?;

        let handle = ProviderHandle {
            id: config.id.clone(),
            name: config.name.clone(),
            config: ProviderSettings {
                requests_per_minute: config.requests_per_minute,
                requests_per_hour: config.requests_per_hour,
                auth_method: config.auth_method,
                base_url: config.base_url.clone(),
            },
            status: ProviderStatus::Inactive,
            error_count: 0,
            last_error: None,
            last_sync: None,
        };

        Ok(Self {
            config: config.clone(),
            handle: RwLock::new(handle),
            rate_limiter: RateLimiter::new(config.requests_per_minute, config.requests_per_hour),
            error_threshold: ConfigDefaults::ERROR_THRESHOLD,
            http,
        })
    }

    /// Override the error threshold
    pub fn with_error_threshold(mut self, threshold: u32) -> Self {
        self.error_threshold = threshold;
        self
    }

    /// Provider id
    pub fn id(&self) -> &str {
        &self.config.id
    }

    /// Provider configuration
    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Shared HTTP client
    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    /// Wait for a request slot
    pub async fn throttle(&self) {
        self.rate_limiter.wait_for_rate_limit().await;
    }

    /// Snapshot of the handle
    pub fn snapshot(&self) -> ProviderHandle {
        self.handle.read().clone()
    }

    /// Current status
    pub fn status(&self) -> ProviderStatus {
        self.handle.read().status
    }

    /// Record a failure; status flips to `error` once the count exceeds the threshold
    pub fn record_error(&self, error: &anyhow::Error) {
        let mut handle = self.handle.write();
        handle.error_count += 1;
        handle.last_error = Some(error.to_string());

        if handle.error_count > self.error_threshold && handle.status != ProviderStatus::Error {
            warn!(
                provider = %handle.id,
                error_count = handle.error_count,
                "Provider exceeded error threshold"
            );
            handle.status = ProviderStatus::Error;
        }
    }

    /// Record a successful exchange
    pub fn record_success(&self) {
        let mut handle = self.handle.write();
        handle.error_count = 0;
        handle.status = ProviderStatus::Active;
        handle.last_sync = Some(Utc::now());
    }

    /// Clear the error count and restore `active`
    pub fn reset_errors(&self) {
        let mut handle = self.handle.write();
        handle.error_count = 0;
        handle.last_error = None;
        handle.status = ProviderStatus::Active;
    }

    /// Force a status
    pub fn set_status(&self, status: ProviderStatus) {
        self.handle.write().status = status;
    }

    /// Join `path` onto the base URL and append non-empty query pairs
    pub fn endpoint(&self, path: &str, query: &[(&str, Option<&str>)]) -> Result<Url> {
        let base = self.config.base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{}{}", base, path))
            .map_err(|e| OddsError::Config(format!("Invalid endpoint for {}: {}", self.config.id, e)))?;

        let pairs: Vec<_> = query
            .iter()
            .filter_map(|(key, value)| value.map(|v| (*key, v)))
            .collect();
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(pairs);
        }

        Ok(url)
    }

    /// Send a request and decode a JSON body
    ///
    /// Network failures, non-success statuses and malformed bodies all map to
    /// a transient adapter error.
    pub async fn send_json<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        self.throttle().await;

        let started = Instant::now();
        let result = self.send_json_inner(request).await;
        metrics::record_provider_fetch(self.id(), result.is_ok(), started.elapsed());

        result
    }

    async fn send_json_inner<T: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| self.transient(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transient(format!("HTTP request failed with status: {}", status)));
        }

        let body = response
            .json::<T>()
            .await
            .map_err(|e| self.transient(format!("Failed to decode response: {}", e)))?;

        debug!(provider = %self.config.id, "Request succeeded");
        Ok(body)
    }

    /// Send a request and report whether it returned a success status
    pub async fn probe(&self, request: reqwest::RequestBuilder) -> bool {
        self.throttle().await;
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                debug!(provider = %self.config.id, "Health probe failed: {}", e);
                false
            }
        }
    }

    /// Build a transient error tagged with this provider
    pub fn transient(&self, message: String) -> anyhow::Error {
        OddsError::TransientAdapter {
            provider: self.config.id.clone(),
            message,
        }
        .into()
    }
}
