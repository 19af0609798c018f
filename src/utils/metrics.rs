//! Metrics recording and Prometheus export

use crate::{OddsError, Result};
use metrics::{gauge, histogram, increment_counter};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;

/// Install a Prometheus scrape endpoint on `addr`
pub fn install_prometheus_exporter(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| OddsError::Config(format!("Failed to install metrics exporter: {}", e)))?;
    Ok(())
}

/// Record one provider fetch
pub fn record_provider_fetch(provider: &str, success: bool, elapsed: Duration) {
    let outcome = if success { "ok" } else { "error" };
    increment_counter!(
        "odds_provider_fetch_total",
        "provider" => provider.to_string(),
        "outcome" => outcome
    );
    histogram!(
        "odds_provider_fetch_seconds",
        elapsed.as_secs_f64(),
        "provider" => provider.to_string()
    );
}

/// Record provider health after a check or failure
pub fn record_provider_health(provider: &str, healthy: bool) {
    gauge!(
        "odds_provider_healthy",
        if healthy { 1.0 } else { 0.0 },
        "provider" => provider.to_string()
    );
}

/// Record a fallback source invocation
pub fn record_fallback_used() {
    increment_counter!("odds_fallback_used_total");
}

/// Record the size of an aggregation pass
pub fn record_aggregation(quotes: usize, markets: usize, opportunities: usize) {
    gauge!("odds_aggregated_quotes", quotes as f64);
    gauge!("odds_aggregated_markets", markets as f64);
    gauge!("odds_arbitrage_opportunities", opportunities as f64);
}

/// Record the active transport; `connected` is 1.0 when up
pub fn record_transport_state(method: &str, connected: bool) {
    gauge!(
        "odds_transport_connected",
        if connected { 1.0 } else { 0.0 },
        "method" => method.to_string()
    );
}

/// Record an outbound message rejected before sending
pub fn record_emit_rejected(reason: &'static str) {
    increment_counter!("odds_emit_rejected_total", "reason" => reason);
}
