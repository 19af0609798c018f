//! Provider manager against HTTP providers served by wiremock

use crate::TestUtils;
use odds_aggregator::{
    config::{ArbitrageSettings, ManagerConfig, ProviderConfig},
    events::EventBus,
    providers::{HmacProvider, ProviderKind, ProviderStatus},
    transport::OddsSource,
    OddsError, ProviderManager,
};
use serde_json::json;
use std::sync::Arc;
use wiremock::matchers::{header, header_exists, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn manager() -> ProviderManager {
    let config = ManagerConfig {
        init_timeout_secs: 2,
        health_check_interval_secs: 3_600,
        ..ManagerConfig::default()
    };
    ProviderManager::new(config, &ArbitrageSettings::default(), EventBus::default(), None)
}

async fn healthy_book(home: f64, away: f64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sports"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"key": "soccer"}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/odds"))
        .respond_with(ResponseTemplate::new(200).set_body_json(TestUtils::two_way_odds("e1", home, away)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    server
}

async fn broken_book() -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn test_initialize_survives_every_adapter_failing() {
    let first = broken_book().await;
    let second = broken_book().await;

    let manager = manager();
    manager
        .add_provider("first", TestUtils::api_key_provider("first", &first.uri()))
        .await;
    manager
        .add_provider("second", TestUtils::api_key_provider("second", &second.uri()))
        .await;

    manager.initialize().await;

    assert!(manager.is_initialized());
    assert_eq!(manager.provider_count().await, 2);
    assert_eq!(manager.healthy_provider_count().await, 0);
    assert!(manager.get_odds(None, None).await.is_empty());

    let err = manager.fetch_odds(None).await.unwrap_err();
    assert!(matches!(
        err.downcast_ref::<OddsError>(),
        Some(OddsError::AllProvidersUnhealthy)
    ));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_failing_provider_does_not_hide_healthy_one() {
    let good = healthy_book(2.1, 1.8).await;
    let flaky = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sports"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"key": "soccer"}])))
        .mount(&flaky)
        .await;
    Mock::given(method("GET"))
        .and(path("/odds"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&flaky)
        .await;

    let manager = manager();
    manager
        .add_provider("good", TestUtils::api_key_provider("good", &good.uri()))
        .await;
    manager
        .add_provider("flaky", TestUtils::api_key_provider("flaky", &flaky.uri()))
        .await;
    manager.initialize().await;
    assert_eq!(manager.healthy_provider_count().await, 2);

    let quotes = manager.get_odds(Some("soccer"), None).await;
    assert_eq!(quotes.len(), 2);
    assert!(quotes.iter().all(|q| q.provider_id == "good"));

    assert!(!manager.is_provider_healthy("flaky").await);
    let flaky_status = manager
        .provider_statuses()
        .await
        .into_iter()
        .find(|h| h.id == "flaky")
        .unwrap();
    assert_eq!(flaky_status.error_count, 1);
    assert!(flaky_status.last_error.is_some());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_cross_provider_arbitrage_detected() {
    let alpha = healthy_book(2.5, 1.5).await;
    let beta = healthy_book(1.6, 2.5).await;

    let manager = manager();
    manager
        .add_provider("alpha", TestUtils::api_key_provider("alpha", &alpha.uri()))
        .await;
    manager
        .add_provider("beta", TestUtils::api_key_provider("beta", &beta.uri()))
        .await;

    let markets = manager.get_aggregated_odds(Some("soccer"), None).await;
    assert_eq!(markets.len(), 2);

    let home = markets.iter().find(|m| m.outcome == "home").unwrap();
    assert_eq!(home.best_odds, 2.5);
    assert_eq!(home.best_provider, "alpha");
    assert_eq!(home.quotes.len(), 2);

    let away = markets.iter().find(|m| m.outcome == "away").unwrap();
    assert_eq!(away.best_provider, "beta");

    let arbitrage = home.arbitrage.as_ref().unwrap();
    assert!((arbitrage.implied_probability_sum - 0.8).abs() < 1e-9);
    assert!((arbitrage.profit_percentage - 20.0).abs() < 1e-9);
    assert_eq!(arbitrage.legs.len(), 2);
    assert_eq!(away.arbitrage, home.arbitrage);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_no_arbitrage_when_book_is_overround() {
    let alpha = healthy_book(1.9, 1.9).await;
    let beta = healthy_book(1.95, 1.85).await;

    let manager = manager();
    manager
        .add_provider("alpha", TestUtils::api_key_provider("alpha", &alpha.uri()))
        .await;
    manager
        .add_provider("beta", TestUtils::api_key_provider("beta", &beta.uri()))
        .await;

    let markets = manager.get_aggregated_odds(None, None).await;
    assert_eq!(markets.len(), 2);
    assert!(markets.iter().all(|m| m.arbitrage.is_none()));

    manager.shutdown().await;
}

#[tokio::test]
async fn test_remove_provider() {
    let alpha = healthy_book(2.0, 1.9).await;

    let manager = manager();
    manager
        .add_provider("alpha", TestUtils::api_key_provider("alpha", &alpha.uri()))
        .await;
    manager.initialize().await;
    assert_eq!(manager.provider_count().await, 1);

    assert!(manager.remove_provider("alpha").await);
    assert!(!manager.remove_provider("alpha").await);
    assert!(!manager.remove_provider("unknown").await);
    assert_eq!(manager.provider_count().await, 0);
    assert!(manager.get_odds(None, None).await.is_empty());

    manager.shutdown().await;
}

#[tokio::test]
async fn test_provider_added_after_initialize_is_usable() {
    let alpha = healthy_book(2.0, 1.9).await;

    let manager = manager();
    manager.initialize().await;
    manager
        .add_provider("alpha", TestUtils::api_key_provider("alpha", &alpha.uri()))
        .await;

    assert!(manager.is_provider_healthy("alpha").await);
    assert_eq!(manager.get_odds(None, None).await.len(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_health_check_recovers_excluded_provider() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/sports"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([{"key": "soccer"}])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/odds"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/odds"))
        .respond_with(ResponseTemplate::new(200).set_body_json(TestUtils::two_way_odds("e1", 2.0, 1.9)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/health"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let manager = manager();
    manager
        .add_provider("book", TestUtils::api_key_provider("book", &server.uri()))
        .await;
    manager.initialize().await;

    assert!(manager.get_odds(None, None).await.is_empty());
    assert!(!manager.is_provider_healthy("book").await);

    assert!(manager.check_provider_health("book").await);
    assert!(!manager.check_provider_health("missing").await);

    let handle = &manager.provider_statuses().await[0];
    assert_eq!(handle.status, ProviderStatus::Active);
    assert_eq!(handle.error_count, 0);
    assert_eq!(manager.get_odds(None, None).await.len(), 2);

    manager.shutdown().await;
}

#[tokio::test]
async fn test_signed_provider_sends_signature_headers() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/status"))
        .and(header("X-API-KEY", "key-1"))
        .and(header_exists("X-SIGNATURE"))
        .and(header_exists("X-TIMESTAMP"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"success": true, "data": {"status": "ok"}})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/prices"))
        .and(query_param("sport", "tennis"))
        .and(header_exists("X-SIGNATURE"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "success": true,
            "data": [
                {"fixture_id": "f1", "sport": "tennis", "market": "match", "selection": "player_a", "decimal_odds": 1.7},
                {"fixture_id": "f1", "sport": "tennis", "market": "match", "selection": "player_b", "decimal_odds": 0.0}
            ]
        })))
        .mount(&server)
        .await;

    let mut config = ProviderConfig::new("signed", ProviderKind::Hmac, &server.uri());
    config.api_key = Some("key-1".to_string());
    config.secret_key = Some("secret".to_string());

    let manager = manager();
    manager
        .add_provider("signed", Arc::new(HmacProvider::new(config).unwrap()))
        .await;
    manager.initialize().await;
    assert!(manager.is_provider_healthy("signed").await);

    let quotes = manager.get_odds(Some("tennis"), None).await;
    assert_eq!(quotes.len(), 1);
    assert_eq!(quotes[0].outcome, "player_a");
    assert_eq!(quotes[0].provider_id, "signed");

    manager.shutdown().await;
}
