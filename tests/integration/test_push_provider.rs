//! Push provider feed loss and recovery

use crate::TestUtils;
use futures_util::{SinkExt, StreamExt};
use odds_aggregator::{
    config::ProviderConfig,
    providers::{ProviderAdapter, ProviderKind, SocketPushProvider},
};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// Feed that pushes one quote per connection and hangs up on the first one
async fn spawn_feed() -> (String, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let connections = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();

                // Wait for the subscribe frame
                let _ = read.next().await;

                let price = if index == 0 { 2.0 } else { 2.4 };
                let odds = json!({
                    "type": "odds",
                    "data": [{"event_id": "e1", "sport": "soccer", "market": "h2h", "outcome": "home", "price": price}]
                });
                let _ = write.send(Message::Text(odds.to_string())).await;

                if index == 0 {
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
                while let Some(Ok(_)) = read.next().await {}
            });
        }
    });

    (url, connections)
}

#[tokio::test]
async fn test_health_check_reopens_dropped_feed() {
    let (url, connections) = spawn_feed().await;
    let provider = Arc::new(SocketPushProvider::new(ProviderConfig::new("push", ProviderKind::SocketPush, &url)).unwrap());

    provider.initialize().await.unwrap();

    let dropped = TestUtils::wait_for_condition(
        || {
            let provider = Arc::clone(&provider);
            async move { !provider.is_connected() && provider.cached_quotes() == 1 }
        },
        2_000,
        10,
    )
    .await;
    assert!(dropped);
    assert!(provider.get_odds(None, None).await.is_err());

    assert!(provider.check_health().await);
    assert!(provider.is_connected());
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    let refreshed = TestUtils::wait_for_condition(
        || {
            let provider = Arc::clone(&provider);
            async move {
                provider
                    .get_odds(Some("soccer"), None)
                    .await
                    .map_or(false, |quotes| quotes.len() == 1 && quotes[0].odds == 2.4)
            }
        },
        2_000,
        10,
    )
    .await;
    assert!(refreshed);
}
