//! Websocket transport against a local server

use crate::TestUtils;
use futures_util::{SinkExt, StreamExt};
use odds_aggregator::{
    config::SocketConfig,
    events::EventBus,
    providers::Quote,
    transport::{ConnectionManager, ConnectionStatus, SocketTransport, Transport, TransportEvent, TransportMethod},
    OddsError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

#[derive(Clone, Copy)]
enum Behavior {
    /// Answer auth and pings, record everything received
    Serve,
    /// Answer auth, ignore pings
    Silent,
    /// Answer auth, push two odds updates, then close
    PushThenClose,
}

struct TestServer {
    url: String,
    received: mpsc::UnboundedReceiver<Value>,
}

async fn spawn_server(token: Option<&'static str>, behavior: Behavior) -> TestServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let (tx, received) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            tokio::spawn(async move {
                let Ok(ws) = accept_async(stream).await else {
                    return;
                };
                let (mut write, mut read) = ws.split();

                while let Some(Ok(message)) = read.next().await {
                    let Message::Text(text) = message else {
                        continue;
                    };
                    let frame: Value = serde_json::from_str(&text).unwrap();
                    let kind = frame["type"].as_str().unwrap_or_default().to_string();
                    let _ = tx.send(frame.clone());

                    match kind.as_str() {
                        "auth" => {
                            let reply = match token {
                                Some(expected) if frame["token"] == expected => json!({"type": "auth_success"}),
                                _ => json!({"type": "auth_error", "message": "bad token"}),
                            };
                            let _ = write.send(Message::Text(reply.to_string())).await;

                            if let Behavior::PushThenClose = behavior {
                                for odds in [2.0, 2.2] {
                                    let quote = Quote::new("book", "soccer", "e1", "h2h", "home", odds).unwrap();
                                    let update = json!({"type": "odds_update", "data": quote});
                                    let _ = write.send(Message::Text(update.to_string())).await;
                                }
                                let _ = write.send(Message::Close(None)).await;
                                return;
                            }
                        }
                        "ping" if matches!(behavior, Behavior::Serve) => {
                            let pong = json!({"type": "pong", "data": {"id": frame["data"]["id"]}});
                            let _ = write.send(Message::Text(pong.to_string())).await;
                        }
                        _ => {}
                    }
                }
            });
        }
    });

    TestServer { url, received }
}

fn socket_config(url: &str, token: Option<&str>, cap: u32) -> SocketConfig {
    SocketConfig {
        url: url.to_string(),
        auth_token: token.map(str::to_string),
        heartbeat_interval_secs: 3_600,
        ping_timeout_secs: 1,
        max_messages_per_minute: cap,
    }
}

fn transport(url: &str, token: Option<&str>, cap: u32) -> SocketTransport {
    SocketTransport::new(socket_config(url, token, cap), Duration::from_secs(2))
}

async fn next_frame(server: &mut TestServer) -> Value {
    tokio::time::timeout(Duration::from_secs(2), server.received.recv())
        .await
        .unwrap()
        .unwrap()
}

#[tokio::test]
async fn test_auth_handshake_then_emit() {
    let mut server = spawn_server(Some("secret"), Behavior::Serve).await;
    let socket = transport(&server.url, Some("secret"), 60);

    socket.connect().await.unwrap();
    assert_eq!(socket.status(), ConnectionStatus::Connected);
    assert!(socket.is_authenticated());
    assert!(socket.is_healthy());

    let auth = next_frame(&mut server).await;
    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["token"], "secret");

    assert!(socket.emit("subscribe", json!({"sports": ["soccer"]})));
    let subscribe = next_frame(&mut server).await;
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(subscribe["data"]["sports"][0], "soccer");
    assert_eq!(socket.messages_sent(), 1);

    socket.disconnect().await.unwrap();
    assert!(!socket.is_authenticated());
    assert!(!socket.emit("subscribe", json!({"sports": ["soccer"]})));
}

#[tokio::test]
async fn test_auth_rejected() {
    let server = spawn_server(Some("secret"), Behavior::Serve).await;
    let socket = transport(&server.url, Some("wrong"), 60);

    let err = socket.connect().await.unwrap_err();
    match err.downcast_ref::<OddsError>() {
        Some(OddsError::Authentication(reason)) => assert_eq!(reason, "bad token"),
        other => panic!("unexpected error {:?}", other),
    }
    assert_eq!(socket.status(), ConnectionStatus::Error);
    assert!(!socket.is_authenticated());
    assert!(!socket.emit("subscribe", json!({"sports": ["soccer"]})));
}

#[tokio::test]
async fn test_invalid_payload_not_sent() {
    let mut server = spawn_server(None, Behavior::Serve).await;
    let socket = transport(&server.url, None, 60);
    socket.connect().await.unwrap();

    assert!(!socket.emit("odds_update", json!({"provider": "book", "odds": 2.0})));
    assert!(!socket.emit("subscribe", json!({"sports": []})));
    assert!(socket.emit("heartbeat", json!({"timestamp": 1})));

    let frame = next_frame(&mut server).await;
    assert_eq!(frame["type"], "heartbeat");
    assert_eq!(socket.messages_sent(), 1);

    socket.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_outbound_rate_cap() {
    let server = spawn_server(None, Behavior::Serve).await;
    let socket = transport(&server.url, None, 2);
    socket.connect().await.unwrap();

    let payload = json!({"events": ["e1"]});
    assert!(socket.emit("subscribe", payload.clone()));
    assert!(socket.emit("subscribe", payload.clone()));
    assert!(!socket.emit("subscribe", payload));
    assert_eq!(socket.remaining_messages(), Some(0));
    assert_eq!(socket.messages_sent(), 2);

    socket.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_ping_measures_latency() {
    let server = spawn_server(None, Behavior::Serve).await;
    let socket = transport(&server.url, None, 60);
    socket.connect().await.unwrap();
    assert!(socket.latency().is_none());

    let round_trip = socket.ping().await.unwrap();
    assert!(round_trip < Duration::from_secs(1));
    assert!(socket.latency().is_some());

    socket.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_ping_times_out_without_pong() {
    let server = spawn_server(None, Behavior::Silent).await;
    let socket = transport(&server.url, None, 60);
    socket.connect().await.unwrap();

    let err = socket.ping().await.unwrap_err();
    assert!(matches!(err.downcast_ref::<OddsError>(), Some(OddsError::Timeout(_))));
    assert!(socket.latency().is_none());

    socket.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_server_close_reports_disconnect() {
    let server = spawn_server(Some("secret"), Behavior::PushThenClose).await;
    let socket = transport(&server.url, Some("secret"), 60);
    let mut events = socket.subscribe();

    socket.connect().await.unwrap();

    let mut prices = Vec::new();
    let reason = loop {
        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            TransportEvent::OddsUpdate(update) => prices.push((update.quote.odds, update.previous_odds)),
            TransportEvent::Disconnected { reason } => break reason,
            _ => {}
        }
    };

    assert_eq!(prices, vec![(2.0, None), (2.2, Some(2.0))]);
    assert_eq!(reason, "closed by server");
    assert_eq!(socket.status(), ConnectionStatus::Disconnected);
    assert!(!socket.is_healthy());
}

#[tokio::test]
async fn test_heartbeat_reports_latency_to_manager() {
    let mut server = spawn_server(Some("secret"), Behavior::Serve).await;
    let config = SocketConfig {
        heartbeat_interval_secs: 1,
        ..socket_config(&server.url, Some("secret"), 60)
    };
    let manager = ConnectionManager::new(TestUtils::connection_config(1), EventBus::default());
    manager.register_transport(Arc::new(SocketTransport::new(config, Duration::from_secs(2))));

    manager.connect().await.unwrap();
    assert_eq!(manager.active_method(), TransportMethod::Socket);
    assert!(manager.state().latency_ms.is_none());

    let measured = TestUtils::wait_for_condition(
        || {
            let manager = manager.clone();
            async move { manager.state().latency_ms.is_some() }
        },
        3_000,
        20,
    )
    .await;
    assert!(measured);

    let mut kinds = Vec::new();
    while let Ok(frame) = server.received.try_recv() {
        kinds.push(frame["type"].as_str().unwrap_or_default().to_string());
    }
    assert!(kinds.iter().any(|kind| kind == "heartbeat"));
    assert!(kinds.iter().any(|kind| kind == "ping"));

    manager.disconnect().await.unwrap();
}
