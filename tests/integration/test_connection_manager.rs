//! Connection manager fallback, failover and emit routing

use crate::{ScriptedTransport, TestUtils};
use odds_aggregator::{
    events::{EventBus, OddsUpdate},
    providers::Quote,
    transport::{ConnectionManager, ConnectionStatus, Transport, TransportEvent, TransportMethod},
    OddsError,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn manager_with(
    max_rounds: u32,
    socket: &Arc<ScriptedTransport>,
    stream: &Arc<ScriptedTransport>,
    polling: &Arc<ScriptedTransport>,
) -> (ConnectionManager, EventBus) {
    let events = EventBus::default();
    let manager = ConnectionManager::new(TestUtils::connection_config(max_rounds), events.clone());
    manager.register_transport(socket.clone());
    manager.register_transport(stream.clone());
    manager.register_transport(polling.clone());
    (manager, events)
}

#[tokio::test]
async fn test_socket_failure_falls_back_to_stream() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, false);
    let stream = ScriptedTransport::always(TransportMethod::Stream, true);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    let (manager, _events) = manager_with(3, &socket, &stream, &polling);

    manager.connect().await.unwrap();

    assert_eq!(manager.active_method(), TransportMethod::Stream);
    let state = manager.state();
    assert_eq!(state.method, TransportMethod::Stream);
    assert_eq!(state.status, ConnectionStatus::Connected);
    assert!(state.is_healthy);

    assert_eq!(socket.connect_calls(), 1);
    assert_eq!(stream.connect_calls(), 1);
    assert_eq!(polling.connect_calls(), 0);

    manager.disconnect().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_rounds_leave_error_state() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, false);
    let stream = ScriptedTransport::always(TransportMethod::Stream, false);
    let polling = ScriptedTransport::always(TransportMethod::Polling, false);
    let (manager, events) = manager_with(3, &socket, &stream, &polling);
    let mut statuses = events.subscribe_connection_status();

    let err = manager.connect().await.unwrap_err();
    match err.downcast_ref::<OddsError>() {
        Some(OddsError::ExhaustedRetries { attempts }) => assert_eq!(*attempts, 3),
        other => panic!("unexpected error {:?}", other),
    }

    let state = manager.state();
    assert_eq!(state.method, TransportMethod::None);
    assert_eq!(state.status, ConnectionStatus::Error);
    assert!(!state.is_healthy);

    for transport in [&socket, &stream, &polling] {
        assert_eq!(transport.connect_calls(), 3);
    }

    let mut last = None;
    while let Some(state) = statuses.try_recv() {
        last = Some(state);
    }
    assert_eq!(last.map(|s| s.status), Some(ConnectionStatus::Error));
}

#[tokio::test(start_paused = true)]
async fn test_later_round_recovers() {
    let socket = ScriptedTransport::new(TransportMethod::Socket, &[false, true]);
    let stream = ScriptedTransport::always(TransportMethod::Stream, false);
    let polling = ScriptedTransport::always(TransportMethod::Polling, false);
    let (manager, _events) = manager_with(3, &socket, &stream, &polling);

    manager.connect().await.unwrap();

    assert_eq!(manager.active_method(), TransportMethod::Socket);
    assert_eq!(socket.connect_calls(), 2);
    assert_eq!(polling.connect_calls(), 1);
}

#[tokio::test]
async fn test_emit_only_through_active_socket() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, false);
    let stream = ScriptedTransport::always(TransportMethod::Stream, true);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    let (manager, _events) = manager_with(1, &socket, &stream, &polling);

    assert!(!manager.emit("subscribe", json!({"sports": ["soccer"]})));

    manager.connect().await.unwrap();
    assert_eq!(manager.active_method(), TransportMethod::Stream);
    assert!(!manager.emit("subscribe", json!({"sports": ["soccer"]})));
    assert!(stream.emitted().is_empty());

    let socket = ScriptedTransport::always(TransportMethod::Socket, true);
    let (manager, _events) = manager_with(1, &socket, &stream, &polling);
    manager.connect().await.unwrap();
    assert!(manager.emit("subscribe", json!({"sports": ["soccer"]})));
    assert_eq!(socket.emitted()[0].0, "subscribe");
}

#[tokio::test]
async fn test_odds_updates_reach_event_bus() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, true);
    let stream = ScriptedTransport::always(TransportMethod::Stream, true);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    let (manager, events) = manager_with(1, &socket, &stream, &polling);
    let mut updates = events.subscribe_odds_updates();

    manager.connect().await.unwrap();

    let quote = Quote::new("book", "soccer", "e1", "h2h", "home", 2.05).unwrap();
    socket.push(TransportEvent::OddsUpdate(OddsUpdate::new(quote.clone(), Some(1.95))));

    let update = tokio::time::timeout(Duration::from_secs(1), updates.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.quote, quote);
    assert_eq!(update.previous_odds, Some(1.95));

    manager.disconnect().await.unwrap();
}

async fn wait_for_method(manager: &ConnectionManager, method: TransportMethod) -> bool {
    TestUtils::wait_for_condition(
        || {
            let manager = manager.clone();
            async move { manager.active_method() == method }
        },
        2_000,
        10,
    )
    .await
}

#[tokio::test]
async fn test_transport_drop_moves_to_next_method() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, true);
    let stream = ScriptedTransport::always(TransportMethod::Stream, true);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    let (manager, _events) = manager_with(3, &socket, &stream, &polling);

    manager.connect().await.unwrap();
    assert_eq!(manager.active_method(), TransportMethod::Socket);

    socket.push(TransportEvent::Disconnected {
        reason: "closed by server".to_string(),
    });

    assert!(wait_for_method(&manager, TransportMethod::Stream).await);
    assert_eq!(socket.connect_calls(), 1);
    assert_eq!(stream.connect_calls(), 1);
    assert_eq!(polling.connect_calls(), 0);

    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_unhealthy_check_moves_to_next_method() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, true);
    let stream = ScriptedTransport::always(TransportMethod::Stream, true);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    let (manager, events) = manager_with(3, &socket, &stream, &polling);
    let mut reports = events.subscribe_health_checks();

    manager.connect().await.unwrap();
    assert!(manager.check_health());

    socket.set_healthy(false);
    assert!(!manager.check_health());

    let first = reports.try_recv().unwrap();
    assert!(first.healthy);
    let second = reports.try_recv().unwrap();
    assert!(!second.healthy);
    assert_eq!(second.method, TransportMethod::Socket);

    assert!(wait_for_method(&manager, TransportMethod::Stream).await);
    assert_eq!(socket.connect_calls(), 1);

    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_stale_stream_hands_over_to_polling() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, false);
    let stream = ScriptedTransport::always(TransportMethod::Stream, true);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    let (manager, _events) = manager_with(3, &socket, &stream, &polling);

    manager.connect().await.unwrap();
    assert_eq!(manager.active_method(), TransportMethod::Stream);

    stream.set_healthy(false);
    assert!(!manager.check_health());

    assert!(wait_for_method(&manager, TransportMethod::Polling).await);
    assert_eq!(socket.connect_calls(), 1);
    assert_eq!(stream.connect_calls(), 1);
    assert_eq!(polling.connect_calls(), 1);

    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_drop_on_last_method_restarts_from_preferred() {
    let socket = ScriptedTransport::new(TransportMethod::Socket, &[false, true]);
    let stream = ScriptedTransport::always(TransportMethod::Stream, false);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    let (manager, _events) = manager_with(3, &socket, &stream, &polling);

    manager.connect().await.unwrap();
    assert_eq!(manager.active_method(), TransportMethod::Polling);

    polling.push(TransportEvent::Disconnected {
        reason: "poll loop gave up".to_string(),
    });

    assert!(wait_for_method(&manager, TransportMethod::Socket).await);
    assert_eq!(socket.connect_calls(), 2);
    assert_eq!(polling.connect_calls(), 1);

    manager.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_disconnect_during_connect_wins() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, true);
    let stream = ScriptedTransport::always(TransportMethod::Stream, true);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    socket.set_connect_delay(Duration::from_millis(100));
    let (manager, _events) = manager_with(3, &socket, &stream, &polling);

    let connecting = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.connect().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.disconnect().await.unwrap();

    assert!(connecting.await.unwrap().is_err());

    let state = manager.state();
    assert_eq!(manager.active_method(), TransportMethod::None);
    assert_eq!(state.method, TransportMethod::None);
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(socket.status(), ConnectionStatus::Disconnected);
    assert_eq!(stream.connect_calls(), 0);
}

#[tokio::test]
async fn test_disconnect_stops_reconnects() {
    let socket = ScriptedTransport::always(TransportMethod::Socket, true);
    let stream = ScriptedTransport::always(TransportMethod::Stream, true);
    let polling = ScriptedTransport::always(TransportMethod::Polling, true);
    let (manager, _events) = manager_with(3, &socket, &stream, &polling);

    manager.connect().await.unwrap();
    manager.disconnect().await.unwrap();

    let state = manager.state();
    assert_eq!(state.method, TransportMethod::None);
    assert_eq!(state.status, ConnectionStatus::Disconnected);
    assert_eq!(socket.status(), ConnectionStatus::Disconnected);

    socket.push(TransportEvent::Disconnected {
        reason: "late close".to_string(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(socket.connect_calls(), 1);
    assert_eq!(manager.active_method(), TransportMethod::None);
    assert!(!manager.check_health());
}
