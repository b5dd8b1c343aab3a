//! Connection manager behaviour against a scripted transport.

mod common;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentstream_lib::bus::EventKind;
use agentstream_lib::connection::{
    ConnectionManager, ConnectionState, ConnectionStatus, StartOutcome,
};
use agentstream_lib::events::EventPayload;
use agentstream_lib::store::StoreHandle;
use agentstream_lib::transport::{ReadyState, StreamRequest, TransportError};
use agentstream_lib::{ConfigError, StreamConfig};
use common::MockTransport;
use pretty_assertions::assert_eq;
use tokio::sync::watch;
use tokio::time::{self, Instant};

fn test_config() -> StreamConfig {
    StreamConfig {
        max_reconnect_attempts: 3,
        reconnect_jitter: 0.0,
        ..StreamConfig::new("http://agent.test/api/stream")
    }
}

fn manager_with(transport: Arc<MockTransport>) -> ConnectionManager {
    ConnectionManager::new(test_config(), transport, StoreHandle::default()).unwrap()
}

/// Every state notification the router delivers, in order.
fn record_states(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionState>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    manager.on_state_change(move |state| {
        sink.lock().unwrap().push(state.clone());
        Ok(())
    });
    seen
}

fn statuses(seen: &Arc<Mutex<Vec<ConnectionState>>>) -> Vec<ConnectionStatus> {
    seen.lock().unwrap().iter().map(|s| s.status).collect()
}

async fn wait_for(
    rx: &mut watch::Receiver<ConnectionState>,
    status: ConnectionStatus,
) -> ConnectionState {
    let waited = time::timeout(Duration::from_secs(3600), async {
        loop {
            {
                let state = rx.borrow_and_update();
                if state.status == status {
                    return state.clone();
                }
            }
            rx.changed().await.expect("manager dropped");
        }
    })
    .await;
    waited.unwrap_or_else(|_| panic!("connection never reached {status}"))
}

fn request() -> StreamRequest {
    StreamRequest::new("summarize the quarterly report").with_session_id("session-1")
}

#[tokio::test]
async fn stop_is_idempotent() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let seen = record_states(&manager);
    let mut rx = manager.watch_state();

    // Stopping a manager that never started notifies nobody.
    manager.stop();
    assert!(seen.lock().unwrap().is_empty());

    manager.start(&request()).unwrap();
    server.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;

    manager.stop();
    manager.stop();
    assert_eq!(
        statuses(&seen),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ]
    );
    assert_eq!(manager.ready_state(), ReadyState::Closed);

    // Frames sent after stop reach neither handlers nor the store.
    server.frame("observation", r#"{"content":"late"}"#);
    tokio::task::yield_now().await;
    assert!(manager.store().read().events().is_empty());
    assert_eq!(statuses(&seen).len(), 3);
}

#[tokio::test]
async fn start_while_active_is_a_no_op() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();

    assert_eq!(manager.start(&request()).unwrap(), StartOutcome::Started);
    assert_eq!(
        manager.start(&request()).unwrap(),
        StartOutcome::AlreadyActive
    );
    server.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;
    assert_eq!(
        manager.start(&request()).unwrap(),
        StartOutcome::AlreadyActive
    );
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(manager.ready_state(), ReadyState::Open);
    manager.stop();
}

#[tokio::test]
async fn request_parameters_reach_the_url() {
    let transport = MockTransport::new();
    let _server = transport.push_stream();
    let config = StreamConfig {
        default_model: Some("gpt-4o".to_string()),
        ..test_config()
    };
    let manager =
        ConnectionManager::new(config, transport.clone(), StoreHandle::default()).unwrap();

    manager
        .start(&request().with_file_ids(["f1", "f2"]))
        .unwrap();
    for _ in 0..10 {
        if transport.connect_count() > 0 {
            break;
        }
        tokio::task::yield_now().await;
    }
    assert_eq!(
        transport.urls(),
        vec![
            "http://agent.test/api/stream?prompt=summarize%20the%20quarterly%20report\
             &session_id=session-1&model=gpt-4o&file_ids=f1%2Cf2"
                .to_string()
        ]
    );
    manager.stop();
}

#[tokio::test]
async fn unusable_config_is_rejected_before_any_session() {
    let transport = MockTransport::new();
    let bad_url = ConnectionManager::new(
        StreamConfig::new("agent.test/stream"),
        transport.clone(),
        StoreHandle::default(),
    );
    assert!(matches!(bad_url, Err(ConfigError::Invalid(_))));

    let zero_heartbeat = StreamConfig {
        heartbeat_interval_ms: 0,
        ..test_config()
    };
    assert!(matches!(
        ConnectionManager::new(zero_heartbeat, transport.clone(), StoreHandle::default()),
        Err(ConfigError::Invalid(_))
    ));
    assert_eq!(transport.connect_count(), 0);
}

#[tokio::test]
async fn clean_round_trip() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let seen = record_states(&manager);
    let mut rx = manager.watch_state();

    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&kinds);
    manager.on_any(move |event| {
        sink.lock().unwrap().push(event.kind());
        Ok(())
    });
    let completions = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&completions);
    manager.on_complete(move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    manager.start(&request()).unwrap();
    server.open();
    server.frame(
        "planning",
        r#"{"steps":[{"id":1,"step":"load data"}],"timestamp":"2024-05-01T10:00:00Z"}"#,
    );
    server.frame(
        "tool_call",
        r#"{"tool_name":"read_csv","parameters":{"path":"q3.csv"},"timestamp":"2024-05-01T10:00:01Z"}"#,
    );
    server.frame("complete", r#"{"total_steps":1}"#);

    wait_for(&mut rx, ConnectionStatus::Disconnected).await;

    let store = manager.store().read();
    let stored: Vec<EventKind> = store.events().iter().map(|e| e.kind()).collect();
    assert_eq!(stored, vec![EventKind::Planning, EventKind::ToolCall]);
    drop(store);

    assert_eq!(
        *kinds.lock().unwrap(),
        vec![EventKind::Planning, EventKind::ToolCall, EventKind::Complete]
    );
    assert_eq!(*completions.lock().unwrap(), 1);
    assert_eq!(
        statuses(&seen),
        vec![
            ConnectionStatus::Connecting,
            ConnectionStatus::Connected,
            ConnectionStatus::Disconnected,
        ]
    );
    assert_eq!(manager.connection_state().reconnect_attempts, 0);
}

#[tokio::test]
async fn final_result_completes_the_assistant_placeholder() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();
    let placeholder = {
        let mut store = manager.store().write();
        store.append_user_message("what is 6 x 7?");
        store.begin_assistant_message()
    };

    manager.start(&request()).unwrap();
    server.open();
    server.frame("final_result", r#"{"content":"42"}"#);
    server.frame("complete", "{}");
    wait_for(&mut rx, ConnectionStatus::Disconnected).await;

    let store = manager.store().read();
    assert_eq!(store.messages().len(), 2);
    let answer = store.messages().last().unwrap();
    assert_eq!(answer.id, placeholder);
    assert_eq!(answer.content, "42");
    assert!(!answer.streaming);
}

#[tokio::test]
async fn malformed_frame_is_dropped_and_stream_continues() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let seen = record_states(&manager);
    let (_, mut plans) = manager.router().subscribe_channel(EventKind::Planning);

    manager.start(&request()).unwrap();
    server.open();
    server.frame(
        "planning",
        r#"{"steps":[{"id":1,"step":"load data"}],"timestamp":"2024-05-01T10:00:00Z"}"#,
    );
    server.frame("planning", "<<garbage frame>>");
    server.frame("message", r#"{"event_type": "planning", broken"#);
    server.frame(
        "planning",
        r#"{"steps":[{"id":2,"step":"plot"}],"timestamp":"2024-05-01T10:00:03Z"}"#,
    );
    plans.recv().await.unwrap();
    plans.recv().await.unwrap();
    time::sleep(Duration::from_millis(300)).await;

    let stored: Vec<EventKind> = manager
        .store()
        .read()
        .events()
        .iter()
        .map(|e| e.kind())
        .collect();
    assert_eq!(stored, vec![EventKind::Planning, EventKind::Planning]);
    assert_eq!(
        manager.connection_state().status,
        ConnectionStatus::Connected
    );
    assert!(!statuses(&seen).contains(&ConnectionStatus::Error));
    assert_eq!(transport.connect_count(), 1);
    assert!(plans.try_recv().is_err());
    manager.stop();
}

#[tokio::test]
async fn transient_transport_errors_are_ignored() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();
    let (_, mut observations) = manager.router().subscribe_channel(EventKind::Observation);

    manager.start(&request()).unwrap();
    server.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;
    server.transient_error("network blip");
    server.frame("observation", r#"{"content":"still here"}"#);
    observations.recv().await.unwrap();

    assert_eq!(
        manager.connection_state().status,
        ConnectionStatus::Connected
    );
    assert_eq!(transport.connect_count(), 1);
    manager.stop();
}

#[tokio::test]
async fn handler_failures_do_not_reach_the_connection() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();

    manager.on_any(|_| Err("handler rejected event".into()));
    manager.on(EventKind::Observation, |_| panic!("handler bug"));
    let delivered = Arc::new(Mutex::new(0));
    let counter = Arc::clone(&delivered);
    manager.on_any(move |_| {
        *counter.lock().unwrap() += 1;
        Ok(())
    });

    manager.start(&request()).unwrap();
    server.open();
    server.frame("observation", r#"{"content":"a"}"#);
    server.frame("complete", "{}");
    wait_for(&mut rx, ConnectionStatus::Disconnected).await;

    assert_eq!(*delivered.lock().unwrap(), 2);
    assert_eq!(manager.store().read().events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn recoverable_error_reconnects_after_retry_after() {
    let transport = MockTransport::new();
    let first = transport.push_stream();
    let second = transport.push_stream();
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();

    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    manager.on_error(move |event| {
        if let EventPayload::Error(err) = event.payload() {
            sink.lock().unwrap().push(err.clone());
        }
        Ok(())
    });

    manager.start(&request()).unwrap();
    first.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;

    let sent_at = Instant::now();
    first.frame(
        "error",
        r#"{"error":"rate limited","recoverable":true,"retry_after":2}"#,
    );
    let reconnecting = wait_for(&mut rx, ConnectionStatus::Reconnecting).await;
    assert_eq!(reconnecting.reconnect_attempts, 0);
    assert_eq!(reconnecting.error_message.as_deref(), Some("rate limited"));

    second.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;
    let waited = sent_at.elapsed();
    assert!(waited >= Duration::from_secs(2), "reconnected after {waited:?}");
    assert!(waited < Duration::from_millis(2100), "reconnected after {waited:?}");

    assert_eq!(transport.connect_count(), 2);
    let errors = errors.lock().unwrap();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].recoverable);
    assert_eq!(manager.store().read().events().len(), 1);
    drop(errors);
    manager.stop();
}

#[tokio::test]
async fn recoverable_error_without_retry_after_keeps_the_channel() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();
    let (_, mut errors) = manager.router().subscribe_channel(EventKind::Error);

    manager.start(&request()).unwrap();
    server.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;
    server.frame("error", r#"{"error":"tool timed out","recoverable":true}"#);
    errors.recv().await.unwrap();

    assert_eq!(
        manager.connection_state().status,
        ConnectionStatus::Connected
    );
    assert_eq!(transport.connect_count(), 1);
    manager.stop();
}

#[tokio::test]
async fn fatal_server_error_stops_without_reconnect() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();

    manager.start(&request()).unwrap();
    server.open();
    server.frame("error", r#"{"error":"model crashed","recoverable":false}"#);
    let state = wait_for(&mut rx, ConnectionStatus::Error).await;

    assert_eq!(state.error_message.as_deref(), Some("model crashed"));
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(manager.store().read().events().len(), 1);

    // `error` is terminal until the next start.
    let next = transport.push_stream();
    assert_eq!(manager.start(&request()).unwrap(), StartOutcome::Started);
    next.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;
    manager.stop();
}

#[tokio::test(start_paused = true)]
async fn heartbeat_staleness_triggers_reconnect() {
    let transport = MockTransport::new();
    let first = transport.push_stream();
    let second = transport.push_stream();
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();
    let (_, mut heartbeats) = manager.router().subscribe_channel(EventKind::Heartbeat);

    manager.start(&request()).unwrap();
    first.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;

    // Heartbeat frames keep an otherwise quiet channel alive.
    for _ in 0..4 {
        time::advance(Duration::from_secs(90)).await;
        first.frame("heartbeat", r#"{"event_type":"heartbeat"}"#);
        heartbeats.recv().await.unwrap();
    }
    assert_eq!(
        manager.connection_state().status,
        ConnectionStatus::Connected
    );

    let last_frame = Instant::now();
    let reconnecting = wait_for(&mut rx, ConnectionStatus::Reconnecting).await;
    assert!(last_frame.elapsed() > Duration::from_secs(120));
    assert_eq!(reconnecting.reconnect_attempts, 1);

    second.open();
    let connected = wait_for(&mut rx, ConnectionStatus::Connected).await;
    assert_eq!(connected.reconnect_attempts, 0);
    assert_eq!(transport.connect_count(), 2);
    assert!(manager.store().read().events().is_empty());
    manager.stop();
}

#[tokio::test(start_paused = true)]
async fn keep_alives_hold_a_quiet_channel_open() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    let manager = manager_with(transport.clone());
    let seen = record_states(&manager);
    let mut rx = manager.watch_state();

    manager.start(&request()).unwrap();
    server.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;

    // A long tool step: only `: ping` comments for 150s.
    for _ in 0..10 {
        time::advance(Duration::from_secs(15)).await;
        server.keep_alive();
        tokio::task::yield_now().await;
    }

    assert_eq!(
        manager.connection_state().status,
        ConnectionStatus::Connected
    );
    assert!(!statuses(&seen).contains(&ConnectionStatus::Reconnecting));
    assert_eq!(transport.connect_count(), 1);
    assert!(manager.store().read().events().is_empty());
    manager.stop();
}

#[tokio::test(start_paused = true)]
async fn retry_budget_exhaustion_ends_in_error() {
    let transport = MockTransport::new();
    let server = transport.push_stream();
    for _ in 0..3 {
        transport.push_failure(TransportError::Connection("connection refused".into()));
    }
    let manager = manager_with(transport.clone());
    let seen = record_states(&manager);
    let mut rx = manager.watch_state();
    let (_, mut errors) = manager.router().subscribe_channel(EventKind::Error);

    manager.start(&request()).unwrap();
    server.open();
    wait_for(&mut rx, ConnectionStatus::Connected).await;
    let lost_at = Instant::now();
    server.close("connection reset");

    let state = wait_for(&mut rx, ConnectionStatus::Error).await;
    assert_eq!(state.reconnect_attempts, 3);
    assert_eq!(transport.connect_count(), 4);
    // Backoff without jitter: 1s + 2s + 4s.
    let waited = lost_at.elapsed();
    assert!(
        waited >= Duration::from_secs(7) && waited < Duration::from_millis(7100),
        "gave up after {waited:?}"
    );

    let synthetic = errors.recv().await.unwrap();
    match synthetic.payload() {
        EventPayload::Error(err) => assert!(!err.recoverable),
        other => panic!("expected error, got {other:?}"),
    }
    assert!(errors.try_recv().is_err());

    let attempts: Vec<u32> = seen
        .lock()
        .unwrap()
        .iter()
        .filter(|s| s.status == ConnectionStatus::Reconnecting)
        .map(|s| s.reconnect_attempts)
        .collect();
    assert_eq!(attempts, vec![1, 2, 3]);

    // No further reconnects are scheduled.
    time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.connect_count(), 4);
    assert_eq!(manager.store().read().events().len(), 1);
}

#[tokio::test]
async fn non_retryable_connect_error_fails_immediately() {
    let transport = MockTransport::new();
    transport.push_failure(TransportError::Http {
        status: 404,
        message: "no such stream".into(),
    });
    let manager = manager_with(transport.clone());
    let mut rx = manager.watch_state();

    manager.start(&request()).unwrap();
    let state = wait_for(&mut rx, ConnectionStatus::Error).await;

    assert_eq!(transport.connect_count(), 1);
    assert!(state.error_message.unwrap().contains("404"));
    assert_eq!(manager.store().read().events().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_cancels_the_reconnect() {
    let transport = MockTransport::new();
    transport.push_failure(TransportError::Connection("connection refused".into()));
    let manager = manager_with(transport.clone());
    let seen = record_states(&manager);
    let mut rx = manager.watch_state();

    manager.start(&request()).unwrap();
    wait_for(&mut rx, ConnectionStatus::Reconnecting).await;
    manager.stop();
    let notified = statuses(&seen).len();

    time::sleep(Duration::from_secs(60)).await;
    assert_eq!(transport.connect_count(), 1);
    assert_eq!(statuses(&seen).len(), notified);
    assert_eq!(
        manager.connection_state().status,
        ConnectionStatus::Disconnected
    );
}
