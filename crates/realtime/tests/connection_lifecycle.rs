//! Connection state machine, reconnection and heartbeat behaviour
#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::time::Duration;

use tokio::time::Instant;

use common::{identity, Behavior, Harness};
use plexmcp_realtime::{
    ConnectionEvent, ConnectionState, Envelope, Identity, RealtimeError, StatusReason,
    TransportCommand,
};
use plexmcp_shared::{SubjectRole, UserId};

fn gaps(times: &[Instant]) -> Vec<u64> {
    times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_backoff_delays_then_exhaustion_then_manual_reconnect() {
    let mut h = Harness::new();
    h.connector.script([Behavior::Refuse; 6]);

    h.client.init(identity()).await.unwrap();
    let (_, event) = h
        .wait_for(|e| matches!(e, ConnectionEvent::RetriesExhausted { .. }))
        .await;
    assert!(matches!(event, ConnectionEvent::RetriesExhausted { attempts: 5 }));

    // Initial attempt plus five automatic retries
    assert_eq!(h.connector.attempt_count(), 6);
    assert_eq!(
        gaps(&h.connector.attempt_times()),
        vec![1000, 2000, 4000, 8000, 16000]
    );

    // No sixth automatic retry, however long we wait
    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempt_count(), 6);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert_eq!(h.client.reconnect_attempt(), 5);

    let requested_at = Instant::now();
    h.client.reconnect();
    let _server = h.next_server().await;
    h.wait_for_state(ConnectionState::Open).await;

    assert_eq!(h.connector.attempt_count(), 7);
    let last_attempt = *h.connector.attempt_times().last().unwrap();
    assert_eq!(last_attempt - requested_at, Duration::from_millis(500));
    assert_eq!(h.client.reconnect_attempt(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_scheduled_events_report_backoff() {
    let mut h = Harness::new();
    h.connector.script([Behavior::Refuse; 3]);

    h.client.init(identity()).await.unwrap();
    let _server = h.next_server().await;

    let scheduled: Vec<(u32, Duration)> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            ConnectionEvent::ReconnectScheduled { attempt, delay } => Some((attempt, delay)),
            _ => None,
        })
        .collect();
    assert_eq!(
        scheduled,
        vec![
            (1, Duration::from_millis(1000)),
            (2, Duration::from_millis(2000)),
            (3, Duration::from_millis(4000)),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_successful_open_resets_backoff() {
    let mut h = Harness::new();
    h.connector.script([Behavior::Refuse, Behavior::Accept, Behavior::Refuse]);

    h.client.init(identity()).await.unwrap();
    let server = h.next_server().await;
    h.wait_for_state(ConnectionState::Open).await;
    assert_eq!(h.client.reconnect_attempt(), 0);

    // Lose the connection; the next retry starts from the base delay again
    server.close(1006);
    let (_, event) = h
        .wait_for(|e| matches!(e, ConnectionEvent::ReconnectScheduled { .. }))
        .await;
    match event {
        ConnectionEvent::ReconnectScheduled { attempt, delay } => {
            assert_eq!(attempt, 1);
            assert_eq!(delay, Duration::from_millis(1000));
        }
        other => panic!("Expected ReconnectScheduled, got {:?}", other),
    }

    // Third attempt (refused) is followed by a second-level backoff
    let (_, event) = h
        .wait_for(|e| matches!(e, ConnectionEvent::ReconnectScheduled { .. }))
        .await;
    assert!(matches!(
        event,
        ConnectionEvent::ReconnectScheduled { attempt: 2, delay } if delay == Duration::from_millis(2000)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_open_announces_identity_and_notifies_once() {
    let mut h = Harness::new();
    let mut server = h.open().await;

    let url = h.connector.last_url().unwrap();
    let query: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    assert_eq!(query[0], ("subjectId".to_string(), common::SUBJECT_ID.to_string()));
    assert_eq!(query[1], ("subjectRole".to_string(), "user".to_string()));
    assert_eq!(query[2].0, "t");

    assert_eq!(server.drain_kinds(), vec!["connection_init"]);
    assert_eq!(h.client.state(), ConnectionState::Open);
}

#[tokio::test(start_paused = true)]
async fn test_status_changes_emit_one_event_per_transition() {
    let mut h = Harness::new();
    let _server = h.open().await;
    h.client.disconnect().await;

    let transitions: Vec<(ConnectionState, bool, StatusReason)> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            ConnectionEvent::StatusChanged {
                state,
                connected,
                reason,
            } => Some((state, connected, reason)),
            _ => None,
        })
        .collect();

    // Connecting and Open were consumed by open()
    assert_eq!(
        transitions,
        vec![
            (ConnectionState::Closing, false, StatusReason::Closing),
            (ConnectionState::Disconnected, false, StatusReason::Disconnected),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_init_while_open_is_a_no_op() {
    let mut h = Harness::new();
    let _server = h.open().await;

    let state = h.client.init(identity()).await.unwrap();
    assert_eq!(state, ConnectionState::Open);
    assert_eq!(h.connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_init_with_different_identity_is_rejected() {
    let h = Harness::new();
    h.client.init(identity()).await.unwrap();

    let other = Identity::new(UserId::new(), SubjectRole::Admin);
    assert!(matches!(
        h.client.init(other).await,
        Err(RealtimeError::IdentityMismatch)
    ));
    assert_eq!(h.client.identity(), Some(identity()));
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_then_init_opens_exactly_once() {
    let mut h = Harness::new();
    let mut first = h.open().await;

    h.client.disconnect().await;
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(first.drain().contains(&TransportCommand::Close(1000)));

    h.client.init(identity()).await.unwrap();
    let _second = h.next_server().await;
    h.wait_for_state(ConnectionState::Open).await;

    // Give any stray timer a chance to fire
    tokio::time::sleep(Duration::from_secs(5)).await;
    let extra_opens = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, ConnectionEvent::StatusChanged { state: ConnectionState::Open, .. }))
        .count();
    assert_eq!(extra_opens, 0);
    assert_eq!(h.connector.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_while_connecting_cancels_the_attempt() {
    let mut h = Harness::new();
    h.connector.script([Behavior::Hang]);

    h.client.init(identity()).await.unwrap();
    h.client.disconnect().await;

    // Neither the connect timeout nor a retry fires afterwards
    tokio::time::sleep(Duration::from_secs(120)).await;
    // The attempt may have been cancelled before it reached the connector
    assert!(h.connector.attempt_count() <= 1);
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(!h
        .drain_events()
        .iter()
        .any(|e| matches!(e, ConnectionEvent::ReconnectScheduled { .. })));
}

#[tokio::test(start_paused = true)]
async fn test_server_close_reconnects_unless_user_disconnected() {
    let mut h = Harness::new();
    let server = h.open().await;

    // A normal closure the client did not ask for still reconnects
    server.close(1000);
    let (_, reason) = h.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(reason, StatusReason::ConnectionLost);
    let _server = h.next_server().await;
    h.wait_for_state(ConnectionState::Open).await;

    h.client.disconnect().await;
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(h.connector.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_protocol_close_retries_with_backoff() {
    let mut h = Harness::new();
    let server = h.open().await;

    server.close(1002);
    let (_, reason) = h.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(reason, StatusReason::ProtocolError);

    let (_, event) = h
        .wait_for(|e| matches!(e, ConnectionEvent::ReconnectScheduled { .. }))
        .await;
    assert!(matches!(
        event,
        ConnectionEvent::ReconnectScheduled { attempt: 1, delay } if delay == Duration::from_millis(1000)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_auth_rejection_is_not_retried() {
    let mut h = Harness::new();
    h.connector.script([Behavior::Reject(401)]);

    h.client.init(identity()).await.unwrap();
    let (_, reason) = h.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(reason, StatusReason::AuthRejected);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_auth_close_code_is_not_retried() {
    let mut h = Harness::new();
    let server = h.open().await;

    server.close(4001);
    let (_, reason) = h.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(reason, StatusReason::AuthRejected);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(h.connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_first_connect_timeout_retries_on_short_delay() {
    let mut h = Harness::new();
    h.connector.script([Behavior::Hang]);

    let started = Instant::now();
    h.client.init(identity()).await.unwrap();

    let (timed_out_at, reason) = h.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(reason, StatusReason::ConnectTimeout);
    assert_eq!(timed_out_at - started, Duration::from_secs(10));

    let (_, event) = h
        .wait_for(|e| matches!(e, ConnectionEvent::ReconnectScheduled { .. }))
        .await;
    assert!(matches!(
        event,
        ConnectionEvent::ReconnectScheduled { attempt: 1, delay } if delay == Duration::from_millis(500)
    ));

    let _server = h.next_server().await;
    let (opened_at, _) = h.wait_for_state(ConnectionState::Open).await;
    assert_eq!(opened_at - started, Duration::from_millis(10_500));
}

#[tokio::test(start_paused = true)]
async fn test_second_connect_timeout_uses_normal_backoff() {
    let mut h = Harness::new();
    h.connector.script([Behavior::Hang, Behavior::Hang]);

    h.client.init(identity()).await.unwrap();
    h.wait_for_state(ConnectionState::Disconnected).await;

    // Only the first timeout of an outage skips backoff
    let (_, reason) = h.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(reason, StatusReason::ConnectTimeout);
    let (_, event) = h
        .wait_for(|e| matches!(e, ConnectionEvent::ReconnectScheduled { .. }))
        .await;
    assert!(matches!(
        event,
        ConnectionEvent::ReconnectScheduled { attempt: 2, delay } if delay == Duration::from_millis(2000)
    ));
}

#[tokio::test(start_paused = true)]
async fn test_stale_connection_reconnects_autonomously() {
    let mut h = Harness::new();
    let mut server = h.open().await;
    let opened_at = Instant::now();

    let (stale_at, reason) = h.wait_for_state(ConnectionState::Disconnected).await;
    assert_eq!(reason, StatusReason::HeartbeatStale);
    assert!(stale_at - opened_at > Duration::from_secs(46));
    assert!(stale_at - opened_at <= Duration::from_secs(60));

    let commands = server.drain();
    let keepalives = commands
        .iter()
        .filter(|c| matches!(c, TransportCommand::Text(t) if t.contains(r#""type":"heartbeat""#)))
        .count();
    assert_eq!(keepalives, 3);
    assert_eq!(commands.last(), Some(&TransportCommand::Close(1000)));

    let _server = h.next_server().await;
    h.wait_for_state(ConnectionState::Open).await;
    assert_eq!(h.connector.attempt_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_inbound_traffic_keeps_connection_alive() {
    let mut h = Harness::new();
    let server = h.open().await;

    for _ in 0..10 {
        tokio::time::sleep(Duration::from_secs(20)).await;
        server.push(serde_json::json!({"type": "heartbeat_ack"}));
    }

    assert_eq!(h.client.state(), ConnectionState::Open);
    assert_eq!(h.connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_malformed_frames_do_not_affect_connection() {
    let mut h = Harness::new();
    let server = h.open().await;

    server.push_raw("{not json");
    server.push_raw(r#"{"type":"presence_update","user_id":"x"}"#);
    server.push_raw(r#"{"no_type":true}"#);
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(h.client.state(), ConnectionState::Open);
    assert!(h.drain_events().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_network_online_forces_attempt_after_exhaustion() {
    let mut h = Harness::new();
    h.connector.script([Behavior::Refuse; 6]);

    h.client.init(identity()).await.unwrap();
    h.wait_for(|e| matches!(e, ConnectionEvent::RetriesExhausted { .. }))
        .await;

    h.client.network_online();
    let (_, reason) = h.wait_for_state(ConnectionState::Connecting).await;
    assert_eq!(reason, StatusReason::NetworkOnline);
    let _server = h.next_server().await;
    h.wait_for_state(ConnectionState::Open).await;
    assert_eq!(h.client.reconnect_attempt(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_network_online_ignored_after_disconnect() {
    let mut h = Harness::new();
    let _server = h.open().await;
    h.client.disconnect().await;

    h.client.network_online();
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.connector.attempt_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_send_requires_open_connection() {
    let mut h = Harness::new();
    let envelope = Envelope::heartbeat();
    assert!(matches!(
        h.client.send(envelope.clone()).await,
        Err(RealtimeError::NotConnected)
    ));

    let mut server = h.open().await;
    server.drain();
    h.client.send(envelope).await.unwrap();
    assert_eq!(server.drain_kinds(), vec!["heartbeat"]);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_the_connection_task() {
    let mut h = Harness::new();
    let _server = h.open().await;

    h.client.shutdown().await;
    assert_eq!(h.client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        h.client.init(identity()).await,
        Err(RealtimeError::ClientClosed)
    ));
}
