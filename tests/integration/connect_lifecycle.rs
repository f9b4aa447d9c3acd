/// Connection lifecycle against the mock broker: handshake, identity,
/// close semantics, and closed-state behavior.
use std::time::Duration;

use airwave::{ClientOptions, ConnState, Error, Realtime};
use aw_test_utils::{BrokerConfig, MockBroker};

fn options_for(broker: &MockBroker) -> ClientOptions {
    let _ = tracing_subscriber::fmt::try_init();
    let mut options = ClientOptions::new(broker.url(), "http://127.0.0.1:1/unused", "test-token");
    options.disconnected_retry_ms = 100;
    options.request_timeout_ms = 5_000;
    options
}

#[tokio::test]
async fn connect_reaches_connected_with_identity() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();

    client.connect().await.expect("connect");
    assert_eq!(client.connection().state(), ConnState::Connected);

    let info = client.connection().info();
    assert!(info.connection_id.is_some(), "connection id must be stored");
    assert!(info.connection_key.is_some(), "resume key must be stored");
}

#[tokio::test]
async fn close_handshakes_and_clears_the_resume_key() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();

    client.connect().await.expect("connect");
    client.close().await.expect("close");
    assert_eq!(client.connection().state(), ConnState::Closed);
    assert!(
        client.connection().info().connection_key.is_none(),
        "resume key is cleared on close"
    );
}

#[tokio::test]
async fn close_is_idempotent() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();

    client.connect().await.expect("connect");
    client.close().await.expect("first close");
    client.close().await.expect("second close is a no-op");
    assert_eq!(client.connection().state(), ConnState::Closed);
}

#[tokio::test]
async fn publish_after_close_fails_with_disconnected() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();

    client.connect().await.expect("connect");
    client.close().await.expect("close");

    let result = client.channel("news").publish("ev", "late").await;
    assert!(matches!(result, Err(Error::Disconnected)));
    assert_eq!(client.connection().state(), ConnState::Closed);
}

#[tokio::test]
async fn connect_after_close_starts_fresh() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();

    client.connect().await.expect("first connect");
    let first_id = client.connection().connection_id();
    client.close().await.expect("close");

    client.connect().await.expect("second connect");
    assert_eq!(client.connection().state(), ConnState::Connected);
    // No resume key was presented, so the broker hands out a new identity.
    assert_ne!(client.connection().connection_id(), first_id);
}

#[tokio::test]
async fn state_changes_arrive_in_transition_order() {
    use futures_util::StreamExt;

    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();

    let mut changes = client.connection().state_changes();
    client.connect().await.expect("connect");
    client.close().await.expect("close");

    let mut seen = Vec::new();
    while seen.len() < 4 {
        match tokio::time::timeout(Duration::from_secs(5), changes.next()).await {
            Ok(Some(Ok(change))) => seen.push(change.current),
            _ => break,
        }
    }
    assert_eq!(
        seen,
        vec![
            ConnState::Connecting,
            ConnState::Connected,
            ConnState::Closing,
            ConnState::Closed,
        ]
    );
}
