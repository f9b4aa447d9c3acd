/// Reconnect/resume: a dropped connection resumes with its key, and
/// unacknowledged publishes are replayed with their original serials.
use std::time::Duration;

use airwave::{ClientOptions, ConnState, Realtime};
use aw_test_utils::{AckMode, BrokerConfig, MockBroker};

fn options_for(broker: &MockBroker) -> ClientOptions {
    let _ = tracing_subscriber::fmt::try_init();
    let mut options = ClientOptions::new(broker.url(), "http://127.0.0.1:1/unused", "test-token");
    options.disconnected_retry_ms = 100;
    options.request_timeout_ms = 10_000;
    options
}

#[tokio::test]
async fn dropped_connection_reconnects_and_resumes() {
    use futures_util::StreamExt;

    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    let mut changes = client.connection().state_changes();
    client.connect().await.expect("connect");
    let original_id = client.connection().connection_id().expect("id");

    broker.kill_connections();

    // Watch the full drop/recover cycle, not just the end state.
    let mut saw_disconnected = false;
    loop {
        match tokio::time::timeout(Duration::from_secs(5), changes.next()).await {
            Ok(Some(Ok(change))) => {
                if change.current == ConnState::Disconnected {
                    saw_disconnected = true;
                }
                if saw_disconnected && change.current == ConnState::Connected {
                    break;
                }
            }
            Ok(Some(Err(_))) => continue,
            _ => panic!("never recovered to Connected"),
        }
    }

    // The resume key was recognized, so the identity is unchanged.
    assert_eq!(client.connection().connection_id(), Some(original_id));
}

#[tokio::test]
async fn unacked_publish_is_replayed_with_its_original_serial() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("journal");
    // First publish establishes serial 0 and is acked normally.
    channel.publish("ev", "first").await.expect("first acked");

    // The second publish reaches the broker but gets no terminal frame.
    broker.set_ack_mode(AckMode::Silent);
    let pending = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("ev", "second").await }
    });
    assert!(
        broker.wait_for_received(2, Duration::from_secs(2)).await,
        "unacked publish reached the broker"
    );

    // Drop the socket; the client resumes and must re-send serial 1.
    broker.set_ack_mode(AckMode::Ack);
    broker.kill_connections();

    pending
        .await
        .expect("task")
        .expect("replayed publish is acked after resume");

    let serials: Vec<i64> = broker
        .received_on("journal")
        .iter()
        .filter_map(|f| f.msg_serial)
        .collect();
    // first (0), second (1), second replayed (1 again, original serial kept).
    assert_eq!(serials, vec![0, 1, 1]);
}

#[tokio::test]
async fn publishes_during_the_outage_are_queued_until_reconnect() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    broker.kill_connections();
    // Wait for the drop to be observed before publishing into the outage.
    let mut rx = client.connection().state_changes();
    {
        use futures_util::StreamExt;
        loop {
            match tokio::time::timeout(Duration::from_secs(5), rx.next()).await {
                Ok(Some(Ok(change))) if change.current == ConnState::Disconnected => break,
                Ok(Some(_)) => continue,
                _ => panic!("never saw Disconnected"),
            }
        }
    }

    let channel = client.channel("outage");
    channel
        .publish("ev", "sent-while-down")
        .await
        .expect("completes after automatic reconnect");
    assert_eq!(broker.received_on("outage").len(), 1);
}
