/// Publish acknowledgement flow: serial assignment, ordered completion,
/// NACK mapping, and the pre-connect queue.
use std::time::Duration;

use airwave::{ClientOptions, Error, Realtime};
use aw_protocol::ErrorInfo;
use aw_test_utils::{AckMode, BrokerConfig, MockBroker};

fn options_for(broker: &MockBroker) -> ClientOptions {
    let _ = tracing_subscriber::fmt::try_init();
    let mut options = ClientOptions::new(broker.url(), "http://127.0.0.1:1/unused", "test-token");
    options.disconnected_retry_ms = 100;
    options.request_timeout_ms = 5_000;
    options
}

#[tokio::test]
async fn publishes_carry_ascending_serials() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("orders");
    for i in 0..3 {
        channel
            .publish("order", format!("payload-{i}"))
            .await
            .expect("publish acked");
    }

    let received = broker.received_on("orders");
    assert_eq!(received.len(), 3);
    let serials: Vec<i64> = received.iter().filter_map(|f| f.msg_serial).collect();
    assert_eq!(serials, vec![0, 1, 2]);
}

#[tokio::test]
async fn concurrent_publishes_complete_in_issue_order() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("burst");
    let first = channel.publish("ev", "a");
    let second = channel.publish("ev", "b");
    let third = channel.publish("ev", "c");
    let (a, b, c) = tokio::join!(first, second, third);
    a.expect("a acked");
    b.expect("b acked");
    c.expect("c acked");

    let serials: Vec<i64> = broker
        .received_on("burst")
        .iter()
        .filter_map(|f| f.msg_serial)
        .collect();
    assert_eq!(serials, vec![0, 1, 2], "send order matches issue order");
}

#[tokio::test]
async fn nack_fails_the_publish_with_the_broker_error() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    broker.set_ack_mode(AckMode::Nack(ErrorInfo::new(
        50001,
        Some(500),
        "persistence unavailable",
    )));
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let result = client.channel("orders").publish("ev", "x").await;
    match result {
        Err(Error::Remote(info)) => assert_eq!(info.code, 50001),
        other => panic!("expected broker rejection, got {other:?}"),
    }

    // A rejected publish only affects itself.
    broker.set_ack_mode(AckMode::Ack);
    client
        .channel("orders")
        .publish("ev", "y")
        .await
        .expect("next publish goes through");
}

#[tokio::test]
async fn publishes_issued_before_connect_are_queued_and_flushed() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();

    let channel = client.channel("early");
    let queued = tokio::spawn({
        let channel = channel.clone();
        async move { channel.publish("ev", "queued-before-connect").await }
    });

    // Give the publish time to land in the queue, then connect.
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.connect().await.expect("connect");

    queued
        .await
        .expect("task")
        .expect("queued publish completes after connect");
    assert!(
        broker
            .wait_for_received(1, Duration::from_secs(2))
            .await,
        "queued publish reached the broker"
    );
    assert_eq!(broker.received_on("early")[0].msg_serial, Some(0));
}
