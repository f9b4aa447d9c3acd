/// Channel delivery through the full stack: attach, subscribe, codec
/// round-trips over the echoing broker, and both wire formats.
use std::time::Duration;

use airwave::{
    ChannelOptions, ChannelState, CipherParams, ClientOptions, Data, Realtime,
};
use aw_test_utils::{BrokerConfig, MockBroker};

fn options_for(broker: &MockBroker) -> ClientOptions {
    let _ = tracing_subscriber::fmt::try_init();
    let mut options = ClientOptions::new(broker.url(), "http://127.0.0.1:1/unused", "test-token");
    options.disconnected_retry_ms = 100;
    options.request_timeout_ms = 5_000;
    options
}

#[tokio::test]
async fn attach_then_receive_in_frame_order() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("news");
    let mut subscription = channel.subscribe().await.expect("subscribe implies attach");
    assert_eq!(channel.state().await.unwrap(), ChannelState::Attached);

    channel.publish("a", "1").await.expect("a");
    channel.publish("b", "2").await.expect("b");

    let first = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("no timeout")
        .expect("message");
    let second = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("no timeout")
        .expect("message");
    assert_eq!(first.name.as_deref(), Some("a"));
    assert_eq!(first.data, Data::Text("1".to_owned()));
    assert_eq!(second.name.as_deref(), Some("b"));
    // Envelope metadata propagated onto the delivered messages.
    assert!(first.id.is_some());
    assert!(first.timestamp.is_some());
}

#[tokio::test]
async fn name_filtered_subscription_skips_other_events() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("mixed");
    let mut only_b = channel.subscribe_to("b").await.expect("subscribe");

    channel.publish("a", "skip me").await.expect("a");
    channel.publish("b", "keep me").await.expect("b");

    let message = tokio::time::timeout(Duration::from_secs(5), only_b.recv())
        .await
        .expect("no timeout")
        .expect("message");
    assert_eq!(message.name.as_deref(), Some("b"));
    assert_eq!(message.data, Data::Text("keep me".to_owned()));
}

#[tokio::test]
async fn structured_payload_round_trips_with_json_label() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("readings");
    let mut subscription = channel.subscribe().await.expect("subscribe");

    let payload = serde_json::json!({"temp": 21.5, "ok": true});
    channel
        .publish("reading", Data::Value(payload.clone()))
        .await
        .expect("publish");

    // On the wire the payload is JSON text with the label attached.
    assert!(broker.wait_for_received(1, Duration::from_secs(2)).await);
    let received = broker.received_on("readings");
    let on_wire = &received[0].messages.as_ref().unwrap()[0];
    assert_eq!(on_wire.encoding.as_deref(), Some("json"));

    // Delivered decoded back to the structured value.
    let message = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("no timeout")
        .expect("message");
    assert_eq!(message.data, Data::Value(payload));
    assert!(message.encoding.is_none());
}

#[tokio::test]
async fn encrypted_channel_round_trips_and_hides_plaintext() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let cipher = CipherParams::aes_cbc(vec![7u8; 16]).unwrap();
    let channel = client.channel_with_options("secrets", ChannelOptions::with_cipher(cipher));
    let mut subscription = channel.subscribe().await.expect("subscribe");

    channel
        .publish("ev", "EncryptionTest")
        .await
        .expect("publish");

    assert!(broker.wait_for_received(1, Duration::from_secs(2)).await);
    let received = broker.received_on("secrets");
    let on_wire = &received[0].messages.as_ref().unwrap()[0];
    assert_eq!(
        on_wire.encoding.as_deref(),
        Some("utf-8/cipher+aes-128-cbc/base64")
    );
    // The broker never sees the plaintext.
    assert_ne!(on_wire.data, Data::Text("EncryptionTest".to_owned()));

    let message = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("no timeout")
        .expect("message");
    assert_eq!(message.data, Data::Text("EncryptionTest".to_owned()));
    assert!(message.encoding.is_none());
}

#[tokio::test]
async fn binary_wire_format_carries_binary_payloads_without_base64() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let mut options = options_for(&broker);
    options.use_binary_protocol = true;
    let client = Realtime::new(options).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("blobs");
    let mut subscription = channel.subscribe().await.expect("subscribe");

    channel
        .publish("blob", Data::Binary(vec![1, 2, 3, 4, 5]))
        .await
        .expect("publish");

    assert!(broker.wait_for_received(1, Duration::from_secs(2)).await);
    let received = broker.received_on("blobs");
    let on_wire = &received[0].messages.as_ref().unwrap()[0];
    assert!(
        on_wire.encoding.is_none(),
        "packed wire needs no base64 leg"
    );

    let message = tokio::time::timeout(Duration::from_secs(5), subscription.recv())
        .await
        .expect("no timeout")
        .expect("message");
    assert_eq!(message.data, Data::Binary(vec![1, 2, 3, 4, 5]));
}

#[tokio::test]
async fn detach_and_release_remove_the_channel() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker)).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("short-lived");
    channel.attach().await.expect("attach");
    channel.detach().await.expect("detach");
    assert_eq!(channel.state().await.unwrap(), ChannelState::Detached);

    client
        .release_channel("short-lived")
        .await
        .expect("release");
    // A fresh reference starts over from Initialized.
    assert_eq!(
        client.channel("short-lived").state().await.unwrap(),
        ChannelState::Initialized
    );
}
