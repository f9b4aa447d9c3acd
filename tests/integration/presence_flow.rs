/// Presence: enter/update/leave round-trips and the member map.
use std::time::Duration;

use airwave::{ClientOptions, Error, PresenceAction, Realtime};
use aw_test_utils::{BrokerConfig, MockBroker};

fn options_for(broker: &MockBroker, client_id: Option<&str>) -> ClientOptions {
    let _ = tracing_subscriber::fmt::try_init();
    let mut options = ClientOptions::new(broker.url(), "http://127.0.0.1:1/unused", "test-token");
    options.disconnected_retry_ms = 100;
    options.request_timeout_ms = 5_000;
    options.client_id = client_id.map(str::to_owned);
    options
}

#[tokio::test]
async fn enter_is_acked_and_tracked_in_the_member_map() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker, Some("alice"))).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("room");
    let mut presence = channel.subscribe_presence().await.expect("subscribe");

    channel.enter_presence("here").await.expect("enter acked");

    let event = tokio::time::timeout(Duration::from_secs(5), presence.recv())
        .await
        .expect("no timeout")
        .expect("presence event");
    assert_eq!(event.action, PresenceAction::Enter);
    assert_eq!(event.client_id.as_deref(), Some("alice"));

    let members = channel.presence_members().await.expect("members");
    assert_eq!(members.len(), 1);
    assert_eq!(members[0].client_id.as_deref(), Some("alice"));
}

#[tokio::test]
async fn leave_removes_the_member() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker, Some("bob"))).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("room");
    let mut presence = channel.subscribe_presence().await.expect("subscribe");

    channel.enter_presence("around").await.expect("enter");
    let _enter = tokio::time::timeout(Duration::from_secs(5), presence.recv())
        .await
        .expect("no timeout")
        .expect("enter event");

    channel.leave_presence().await.expect("leave");
    let leave = tokio::time::timeout(Duration::from_secs(5), presence.recv())
        .await
        .expect("no timeout")
        .expect("leave event");
    assert_eq!(leave.action, PresenceAction::Leave);

    let members = channel.presence_members().await.expect("members");
    assert!(members.is_empty(), "leave empties the member map");
}

#[tokio::test]
async fn presence_requires_a_client_id() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker, None)).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("room");
    channel.attach().await.expect("attach");
    let result = channel.enter_presence("x").await;
    assert!(matches!(result, Err(Error::BadOptions(_))));
}

#[tokio::test]
async fn presence_requires_an_attached_channel() {
    let broker = MockBroker::start(BrokerConfig::default()).await.unwrap();
    let client = Realtime::new(options_for(&broker, Some("carol"))).unwrap();
    client.connect().await.expect("connect");

    let channel = client.channel("room");
    let result = channel.enter_presence("x").await;
    assert!(matches!(result, Err(Error::ChannelNotAttached)));
}
