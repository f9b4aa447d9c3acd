/// Contract tests: golden JSON frames a conforming broker emits, deserialized
/// into the typed model, serialized back, and compared structurally.
///
/// These frames pin the frozen parts of the wire format: numeric action
/// codes, camelCase field names, and absent-field omission.
use aw_protocol::{Action, Data, PresenceAction, ProtocolMessage, WireFormat, WireFrame, flags};

/// Helper: parse a golden frame, assert round-trip fidelity, return the model.
fn round_trip(json_text: &str) -> ProtocolMessage {
    let msg: ProtocolMessage =
        serde_json::from_str(json_text).unwrap_or_else(|e| panic!("deserialize failed: {e}"));

    let serialized = serde_json::to_string(&msg).unwrap();
    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let reserialized: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, reserialized, "round-trip mismatch");

    msg
}

#[test]
fn connected_frame() {
    let msg = round_trip(
        r#"{"action":4,"connectionId":"abc123","connectionKey":"key.456",
            "connectionDetails":{"connectionKey":"key.456","connectionStateTtl":120000,
            "maxIdleInterval":15000,"maxMessageSize":65536,"serverId":"frontend.001"}}"#,
    );
    assert_eq!(msg.action, Action::Connected);
    assert_eq!(msg.connection_id.as_deref(), Some("abc123"));
    let details = msg.connection_details.unwrap();
    assert_eq!(details.connection_state_ttl, Some(120_000));
    assert_eq!(details.max_idle_interval, Some(15_000));
    assert_eq!(details.server_id.as_deref(), Some("frontend.001"));
}

#[test]
fn ack_frame() {
    let msg = round_trip(r#"{"action":1,"msgSerial":7,"count":3}"#);
    assert_eq!(msg.action, Action::Ack);
    assert_eq!(msg.msg_serial, Some(7));
    assert_eq!(msg.count, Some(3));
}

#[test]
fn nack_frame_carries_error() {
    let msg = round_trip(
        r#"{"action":2,"msgSerial":4,"count":1,
            "error":{"code":40160,"statusCode":401,"message":"permission denied"}}"#,
    );
    assert_eq!(msg.action, Action::Nack);
    let err = msg.error.unwrap();
    assert_eq!(err.code, 40160);
    assert_eq!(err.status_code, Some(401));
}

#[test]
fn attached_frame_with_presence_flag() {
    let msg = round_trip(
        r#"{"action":11,"channel":"room","channelSerial":"108sY:12","flags":1}"#,
    );
    assert_eq!(msg.action, Action::Attached);
    assert!(msg.has_flag(flags::HAS_PRESENCE));
    assert!(!msg.has_flag(flags::HAS_BACKLOG));
}

#[test]
fn message_frame_with_embedded_messages() {
    let msg = round_trip(
        r#"{"action":15,"channel":"news","id":"m1","timestamp":1700000000000,
            "messages":[{"name":"update","data":"payload"}]}"#,
    );
    assert_eq!(msg.action, Action::Message);
    let inner = &msg.messages.as_ref().unwrap()[0];
    assert_eq!(inner.name.as_deref(), Some("update"));
    assert_eq!(inner.data, Data::Text("payload".to_owned()));
}

#[test]
fn presence_frame_action_codes() {
    let msg = round_trip(
        r#"{"action":14,"channel":"room",
            "presence":[{"action":2,"clientId":"alice","data":"here"}]}"#,
    );
    let entry = &msg.presence.as_ref().unwrap()[0];
    assert_eq!(entry.action, PresenceAction::Enter);
    assert_eq!(entry.client_id.as_deref(), Some("alice"));
}

#[test]
fn sync_end_frame_has_no_channel_serial() {
    let msg = round_trip(r#"{"action":16,"channel":"room"}"#);
    assert_eq!(msg.action, Action::Sync);
    assert!(msg.channel_serial.is_none());
}

#[test]
fn json_and_msgpack_agree() {
    let mut pm = ProtocolMessage::with_channel(Action::Message, "news");
    pm.msg_serial = Some(11);
    pm.messages = Some(vec![aw_protocol::Message::new(
        "ev",
        Data::Text("body".to_owned()),
    )]);

    let json = WireFormat::Json.encode(&pm).unwrap();
    let packed = WireFormat::MsgPack.encode(&pm).unwrap();
    let from_json = WireFormat::Json.decode(&json).unwrap();
    let from_packed = WireFormat::MsgPack.decode(&packed).unwrap();
    assert_eq!(from_json, from_packed);
}

#[test]
fn binary_payload_survives_the_packed_wire() {
    let mut pm = ProtocolMessage::with_channel(Action::Message, "blobs");
    pm.messages = Some(vec![aw_protocol::Message {
        name: Some("blob".to_owned()),
        data: Data::Binary(vec![0x01, 0x02, 0x03, 0x04, 0x05]),
        ..aw_protocol::Message::default()
    }]);

    let frame = WireFormat::MsgPack.encode(&pm).unwrap();
    let WireFrame::Binary(_) = frame else {
        panic!("expected binary frame");
    };
    let back = WireFormat::MsgPack.decode(&frame).unwrap();
    assert_eq!(
        back.messages.unwrap()[0].data,
        Data::Binary(vec![1, 2, 3, 4, 5])
    );
}
