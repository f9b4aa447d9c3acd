// aw-protocol: wire envelope types and serialization for the realtime protocol.
//
// Everything exchanged with the broker is a `ProtocolMessage`: a typed action
// code plus optional metadata and zero or more embedded `Message` /
// `PresenceMessage` entries.  Two wire representations exist (JSON text and
// MessagePack binary); both map the same model with camelCase field names.
//
// The numeric action codes are frozen and must never be reordered.

use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};

mod data;
mod wire;

pub use data::Data;
pub use wire::{WireError, WireFormat, WireFrame};

// ---------------------------------------------------------------------------
// Action codes
// ---------------------------------------------------------------------------

/// Protocol message action.
///
/// The numeric values are the authoritative wire codes (0..=16); peers in
/// other languages rely on them, so new actions may only be appended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum Action {
    Heartbeat = 0,
    Ack = 1,
    Nack = 2,
    Connect = 3,
    Connected = 4,
    Disconnect = 5,
    Disconnected = 6,
    Close = 7,
    Closed = 8,
    Error = 9,
    Attach = 10,
    Attached = 11,
    Detach = 12,
    Detached = 13,
    Presence = 14,
    Message = 15,
    Sync = 16,
}

impl Action {
    /// True for actions that are scoped to a named channel rather than the
    /// connection as a whole.
    pub fn is_channel_scoped(self) -> bool {
        matches!(
            self,
            Action::Attach
                | Action::Attached
                | Action::Detach
                | Action::Detached
                | Action::Presence
                | Action::Message
                | Action::Sync
        )
    }
}

/// Flag bits carried in [`ProtocolMessage::flags`].
///
/// Allocated from the low-order bit upward. The mode bits mirror the channel
/// mode set sent in ATTACH frames.
pub mod flags {
    pub const HAS_PRESENCE: u32 = 1 << 0;
    pub const HAS_BACKLOG: u32 = 1 << 1;

    pub const MODE_PRESENCE: u32 = 1 << 16;
    pub const MODE_PUBLISH: u32 = 1 << 17;
    pub const MODE_SUBSCRIBE: u32 = 1 << 18;
    pub const MODE_PRESENCE_SUBSCRIBE: u32 = 1 << 19;
}

// ---------------------------------------------------------------------------
// ErrorInfo
// ---------------------------------------------------------------------------

/// A broker-reported error: protocol error code, optional HTTP status code,
/// human-readable message, and an optional documentation link.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ErrorInfo {
    pub code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: i32, status_code: Option<u16>, message: impl Into<String>) -> Self {
        ErrorInfo {
            code,
            status_code,
            message: message.into(),
            href: None,
        }
    }

    /// Token-expiry class of auth errors; the connection may renew its token
    /// and retry instead of failing outright.
    pub fn is_token_expired(&self) -> bool {
        (40140..40150).contains(&self.code)
    }

    /// Errors that leave a retry worthwhile (server-side trouble).
    pub fn is_retryable(&self) -> bool {
        matches!(self.status_code, Some(s) if s >= 500)
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)?;
        if let Some(status) = self.status_code {
            write!(f, " (status {status})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorInfo {}

// ---------------------------------------------------------------------------
// ConnectionDetails
// ---------------------------------------------------------------------------

/// Connection parameters the broker reports in a CONNECTED frame.
///
/// `connection_state_ttl` and `max_idle_interval` are milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ConnectionDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_message_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_inbound_rate: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_state_ttl: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_idle_interval: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// A user-level message envelope.
///
/// `encoding` is a slash-separated list of transform labels, read left to
/// right as most-recently-applied-last; decoding strips from the right.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Message {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Data::is_none")]
    pub data: Data,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extras: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl Message {
    /// A named message with the given payload.
    pub fn new(name: impl Into<String>, data: Data) -> Self {
        Message {
            name: Some(name.into()),
            data,
            ..Message::default()
        }
    }

    /// Structurally empty entries (no name, no payload) are pruned from the
    /// wire envelope on send.
    pub fn is_empty(&self) -> bool {
        self.name.as_deref().is_none_or(str::is_empty) && self.data.is_none()
    }
}

// ---------------------------------------------------------------------------
// PresenceMessage
// ---------------------------------------------------------------------------

/// Presence action codes (frozen wire values).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum PresenceAction {
    Absent = 0,
    Present = 1,
    Enter = 2,
    Leave = 3,
    Update = 4,
}

impl Default for PresenceAction {
    fn default() -> Self {
        PresenceAction::Absent
    }
}

/// A presence event for one member on one channel.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PresenceMessage {
    pub action: PresenceAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Data::is_none")]
    pub data: Data,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl PresenceMessage {
    pub fn new(action: PresenceAction, client_id: impl Into<String>, data: Data) -> Self {
        PresenceMessage {
            action,
            client_id: Some(client_id.into()),
            data,
            ..PresenceMessage::default()
        }
    }

    /// Key identifying a member: connection id plus client id.
    pub fn member_key(&self) -> String {
        format!(
            "{}:{}",
            self.connection_id.as_deref().unwrap_or(""),
            self.client_id.as_deref().unwrap_or("")
        )
    }
}

// ---------------------------------------------------------------------------
// ProtocolMessage
// ---------------------------------------------------------------------------

/// The wire envelope exchanged with the broker.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProtocolMessage {
    pub action: Action,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flags: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_serial: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_serial: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg_serial: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages: Option<Vec<Message>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<Vec<PresenceMessage>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_details: Option<ConnectionDetails>,
}

impl Default for Action {
    fn default() -> Self {
        Action::Heartbeat
    }
}

impl ProtocolMessage {
    pub fn new(action: Action) -> Self {
        ProtocolMessage {
            action,
            ..ProtocolMessage::default()
        }
    }

    pub fn with_channel(action: Action, channel: impl Into<String>) -> Self {
        ProtocolMessage {
            action,
            channel: Some(channel.into()),
            ..ProtocolMessage::default()
        }
    }

    pub fn has_flag(&self, flag: u32) -> bool {
        self.flags.unwrap_or(0) & flag != 0
    }

    /// Normalize an inbound envelope: embedded messages and presence entries
    /// inherit the envelope `timestamp` and `connection_id` where their own
    /// are unset, and empty message ids become `<envelope id>:<index>`.
    pub fn apply_inherited_fields(&mut self) {
        let timestamp = self.timestamp;
        let connection_id = self.connection_id.clone();
        let envelope_id = self.id.clone();

        if let Some(messages) = &mut self.messages {
            for (i, m) in messages.iter_mut().enumerate() {
                if m.timestamp.is_none() {
                    m.timestamp = timestamp;
                }
                if m.connection_id.as_deref().is_none_or(str::is_empty) {
                    m.connection_id = connection_id.clone();
                }
                if m.id.as_deref().is_none_or(str::is_empty) {
                    if let Some(pid) = &envelope_id {
                        m.id = Some(format!("{pid}:{i}"));
                    }
                }
            }
        }
        if let Some(presence) = &mut self.presence {
            for (i, p) in presence.iter_mut().enumerate() {
                if p.timestamp.is_none() {
                    p.timestamp = timestamp;
                }
                if p.connection_id.as_deref().is_none_or(str::is_empty) {
                    p.connection_id = connection_id.clone();
                }
                if p.id.as_deref().is_none_or(str::is_empty) {
                    if let Some(pid) = &envelope_id {
                        p.id = Some(format!("{pid}:{i}"));
                    }
                }
            }
        }
    }

    /// Prune empty fields before serialization: an empty `channel` string
    /// serializes as absent, structurally empty messages are dropped, and an
    /// emptied `messages` array is omitted entirely.
    pub fn prune_for_send(&mut self) {
        if self.channel.as_deref().is_some_and(str::is_empty) {
            self.channel = None;
        }
        if let Some(messages) = &mut self.messages {
            messages.retain(|m| !m.is_empty());
            if messages.is_empty() {
                self.messages = None;
            }
        }
        if let Some(presence) = &mut self.presence {
            if presence.is_empty() {
                self.presence = None;
            }
        }
    }
}
