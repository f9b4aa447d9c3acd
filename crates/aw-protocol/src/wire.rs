//! Wire serialization: one JSON text format, one MessagePack binary format.
//!
//! The format is chosen per connection and fixed for its lifetime. Both carry
//! the same model; MessagePack uses named-map encoding so that fields skipped
//! on serialize stay optional on deserialize.

use serde::Deserialize;

use crate::ProtocolMessage;

/// The serialization format negotiated for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WireFormat {
    /// JSON text frames.
    #[default]
    Json,
    /// MessagePack binary frames.
    MsgPack,
}

/// A raw frame as exchanged with the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum WireFrame {
    Text(String),
    Binary(Vec<u8>),
}

impl WireFrame {
    /// The format a received frame was evidently written in.
    pub fn format(&self) -> WireFormat {
        match self {
            WireFrame::Text(_) => WireFormat::Json,
            WireFrame::Binary(_) => WireFormat::MsgPack,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("MessagePack encode: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),
    #[error("MessagePack decode: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),
    #[error("frame kind does not match the connection wire format")]
    FrameMismatch,
}

impl WireFormat {
    /// The `format` query parameter value sent when dialing.
    pub fn query_value(self) -> &'static str {
        match self {
            WireFormat::Json => "json",
            WireFormat::MsgPack => "msgpack",
        }
    }

    /// Serialize an envelope for sending. Empty fields are pruned first
    /// (on a copy; the caller's message is untouched).
    pub fn encode(self, msg: &ProtocolMessage) -> Result<WireFrame, WireError> {
        let mut pruned = msg.clone();
        pruned.prune_for_send();
        match self {
            WireFormat::Json => Ok(WireFrame::Text(serde_json::to_string(&pruned)?)),
            WireFormat::MsgPack => Ok(WireFrame::Binary(rmp_serde::to_vec_named(&pruned)?)),
        }
    }

    /// Deserialize a received frame and normalize it (timestamp / id /
    /// connection_id inheritance for embedded entries).
    pub fn decode(self, frame: &WireFrame) -> Result<ProtocolMessage, WireError> {
        let mut msg = match (self, frame) {
            (WireFormat::Json, WireFrame::Text(text)) => {
                serde_json::from_str::<ProtocolMessage>(text)?
            }
            (WireFormat::MsgPack, WireFrame::Binary(bytes)) => {
                let mut de = rmp_serde::Deserializer::new(bytes.as_slice());
                ProtocolMessage::deserialize(&mut de)?
            }
            _ => return Err(WireError::FrameMismatch),
        };
        msg.apply_inherited_fields();
        Ok(msg)
    }
}
