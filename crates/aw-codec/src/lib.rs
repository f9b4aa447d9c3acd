// aw-codec: the reversible payload encoding pipeline.
//
// A payload travels through an ordered chain of encoders on its way to the
// wire; each transform appends a label to the message's slash-separated
// `encoding` field. The receiver peels labels off from the right, reversing
// each transform, until the original payload is recovered:
//
//   {"k":"v"}  --json-->  text  --utf-8/cipher-->  bytes  --base64-->  text
//
// Label detection lives in each encoder so the chain stays open to new
// transforms.

use aw_protocol::{Data, Message, PresenceMessage, WireFormat, flags};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};

mod cipher;

pub use cipher::{AesCbcCipher, CipherParams};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Codec errors. All are non-fatal to the pipeline: an encode error rejects
/// the one message being encoded; a decode error degrades the one message
/// being decoded.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("unsupported payload type ({0}); wrap scalar values in an object or array")]
    PayloadTypeUnsupported(&'static str),
    #[error("channel options request encryption but no cipher params were supplied")]
    EncryptionMisconfigured,
    #[error("cipher failure: {0}")]
    CipherFailure(String),
    #[error("malformed encoding label: {0}")]
    MalformedEncodingLabel(String),
    #[error("base64 payload malformed: {0}")]
    Base64Malformed(#[from] base64::DecodeError),
    #[error("json payload malformed: {0}")]
    JsonMalformed(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Channel options
// ---------------------------------------------------------------------------

/// Capabilities requested when attaching a channel; mapped onto ATTACH flag
/// bits on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    Publish,
    Subscribe,
    Presence,
    PresenceSubscribe,
}

impl ChannelMode {
    pub fn flag(self) -> u32 {
        match self {
            ChannelMode::Publish => flags::MODE_PUBLISH,
            ChannelMode::Subscribe => flags::MODE_SUBSCRIBE,
            ChannelMode::Presence => flags::MODE_PRESENCE,
            ChannelMode::PresenceSubscribe => flags::MODE_PRESENCE_SUBSCRIBE,
        }
    }
}

/// Per-channel options: payload encryption and requested modes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChannelOptions {
    pub encrypted: bool,
    pub cipher: Option<CipherParams>,
    pub modes: Vec<ChannelMode>,
}

impl ChannelOptions {
    /// Encrypted channel options from cipher params.
    pub fn with_cipher(params: CipherParams) -> Self {
        ChannelOptions {
            encrypted: true,
            cipher: Some(params),
            modes: Vec::new(),
        }
    }

    /// The flags bitfield for an ATTACH frame, or None when no explicit
    /// modes were requested.
    pub fn mode_flags(&self) -> Option<u32> {
        if self.modes.is_empty() {
            return None;
        }
        Some(self.modes.iter().fold(0, |acc, m| acc | m.flag()))
    }
}

// ---------------------------------------------------------------------------
// Encoding label list
// ---------------------------------------------------------------------------

/// The slash-separated label list from a message's `encoding` field.
#[derive(Debug, Clone, Default, PartialEq)]
struct EncodingList(Vec<String>);

impl EncodingList {
    fn from_field(field: Option<&str>) -> Self {
        match field {
            None | Some("") => EncodingList(Vec::new()),
            Some(s) => EncodingList(s.split('/').map(str::to_owned).collect()),
        }
    }

    fn into_field(self) -> Option<String> {
        if self.0.is_empty() {
            None
        } else {
            Some(self.0.join("/"))
        }
    }

    fn push(&mut self, label: impl Into<String>) {
        self.0.push(label.into());
    }

    fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    fn pop(&mut self) {
        self.0.pop();
    }
}

// ---------------------------------------------------------------------------
// Encoder chain
// ---------------------------------------------------------------------------

/// One reversible transform in the pipeline.
trait PayloadEncoder: Send + Sync {
    /// Does this encoder own the given trailing label?
    fn claims(&self, label: &str) -> bool;
    /// Forward transform; pushes a label for each change it makes.
    fn encode(&self, data: &mut Data, labels: &mut EncodingList) -> Result<(), CodecError>;
    /// Reverse the transform named by `label` (already matched by `claims`).
    fn decode(&self, label: &str, data: &mut Data) -> Result<(), CodecError>;
}

struct JsonEncoder;

impl PayloadEncoder for JsonEncoder {
    fn claims(&self, label: &str) -> bool {
        label == "json"
    }

    fn encode(&self, data: &mut Data, labels: &mut EncodingList) -> Result<(), CodecError> {
        let Data::Value(value) = data else {
            return Ok(());
        };
        let kind = match value {
            serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                *data = Data::Text(serde_json::to_string(value)?);
                labels.push("json");
                return Ok(());
            }
            serde_json::Value::Number(_) => "number",
            serde_json::Value::Bool(_) => "boolean",
            serde_json::Value::String(_) => "string",
            serde_json::Value::Null => "null",
        };
        Err(CodecError::PayloadTypeUnsupported(kind))
    }

    fn decode(&self, label: &str, data: &mut Data) -> Result<(), CodecError> {
        match std::mem::take(data) {
            Data::Text(text) => match serde_json::from_str(&text) {
                Ok(value) => {
                    *data = Data::Value(value);
                    Ok(())
                }
                Err(e) => {
                    *data = Data::Text(text);
                    Err(CodecError::JsonMalformed(e))
                }
            },
            Data::Binary(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    *data = Data::Value(value);
                    Ok(())
                }
                Err(e) => {
                    *data = Data::Binary(bytes);
                    Err(CodecError::JsonMalformed(e))
                }
            },
            already @ Data::Value(_) => {
                *data = already;
                Ok(())
            }
            Data::None => Err(CodecError::MalformedEncodingLabel(label.to_owned())),
        }
    }
}

struct Utf8Encoder;

impl PayloadEncoder for Utf8Encoder {
    fn claims(&self, label: &str) -> bool {
        label == "utf-8"
    }

    // Strings pass through unchanged; the cipher stage adds the utf-8 label
    // itself when it byte-encodes a string.
    fn encode(&self, _data: &mut Data, _labels: &mut EncodingList) -> Result<(), CodecError> {
        Ok(())
    }

    fn decode(&self, label: &str, data: &mut Data) -> Result<(), CodecError> {
        match std::mem::take(data) {
            Data::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => {
                    *data = Data::Text(text);
                    Ok(())
                }
                Err(e) => {
                    *data = Data::Binary(e.into_bytes());
                    Err(CodecError::MalformedEncodingLabel(format!(
                        "{label}: payload is not valid UTF-8"
                    )))
                }
            },
            already @ Data::Text(_) => {
                *data = already;
                Ok(())
            }
            other => {
                *data = other;
                Err(CodecError::MalformedEncodingLabel(label.to_owned()))
            }
        }
    }
}

struct CipherEncoder {
    cipher: AesCbcCipher,
    label: String,
}

impl CipherEncoder {
    fn new(params: CipherParams) -> Result<Self, CodecError> {
        let cipher = AesCbcCipher::new(params)?;
        let label = format!("cipher+{}", cipher.cipher_spec());
        Ok(CipherEncoder { cipher, label })
    }
}

impl PayloadEncoder for CipherEncoder {
    fn claims(&self, label: &str) -> bool {
        label.starts_with("cipher+")
    }

    fn encode(&self, data: &mut Data, labels: &mut EncodingList) -> Result<(), CodecError> {
        if let Data::Text(text) = data {
            let bytes = std::mem::take(text).into_bytes();
            *data = Data::Binary(bytes);
            labels.push("utf-8");
        }
        match std::mem::take(data) {
            Data::Binary(bytes) => {
                let ciphertext = self.cipher.encrypt(&bytes)?;
                *data = Data::Binary(ciphertext);
                labels.push(self.label.clone());
                Ok(())
            }
            Data::None => Ok(()),
            other @ Data::Value(_) => {
                *data = other;
                Err(CodecError::PayloadTypeUnsupported("structured"))
            }
            Data::Text(_) => unreachable!("text converted to bytes above"),
        }
    }

    fn decode(&self, label: &str, data: &mut Data) -> Result<(), CodecError> {
        if label != self.label {
            return Err(CodecError::CipherFailure(format!(
                "label {label} does not match the configured cipher {}",
                self.label
            )));
        }
        match std::mem::take(data) {
            Data::Binary(bytes) => match self.cipher.decrypt(&bytes) {
                Ok(plaintext) => {
                    *data = Data::Binary(plaintext);
                    Ok(())
                }
                Err(e) => {
                    *data = Data::Binary(bytes);
                    Err(e)
                }
            },
            other => {
                *data = other;
                Err(CodecError::CipherFailure(
                    "cipher payload must be binary".to_owned(),
                ))
            }
        }
    }
}

struct Base64Encoder {
    /// Binary payloads only need the base64 leg on the text (JSON) wire.
    text_wire: bool,
}

impl PayloadEncoder for Base64Encoder {
    fn claims(&self, label: &str) -> bool {
        label == "base64"
    }

    fn encode(&self, data: &mut Data, labels: &mut EncodingList) -> Result<(), CodecError> {
        if !self.text_wire {
            return Ok(());
        }
        if let Data::Binary(bytes) = data {
            let encoded = BASE64.encode(bytes.as_slice());
            *data = Data::Text(encoded);
            labels.push("base64");
        }
        Ok(())
    }

    fn decode(&self, label: &str, data: &mut Data) -> Result<(), CodecError> {
        match std::mem::take(data) {
            Data::Text(text) => match BASE64.decode(text.as_bytes()) {
                Ok(bytes) => {
                    *data = Data::Binary(bytes);
                    Ok(())
                }
                Err(e) => {
                    *data = Data::Text(text);
                    Err(e.into())
                }
            },
            Data::Binary(raw) => match BASE64.decode(raw.as_slice()) {
                Ok(bytes) => {
                    *data = Data::Binary(bytes);
                    Ok(())
                }
                Err(e) => {
                    *data = Data::Binary(raw);
                    Err(e.into())
                }
            },
            other => {
                *data = other;
                Err(CodecError::MalformedEncodingLabel(label.to_owned()))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Anything carrying a `(data, encoding)` pair the pipeline can work on.
pub trait Encodable {
    fn payload_mut(&mut self) -> (&mut Data, &mut Option<String>);
}

impl Encodable for Message {
    fn payload_mut(&mut self) -> (&mut Data, &mut Option<String>) {
        (&mut self.data, &mut self.encoding)
    }
}

impl Encodable for PresenceMessage {
    fn payload_mut(&mut self) -> (&mut Data, &mut Option<String>) {
        (&mut self.data, &mut self.encoding)
    }
}

/// The ordered encoder chain for one channel on one connection.
///
/// Encode traverses the chain in declared order; decode peels trailing
/// labels, letting each encoder claim its own, until none remain.
pub struct CodecPipeline {
    encoders: Vec<Box<dyn PayloadEncoder>>,
}

impl CodecPipeline {
    pub fn new(options: &ChannelOptions, wire: WireFormat) -> Result<Self, CodecError> {
        let mut encoders: Vec<Box<dyn PayloadEncoder>> =
            vec![Box::new(JsonEncoder), Box::new(Utf8Encoder)];
        if options.encrypted {
            let params = options
                .cipher
                .as_ref()
                .ok_or(CodecError::EncryptionMisconfigured)?;
            encoders.push(Box::new(CipherEncoder::new(params.clone())?));
        }
        encoders.push(Box::new(Base64Encoder {
            text_wire: wire == WireFormat::Json,
        }));
        Ok(CodecPipeline { encoders })
    }

    /// Plaintext pipeline for the given wire format.
    pub fn plain(wire: WireFormat) -> Self {
        CodecPipeline::new(&ChannelOptions::default(), wire)
            .unwrap_or_else(|_| unreachable!("plain pipeline cannot misconfigure"))
    }

    /// Transform a payload into its wire-safe form, appending one label per
    /// transform. On error the message is left exactly as it was.
    pub fn encode(&self, item: &mut impl Encodable) -> Result<(), CodecError> {
        let (data, encoding) = item.payload_mut();
        let original = data.clone();
        let mut labels = EncodingList::from_field(encoding.as_deref());

        for encoder in &self.encoders {
            if let Err(e) = encoder.encode(data, &mut labels) {
                *data = original;
                return Err(e);
            }
        }
        *encoding = labels.into_field();
        Ok(())
    }

    /// Reverse the transforms named by the encoding field, right to left.
    ///
    /// On error the message keeps the partial decode result and the labels
    /// not yet consumed, so callers can surface a degraded message.
    pub fn decode(&self, item: &mut impl Encodable) -> Result<(), CodecError> {
        let (data, encoding) = item.payload_mut();
        let mut labels = EncodingList::from_field(encoding.as_deref());

        let result = loop {
            let Some(label) = labels.last().map(str::to_owned) else {
                break Ok(());
            };
            match self.encoders.iter().rev().find(|e| e.claims(&label)) {
                None => break Err(CodecError::MalformedEncodingLabel(label)),
                Some(encoder) => {
                    if let Err(e) = encoder.decode(&label, data) {
                        break Err(e);
                    }
                    labels.pop();
                }
            }
        };
        *encoding = labels.into_field();
        result
    }
}
