//! Message payload representation.
//!
//! Payloads are opaque to the protocol layer: a string, a byte blob, or a
//! structured JSON value. The codec pipeline is responsible for reducing a
//! payload to a wire-safe form (`Text` or `Binary`) before a frame is sent;
//! `Value` exists so user-supplied structured data can flow into the pipeline
//! and back out of it on decode.

use serde::de::{self, Deserializer, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};

/// An opaque message payload.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Data {
    /// No payload; serializes as absent.
    #[default]
    None,
    /// A text payload.
    Text(String),
    /// A binary payload. On the JSON wire this only appears pre-encode;
    /// the codec base64s it before the frame is serialized.
    Binary(Vec<u8>),
    /// A structured value (map, list, or scalar). Scalars are representable
    /// here but rejected by the codec with `PayloadTypeUnsupported`.
    Value(serde_json::Value),
}

impl Data {
    pub fn is_none(&self) -> bool {
        matches!(self, Data::None)
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Data::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            Data::Binary(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for Data {
    fn from(s: &str) -> Self {
        Data::Text(s.to_owned())
    }
}

impl From<String> for Data {
    fn from(s: String) -> Self {
        Data::Text(s)
    }
}

impl From<Vec<u8>> for Data {
    fn from(b: Vec<u8>) -> Self {
        Data::Binary(b)
    }
}

impl From<serde_json::Value> for Data {
    fn from(v: serde_json::Value) -> Self {
        Data::Value(v)
    }
}

impl Serialize for Data {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Data::None => serializer.serialize_unit(),
            Data::Text(s) => serializer.serialize_str(s),
            Data::Binary(b) => serializer.serialize_bytes(b),
            Data::Value(v) => v.serialize(serializer),
        }
    }
}

struct DataVisitor;

impl<'de> Visitor<'de> for DataVisitor {
    type Value = Data;

    fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("a string, byte array, or JSON value")
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<Data, E> {
        Ok(Data::Text(v.to_owned()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<Data, E> {
        Ok(Data::Text(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Data, E> {
        Ok(Data::Binary(v.to_vec()))
    }

    fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Data, E> {
        Ok(Data::Binary(v))
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<Data, E> {
        Ok(Data::Value(serde_json::Value::Bool(v)))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<Data, E> {
        Ok(Data::Value(serde_json::Value::from(v)))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<Data, E> {
        Ok(Data::Value(serde_json::Value::from(v)))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<Data, E> {
        Ok(Data::Value(serde_json::Value::from(v)))
    }

    fn visit_unit<E: de::Error>(self) -> Result<Data, E> {
        Ok(Data::None)
    }

    fn visit_none<E: de::Error>(self) -> Result<Data, E> {
        Ok(Data::None)
    }

    fn visit_some<D: Deserializer<'de>>(self, deserializer: D) -> Result<Data, D::Error> {
        deserializer.deserialize_any(DataVisitor)
    }

    fn visit_seq<A: de::SeqAccess<'de>>(self, seq: A) -> Result<Data, A::Error> {
        let value = serde_json::Value::deserialize(de::value::SeqAccessDeserializer::new(seq))?;
        Ok(Data::Value(value))
    }

    fn visit_map<A: de::MapAccess<'de>>(self, map: A) -> Result<Data, A::Error> {
        let value = serde_json::Value::deserialize(de::value::MapAccessDeserializer::new(map))?;
        Ok(Data::Value(value))
    }
}

impl<'de> Deserialize<'de> for Data {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Data, D::Error> {
        deserializer.deserialize_any(DataVisitor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_round_trips_through_json() {
        let d = Data::Text("hello".to_owned());
        let json = serde_json::to_string(&d).unwrap();
        assert_eq!(json, "\"hello\"");
        let back: Data = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn structured_values_survive_json() {
        let d = Data::Value(serde_json::json!({"a": [1, 2], "b": "x"}));
        let json = serde_json::to_string(&d).unwrap();
        let back: Data = serde_json::from_str(&json).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn json_scalars_deserialize_as_values() {
        let back: Data = serde_json::from_str("10").unwrap();
        assert_eq!(back, Data::Value(serde_json::json!(10)));
        let back: Data = serde_json::from_str("true").unwrap();
        assert_eq!(back, Data::Value(serde_json::json!(true)));
    }

    #[test]
    fn binary_round_trips_through_msgpack() {
        let d = Data::Binary(vec![1, 2, 3, 4, 5]);
        let bytes = rmp_serde::to_vec(&d).unwrap();
        let back: Data = rmp_serde::from_slice(&bytes).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn null_is_absent_payload() {
        let back: Data = serde_json::from_str("null").unwrap();
        assert!(back.is_none());
    }
}
