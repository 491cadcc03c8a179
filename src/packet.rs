//! KDE Connect network packets.
//!
//! A packet is a JSON object `{ "id": <int64 ms timestamp>, "type": "<string>",
//! "body": { ... } }` framed as one newline-terminated UTF-8 line.

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Packet type of the identity greeting.
pub const PACKET_TYPE_IDENTITY: &str = "kdeconnect.identity";

/// Packet type of pair/unpair requests and responses.
pub const PACKET_TYPE_PAIR: &str = "kdeconnect.pair";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    #[serde(deserialize_with = "deserialize_id", serialize_with = "serialize_id")]
    pub id: i64,

    #[serde(rename = "type")]
    pub packet_type: String,

    #[serde(default = "empty_body")]
    pub body: Value,
}

impl Packet {
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self {
            id: current_timestamp(),
            packet_type: packet_type.into(),
            body,
        }
    }

    /// Build a `kdeconnect.pair` packet carrying the pair/unpair flag.
    pub fn pair(pair: bool) -> Self {
        Self::new(PACKET_TYPE_PAIR, json!({ "pair": pair }))
    }

    /// Serialize to one newline-terminated line.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_string(self)?;
        let mut bytes = json.into_bytes();
        bytes.push(b'\n');
        Ok(bytes)
    }

    /// Parse one received line.
    ///
    /// Fails with [`ProtocolError::MalformedPacket`] when the line is not
    /// valid JSON, is missing `type`, or carries a non-object `body`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed: Vec<u8> = data
            .iter()
            .copied()
            .filter(|&b| b != 0)
            .collect::<Vec<u8>>();
        let trimmed = match std::str::from_utf8(&trimmed) {
            Ok(s) => s.trim(),
            Err(e) => return Err(ProtocolError::MalformedPacket(format!("not UTF-8: {e}"))),
        };

        let packet: Packet = serde_json::from_str(trimmed)
            .map_err(|e| ProtocolError::MalformedPacket(e.to_string()))?;

        if !packet.body.is_object() {
            return Err(ProtocolError::MalformedPacket(
                "body is not a JSON object".to_string(),
            ));
        }

        Ok(packet)
    }

    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Typed access to one body field.
    pub fn body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

fn empty_body() -> Value {
    Value::Object(Default::default())
}

// Some peers serialize the id as a string.
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Current UNIX timestamp in milliseconds, used as packet id.
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}
