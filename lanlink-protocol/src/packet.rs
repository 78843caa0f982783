//! Network Packet
//!
//! Packets are JSON objects written on a single line and terminated by `\n`.
//!
//! ## Packet Structure
//!
//! Each packet contains:
//! - `id`: UNIX epoch timestamp in milliseconds
//! - `type`: Packet type in format `kdeconnect.<plugin>[.<action>]`
//! - `body`: JSON dictionary of plugin-specific parameters
//! - `payloadSize`: (optional) Size of payload data in bytes
//! - `payloadTransferInfo`: (optional) Transfer negotiation parameters, e.g. `{"port": 1739}`

use crate::{ProtocolError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Represents a network packet
///
/// # Examples
///
/// ```
/// use lanlink_protocol::Packet;
/// use serde_json::json;
///
/// let packet = Packet::new("kdeconnect.ping", json!({ "message": "hi" }));
///
/// let line = packet.serialize().unwrap();
/// assert!(line.ends_with('\n'));
///
/// let parsed = Packet::parse(&line).unwrap();
/// assert_eq!(parsed, packet);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Packet {
    /// UNIX timestamp in milliseconds
    /// Note: Some clients send this as a string
    #[serde(
        default,
        deserialize_with = "deserialize_id",
        serialize_with = "serialize_id"
    )]
    pub id: i64,

    /// Packet type in format: kdeconnect.<plugin>[.<action>]
    #[serde(rename = "type")]
    pub packet_type: String,

    /// Plugin-specific parameters
    pub body: Map<String, Value>,

    /// Optional payload size in bytes (-1 for indefinite streams)
    #[serde(rename = "payloadSize", skip_serializing_if = "Option::is_none")]
    pub payload_size: Option<i64>,

    /// Optional payload transfer negotiation info
    #[serde(
        rename = "payloadTransferInfo",
        skip_serializing_if = "Option::is_none"
    )]
    pub payload_transfer_info: Option<Map<String, Value>>,
}

impl Packet {
    /// Creates a new packet with the specified type and body
    ///
    /// The packet ID is set to the current timestamp in milliseconds. Non-object
    /// bodies are replaced by an empty map.
    pub fn new(packet_type: impl Into<String>, body: Value) -> Self {
        Self::with_id(current_timestamp(), packet_type, body)
    }

    /// Create a new packet with an explicit id
    pub fn with_id(id: i64, packet_type: impl Into<String>, body: Value) -> Self {
        let body = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };

        Self {
            id,
            packet_type: packet_type.into(),
            body,
            payload_size: None,
            payload_transfer_info: None,
        }
    }

    /// Parse one line of stream data
    ///
    /// A single trailing `\n` or `\r\n` is accepted. Anything that is not a JSON
    /// object with a string `type` and an object `body` is rejected.
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::MalformedPacket` describing the decode failure.
    pub fn parse(line: &str) -> Result<Self> {
        Self::from_bytes(line.as_bytes())
    }

    /// Serialize to a single newline-terminated line
    ///
    /// Compact JSON never contains a raw newline (string contents are escaped),
    /// so the only `\n` in the output is the terminator.
    pub fn serialize(&self) -> Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }

    /// Serialize packet to bytes with newline terminator
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(self.serialize()?.into_bytes())
    }

    /// Deserialize a packet from bytes
    ///
    /// Accepts both `\r\n` and `\n` terminators, or none at all.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let trimmed = data
            .strip_suffix(b"\r\n")
            .or_else(|| data.strip_suffix(b"\n"))
            .unwrap_or(data);

        serde_json::from_slice(trimmed).map_err(|e| ProtocolError::MalformedPacket(e.to_string()))
    }

    /// Return a copy carrying a payload descriptor
    ///
    /// `transfer_info` becomes `payloadTransferInfo`, typically `{"port": N}`.
    pub fn with_payload(&self, size: i64, transfer_info: Map<String, Value>) -> Self {
        let mut packet = self.clone();
        packet.payload_size = Some(size);
        packet.payload_transfer_info = Some(transfer_info);
        packet
    }

    /// Builder pattern: Add a key-value pair to the body
    pub fn with_body_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.body.insert(key.into(), value.into());
        self
    }

    /// Set a body field in place (local enrichment such as `tcpHost`)
    pub fn set_body_field(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.body.insert(key.into(), value.into());
    }

    /// Check if packet is of a specific type
    pub fn is_type(&self, packet_type: &str) -> bool {
        self.packet_type == packet_type
    }

    /// Get a field from the body as a specific type
    pub fn get_body_field<T>(&self, key: &str) -> Option<T>
    where
        T: serde::de::DeserializeOwned,
    {
        self.body
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    /// Port announced in `payloadTransferInfo`, if any
    pub fn transfer_port(&self) -> Option<u16> {
        self.payload_transfer_info
            .as_ref()
            .and_then(|info| info.get("port"))
            .and_then(Value::as_u64)
            .and_then(|port| u16::try_from(port).ok())
    }
}

/// Custom deserializer for the `id` field to handle both string and number formats
fn deserialize_id<'de, D>(deserializer: D) -> std::result::Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;

    let value: Value = Deserialize::deserialize(deserializer)?;
    match value {
        Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| Error::custom("Invalid number for id")),
        Value::String(s) => s
            .parse::<i64>()
            .map_err(|_| Error::custom("Invalid string for id")),
        _ => Err(Error::custom("id must be a number or string")),
    }
}

/// Custom serializer for the `id` field - always serialize as a number
fn serialize_id<S>(id: &i64, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_i64(*id)
}

/// Generate current UNIX timestamp in milliseconds
pub fn current_timestamp() -> i64 {
    Utc::now().timestamp_millis()
}
