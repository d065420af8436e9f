//! Protocol message definitions

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

/// Wire-stable message type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Request,
    Response,
    Heartbeat,
    HeartbeatAck,
    Clipboard,
    Disconnect,
    Shutdown,
    FileChunkStart,
    FileChunkData,
    FileChunkComplete,
}

impl MessageType {
    pub const ALL: [MessageType; 10] = [
        MessageType::Request,
        MessageType::Response,
        MessageType::Heartbeat,
        MessageType::HeartbeatAck,
        MessageType::Clipboard,
        MessageType::Disconnect,
        MessageType::Shutdown,
        MessageType::FileChunkStart,
        MessageType::FileChunkData,
        MessageType::FileChunkComplete,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Request => "request",
            MessageType::Response => "response",
            MessageType::Heartbeat => "heartbeat",
            MessageType::HeartbeatAck => "heartbeat_ack",
            MessageType::Clipboard => "clipboard",
            MessageType::Disconnect => "disconnect",
            MessageType::Shutdown => "shutdown",
            MessageType::FileChunkStart => "file_chunk_start",
            MessageType::FileChunkData => "file_chunk_data",
            MessageType::FileChunkComplete => "file_chunk_complete",
        }
    }

    /// Look up a tag as it appears on the wire
    pub fn from_wire(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == tag)
    }

    /// One-shot control messages close their connection after dispatch
    pub fn is_control(&self) -> bool {
        matches!(self, MessageType::Request | MessageType::Response)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw wire envelope: `{"type": ..., "data": ...}`
///
/// The type is kept as a string so that tags from newer peers decode
/// cleanly and can be dropped by the dispatcher instead of breaking the
/// stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl Envelope {
    /// Decode the payload into its typed message.
    pub fn into_message(self) -> Result<Message> {
        let kind = MessageType::from_wire(&self.kind)
            .ok_or_else(|| Error::UnknownMessageType(self.kind.clone()))?;

        let data = self.data;
        let message = match kind {
            MessageType::Request => Message::Request(serde_json::from_value(data)?),
            MessageType::Response => Message::Response(serde_json::from_value(data)?),
            MessageType::Heartbeat => Message::Heartbeat(serde_json::from_value(data)?),
            MessageType::HeartbeatAck => Message::HeartbeatAck,
            MessageType::Clipboard => Message::Clipboard(serde_json::from_value(data)?),
            MessageType::Disconnect => Message::Disconnect(serde_json::from_value(data)?),
            MessageType::Shutdown => Message::Shutdown,
            MessageType::FileChunkStart => Message::FileChunkStart(serde_json::from_value(data)?),
            MessageType::FileChunkData => Message::FileChunkData(serde_json::from_value(data)?),
            MessageType::FileChunkComplete => {
                Message::FileChunkComplete(serde_json::from_value(data)?)
            }
        };
        Ok(message)
    }
}

/// All protocol messages
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Ask a peer to approve a connection
    Request(ConnectionRequest),
    /// Peer's answer to a request
    Response(ConnectionResponse),
    Heartbeat(Heartbeat),
    HeartbeatAck,
    /// Clipboard text pushed by a peer
    Clipboard(ClipboardData),
    /// Peer is closing the session
    Disconnect(DisconnectNotice),
    /// Hub is exiting; all of its sessions end
    Shutdown,
    FileChunkStart(FileChunkStart),
    FileChunkData(FileChunkData),
    FileChunkComplete(FileChunkComplete),
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Message::Request(_) => MessageType::Request,
            Message::Response(_) => MessageType::Response,
            Message::Heartbeat(_) => MessageType::Heartbeat,
            Message::HeartbeatAck => MessageType::HeartbeatAck,
            Message::Clipboard(_) => MessageType::Clipboard,
            Message::Disconnect(_) => MessageType::Disconnect,
            Message::Shutdown => MessageType::Shutdown,
            Message::FileChunkStart(_) => MessageType::FileChunkStart,
            Message::FileChunkData(_) => MessageType::FileChunkData,
            Message::FileChunkComplete(_) => MessageType::FileChunkComplete,
        }
    }

    /// Serialize to a JSON envelope without an intermediate `Value`
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let kind = self.message_type().as_str();
        let bytes = match self {
            Message::Request(p) => encode(kind, Some(p)),
            Message::Response(p) => encode(kind, Some(p)),
            Message::Heartbeat(p) => encode(kind, Some(p)),
            Message::Clipboard(p) => encode(kind, Some(p)),
            Message::Disconnect(p) => encode(kind, Some(p)),
            Message::FileChunkStart(p) => encode(kind, Some(p)),
            Message::FileChunkData(p) => encode(kind, Some(p)),
            Message::FileChunkComplete(p) => encode(kind, Some(p)),
            Message::HeartbeatAck | Message::Shutdown => encode::<()>(kind, None),
        }?;
        Ok(bytes)
    }

    /// Deserialize a single envelope
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let envelope: Envelope = serde_json::from_slice(bytes)?;
        envelope.into_message()
    }
}

#[derive(Serialize)]
struct EnvelopeRef<'a, T: Serialize> {
    #[serde(rename = "type")]
    kind: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<&'a T>,
}

fn encode<T: Serialize>(kind: &'static str, data: Option<&T>) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&EnvelopeRef { kind, data })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub from_name: String,
    pub from_ip: String,
    #[serde(default)]
    pub from_mac: String,
    pub to_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionResponse {
    pub from_ip: String,
    #[serde(default)]
    pub from_mac: String,
    pub to_ip: String,
    pub accept: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub from_ip: String,
    /// Unix time in milliseconds. Peers that send a timestamp string
    /// decode as 0.
    #[serde(default, deserialize_with = "crate::protocol::serde_utils::lenient_timestamp::deserialize")]
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipboardData {
    pub from_ip: String,
    pub content: String,
    /// Unix time in seconds
    #[serde(default)]
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectNotice {
    pub from_ip: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkStart {
    pub file_id: String,
    pub file_name: String,
    pub total_size: u64,
    pub total_chunks: usize,
    pub checksum: String,
    pub from_ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkData {
    pub file_id: String,
    pub chunk_index: usize,
    #[serde(with = "crate::protocol::serde_utils::base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChunkComplete {
    pub file_id: String,
    pub checksum: String,
}

pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn unix_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let msg = Message::Request(ConnectionRequest {
            from_name: "desk".to_string(),
            from_ip: "10.0.0.2".to_string(),
            from_mac: String::new(),
            to_ip: "10.0.0.3".to_string(),
        });

        let value: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["type"], "request");
        assert_eq!(value["data"]["from_name"], "desk");
        assert_eq!(value["data"]["to_ip"], "10.0.0.3");
    }

    #[test]
    fn test_unit_messages_omit_data() {
        let bytes = Message::HeartbeatAck.to_bytes().unwrap();
        assert_eq!(bytes, br#"{"type":"heartbeat_ack"}"#);

        let decoded = Message::from_bytes(br#"{"type":"shutdown"}"#).unwrap();
        assert_eq!(decoded, Message::Shutdown);
    }

    #[test]
    fn test_chunk_data_is_base64() {
        let msg = Message::FileChunkData(FileChunkData {
            file_id: "f1".to_string(),
            chunk_index: 3,
            data: b"hello".to_vec(),
        });

        let value: Value = serde_json::from_slice(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(value["data"]["data"], "aGVsbG8=");

        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_heartbeat_with_timestamp_string_decodes() {
        let decoded = Message::from_bytes(
            br#"{"type":"heartbeat","data":{"from_ip":"10.0.0.4","timestamp":"2024-01-01T00:00:00Z"}}"#,
        )
        .unwrap();
        assert_eq!(
            decoded,
            Message::Heartbeat(Heartbeat { from_ip: "10.0.0.4".to_string(), timestamp: 0 })
        );
    }

    #[test]
    fn test_unknown_type_is_reported() {
        let result = Message::from_bytes(br#"{"type":"telepathy","data":{}}"#);
        assert!(matches!(result, Err(Error::UnknownMessageType(t)) if t == "telepathy"));
    }

    #[test]
    fn test_malformed_payload_is_serialization_error() {
        let result = Message::from_bytes(br#"{"type":"clipboard","data":{"content":7}}"#);
        assert!(matches!(result, Err(Error::Serialization(_))));
    }

    #[test]
    fn test_every_tag_roundtrips_through_from_wire() {
        for kind in MessageType::ALL {
            assert_eq!(MessageType::from_wire(kind.as_str()), Some(kind));
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind));
        }
        assert!(MessageType::Request.is_control());
        assert!(!MessageType::Heartbeat.is_control());
    }
}
