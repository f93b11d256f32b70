//! Framed messages exchanged between the engine and its clients.
//!
//! Messages are JSON objects with a `kind` discriminator. CRDT payloads are
//! opaque binary blobs (the CRDT library's v1 encoding) and travel base64
//! inside the JSON frame; the engine never inspects their structure.

use crate::id::ClientId;
use crate::presence::{PresenceMessage, PresenceUpdate};
use serde::{Deserialize, Serialize};

/// Base64 (de)serialization for binary CRDT payloads inside JSON frames.
mod blob {
    use base64::Engine as _;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Error categories reported to clients and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRange,
    InvalidTag,
    DocumentTooLarge,
    MalformedUpdate,
    UnknownHighlight,
    Protocol,
    Persistence,
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::InvalidRange => "invalid_range",
            ErrorCode::InvalidTag => "invalid_tag",
            ErrorCode::DocumentTooLarge => "document_too_large",
            ErrorCode::MalformedUpdate => "malformed_update",
            ErrorCode::UnknownHighlight => "unknown_highlight",
            ErrorCode::Protocol => "protocol",
            ErrorCode::Persistence => "persistence",
            ErrorCode::Internal => "internal",
        }
    }
}

/// Messages flowing server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full CRDT state, sent once when the client joins a document.
    Snapshot {
        #[serde(with = "blob")]
        state: Vec<u8>,
    },
    /// An incremental CRDT update originated by a peer (or the server).
    Update {
        #[serde(with = "blob")]
        update: Vec<u8>,
    },
    /// An ephemeral presence delta from a co-viewer.
    Presence { presence: PresenceMessage },
    /// A dropped message or rejected operation.
    Error { code: ErrorCode, message: String },
}

/// Messages flowing client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClientMessage {
    /// A CRDT update produced by the client's local replica.
    Update {
        #[serde(with = "blob")]
        update: Vec<u8>,
    },
    /// A presence delta for this client.
    Presence { presence: PresenceUpdate },
}

impl ServerMessage {
    /// Encodes the message as a JSON frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a JSON frame.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

impl ClientMessage {
    /// Encodes the message as a JSON frame.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Decodes a JSON frame.
    pub fn decode(frame: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(frame)
    }
}

/// Metadata stored next to the persisted state blob.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveMetadata {
    pub highlight_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_editor: Option<ClientId>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_frame_is_base64() {
        let msg = ServerMessage::Snapshot {
            state: vec![0, 1, 2, 255],
        };
        let frame = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["kind"], "snapshot");
        assert_eq!(value["state"], "AAEC/w==");
        assert_eq!(ServerMessage::decode(&frame).unwrap(), msg);
    }

    #[test]
    fn test_update_frame_round_trip() {
        let msg = ClientMessage::Update {
            update: vec![7; 32],
        };
        let back = ClientMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_error_frame_shape() {
        let msg = ServerMessage::Error {
            code: ErrorCode::MalformedUpdate,
            message: "truncated update".to_string(),
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "error");
        assert_eq!(value["code"], "malformed_update");
    }

    #[test]
    fn test_presence_frame_nests_payload() {
        let msg = ClientMessage::Presence {
            presence: PresenceUpdate::Cursor {
                cursor_char: Some(9),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&msg.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "presence");
        assert_eq!(value["presence"]["kind"], "cursor");
        assert_eq!(value["presence"]["cursor_char"], 9);
    }

    #[test]
    fn test_corrupt_base64_is_rejected() {
        let frame = r#"{"kind":"update","update":"$$not-base64$$"}"#;
        assert!(ServerMessage::decode(frame).is_err());
    }

    #[test]
    fn test_save_metadata_omits_absent_editor() {
        let meta = SaveMetadata {
            highlight_count: 3,
            last_editor: None,
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("last_editor"));
    }
}
