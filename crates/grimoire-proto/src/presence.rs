//! Ephemeral presence payloads.
//!
//! Presence travels outside the CRDT: it is never persisted, ordering is
//! best-effort, and a row dies with its connection. Offsets are character
//! offsets into the extracted document text; receivers render defensively
//! because the document may have changed under the sender.

use crate::id::ClientId;
use serde::{Deserialize, Serialize};

/// One client's awareness row for one document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceState {
    pub client_id: ClientId,
    pub display_name: String,
    /// Cursor/selection color assigned to this client, as a CSS color token.
    pub color: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor_char: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_start: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selection_end: Option<u64>,
}

impl PresenceState {
    /// A fresh row with no cursor and no selection.
    pub fn new(
        client_id: ClientId,
        display_name: impl Into<String>,
        color: impl Into<String>,
    ) -> Self {
        Self {
            client_id,
            display_name: display_name.into(),
            color: color.into(),
            cursor_char: None,
            selection_start: None,
            selection_end: None,
        }
    }
}

/// The kind-specific part of a presence delta.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PresenceUpdate {
    /// Cursor moved; `None` clears it.
    Cursor {
        #[serde(skip_serializing_if = "Option::is_none")]
        cursor_char: Option<u64>,
    },
    /// Selection changed; `None`/`None` clears it.
    Selection {
        #[serde(skip_serializing_if = "Option::is_none")]
        selection_start: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        selection_end: Option<u64>,
    },
    /// The client left the document.
    Leave,
}

/// A presence delta as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceMessage {
    pub client_id: ClientId,
    pub display_name: String,
    pub color: String,
    #[serde(flatten)]
    pub update: PresenceUpdate,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(update: PresenceUpdate) -> PresenceMessage {
        PresenceMessage {
            client_id: ClientId::new("c1"),
            display_name: "Alice".to_string(),
            color: "#e8a33d".to_string(),
            update,
        }
    }

    #[test]
    fn test_cursor_message_shape() {
        let json = serde_json::to_value(message(PresenceUpdate::Cursor {
            cursor_char: Some(42),
        }))
        .unwrap();
        assert_eq!(json["kind"], "cursor");
        assert_eq!(json["client_id"], "c1");
        assert_eq!(json["cursor_char"], 42);
    }

    #[test]
    fn test_cleared_cursor_omits_offset() {
        let json = serde_json::to_value(message(PresenceUpdate::Cursor { cursor_char: None }))
            .unwrap();
        assert_eq!(json["kind"], "cursor");
        assert!(json.get("cursor_char").is_none());
    }

    #[test]
    fn test_leave_message_round_trip() {
        let msg = message(PresenceUpdate::Leave);
        let json = serde_json::to_string(&msg).unwrap();
        let back: PresenceMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_selection_round_trip() {
        let msg = message(PresenceUpdate::Selection {
            selection_start: Some(3),
            selection_end: Some(17),
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: PresenceMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}
