//! Ephemeral presence state.
//!
//! Cursor positions and selections per client per document. Nothing here is
//! persisted or part of the CRDT; rows die with their connection, and a user
//! viewing two documents has two independent rows. The tracker owns state
//! and produces the deltas to fan out; transport stays with the router.

use crate::error::EngineError;
use grimoire_proto::{ClientId, DocId, PresenceMessage, PresenceState, PresenceUpdate};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
pub struct PresenceTracker {
    docs: RwLock<HashMap<DocId, HashMap<ClientId, PresenceState>>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates the client's row with no cursor and no selection. Co-viewers
    /// learn about it on its first delta.
    pub async fn join(&self, doc_id: &DocId, state: PresenceState) {
        self.docs
            .write()
            .await
            .entry(doc_id.clone())
            .or_default()
            .insert(state.client_id.clone(), state);
    }

    /// Current rows for a document, sorted by client id. Used to seed late
    /// joiners.
    pub async fn rows(&self, doc_id: &DocId) -> Vec<PresenceState> {
        let docs = self.docs.read().await;
        let mut rows: Vec<PresenceState> = docs
            .get(doc_id)
            .map(|clients| clients.values().cloned().collect())
            .unwrap_or_default();
        rows.sort_by(|a, b| a.client_id.cmp(&b.client_id));
        rows
    }

    /// Replaces the client's cursor position; `None` clears it. The index is
    /// not validated against document length (the document may have changed
    /// under the client); receivers render defensively. Returns the delta to
    /// fan out, or `None` for a client with no row.
    pub async fn set_cursor(
        &self,
        doc_id: &DocId,
        client_id: &ClientId,
        cursor_char: Option<u64>,
    ) -> Option<PresenceMessage> {
        let mut docs = self.docs.write().await;
        let row = docs.get_mut(doc_id)?.get_mut(client_id)?;
        row.cursor_char = cursor_char;
        Some(PresenceMessage {
            client_id: row.client_id.clone(),
            display_name: row.display_name.clone(),
            color: row.color.clone(),
            update: PresenceUpdate::Cursor { cursor_char },
        })
    }

    /// Replaces the client's selection; `None`/`None` clears it. A range
    /// with `start > end` is a validation error.
    pub async fn set_selection(
        &self,
        doc_id: &DocId,
        client_id: &ClientId,
        selection_start: Option<u64>,
        selection_end: Option<u64>,
    ) -> Result<Option<PresenceMessage>, EngineError> {
        if let (Some(start), Some(end)) = (selection_start, selection_end) {
            if start > end {
                return Err(EngineError::InvalidRange { start, end });
            }
        }
        let mut docs = self.docs.write().await;
        let Some(row) = docs
            .get_mut(doc_id)
            .and_then(|clients| clients.get_mut(client_id))
        else {
            return Ok(None);
        };
        row.selection_start = selection_start;
        row.selection_end = selection_end;
        Ok(Some(PresenceMessage {
            client_id: row.client_id.clone(),
            display_name: row.display_name.clone(),
            color: row.color.clone(),
            update: PresenceUpdate::Selection {
                selection_start,
                selection_end,
            },
        }))
    }

    /// Drops the client's row. Returns the leave delta to fan out if the
    /// row existed.
    pub async fn remove(&self, doc_id: &DocId, client_id: &ClientId) -> Option<PresenceMessage> {
        let mut docs = self.docs.write().await;
        let clients = docs.get_mut(doc_id)?;
        let row = clients.remove(client_id)?;
        if clients.is_empty() {
            docs.remove(doc_id);
        }
        Some(PresenceMessage {
            client_id: row.client_id,
            display_name: row.display_name,
            color: row.color,
            update: PresenceUpdate::Leave,
        })
    }
}
