//! The per-document CRDT replica.
//!
//! One [`AnnotationReplica`] wraps one CRDT document holding five named
//! roots: the highlights map (highlight-id → record), the per-tag display
//! order, presence metadata for connected clients, and two collaborative
//! text fields (response draft and general notes). Mutations go through the
//! operation methods below; every committed transaction is published to the
//! update bus tagged with its origin so the router can suppress echo and the
//! persistence manager can debounce saves.
//!
//! Highlight records cross the API boundary as value copies. Live CRDT node
//! references never escape this module; their validity is tied to the
//! enclosing document.

use crate::error::EngineError;
use crate::events::{META_ORIGIN, ReplicaUpdate, UpdateOrigin};
use chrono::Utc;
use grimoire_proto::{ClientId, DocId, HighlightId, Tag};
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::broadcast;
use tracing::warn;
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, Doc, GetString, Map, MapPrelim, MapRef, Out, ReadTxn,
    StateVector, Subscription, Text, Transact, TransactionMut, Update,
};

const HIGHLIGHTS: &str = "highlights";
const TAG_ORDER: &str = "tag_order";
const CLIENT_META: &str = "client_meta";
const RESPONSE_DRAFT: &str = "response_draft_markdown";
const GENERAL_NOTES: &str = "general_notes";

/// A highlight as read out of the replica. A plain value copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Highlight {
    pub id: HighlightId,
    pub start_char: u64,
    pub end_char: u64,
    pub tag: Tag,
    /// The highlighted substring, stored for display and search. Canonical
    /// position is the char range.
    pub text: String,
    /// Display name of the creator; not an identity claim.
    pub author: String,
    /// ISO-8601 UTC creation stamp.
    pub created_at: String,
    /// `"[N]"`, `"[N]-[M]"`, or empty. Computed once at creation and only
    /// changed by an explicit update.
    pub para_ref: String,
    /// Which source document this range refers to, when a workspace holds
    /// several.
    pub document_id: String,
    pub comments: Vec<Comment>,
}

/// A threaded comment on a highlight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comment {
    pub author: String,
    pub text: String,
    pub created_at: String,
}

/// Inputs for creating a highlight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighlightDraft {
    pub start_char: u64,
    pub end_char: u64,
    pub tag: Tag,
    pub text: String,
    pub author: String,
    pub para_ref: String,
    pub document_id: String,
}

struct DocState {
    _update_sub: Subscription,
    doc: Doc,
}

impl std::fmt::Debug for AnnotationReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnnotationReplica")
            .field("doc_id", &self.doc_id)
            .finish_non_exhaustive()
    }
}

/// The in-memory CRDT document for one workspace id.
pub struct AnnotationReplica {
    doc_id: DocId,
    updates: broadcast::Sender<ReplicaUpdate>,
    state: Mutex<DocState>,
}

impl AnnotationReplica {
    /// Creates an empty replica publishing into `updates`.
    pub fn new(
        doc_id: DocId,
        updates: broadcast::Sender<ReplicaUpdate>,
    ) -> Result<Self, EngineError> {
        Self::build(doc_id, updates, None)
    }

    /// Creates a replica seeded from persisted state bytes. The seed is
    /// applied before the update observer attaches, so cold loading never
    /// marks the document dirty; persisted presence metadata is wiped.
    pub fn from_snapshot(
        doc_id: DocId,
        updates: broadcast::Sender<ReplicaUpdate>,
        state: &[u8],
    ) -> Result<Self, EngineError> {
        Self::build(doc_id, updates, Some(state))
    }

    fn build(
        doc_id: DocId,
        updates: broadcast::Sender<ReplicaUpdate>,
        seed: Option<&[u8]>,
    ) -> Result<Self, EngineError> {
        let doc = Doc::new();
        let _ = doc.get_or_insert_map(HIGHLIGHTS);
        let _ = doc.get_or_insert_map(TAG_ORDER);
        let _ = doc.get_or_insert_map(CLIENT_META);
        let _ = doc.get_or_insert_text(RESPONSE_DRAFT);
        let _ = doc.get_or_insert_text(GENERAL_NOTES);

        if let Some(bytes) = seed {
            let update =
                Update::decode_v1(bytes).map_err(|e| EngineError::Load(e.to_string()))?;
            let mut txn = doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| EngineError::Load(e.to_string()))?;
        }

        // client_meta reflects live connections only; a snapshot taken by a
        // previous process may still carry rows
        {
            let meta = doc.get_or_insert_map(CLIENT_META);
            let mut txn = doc.transact_mut();
            let stale: Vec<String> = meta.keys(&txn).map(str::to_string).collect();
            for key in stale {
                meta.remove(&mut txn, &key);
            }
        }

        let subscription = {
            let tx = updates.clone();
            let observed_doc_id = doc_id.clone();
            doc.observe_update_v1(move |txn, event| {
                let origin = UpdateOrigin::from_txn(txn.origin());
                let _ = tx.send(ReplicaUpdate {
                    doc_id: observed_doc_id.clone(),
                    update: event.update.clone(),
                    origin,
                });
            })
            .map_err(|e| EngineError::Internal(format!("update observer: {e}")))?
        };

        Ok(Self {
            doc_id,
            updates,
            state: Mutex::new(DocState {
                _update_sub: subscription,
                doc,
            }),
        })
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    fn txn<'a>(doc: &'a Doc, origin: Option<&ClientId>) -> TransactionMut<'a> {
        match origin {
            Some(client) => doc.transact_mut_with(client.as_str()),
            None => doc.transact_mut(),
        }
    }

    fn meta_txn(doc: &Doc) -> TransactionMut<'_> {
        doc.transact_mut_with(META_ORIGIN)
    }

    // ─── Highlight operations ────────────────────────────────────────────

    /// Creates a highlight and appends it to its tag's display order.
    /// Returns the server-issued id.
    pub fn add_highlight(
        &self,
        draft: HighlightDraft,
        origin: Option<&ClientId>,
    ) -> Result<HighlightId, EngineError> {
        if draft.start_char > draft.end_char {
            return Err(EngineError::InvalidRange {
                start: draft.start_char,
                end: draft.end_char,
            });
        }
        if draft.tag.is_empty() {
            return Err(EngineError::InvalidTag("empty tag".to_string()));
        }

        let id = HighlightId::generate();
        let record = Highlight {
            id: id.clone(),
            start_char: draft.start_char,
            end_char: draft.end_char,
            tag: draft.tag,
            text: draft.text,
            author: draft.author,
            created_at: Utc::now().to_rfc3339(),
            para_ref: draft.para_ref,
            document_id: draft.document_id,
            comments: Vec::new(),
        };

        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let tag_order = state.doc.get_or_insert_map(TAG_ORDER);
        let mut txn = Self::txn(&state.doc, origin);
        write_highlight_entry(&highlights, &mut txn, &id, &record);

        let tag_key = record.tag.to_string();
        let order = match tag_order
            .get(&txn, &tag_key)
            .and_then(|value| value.cast::<ArrayRef>().ok())
        {
            Some(existing) => existing,
            None => tag_order.insert(&mut txn, tag_key, ArrayPrelim::default()),
        };
        order.push_back(&mut txn, id.as_str());
        Ok(id)
    }

    /// Removes a highlight and scrubs every tag-order reference to it.
    /// Returns whether the highlight existed.
    pub fn remove_highlight(&self, id: &HighlightId, origin: Option<&ClientId>) -> bool {
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let tag_order = state.doc.get_or_insert_map(TAG_ORDER);
        let mut txn = Self::txn(&state.doc, origin);
        if highlights.remove(&mut txn, id.as_str()).is_none() {
            return false;
        }
        scrub_tag_order(&tag_order, &mut txn, |candidate| candidate == id.as_str());
        true
    }

    /// Removes every highlight carrying `tag` plus the tag's order entry.
    /// Used when the workspace deletes a tag from its catalogue. Returns the
    /// number of highlights removed.
    pub fn remove_highlights_with_tag(&self, tag: &Tag, origin: Option<&ClientId>) -> usize {
        let tag_key = tag.to_string();
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let tag_order = state.doc.get_or_insert_map(TAG_ORDER);
        let mut txn = Self::txn(&state.doc, origin);

        let doomed: Vec<String> = highlights
            .iter(&txn)
            .filter_map(|(id, value)| {
                let entry = value.cast::<MapRef>().ok()?;
                (map_string(&entry, &txn, "tag") == tag_key).then(|| id.to_string())
            })
            .collect();
        if doomed.is_empty() && tag_order.get(&txn, &tag_key).is_none() {
            return 0;
        }
        for id in &doomed {
            highlights.remove(&mut txn, id);
        }
        tag_order.remove(&mut txn, &tag_key);
        // the removed highlights may appear in other tags' orders too
        scrub_tag_order(&tag_order, &mut txn, |candidate| {
            doomed.iter().any(|id| id == candidate)
        });
        doomed.len()
    }

    /// Appends a comment to a highlight. Returns false (and changes
    /// nothing) when the highlight is absent.
    pub fn add_comment(
        &self,
        highlight_id: &HighlightId,
        author: &str,
        text: &str,
        origin: Option<&ClientId>,
    ) -> bool {
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let mut txn = Self::txn(&state.doc, origin);
        let Some(comments) = highlights
            .get(&txn, highlight_id.as_str())
            .and_then(|value| value.cast::<MapRef>().ok())
            .and_then(|entry| entry.get(&txn, "comments")?.cast::<ArrayRef>().ok())
        else {
            return false;
        };
        comments.push_back(
            &mut txn,
            comment_record(author, text, &Utc::now().to_rfc3339()),
        );
        true
    }

    /// Removes the comment at a zero-based position. Returns false on an
    /// absent highlight or out-of-range index.
    pub fn delete_comment(
        &self,
        highlight_id: &HighlightId,
        index: usize,
        origin: Option<&ClientId>,
    ) -> bool {
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let mut txn = Self::txn(&state.doc, origin);
        let Some(comments) = highlights
            .get(&txn, highlight_id.as_str())
            .and_then(|value| value.cast::<MapRef>().ok())
            .and_then(|entry| entry.get(&txn, "comments")?.cast::<ArrayRef>().ok())
        else {
            return false;
        };
        let len = comments.len(&txn) as usize;
        if index >= len {
            return false;
        }
        comments.remove(&mut txn, index as u32);
        true
    }

    /// Rewrites only the paragraph reference of a highlight, preserving
    /// every other field. Returns whether the highlight was found.
    pub fn update_highlight_para_ref(
        &self,
        id: &HighlightId,
        new_ref: &str,
        origin: Option<&ClientId>,
    ) -> bool {
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let mut txn = Self::txn(&state.doc, origin);
        let Some(entry) = highlights
            .get(&txn, id.as_str())
            .and_then(|value| value.cast::<MapRef>().ok())
        else {
            return false;
        };
        entry.insert(&mut txn, "para_ref", new_ref);
        true
    }

    /// Replaces a tag's display order. Every id must resolve to an existing
    /// highlight or the whole operation is rejected.
    pub fn set_tag_order(
        &self,
        tag: &Tag,
        ids: &[HighlightId],
        origin: Option<&ClientId>,
    ) -> Result<(), EngineError> {
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let tag_order = state.doc.get_or_insert_map(TAG_ORDER);
        let mut txn = Self::txn(&state.doc, origin);
        for id in ids {
            if highlights.get(&txn, id.as_str()).is_none() {
                return Err(EngineError::UnknownHighlight(id.to_string()));
            }
        }
        let order = tag_order.insert(&mut txn, tag.to_string(), ArrayPrelim::default());
        for id in ids {
            order.push_back(&mut txn, id.as_str());
        }
        Ok(())
    }

    // ─── Scalar fields ───────────────────────────────────────────────────

    /// Replaces the collaborative response draft.
    pub fn set_response_draft(&self, markdown: &str, origin: Option<&ClientId>) {
        self.replace_text_root(RESPONSE_DRAFT, markdown, origin);
    }

    /// Replaces the general notes.
    pub fn set_general_notes(&self, text: &str, origin: Option<&ClientId>) {
        self.replace_text_root(GENERAL_NOTES, text, origin);
    }

    fn replace_text_root(&self, root: &str, text: &str, origin: Option<&ClientId>) {
        let state = self.state.lock();
        let field = state.doc.get_or_insert_text(root);
        let current = {
            let txn = state.doc.transact();
            field.get_string(&txn)
        };
        if current == text {
            return;
        }
        let mut txn = Self::txn(&state.doc, origin);
        let len = field.len(&txn);
        if len > 0 {
            field.remove_range(&mut txn, 0, len);
        }
        if !text.is_empty() {
            field.insert(&mut txn, 0, text);
        }
    }

    // ─── Presence metadata ───────────────────────────────────────────────

    /// Upserts a connected client's display metadata. Replicates to
    /// co-viewers but never dirties the document for persistence.
    pub fn register_client(&self, client_id: &ClientId, display_name: &str, color: &str) {
        let state = self.state.lock();
        let meta = state.doc.get_or_insert_map(CLIENT_META);
        let mut txn = Self::meta_txn(&state.doc);
        let mut fields = HashMap::new();
        fields.insert("display_name".to_string(), Any::from(display_name));
        fields.insert("color".to_string(), Any::from(color));
        meta.insert(&mut txn, client_id.as_str(), Any::from(fields));
    }

    /// Drops a client's metadata row. Returns whether it existed.
    pub fn unregister_client(&self, client_id: &ClientId) -> bool {
        let state = self.state.lock();
        let meta = state.doc.get_or_insert_map(CLIENT_META);
        let mut txn = Self::meta_txn(&state.doc);
        meta.remove(&mut txn, client_id.as_str()).is_some()
    }

    /// Connected clients' display metadata: `client_id → (name, color)`.
    pub fn client_meta(&self) -> HashMap<ClientId, (String, String)> {
        let state = self.state.lock();
        let meta = state.doc.get_or_insert_map(CLIENT_META);
        let txn = state.doc.transact();
        meta.iter(&txn)
            .filter_map(|(client_id, value)| match value {
                Out::Any(Any::Map(fields)) => Some((
                    ClientId::new(client_id),
                    (
                        any_map_string(&fields, "display_name"),
                        any_map_string(&fields, "color"),
                    ),
                )),
                _ => None,
            })
            .collect()
    }

    // ─── Remote updates and snapshots ────────────────────────────────────

    /// Integrates a peer's update blob, then runs the cheap self-repair
    /// pass. Applying the same blob twice is a no-op.
    pub fn apply_remote_update(
        &self,
        update: &[u8],
        origin: Option<&ClientId>,
    ) -> Result<(), EngineError> {
        let decoded =
            Update::decode_v1(update).map_err(|e| EngineError::MalformedUpdate(e.to_string()))?;
        let state = self.state.lock();
        {
            let mut txn = Self::txn(&state.doc, origin);
            txn.apply_update(decoded)
                .map_err(|e| EngineError::MalformedUpdate(e.to_string()))?;
        }
        self.repair(&state);
        Ok(())
    }

    /// Full CRDT state, suitable for persistence and cold loading.
    pub fn snapshot(&self) -> Vec<u8> {
        let state = self.state.lock();
        let txn = state.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Prunes tag-order entries referencing absent highlights. Concurrent
    /// remove-vs-reorder races leave these behind; the linear pass is cheap
    /// at realistic sizes, so no reverse index is kept.
    fn repair(&self, state: &DocState) {
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let tag_order = state.doc.get_or_insert_map(TAG_ORDER);

        let dangling: Vec<(String, Vec<u32>)> = {
            let txn = state.doc.transact();
            tag_order
                .iter(&txn)
                .filter_map(|(tag_key, value)| {
                    let order = value.cast::<ArrayRef>().ok()?;
                    let stale: Vec<u32> = order
                        .iter(&txn)
                        .enumerate()
                        .filter_map(|(index, item)| {
                            let exists = match &item {
                                Out::Any(Any::String(id)) => {
                                    highlights.get(&txn, id.as_ref()).is_some()
                                }
                                _ => false,
                            };
                            (!exists).then_some(index as u32)
                        })
                        .collect();
                    (!stale.is_empty()).then(|| (tag_key.to_string(), stale))
                })
                .collect()
        };
        if dangling.is_empty() {
            return;
        }

        warn!(doc_id = %self.doc_id, "pruning dangling tag order references");
        let mut txn = state.doc.transact_mut();
        for (tag_key, indices) in dangling {
            let Some(order) = tag_order
                .get(&txn, &tag_key)
                .and_then(|value| value.cast::<ArrayRef>().ok())
            else {
                continue;
            };
            for index in indices.into_iter().rev() {
                order.remove(&mut txn, index);
            }
        }
    }

    // ─── Reads ───────────────────────────────────────────────────────────

    /// A value copy of one highlight.
    pub fn highlight(&self, id: &HighlightId) -> Option<Highlight> {
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let txn = state.doc.transact();
        let entry = highlights
            .get(&txn, id.as_str())
            .and_then(|value| value.cast::<MapRef>().ok())?;
        Some(read_highlight(&txn, id.as_str(), &entry))
    }

    /// Value copies of all highlights, ordered by (start, end, id).
    pub fn highlights(&self) -> Vec<Highlight> {
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let txn = state.doc.transact();
        let mut out: Vec<Highlight> = highlights
            .iter(&txn)
            .filter_map(|(id, value)| {
                let entry = value.cast::<MapRef>().ok()?;
                Some(read_highlight(&txn, id, &entry))
            })
            .collect();
        out.sort_by(|a, b| {
            (a.start_char, a.end_char, a.id.as_str()).cmp(&(b.start_char, b.end_char, b.id.as_str()))
        });
        out
    }

    pub fn highlight_count(&self) -> usize {
        let state = self.state.lock();
        let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
        let txn = state.doc.transact();
        highlights.len(&txn) as usize
    }

    /// The display order for one tag.
    pub fn tag_order_for(&self, tag: &Tag) -> Vec<HighlightId> {
        let state = self.state.lock();
        let tag_order = state.doc.get_or_insert_map(TAG_ORDER);
        let txn = state.doc.transact();
        read_order(&tag_order, &txn, &tag.to_string())
    }

    /// Every tag's display order, sorted by tag for determinism.
    pub fn tag_orders(&self) -> Vec<(Tag, Vec<HighlightId>)> {
        let state = self.state.lock();
        let tag_order = state.doc.get_or_insert_map(TAG_ORDER);
        let txn = state.doc.transact();
        let mut out: Vec<(Tag, Vec<HighlightId>)> = tag_order
            .iter(&txn)
            .map(|(tag_key, _)| {
                let ids = read_order(&tag_order, &txn, tag_key);
                (Tag::parse(tag_key), ids)
            })
            .collect();
        out.sort_by(|a, b| a.0.to_string().cmp(&b.0.to_string()));
        out
    }

    pub fn response_draft(&self) -> String {
        self.read_text_root(RESPONSE_DRAFT)
    }

    pub fn general_notes(&self) -> String {
        self.read_text_root(GENERAL_NOTES)
    }

    fn read_text_root(&self, root: &str) -> String {
        let state = self.state.lock();
        let field = state.doc.get_or_insert_text(root);
        let txn = state.doc.transact();
        field.get_string(&txn)
    }

    // ─── Cloning ─────────────────────────────────────────────────────────

    /// Clones this replica into a fresh one bound to `doc_id`. Copies
    /// highlights (with renewed ids), comments, tag orders, the response
    /// draft, and general notes; excludes `client_meta`. When a remap table
    /// is given, UUID tags are rewritten through it; legacy string tags pass
    /// through unchanged.
    pub fn clone_into(
        &self,
        doc_id: DocId,
        tag_remap: Option<&HashMap<Uuid, Uuid>>,
    ) -> Result<AnnotationReplica, EngineError> {
        let clone = AnnotationReplica::new(doc_id, self.updates.clone())?;

        let source_highlights = self.highlights();
        let mut id_map: HashMap<HighlightId, HighlightId> = HashMap::new();
        {
            let state = clone.state.lock();
            let highlights = state.doc.get_or_insert_map(HIGHLIGHTS);
            let mut txn = state.doc.transact_mut();
            for source in &source_highlights {
                let new_id = HighlightId::generate();
                let record = Highlight {
                    id: new_id.clone(),
                    tag: remap_tag(&source.tag, tag_remap),
                    ..source.clone()
                };
                write_highlight_entry(&highlights, &mut txn, &new_id, &record);
                id_map.insert(source.id.clone(), new_id);
            }
        }

        let source_orders = self.tag_orders();
        {
            let state = clone.state.lock();
            let tag_order = state.doc.get_or_insert_map(TAG_ORDER);
            let mut txn = state.doc.transact_mut();
            for (tag, ids) in source_orders {
                let tag = remap_tag(&tag, tag_remap);
                let order = tag_order.insert(&mut txn, tag.to_string(), ArrayPrelim::default());
                for id in ids {
                    if let Some(new_id) = id_map.get(&id) {
                        order.push_back(&mut txn, new_id.as_str());
                    }
                }
            }
        }

        clone.set_response_draft(&self.response_draft(), None);
        clone.set_general_notes(&self.general_notes(), None);
        Ok(clone)
    }
}

fn remap_tag(tag: &Tag, remap: Option<&HashMap<Uuid, Uuid>>) -> Tag {
    match (tag, remap) {
        (Tag::Uuid(id), Some(table)) => Tag::Uuid(table.get(id).copied().unwrap_or(*id)),
        _ => tag.clone(),
    }
}

fn write_highlight_entry(
    highlights: &MapRef,
    txn: &mut TransactionMut<'_>,
    id: &HighlightId,
    record: &Highlight,
) {
    let entry = highlights.insert(txn, id.as_str(), MapPrelim::default());
    entry.insert(txn, "start_char", record.start_char as i64);
    entry.insert(txn, "end_char", record.end_char as i64);
    entry.insert(txn, "tag", record.tag.to_string());
    entry.insert(txn, "text", record.text.as_str());
    entry.insert(txn, "author", record.author.as_str());
    entry.insert(txn, "created_at", record.created_at.as_str());
    entry.insert(txn, "para_ref", record.para_ref.as_str());
    entry.insert(txn, "document_id", record.document_id.as_str());
    let comments = entry.insert(txn, "comments", ArrayPrelim::default());
    for comment in &record.comments {
        comments.push_back(
            txn,
            comment_record(&comment.author, &comment.text, &comment.created_at),
        );
    }
}

fn comment_record(author: &str, text: &str, created_at: &str) -> Any {
    let mut fields = HashMap::new();
    fields.insert("author".to_string(), Any::from(author));
    fields.insert("text".to_string(), Any::from(text));
    fields.insert("created_at".to_string(), Any::from(created_at));
    Any::from(fields)
}

fn scrub_tag_order(
    tag_order: &MapRef,
    txn: &mut TransactionMut<'_>,
    mut is_doomed: impl FnMut(&str) -> bool,
) {
    let tag_keys: Vec<String> = tag_order.keys(txn).map(str::to_string).collect();
    for tag_key in tag_keys {
        let Some(order) = tag_order
            .get(txn, &tag_key)
            .and_then(|value| value.cast::<ArrayRef>().ok())
        else {
            continue;
        };
        let mut index = 0u32;
        while index < order.len(txn) {
            let doomed = matches!(
                order.get(txn, index),
                Some(Out::Any(Any::String(candidate))) if is_doomed(candidate.as_ref())
            );
            if doomed {
                order.remove(txn, index);
            } else {
                index += 1;
            }
        }
    }
}

fn read_highlight(txn: &impl ReadTxn, id: &str, entry: &MapRef) -> Highlight {
    Highlight {
        id: HighlightId::new(id),
        start_char: map_offset(entry, txn, "start_char"),
        end_char: map_offset(entry, txn, "end_char"),
        tag: Tag::parse(&map_string(entry, txn, "tag")),
        text: map_string(entry, txn, "text"),
        author: map_string(entry, txn, "author"),
        created_at: map_string(entry, txn, "created_at"),
        para_ref: map_string(entry, txn, "para_ref"),
        document_id: map_string(entry, txn, "document_id"),
        comments: read_comments(entry, txn),
    }
}

fn read_comments(entry: &MapRef, txn: &impl ReadTxn) -> Vec<Comment> {
    let Some(comments) = entry
        .get(txn, "comments")
        .and_then(|value| value.cast::<ArrayRef>().ok())
    else {
        return Vec::new();
    };
    comments
        .iter(txn)
        .filter_map(|item| match item {
            Out::Any(Any::Map(fields)) => Some(Comment {
                author: any_map_string(&fields, "author"),
                text: any_map_string(&fields, "text"),
                created_at: any_map_string(&fields, "created_at"),
            }),
            _ => None,
        })
        .collect()
}

fn read_order(tag_order: &MapRef, txn: &impl ReadTxn, tag_key: &str) -> Vec<HighlightId> {
    let Some(order) = tag_order
        .get(txn, tag_key)
        .and_then(|value| value.cast::<ArrayRef>().ok())
    else {
        return Vec::new();
    };
    order
        .iter(txn)
        .filter_map(|item| match item {
            Out::Any(Any::String(id)) => Some(HighlightId::new(id.as_ref())),
            _ => None,
        })
        .collect()
}

fn map_string(entry: &MapRef, txn: &impl ReadTxn, key: &str) -> String {
    match entry.get(txn, key) {
        Some(Out::Any(Any::String(value))) => value.to_string(),
        _ => String::new(),
    }
}

fn map_offset(entry: &MapRef, txn: &impl ReadTxn, key: &str) -> u64 {
    match entry.get(txn, key) {
        Some(Out::Any(Any::BigInt(value))) => value.max(0) as u64,
        // browser replicas encode small integers as doubles
        Some(Out::Any(Any::Number(value))) if value >= 0.0 => value as u64,
        _ => 0,
    }
}

fn any_map_string(fields: &HashMap<String, Any>, key: &str) -> String {
    match fields.get(key) {
        Some(Any::String(value)) => value.to_string(),
        _ => String::new(),
    }
}
