//! Debounced persistence.
//!
//! Bridges in-memory replicas and the host's state loader. Every durable
//! update marks its document dirty and (re)schedules a flush after the quiet
//! interval; the last client leaving, process shutdown, and the explicit API
//! all force an immediate flush. Flushes for one document are serialized;
//! different documents flush concurrently. A failed save keeps the dirty
//! bit and retries after the next quiet interval.

use crate::error::EngineError;
use crate::events::ReplicaUpdate;
use crate::store::ReplicaStore;
use async_trait::async_trait;
use grimoire_proto::{ClientId, DocId, SaveMetadata};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// The durable store seam. Implemented by the host over its relational
/// database; the engine only ever sees opaque bytes keyed by document id.
#[async_trait]
pub trait StateLoader: Send + Sync {
    /// Loads the persisted state for a document, `None` when the id has
    /// never been saved.
    async fn load(&self, doc_id: &DocId) -> anyhow::Result<Option<Vec<u8>>>;

    /// Upserts the state blob and its metadata for a document.
    async fn save(
        &self,
        doc_id: &DocId,
        state: &[u8],
        metadata: &SaveMetadata,
    ) -> anyhow::Result<()>;
}

/// An in-memory loader for tests and ephemeral workspaces.
#[derive(Default)]
pub struct MemoryStateLoader {
    state: std::sync::Mutex<HashMap<DocId, (Vec<u8>, SaveMetadata)>>,
    fail_loads: AtomicBool,
    fail_saves: AtomicBool,
    save_count: AtomicUsize,
}

impl MemoryStateLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates a document, as if a previous process had saved it.
    pub fn seed(&self, doc_id: DocId, state: Vec<u8>) {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(doc_id, (state, SaveMetadata::default()));
    }

    /// The last saved blob for a document.
    pub fn saved(&self, doc_id: &DocId) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(doc_id)
            .map(|(state, _)| state.clone())
    }

    /// The last saved metadata for a document.
    pub fn saved_metadata(&self, doc_id: &DocId) -> Option<SaveMetadata> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(doc_id)
            .map(|(_, metadata)| metadata.clone())
    }

    /// Total successful saves across all documents.
    pub fn save_count(&self) -> usize {
        self.save_count.load(Ordering::SeqCst)
    }

    pub fn fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateLoader for MemoryStateLoader {
    async fn load(&self, doc_id: &DocId) -> anyhow::Result<Option<Vec<u8>>> {
        if self.fail_loads.load(Ordering::SeqCst) {
            anyhow::bail!("simulated load failure");
        }
        Ok(self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(doc_id)
            .map(|(state, _)| state.clone()))
    }

    async fn save(
        &self,
        doc_id: &DocId,
        state: &[u8],
        metadata: &SaveMetadata,
    ) -> anyhow::Result<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            anyhow::bail!("simulated save failure");
        }
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(doc_id.clone(), (state.to_vec(), metadata.clone()));
        self.save_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct PendingFlush {
    generation: u64,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct PersistState {
    dirty: HashSet<DocId>,
    /// Bumped on every durable update; a flush only clears the dirty bit
    /// when no newer update landed while it was writing.
    generation: HashMap<DocId, u64>,
    last_editor: HashMap<DocId, Option<ClientId>>,
    pending: HashMap<DocId, PendingFlush>,
    flush_locks: HashMap<DocId, Arc<Mutex<()>>>,
    flushing: HashSet<DocId>,
}

pub struct PersistenceManager {
    store: Arc<ReplicaStore>,
    loader: Arc<dyn StateLoader>,
    quiet_interval: Duration,
    state: Mutex<PersistState>,
}

impl PersistenceManager {
    pub fn new(
        store: Arc<ReplicaStore>,
        loader: Arc<dyn StateLoader>,
        quiet_interval: Duration,
    ) -> Self {
        Self {
            store,
            loader,
            quiet_interval,
            state: Mutex::new(PersistState::default()),
        }
    }

    /// Drains the update bus for the lifetime of the engine.
    pub async fn run(self: Arc<Self>, mut updates: tokio::sync::broadcast::Receiver<ReplicaUpdate>) {
        loop {
            match updates.recv().await {
                Ok(update) => self.note_update(&update).await,
                Err(RecvError::Lagged(skipped)) => {
                    // which updates were lost is unknowable, so re-dirty
                    // every live document rather than risk losing a save
                    warn!(skipped, "update bus lagged; re-marking live documents dirty");
                    for doc_id in self.store.doc_ids().await {
                        self.mark_dirty(&doc_id).await;
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    /// Records a durable update: mark dirty, remember the editor, restart
    /// the debounce clock. Presence-metadata updates are ignored.
    pub async fn note_update(self: &Arc<Self>, update: &ReplicaUpdate) {
        if update.origin.is_meta() {
            return;
        }
        let mut state = self.state.lock().await;
        state.dirty.insert(update.doc_id.clone());
        let generation = {
            let counter = state.generation.entry(update.doc_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        state
            .last_editor
            .insert(update.doc_id.clone(), update.origin.client().cloned());
        self.schedule_locked(&mut state, &update.doc_id, generation);
        debug!(doc_id = %update.doc_id, "flush scheduled");
    }

    /// Marks a document dirty without attributing an editor.
    pub async fn mark_dirty(self: &Arc<Self>, doc_id: &DocId) {
        let mut state = self.state.lock().await;
        state.dirty.insert(doc_id.clone());
        let generation = {
            let counter = state.generation.entry(doc_id.clone()).or_insert(0);
            *counter += 1;
            *counter
        };
        self.schedule_locked(&mut state, doc_id, generation);
    }

    fn schedule_locked(self: &Arc<Self>, state: &mut PersistState, doc_id: &DocId, generation: u64) {
        if let Some(previous) = state.pending.remove(doc_id) {
            previous.handle.abort();
        }
        let manager = Arc::clone(self);
        let doc_id_owned = doc_id.clone();
        let quiet = self.quiet_interval;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(quiet).await;
            manager.flush(&doc_id_owned).await;
        });
        state
            .pending
            .insert(doc_id.clone(), PendingFlush { generation, handle });
    }

    /// Immediately persists a document, cancelling any pending debounce.
    /// A clean document is a no-op. Invoked by the router when the last
    /// client leaves, and available to hosts directly.
    pub async fn force_persist(self: &Arc<Self>, doc_id: &DocId) {
        {
            let mut state = self.state.lock().await;
            if let Some(previous) = state.pending.remove(doc_id) {
                previous.handle.abort();
            }
        }
        self.flush(doc_id).await;
    }

    /// Sequentially flushes every dirty document. Blocks teardown until
    /// complete.
    pub async fn shutdown(self: &Arc<Self>) {
        let dirty: Vec<DocId> = {
            let mut state = self.state.lock().await;
            for (_, pending) in state.pending.drain() {
                pending.handle.abort();
            }
            state.dirty.iter().cloned().collect()
        };
        if !dirty.is_empty() {
            info!(documents = dirty.len(), "flushing dirty documents for shutdown");
        }
        for doc_id in dirty {
            self.flush(&doc_id).await;
        }
    }

    pub async fn is_dirty(&self, doc_id: &DocId) -> bool {
        self.state.lock().await.dirty.contains(doc_id)
    }

    pub async fn is_dirty_or_flushing(&self, doc_id: &DocId) -> bool {
        let state = self.state.lock().await;
        state.dirty.contains(doc_id) || state.flushing.contains(doc_id)
    }

    async fn flush(self: &Arc<Self>, doc_id: &DocId) {
        // flushes for one doc are serialized through this lock; other docs
        // proceed concurrently
        let flush_lock = {
            let mut state = self.state.lock().await;
            state
                .flush_locks
                .entry(doc_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _serial = flush_lock.lock().await;

        let (generation, last_editor) = {
            let mut state = self.state.lock().await;
            if !state.dirty.contains(doc_id) {
                return;
            }
            state.flushing.insert(doc_id.clone());
            (
                state.generation.get(doc_id).copied().unwrap_or(0),
                state.last_editor.get(doc_id).cloned().flatten(),
            )
        };

        let result = self.write_snapshot(doc_id, last_editor).await;

        let mut state = self.state.lock().await;
        state.flushing.remove(doc_id);
        match result {
            Ok(()) => {
                if state.generation.get(doc_id).copied().unwrap_or(0) == generation {
                    state.dirty.remove(doc_id);
                    let obsolete = state
                        .pending
                        .get(doc_id)
                        .is_some_and(|pending| pending.generation <= generation);
                    if obsolete {
                        state.pending.remove(doc_id);
                    }
                    debug!(doc_id = %doc_id, "document persisted");
                }
                // else: a newer update landed mid-write; its debounce task
                // is already scheduled and will flush again
            }
            Err(err) => {
                warn!(doc_id = %doc_id, error = %err, "save failed; retrying after quiet interval");
                let generation = state.generation.get(doc_id).copied().unwrap_or(0);
                self.schedule_locked(&mut state, doc_id, generation);
            }
        }
    }

    async fn write_snapshot(
        &self,
        doc_id: &DocId,
        last_editor: Option<ClientId>,
    ) -> Result<(), EngineError> {
        let Some(replica) = self.store.get(doc_id).await else {
            warn!(doc_id = %doc_id, "dirty document is no longer live; nothing to persist");
            return Ok(());
        };
        let state = replica.snapshot();
        let metadata = SaveMetadata {
            highlight_count: replica.highlight_count() as u64,
            last_editor,
        };
        self.loader
            .save(doc_id, &state, &metadata)
            .await
            .map_err(|e| EngineError::Persistence(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{UpdateBus, UpdateOrigin};
    use crate::replica::HighlightDraft;
    use grimoire_proto::Tag;

    const QUIET: Duration = Duration::from_secs(5);

    struct Fixture {
        loader: Arc<MemoryStateLoader>,
        store: Arc<ReplicaStore>,
        manager: Arc<PersistenceManager>,
        doc_id: DocId,
    }

    async fn fixture() -> Fixture {
        let loader = Arc::new(MemoryStateLoader::new());
        let bus = UpdateBus::new(64);
        let store = Arc::new(ReplicaStore::new(
            loader.clone(),
            bus.sender(),
            2 * 1024 * 1024,
        ));
        let manager = Arc::new(PersistenceManager::new(store.clone(), loader.clone(), QUIET));
        let doc_id = DocId::new("d1");
        store.get_or_create(&doc_id).await.unwrap();
        Fixture {
            loader,
            store,
            manager,
            doc_id,
        }
    }

    fn update_from(doc_id: &DocId, client: &str) -> ReplicaUpdate {
        ReplicaUpdate {
            doc_id: doc_id.clone(),
            update: Vec::new(),
            origin: UpdateOrigin::Client(ClientId::new(client)),
        }
    }

    fn draft(start: u64) -> HighlightDraft {
        HighlightDraft {
            start_char: start,
            end_char: start + 5,
            tag: Tag::parse("tag-a"),
            text: "t".to_string(),
            author: "A".to_string(),
            para_ref: String::new(),
            document_id: String::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_after_quiet_interval() {
        let fx = fixture().await;
        let replica = fx.store.get(&fx.doc_id).await.unwrap();
        replica.add_highlight(draft(0), None).unwrap();
        fx.manager.note_update(&update_from(&fx.doc_id, "cA")).await;

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fx.loader.save_count(), 0, "debounce still pending");

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fx.loader.save_count(), 1);
        assert!(!fx.manager.is_dirty(&fx.doc_id).await);
        let metadata = fx.loader.saved_metadata(&fx.doc_id).unwrap();
        assert_eq!(metadata.highlight_count, 1);
        assert_eq!(metadata.last_editor, Some(ClientId::new("cA")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_update_reschedules_single_save() {
        // t=0: first edit schedules a flush for t=5; t=3: second edit moves
        // it to t=8; exactly one save lands, carrying both highlights
        let fx = fixture().await;
        let replica = fx.store.get(&fx.doc_id).await.unwrap();
        replica.add_highlight(draft(0), None).unwrap();
        fx.manager.note_update(&update_from(&fx.doc_id, "cA")).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        replica.add_highlight(draft(10), None).unwrap();
        fx.manager.note_update(&update_from(&fx.doc_id, "cA")).await;

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fx.loader.save_count(), 0, "flush was rescheduled to t=8");

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(fx.loader.save_count(), 1);

        let saved = fx.loader.saved(&fx.doc_id).unwrap();
        let reloaded = crate::replica::AnnotationReplica::from_snapshot(
            fx.doc_id.clone(),
            UpdateBus::new(8).sender(),
            &saved,
        )
        .unwrap();
        assert_eq!(reloaded.highlight_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_persist_cancels_debounce() {
        let fx = fixture().await;
        let replica = fx.store.get(&fx.doc_id).await.unwrap();
        replica.add_highlight(draft(0), None).unwrap();
        fx.manager.note_update(&update_from(&fx.doc_id, "cA")).await;

        tokio::time::sleep(Duration::from_secs(2)).await;
        fx.manager.force_persist(&fx.doc_id).await;
        assert_eq!(fx.loader.save_count(), 1);

        // the cancelled debounce never fires
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.loader.save_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_persist_on_clean_document_is_noop() {
        let fx = fixture().await;
        fx.manager.force_persist(&fx.doc_id).await;
        assert_eq!(fx.loader.save_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_save_keeps_dirty_and_retries() {
        let fx = fixture().await;
        let replica = fx.store.get(&fx.doc_id).await.unwrap();
        replica.add_highlight(draft(0), None).unwrap();
        fx.loader.fail_saves(true);
        fx.manager.note_update(&update_from(&fx.doc_id, "cA")).await;

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fx.loader.save_count(), 0);
        assert!(fx.manager.is_dirty(&fx.doc_id).await);

        // next quiet interval retries and succeeds
        fx.loader.fail_saves(false);
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fx.loader.save_count(), 1);
        assert!(!fx.manager.is_dirty(&fx.doc_id).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_all_dirty_documents() {
        let loader = Arc::new(MemoryStateLoader::new());
        let bus = UpdateBus::new(64);
        let store = Arc::new(ReplicaStore::new(
            loader.clone(),
            bus.sender(),
            2 * 1024 * 1024,
        ));
        let manager = Arc::new(PersistenceManager::new(store.clone(), loader.clone(), QUIET));

        for name in ["d1", "d2", "d3"] {
            let doc_id = DocId::new(name);
            let replica = store.get_or_create(&doc_id).await.unwrap();
            replica.add_highlight(draft(0), None).unwrap();
            manager.note_update(&update_from(&doc_id, "cA")).await;
        }

        manager.shutdown().await;
        assert_eq!(loader.save_count(), 3);
        for name in ["d1", "d2", "d3"] {
            assert!(!manager.is_dirty(&DocId::new(name)).await);
            assert!(loader.saved(&DocId::new(name)).is_some());
        }

        // aborted debounces never double-save
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(loader.save_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_meta_updates_do_not_dirty() {
        let fx = fixture().await;
        fx.manager
            .note_update(&ReplicaUpdate {
                doc_id: fx.doc_id.clone(),
                update: Vec::new(),
                origin: UpdateOrigin::Meta,
            })
            .await;
        assert!(!fx.manager.is_dirty(&fx.doc_id).await);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(fx.loader.save_count(), 0);
    }
}
