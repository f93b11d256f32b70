//! Registry of live replicas.
//!
//! Maps `doc_id → AnnotationReplica`, cold-loading from the state loader on
//! first access and evicting after the last disconnect once nothing is
//! dirty. Two simultaneous first-time accesses for the same id must yield
//! the same replica instance, so creation is double-checked under a per-id
//! lock.

use crate::error::EngineError;
use crate::events::ReplicaUpdate;
use crate::persist::{PersistenceManager, StateLoader};
use crate::replica::AnnotationReplica;
use grimoire_proto::DocId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock, broadcast};
use tracing::{debug, info, warn};

pub struct ReplicaStore {
    loader: Arc<dyn StateLoader>,
    updates: broadcast::Sender<ReplicaUpdate>,
    max_document_bytes: usize,
    replicas: RwLock<HashMap<DocId, Arc<AnnotationReplica>>>,
    init_locks: Mutex<HashMap<DocId, Arc<Mutex<()>>>>,
}

impl ReplicaStore {
    pub fn new(
        loader: Arc<dyn StateLoader>,
        updates: broadcast::Sender<ReplicaUpdate>,
        max_document_bytes: usize,
    ) -> Self {
        Self {
            loader,
            updates,
            max_document_bytes,
            replicas: RwLock::new(HashMap::new()),
            init_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the live replica for `doc_id`, cold-loading or creating it on
    /// first access.
    pub async fn get_or_create(
        &self,
        doc_id: &DocId,
    ) -> Result<Arc<AnnotationReplica>, EngineError> {
        if let Some(replica) = self.replicas.read().await.get(doc_id) {
            return Ok(replica.clone());
        }

        let init_lock = {
            let mut locks = self.init_locks.lock().await;
            locks
                .entry(doc_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _init = init_lock.lock().await;

        // another task may have finished the cold load while we waited
        if let Some(replica) = self.replicas.read().await.get(doc_id) {
            return Ok(replica.clone());
        }

        let replica = match self.loader.load(doc_id).await {
            Ok(Some(bytes)) => {
                if bytes.len() > self.max_document_bytes {
                    return Err(EngineError::DocumentTooLarge {
                        size: bytes.len(),
                        limit: self.max_document_bytes,
                    });
                }
                debug!(doc_id = %doc_id, bytes = bytes.len(), "cold-loading document");
                AnnotationReplica::from_snapshot(doc_id.clone(), self.updates.clone(), &bytes)?
            }
            Ok(None) => {
                debug!(doc_id = %doc_id, "creating empty document");
                AnnotationReplica::new(doc_id.clone(), self.updates.clone())?
            }
            Err(err) => {
                warn!(doc_id = %doc_id, error = %err, "state load failed");
                return Err(EngineError::Load(err.to_string()));
            }
        };

        let replica = Arc::new(replica);
        self.replicas
            .write()
            .await
            .insert(doc_id.clone(), replica.clone());
        Ok(replica)
    }

    /// The live replica for `doc_id`, if any. Never loads.
    pub async fn get(&self, doc_id: &DocId) -> Option<Arc<AnnotationReplica>> {
        self.replicas.read().await.get(doc_id).cloned()
    }

    /// Registers an externally constructed replica (the clone path). Fails
    /// if the id is already live.
    pub async fn adopt(&self, replica: Arc<AnnotationReplica>) -> Result<(), EngineError> {
        let mut replicas = self.replicas.write().await;
        let doc_id = replica.doc_id().clone();
        if replicas.contains_key(&doc_id) {
            return Err(EngineError::Protocol(format!(
                "document {doc_id} is already loaded"
            )));
        }
        replicas.insert(doc_id, replica);
        Ok(())
    }

    /// Ids of every live replica.
    pub async fn doc_ids(&self) -> Vec<DocId> {
        self.replicas.read().await.keys().cloned().collect()
    }

    /// Full state of every live replica, for shutdown persistence and
    /// host diagnostics.
    pub async fn snapshot_all(&self) -> Vec<(DocId, Vec<u8>)> {
        let replicas = self.replicas.read().await;
        replicas
            .iter()
            .map(|(doc_id, replica)| (doc_id.clone(), replica.snapshot()))
            .collect()
    }

    /// Evicts `doc_id` unless it is dirty or mid-flush. Called after the
    /// last disconnect; returns whether the replica was evicted.
    pub async fn consider_eviction(
        &self,
        doc_id: &DocId,
        persistence: &PersistenceManager,
    ) -> bool {
        if persistence.is_dirty_or_flushing(doc_id).await {
            debug!(doc_id = %doc_id, "eviction deferred: unsaved state");
            return false;
        }
        let evicted = self.replicas.write().await.remove(doc_id).is_some();
        if evicted {
            self.init_locks.lock().await.remove(doc_id);
            info!(doc_id = %doc_id, "replica evicted");
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::UpdateBus;
    use crate::persist::MemoryStateLoader;
    use crate::replica::HighlightDraft;
    use grimoire_proto::Tag;

    fn store_with(loader: Arc<MemoryStateLoader>) -> ReplicaStore {
        ReplicaStore::new(loader, UpdateBus::new(64).sender(), 2 * 1024 * 1024)
    }

    fn draft() -> HighlightDraft {
        HighlightDraft {
            start_char: 0,
            end_char: 5,
            tag: Tag::parse("tag-a"),
            text: "t".to_string(),
            author: "A".to_string(),
            para_ref: String::new(),
            document_id: String::new(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_returns_same_instance() {
        let store = store_with(Arc::new(MemoryStateLoader::new()));
        let doc = DocId::new("d1");
        let first = store.get_or_create(&doc).await.unwrap();
        let second = store.get_or_create(&doc).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_concurrent_first_access_yields_one_replica() {
        let store = Arc::new(store_with(Arc::new(MemoryStateLoader::new())));
        let doc = DocId::new("d1");
        let (a, b) = tokio::join!(store.get_or_create(&doc), store.get_or_create(&doc));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
    }

    #[tokio::test]
    async fn test_cold_load_seeds_from_loader() {
        let loader = Arc::new(MemoryStateLoader::new());
        let doc = DocId::new("d1");

        // persist some state through a scratch replica
        let scratch =
            AnnotationReplica::new(doc.clone(), UpdateBus::new(8).sender()).unwrap();
        scratch.add_highlight(draft(), None).unwrap();
        loader.seed(doc.clone(), scratch.snapshot());

        let store = store_with(loader);
        let replica = store.get_or_create(&doc).await.unwrap();
        assert_eq!(replica.highlight_count(), 1);
    }

    #[tokio::test]
    async fn test_load_failure_refuses_creation() {
        let loader = Arc::new(MemoryStateLoader::new());
        loader.fail_loads(true);
        let store = store_with(loader);
        let err = store.get_or_create(&DocId::new("d1")).await.unwrap_err();
        assert!(matches!(err, EngineError::Load(_)));
        assert!(store.get(&DocId::new("d1")).await.is_none());
    }

    #[tokio::test]
    async fn test_oversized_blob_is_rejected() {
        let loader = Arc::new(MemoryStateLoader::new());
        let doc = DocId::new("d1");
        loader.seed(doc.clone(), vec![0u8; 64]);
        let store = ReplicaStore::new(loader, UpdateBus::new(8).sender(), 16);
        let err = store.get_or_create(&doc).await.unwrap_err();
        assert!(matches!(err, EngineError::DocumentTooLarge { size: 64, limit: 16 }));
    }

    #[tokio::test]
    async fn test_adopt_rejects_duplicates() {
        let store = store_with(Arc::new(MemoryStateLoader::new()));
        let doc = DocId::new("d1");
        store.get_or_create(&doc).await.unwrap();
        let dup = Arc::new(
            AnnotationReplica::new(doc.clone(), UpdateBus::new(8).sender()).unwrap(),
        );
        assert!(store.adopt(dup).await.is_err());
    }
}
