//! The engine facade.
//!
//! One [`Engine`] value owns every subsystem: the replica store, the fan-out
//! router, the presence tracker, the persistence manager, and the update bus
//! tying them together. There is no module-global state; hosts construct an
//! engine, hand it connections, and shut it down.

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::events::UpdateBus;
use crate::persist::{PersistenceManager, StateLoader};
use crate::presence::PresenceTracker;
use crate::replica::AnnotationReplica;
use crate::router::{Connection, ConnectionIdentity, FanoutRouter};
use crate::store::ReplicaStore;
use grimoire_proto::{ClientMessage, DocId};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// The Annotation Collaboration Engine.
///
/// Construction spawns the two bus-draining tasks (router fan-out and
/// persistence debouncing), so an [`Engine`] must be created inside a tokio
/// runtime.
pub struct Engine {
    config: EngineConfig,
    store: Arc<ReplicaStore>,
    presence: Arc<PresenceTracker>,
    persistence: Arc<PersistenceManager>,
    router: Arc<FanoutRouter>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl Engine {
    pub fn new(config: EngineConfig, loader: Arc<dyn StateLoader>) -> Self {
        let bus = UpdateBus::new(config.update_bus_capacity);
        let store = Arc::new(ReplicaStore::new(
            loader.clone(),
            bus.sender(),
            config.max_document_bytes,
        ));
        let presence = Arc::new(PresenceTracker::new());
        let persistence = Arc::new(PersistenceManager::new(
            store.clone(),
            loader,
            config.quiet_interval(),
        ));
        let router = Arc::new(FanoutRouter::new(
            store.clone(),
            presence.clone(),
            persistence.clone(),
        ));

        let tasks = vec![
            tokio::spawn(router.clone().run(bus.subscribe())),
            tokio::spawn(persistence.clone().run(bus.subscribe())),
        ];

        Self {
            config,
            store,
            presence,
            persistence,
            router,
            tasks: parking_lot::Mutex::new(tasks),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Attaches a connection to a document, running the join protocol.
    /// Fails (and registers nothing) when the cold load fails or the
    /// initial snapshot cannot be delivered.
    pub async fn connect(
        &self,
        doc_id: &DocId,
        identity: &ConnectionIdentity,
        connection: Arc<dyn Connection>,
    ) -> Result<ClientHandle, EngineError> {
        let client_id = self.router.join(doc_id, identity, connection).await?;
        Ok(ClientHandle {
            doc_id: doc_id.clone(),
            client_id,
            router: self.router.clone(),
        })
    }

    /// The live replica for a document, cold-loading it if needed. Server-
    /// side callers mutate documents through this handle.
    pub async fn replica(&self, doc_id: &DocId) -> Result<Arc<AnnotationReplica>, EngineError> {
        self.store.get_or_create(doc_id).await
    }

    /// Clones a document into a new workspace id, optionally remapping
    /// workspace tag UUIDs. The clone is registered and persisted at once.
    pub async fn clone_document(
        &self,
        source_id: &DocId,
        target_id: &DocId,
        tag_remap: Option<&HashMap<Uuid, Uuid>>,
    ) -> Result<(), EngineError> {
        let source = self.store.get_or_create(source_id).await?;
        let clone = AnnotationReplica::clone_into(&source, target_id.clone(), tag_remap)?;
        self.store.adopt(Arc::new(clone)).await?;
        self.persistence.mark_dirty(target_id).await;
        self.persistence.force_persist(target_id).await;
        Ok(())
    }

    /// Immediately persists one document.
    pub async fn force_persist(&self, doc_id: &DocId) {
        self.persistence.force_persist(doc_id).await;
    }

    /// Full state of every live replica.
    pub async fn snapshot_all(&self) -> Vec<(DocId, Vec<u8>)> {
        self.store.snapshot_all().await
    }

    /// Rejects documents over the configured ingestion limit. Hosts call
    /// this before handing HTML to the paragraph map builder.
    pub fn check_document_size(&self, size: usize) -> Result<(), EngineError> {
        if size > self.config.max_document_bytes {
            return Err(EngineError::DocumentTooLarge {
                size,
                limit: self.config.max_document_bytes,
            });
        }
        Ok(())
    }

    /// Stops the bus tasks, cancels every pending debounce, and
    /// sequentially flushes all dirty documents. Blocks until complete.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        self.persistence.shutdown().await;
    }
}

/// One attached connection's handle, used by host plumbing to feed inbound
/// messages and to signal disconnect.
pub struct ClientHandle {
    doc_id: DocId,
    client_id: grimoire_proto::ClientId,
    router: Arc<FanoutRouter>,
}

impl ClientHandle {
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn client_id(&self) -> &grimoire_proto::ClientId {
        &self.client_id
    }

    /// Routes one inbound message from this client.
    pub async fn handle_message(&self, message: ClientMessage) -> Result<(), EngineError> {
        self.router
            .handle_message(&self.doc_id, &self.client_id, message)
            .await
    }

    /// Runs the leave protocol for this connection.
    pub async fn disconnect(self) {
        self.router.leave(&self.doc_id, &self.client_id).await;
    }
}
