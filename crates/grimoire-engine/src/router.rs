//! Fan-out routing between a document's connections.
//!
//! Binds connections to replicas, applies inbound updates with an origin
//! tag, and broadcasts committed updates to every co-viewer except the
//! originator. The per-document registry lock is never held across a send;
//! a failed send tears the connection down through the normal leave
//! protocol, and the other peers still get their copy.

use crate::error::EngineError;
use crate::events::ReplicaUpdate;
use crate::persist::PersistenceManager;
use crate::presence::PresenceTracker;
use crate::store::ReplicaStore;
use async_trait::async_trait;
use grimoire_proto::{
    ClientId, ClientMessage, DocId, PresenceMessage, PresenceState, PresenceUpdate, ServerMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// One live client connection, as the engine sees it. The host's transport
/// layer (WebSocket or otherwise) implements this.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Delivers one framed message to the client. An error means the
    /// connection is gone and triggers the leave protocol.
    async fn send(&self, message: ServerMessage) -> anyhow::Result<()>;
}

/// The identity tuple the host resolved for a connection. Authentication
/// and workspace-level access checks happen before the engine is involved.
#[derive(Debug, Clone)]
pub struct ConnectionIdentity {
    pub user_id: String,
    pub display_name: String,
    /// Cursor/highlight color assigned to this user by the host.
    pub color: String,
    pub roles: Vec<String>,
    pub org_admin: bool,
}

pub struct FanoutRouter {
    store: Arc<ReplicaStore>,
    presence: Arc<PresenceTracker>,
    persistence: Arc<PersistenceManager>,
    connections: RwLock<HashMap<DocId, HashMap<ClientId, Arc<dyn Connection>>>>,
}

impl FanoutRouter {
    pub fn new(
        store: Arc<ReplicaStore>,
        presence: Arc<PresenceTracker>,
        persistence: Arc<PersistenceManager>,
    ) -> Self {
        Self {
            store,
            presence,
            persistence,
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Join protocol: load (or create) the replica, send the full snapshot
    /// and current co-viewer presence, then register the connection.
    /// Returns the client id minted for this connection.
    pub async fn join(
        &self,
        doc_id: &DocId,
        identity: &ConnectionIdentity,
        connection: Arc<dyn Connection>,
    ) -> Result<ClientId, EngineError> {
        let replica = self.store.get_or_create(doc_id).await?;
        let client_id = ClientId::generate();

        connection
            .send(ServerMessage::Snapshot {
                state: replica.snapshot(),
            })
            .await
            .map_err(|e| EngineError::Transport(e.to_string()))?;

        // seed the newcomer with what co-viewers are doing right now
        for row in self.presence.rows(doc_id).await {
            for message in seed_messages(&row) {
                connection
                    .send(ServerMessage::Presence { presence: message })
                    .await
                    .map_err(|e| EngineError::Transport(e.to_string()))?;
            }
        }

        self.connections
            .write()
            .await
            .entry(doc_id.clone())
            .or_default()
            .insert(client_id.clone(), connection);
        self.presence
            .join(
                doc_id,
                PresenceState::new(client_id.clone(), &identity.display_name, &identity.color),
            )
            .await;
        // broadcasts a small client_meta update to every peer, as any
        // other mutation would
        replica.register_client(&client_id, &identity.display_name, &identity.color);

        info!(doc_id = %doc_id, client_id = %client_id, user_id = %identity.user_id, "client joined");
        Ok(client_id)
    }

    /// Handles one inbound client message.
    pub async fn handle_message(
        &self,
        doc_id: &DocId,
        client_id: &ClientId,
        message: ClientMessage,
    ) -> Result<(), EngineError> {
        match message {
            ClientMessage::Update { update } => {
                let Some(replica) = self.store.get(doc_id).await else {
                    return Err(EngineError::Protocol(format!(
                        "document {doc_id} has no live replica"
                    )));
                };
                if let Err(err) = replica.apply_remote_update(&update, Some(client_id)) {
                    // a bad blob is dropped, reported, and the connection
                    // stays up
                    warn!(doc_id = %doc_id, client_id = %client_id, error = %err, "dropping malformed update");
                    self.send_error(doc_id, client_id, &err).await;
                }
                Ok(())
            }
            ClientMessage::Presence { presence } => {
                self.handle_presence(doc_id, client_id, presence).await
            }
        }
    }

    async fn handle_presence(
        &self,
        doc_id: &DocId,
        client_id: &ClientId,
        update: PresenceUpdate,
    ) -> Result<(), EngineError> {
        let delta = match update {
            PresenceUpdate::Cursor { cursor_char } => {
                self.presence.set_cursor(doc_id, client_id, cursor_char).await
            }
            PresenceUpdate::Selection {
                selection_start,
                selection_end,
            } => {
                match self
                    .presence
                    .set_selection(doc_id, client_id, selection_start, selection_end)
                    .await
                {
                    Ok(delta) => delta,
                    Err(err) => {
                        self.send_error(doc_id, client_id, &err).await;
                        return Ok(());
                    }
                }
            }
            PresenceUpdate::Leave => self.presence.remove(doc_id, client_id).await,
        };
        if let Some(message) = delta {
            let failed = self
                .broadcast_presence(doc_id, Some(client_id), message)
                .await;
            for failed_client in failed {
                self.leave(doc_id, &failed_client).await;
            }
        }
        Ok(())
    }

    /// Leave protocol: drop the connection, clear presence and client_meta,
    /// and on the last disconnect force a flush and offer the replica for
    /// eviction.
    pub async fn leave(&self, doc_id: &DocId, client_id: &ClientId) {
        let was_last = {
            let mut connections = self.connections.write().await;
            let Some(doc_connections) = connections.get_mut(doc_id) else {
                return;
            };
            if doc_connections.remove(client_id).is_none() {
                return;
            }
            let empty = doc_connections.is_empty();
            if empty {
                connections.remove(doc_id);
            }
            empty
        };

        if let Some(replica) = self.store.get(doc_id).await {
            replica.unregister_client(client_id);
        }
        if let Some(message) = self.presence.remove(doc_id, client_id).await {
            // failures here are left to the next broadcast to collect
            let _ = self
                .broadcast_presence(doc_id, Some(client_id), message)
                .await;
        }

        if was_last {
            self.persistence.force_persist(doc_id).await;
            // a newcomer may have joined while the flush ran
            let still_empty = !self.connections.read().await.contains_key(doc_id);
            if still_empty {
                self.store.consider_eviction(doc_id, &self.persistence).await;
            }
        }
        info!(doc_id = %doc_id, client_id = %client_id, "client left");
    }

    /// Number of live connections for a document.
    pub async fn connection_count(&self, doc_id: &DocId) -> usize {
        self.connections
            .read()
            .await
            .get(doc_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    /// Drains the update bus for the lifetime of the engine, fanning each
    /// committed update out to every co-viewer except its origin.
    pub async fn run(self: Arc<Self>, mut updates: tokio::sync::broadcast::Receiver<ReplicaUpdate>) {
        loop {
            match updates.recv().await {
                Ok(update) => self.broadcast_update(&update).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "update bus lagged; peers may be stale until rejoin");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    async fn broadcast_update(&self, update: &ReplicaUpdate) {
        let targets: Vec<(ClientId, Arc<dyn Connection>)> = {
            let connections = self.connections.read().await;
            let Some(doc_connections) = connections.get(&update.doc_id) else {
                return;
            };
            doc_connections
                .iter()
                .filter(|(client_id, _)| update.origin.client() != Some(*client_id))
                .map(|(client_id, connection)| (client_id.clone(), connection.clone()))
                .collect()
        };
        if targets.is_empty() {
            return;
        }

        let message = ServerMessage::Update {
            update: update.update.clone(),
        };
        let mut failed = Vec::new();
        for (client_id, connection) in targets {
            if let Err(err) = connection.send(message.clone()).await {
                warn!(doc_id = %update.doc_id, client_id = %client_id, error = %err, "send failed; dropping connection");
                failed.push(client_id);
            }
        }
        for client_id in failed {
            self.leave(&update.doc_id, &client_id).await;
        }
        debug!(doc_id = %update.doc_id, "update broadcast");
    }

    /// Sends a presence delta to every connection except `except`. Returns
    /// the clients whose send failed.
    async fn broadcast_presence(
        &self,
        doc_id: &DocId,
        except: Option<&ClientId>,
        message: PresenceMessage,
    ) -> Vec<ClientId> {
        let targets: Vec<(ClientId, Arc<dyn Connection>)> = {
            let connections = self.connections.read().await;
            let Some(doc_connections) = connections.get(doc_id) else {
                return Vec::new();
            };
            doc_connections
                .iter()
                .filter(|(client_id, _)| except != Some(*client_id))
                .map(|(client_id, connection)| (client_id.clone(), connection.clone()))
                .collect()
        };

        let mut failed = Vec::new();
        for (client_id, connection) in targets {
            let frame = ServerMessage::Presence {
                presence: message.clone(),
            };
            if let Err(err) = connection.send(frame).await {
                warn!(doc_id = %doc_id, client_id = %client_id, error = %err, "presence send failed");
                failed.push(client_id);
            }
        }
        failed
    }

    async fn send_error(&self, doc_id: &DocId, client_id: &ClientId, error: &EngineError) {
        let connection = {
            let connections = self.connections.read().await;
            connections
                .get(doc_id)
                .and_then(|doc_connections| doc_connections.get(client_id))
                .cloned()
        };
        let Some(connection) = connection else {
            return;
        };
        let frame = ServerMessage::Error {
            code: error.code(),
            message: error.to_string(),
        };
        if let Err(err) = connection.send(frame).await {
            warn!(doc_id = %doc_id, client_id = %client_id, error = %err, "error frame send failed");
        }
    }
}

/// The messages that reconstruct one presence row for a late joiner.
fn seed_messages(row: &PresenceState) -> Vec<PresenceMessage> {
    let mut messages = Vec::new();
    if row.cursor_char.is_some() {
        messages.push(PresenceMessage {
            client_id: row.client_id.clone(),
            display_name: row.display_name.clone(),
            color: row.color.clone(),
            update: PresenceUpdate::Cursor {
                cursor_char: row.cursor_char,
            },
        });
    }
    if row.selection_start.is_some() || row.selection_end.is_some() {
        messages.push(PresenceMessage {
            client_id: row.client_id.clone(),
            display_name: row.display_name.clone(),
            color: row.color.clone(),
            update: PresenceUpdate::Selection {
                selection_start: row.selection_start,
                selection_end: row.selection_end,
            },
        });
    }
    messages
}
