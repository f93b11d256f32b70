//! The typed update bus.
//!
//! Every replica mutation ends up here as a [`ReplicaUpdate`]; the fan-out
//! router and the persistence manager each hold a subscription for their
//! lifetime. Events fan out over a tokio broadcast channel, so a slow
//! subscriber lags rather than blocking writers.

use grimoire_proto::{ClientId, DocId};
use tokio::sync::broadcast;
use yrs::Origin;

/// Reserved transaction origin for `client_meta` housekeeping. Such updates
/// replicate to co-viewers but never dirty the document for persistence.
pub(crate) const META_ORIGIN: &str = "\u{1}meta";

/// Who performed a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// A server-internal durable mutation (no echo to suppress).
    Server,
    /// Presence-metadata housekeeping; replicated but never persisted.
    Meta,
    /// A mutation submitted by this client; never echoed back to it.
    Client(ClientId),
}

impl UpdateOrigin {
    pub(crate) fn from_txn(origin: Option<&Origin>) -> Self {
        match origin {
            None => UpdateOrigin::Server,
            Some(origin) => {
                let bytes: &[u8] = origin.as_ref();
                if bytes == META_ORIGIN.as_bytes() {
                    UpdateOrigin::Meta
                } else {
                    UpdateOrigin::Client(ClientId::new(
                        String::from_utf8_lossy(bytes).into_owned(),
                    ))
                }
            }
        }
    }

    /// The originating client, if any.
    pub fn client(&self) -> Option<&ClientId> {
        match self {
            UpdateOrigin::Client(id) => Some(id),
            _ => None,
        }
    }

    /// True for `client_meta` housekeeping updates.
    pub fn is_meta(&self) -> bool {
        matches!(self, UpdateOrigin::Meta)
    }
}

/// One committed CRDT transaction, as broadcast to subsystems.
#[derive(Debug, Clone)]
pub struct ReplicaUpdate {
    pub doc_id: DocId,
    /// The CRDT library's v1 update encoding for this transaction.
    pub update: Vec<u8>,
    pub origin: UpdateOrigin,
}

/// Owner of the broadcast channel replicas publish into.
pub struct UpdateBus {
    tx: broadcast::Sender<ReplicaUpdate>,
}

impl UpdateBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// A sender handle for replicas to publish through.
    pub fn sender(&self) -> broadcast::Sender<ReplicaUpdate> {
        self.tx.clone()
    }

    /// A fresh subscription; the holder sees every update published after
    /// this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ReplicaUpdate> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_origin_decoding() {
        assert_eq!(UpdateOrigin::from_txn(None), UpdateOrigin::Server);

        let meta: Origin = META_ORIGIN.into();
        assert!(UpdateOrigin::from_txn(Some(&meta)).is_meta());

        let client: Origin = "client-17".into();
        assert_eq!(
            UpdateOrigin::from_txn(Some(&client)).client(),
            Some(&ClientId::new("client-17"))
        );
    }

    #[tokio::test]
    async fn test_bus_delivers_to_subscribers() {
        let bus = UpdateBus::new(8);
        let mut rx = bus.subscribe();
        bus.sender()
            .send(ReplicaUpdate {
                doc_id: DocId::new("d1"),
                update: vec![1, 2, 3],
                origin: UpdateOrigin::Server,
            })
            .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.doc_id, DocId::new("d1"));
        assert_eq!(event.update, vec![1, 2, 3]);
    }
}
