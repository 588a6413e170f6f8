//! Live client connections per document, for control signals.
//!
//! Delivery is best-effort and at-most-once: a connection whose outbox is
//! closed or full when a signal is broadcast is dropped from the registry.
//! Undelivered signals are not retried or persisted.

use std::collections::HashMap;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::model::DocumentId;

/// Control signal pushed to every session of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Discard local state and resynchronize from the server.
    Reload,
}

/// Handle to one attached session.
#[derive(Debug, Clone)]
pub struct Connection {
    id: Uuid,
    outbox: mpsc::Sender<Signal>,
}

impl Connection {
    /// Create a connection handle and the receiver its session drains.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Signal>) {
        Self::with_id(Uuid::new_v4(), capacity)
    }

    pub fn with_id(id: Uuid, capacity: usize) -> (Self, mpsc::Receiver<Signal>) {
        let (outbox, rx) = mpsc::channel(capacity.max(1));
        (Self { id, outbox }, rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }
}

#[derive(Default)]
pub struct ConnectionRegistry {
    docs: RwLock<HashMap<DocumentId, HashMap<Uuid, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, doc_id: &DocumentId, connection: Connection) {
        let mut docs = self.docs.write().await;
        docs.entry(doc_id.clone())
            .or_default()
            .insert(connection.id, connection);
    }

    /// Remove a connection. Unknown ids are ignored.
    pub async fn unregister(&self, doc_id: &DocumentId, connection_id: Uuid) {
        let mut docs = self.docs.write().await;
        if let Some(conns) = docs.get_mut(doc_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                docs.remove(doc_id);
            }
        }
    }

    /// Deliver `signal` to every connection of `doc_id`. Returns how many
    /// connections accepted it.
    pub async fn broadcast(&self, doc_id: &DocumentId, signal: Signal) -> usize {
        let mut docs = self.docs.write().await;
        let Some(conns) = docs.get_mut(doc_id) else {
            return 0;
        };

        let before = conns.len();
        conns.retain(|id, conn| match conn.outbox.try_send(signal) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Dropping connection {id} of doc {doc_id}: {e}");
                false
            }
        });
        let delivered = conns.len();
        if conns.is_empty() {
            docs.remove(doc_id);
        }

        log::debug!(
            "Broadcast {signal:?} to doc {doc_id}: {delivered}/{before} connections"
        );
        delivered
    }

    pub async fn connection_count(&self, doc_id: &DocumentId) -> usize {
        self.docs
            .read()
            .await
            .get(doc_id)
            .map_or(0, |conns| conns.len())
    }

    pub async fn active_documents(&self) -> Vec<DocumentId> {
        self.docs.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id: &str) -> DocumentId {
        DocumentId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn test_broadcast_reaches_registered_connections() {
        let registry = ConnectionRegistry::new();
        let d = doc("d");
        let (c1, mut rx1) = Connection::new(4);
        let (c2, mut rx2) = Connection::new(4);
        registry.register(&d, c1).await;
        registry.register(&d, c2).await;

        assert_eq!(registry.broadcast(&d, Signal::Reload).await, 2);
        assert_eq!(rx1.recv().await, Some(Signal::Reload));
        assert_eq!(rx2.recv().await, Some(Signal::Reload));
    }

    #[tokio::test]
    async fn test_broadcast_is_scoped_to_document() {
        let registry = ConnectionRegistry::new();
        let (c1, mut rx1) = Connection::new(4);
        registry.register(&doc("a"), c1).await;

        assert_eq!(registry.broadcast(&doc("b"), Signal::Reload).await, 0);
        assert!(rx1.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_connections_are_dropped() {
        let registry = ConnectionRegistry::new();
        let d = doc("d");
        let (closed, rx_closed) = Connection::new(4);
        let (full, _rx_full) = Connection::new(1);
        let (healthy, mut rx_healthy) = Connection::new(4);
        drop(rx_closed);
        registry.register(&d, closed).await;
        registry.register(&d, full.clone()).await;
        registry.register(&d, healthy).await;

        // Fill the single slot so the next send fails
        full.outbox.try_send(Signal::Reload).unwrap();

        assert_eq!(registry.broadcast(&d, Signal::Reload).await, 1);
        assert_eq!(registry.connection_count(&d).await, 1);
        assert_eq!(rx_healthy.recv().await, Some(Signal::Reload));
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let registry = ConnectionRegistry::new();
        let d = doc("d");
        let (conn, _rx) = Connection::new(4);
        let id = conn.id();
        registry.register(&d, conn).await;
        assert_eq!(registry.active_documents().await, vec![d.clone()]);

        registry.unregister(&d, id).await;
        registry.unregister(&d, id).await;
        registry.unregister(&doc("never"), id).await;
        assert_eq!(registry.connection_count(&d).await, 0);
        assert!(registry.active_documents().await.is_empty());
    }

    #[tokio::test]
    async fn test_empty_registry_broadcast() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.broadcast(&doc("d"), Signal::Reload).await, 0);
    }
}
