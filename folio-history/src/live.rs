//! In-memory live documents, one per document id.
//!
//! ```text
//!  update ──► LiveRoom::write ──► append_update (durable)
//!                  │
//!                  ├──► SharedDoc (authority)
//!                  │
//!                  └──► BroadcastGroup ──► subscribed sessions
//! ```
//!
//! Rooms are loaded lazily from the stored state plus the update log and
//! compacted back into a single stored state once nobody uses them.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::broadcast::BroadcastGroup;
use crate::doc::{decode_update, DocError, SharedDoc, DEFAULT_ROOT};
use crate::locks::DocLocks;
use crate::model::DocumentId;
use crate::protocol::SyncMessage;
use crate::storage::{HistoryBackend, StorageError};

/// Live document hub configuration.
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Name of the shared text root
    pub root_name: String,
    /// Broadcast channel capacity per room
    pub broadcast_capacity: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            root_name: DEFAULT_ROOT.to_string(),
            broadcast_capacity: 256,
        }
    }
}

impl LiveConfig {
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 64,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LiveError {
    #[error(transparent)]
    Doc(#[from] DocError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Default)]
struct WriteState {
    /// Sequence of the last update persisted by this room
    last_seq: Option<u64>,
    clock: u64,
}

/// One live document: the authoritative replica and its subscribers.
pub struct LiveRoom {
    doc_id: DocumentId,
    doc: SharedDoc,
    updates: BroadcastGroup,
    write: Mutex<WriteState>,
}

impl LiveRoom {
    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    /// Read access to the replica. Mutations go through [`LiveDocuments`].
    pub fn doc(&self) -> &SharedDoc {
        &self.doc
    }

    pub fn updates(&self) -> &BroadcastGroup {
        &self.updates
    }
}

pub struct LiveDocuments {
    config: LiveConfig,
    backend: Arc<dyn HistoryBackend>,
    rooms: RwLock<HashMap<DocumentId, Arc<LiveRoom>>>,
    /// Serializes loads of one document; the room table is not held meanwhile
    loading: DocLocks,
}

impl LiveDocuments {
    pub fn new(backend: Arc<dyn HistoryBackend>, config: LiveConfig) -> Self {
        Self {
            config,
            backend,
            rooms: RwLock::new(HashMap::new()),
            loading: DocLocks::new(),
        }
    }

    pub fn config(&self) -> &LiveConfig {
        &self.config
    }

    /// Get the room of `doc_id`, loading it from storage on first use.
    pub async fn open(&self, doc_id: &DocumentId) -> Result<Arc<LiveRoom>, LiveError> {
        if let Some(room) = self.rooms.read().await.get(doc_id) {
            return Ok(room.clone());
        }

        let _loading = self.loading.lock(doc_id).await;
        if let Some(room) = self.rooms.read().await.get(doc_id) {
            return Ok(room.clone());
        }
        let room = Arc::new(self.load(doc_id)?);
        self.rooms
            .write()
            .await
            .insert(doc_id.clone(), room.clone());
        Ok(room)
    }

    fn load(&self, doc_id: &DocumentId) -> Result<LiveRoom, LiveError> {
        let stored = self.backend.load_document(doc_id)?;
        let doc = SharedDoc::new(self.config.root_name.as_str());

        if let Some(state) = &stored.state {
            doc.apply_update(state)?;
        }
        let mut skipped = 0usize;
        for (seq, update) in &stored.updates {
            if let Err(e) = doc.apply_update(update) {
                log::warn!("Skipping stored update {seq} of doc {doc_id}: {e}");
                skipped += 1;
            }
        }

        if !stored.is_empty() {
            log::info!(
                "Loaded doc {doc_id}: state={} updates={} skipped={skipped}",
                stored.state.is_some(),
                stored.updates.len()
            );
        }

        Ok(LiveRoom {
            doc_id: doc_id.clone(),
            doc,
            updates: BroadcastGroup::new(self.config.broadcast_capacity),
            write: Mutex::new(WriteState {
                last_seq: stored.last_seq(),
                clock: 0,
            }),
        })
    }

    /// Apply a client update: persist it, merge it into the replica and fan
    /// it out tagged with `origin`.
    pub async fn apply_update(
        &self,
        doc_id: &DocumentId,
        update: &[u8],
        origin: Uuid,
    ) -> Result<(), LiveError> {
        self.apply_with(doc_id, origin, |_| Ok(update.to_vec()))
            .await
            .map(|_| ())
    }

    /// Compute an update against the replica and apply it, all under the
    /// room's write lock. No other update can land between `compute` and
    /// the apply. Returns the applied update.
    ///
    /// The update is validated and persisted before the replica is touched,
    /// so a failure leaves the live document unchanged.
    pub async fn apply_with<F>(
        &self,
        doc_id: &DocumentId,
        origin: Uuid,
        compute: F,
    ) -> Result<Vec<u8>, LiveError>
    where
        F: FnOnce(&SharedDoc) -> Result<Vec<u8>, DocError>,
    {
        let room = self.open(doc_id).await?;
        let mut state = room.write.lock().await;

        let update = compute(&room.doc)?;
        let decoded = decode_update(&update)?;
        let seq = self.backend.append_update(doc_id, &update)?;
        state.last_seq = Some(seq);
        room.doc.apply_decoded(decoded)?;

        state.clock += 1;
        let msg = SyncMessage::update(origin, doc_id.as_str(), state.clock, update.clone());
        if let Err(e) = room.updates.broadcast(&msg) {
            log::warn!("Failed to fan out update {seq} of doc {doc_id}: {e}");
        }
        log::trace!("Applied update {seq} to doc {doc_id} ({} bytes)", update.len());
        Ok(update)
    }

    /// Compact and unload the room if nobody holds it. Returns whether the
    /// room was closed.
    pub async fn close_if_idle(&self, doc_id: &DocumentId) -> Result<bool, LiveError> {
        let mut rooms = self.rooms.write().await;
        let Some(room) = rooms.get(doc_id) else {
            return Ok(false);
        };
        // Only the table references an idle room
        if Arc::strong_count(room) > 1 || room.updates.peer_count().await > 0 {
            return Ok(false);
        }
        let Ok(state) = room.write.try_lock() else {
            return Ok(false);
        };

        let full_state = room.doc.encode_full_state();
        let removed = self
            .backend
            .compact_document(doc_id, &full_state, state.last_seq)?;
        drop(state);
        rooms.remove(doc_id);

        log::info!("Closed doc {doc_id}: compacted {removed} updates");
        Ok(true)
    }

    /// Close every idle room. Returns how many were closed.
    pub async fn close_all_idle(&self) -> usize {
        let ids: Vec<DocumentId> = self.rooms.read().await.keys().cloned().collect();
        let mut closed = 0;
        for doc_id in ids {
            match self.close_if_idle(&doc_id).await {
                Ok(true) => closed += 1,
                Ok(false) => {}
                Err(e) => log::error!("Failed to close doc {doc_id}: {e}"),
            }
        }
        closed
    }

    pub async fn open_documents(&self) -> Vec<DocumentId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PeerInfo;
    use crate::storage::MemoryBackend;

    fn doc(id: &str) -> DocumentId {
        DocumentId::parse(id).unwrap()
    }

    fn hub(backend: Arc<dyn HistoryBackend>) -> LiveDocuments {
        LiveDocuments::new(backend, LiveConfig::for_testing())
    }

    fn edit(text: &str) -> Vec<u8> {
        SharedDoc::new(DEFAULT_ROOT).insert_text(0, text)
    }

    #[tokio::test]
    async fn test_open_is_shared() {
        let live = hub(Arc::new(MemoryBackend::new()));
        let d = doc("d");
        let a = live.open(&d).await.unwrap();
        let b = live.open(&d).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.doc().text(), "");
    }

    #[tokio::test]
    async fn test_pending_load_does_not_block_other_documents() {
        let live = Arc::new(hub(Arc::new(MemoryBackend::new())));
        let slow = doc("slow");
        let loading = live.loading.lock(&slow).await;

        let opener = {
            let live = live.clone();
            let slow = slow.clone();
            tokio::spawn(async move { live.open(&slow).await.map(|room| room.doc().text()) })
        };
        tokio::task::yield_now().await;

        let other = tokio::time::timeout(std::time::Duration::from_secs(1), live.open(&doc("other")))
            .await
            .expect("open of another document waited on a pending load");
        assert_eq!(other.unwrap().doc().text(), "");
        assert!(!opener.is_finished());

        drop(loading);
        assert_eq!(opener.await.unwrap().unwrap(), "");
        assert_eq!(live.open_documents().await.len(), 2);
    }

    #[tokio::test]
    async fn test_apply_persists_and_fans_out() {
        let backend = Arc::new(MemoryBackend::new());
        let live = hub(backend.clone());
        let d = doc("d");
        let room = live.open(&d).await.unwrap();
        let mut rx = room.updates().add_peer(PeerInfo::new("watcher")).await;

        let origin = Uuid::new_v4();
        live.apply_update(&d, &edit("hello"), origin).await.unwrap();

        assert_eq!(room.doc().text(), "hello");
        assert_eq!(backend.load_document(&d).unwrap().updates.len(), 1);

        let frame = rx.recv().await.unwrap();
        let msg = SyncMessage::decode(&frame).unwrap();
        assert_eq!(msg.peer_id, origin);
        assert_eq!(msg.clock, 1);
    }

    #[tokio::test]
    async fn test_malformed_update_leaves_document_untouched() {
        let backend = Arc::new(MemoryBackend::new());
        let live = hub(backend.clone());
        let d = doc("d");
        live.apply_update(&d, &edit("keep"), Uuid::nil()).await.unwrap();

        let result = live.apply_update(&d, &[0xFF, 0xFF, 0xFF], Uuid::nil()).await;
        assert!(matches!(result, Err(LiveError::Doc(_))));
        assert_eq!(live.open(&d).await.unwrap().doc().text(), "keep");
        assert_eq!(backend.load_document(&d).unwrap().updates.len(), 1);
    }

    #[tokio::test]
    async fn test_close_compacts_and_reload_restores() {
        let backend: Arc<dyn HistoryBackend> = Arc::new(MemoryBackend::new());
        let live = hub(backend.clone());
        let d = doc("d");
        live.apply_update(&d, &edit("world"), Uuid::nil()).await.unwrap();
        live.apply_update(&d, &edit("hello "), Uuid::nil()).await.unwrap();
        let text = live.open(&d).await.unwrap().doc().text();

        assert!(live.close_if_idle(&d).await.unwrap());
        assert!(live.open_documents().await.is_empty());
        let stored = backend.load_document(&d).unwrap();
        assert!(stored.state.is_some());
        assert!(stored.updates.is_empty());

        let reopened = hub(backend);
        assert_eq!(reopened.open(&d).await.unwrap().doc().text(), text);
    }

    #[tokio::test]
    async fn test_held_room_is_not_closed() {
        let live = hub(Arc::new(MemoryBackend::new()));
        let d = doc("d");
        let room = live.open(&d).await.unwrap();
        assert!(!live.close_if_idle(&d).await.unwrap());
        drop(room);
        assert_eq!(live.close_all_idle().await, 1);
        assert!(!live.close_if_idle(&doc("unknown")).await.unwrap());
    }

    #[tokio::test]
    async fn test_load_skips_corrupt_updates() {
        let backend: Arc<dyn HistoryBackend> = Arc::new(MemoryBackend::new());
        let d = doc("d");
        backend.append_update(&d, &edit("ok")).unwrap();
        backend.append_update(&d, &[0xFF, 0x01]).unwrap();

        let live = hub(backend);
        assert_eq!(live.open(&d).await.unwrap().doc().text(), "ok");
    }

    #[tokio::test]
    async fn test_apply_with_sees_current_state() {
        let live = hub(Arc::new(MemoryBackend::new()));
        let d = doc("d");
        live.apply_update(&d, &edit("abc"), Uuid::nil()).await.unwrap();

        let applied = live
            .apply_with(&d, Uuid::nil(), |current| {
                let fork = SharedDoc::from_state(DEFAULT_ROOT, &current.encode_full_state())?;
                fork.insert_text(3, "d");
                Ok(fork.encode_diff(&current.state_vector()))
            })
            .await
            .unwrap();
        assert!(!applied.is_empty());
        assert_eq!(live.open(&d).await.unwrap().doc().text(), "abcd");
    }
}
