//! Fan-out of encoded sync frames to every peer attached to a live document.
//!
//! One tokio broadcast channel per document: a send reaches all subscribers,
//! each buffering up to `capacity` frames before it lags.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};

/// Encoded frame shared by all receivers.
pub type Frame = Arc<Vec<u8>>;

/// Subscribers of one live document.
///
/// Frames go to every subscriber including the sender; sessions drop their
/// own echoes.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Frame>,
    peers: RwLock<HashMap<Uuid, PeerInfo>>,
}

impl BroadcastGroup {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Frame> {
        self.peers.write().await.insert(info.peer_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, peer_id: &Uuid) -> Option<PeerInfo> {
        self.peers.write().await.remove(peer_id)
    }

    /// Encode and send a message. Returns the number of receivers reached.
    pub fn broadcast(&self, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        Ok(self.broadcast_raw(Arc::new(msg.encode()?)))
    }

    /// Send pre-encoded bytes. No receivers is not an error.
    pub fn broadcast_raw(&self, frame: Frame) -> usize {
        self.sender.send(frame).unwrap_or(0)
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }
}
