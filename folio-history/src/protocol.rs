//! Binary protocol for live document synchronization.
//!
//! Wire format (bincode-encoded):
//! ```text
//! ┌──────────┬───────────┬───────────────┬──────────┬──────────┐
//! │ msg_type │ peer_id   │ doc_id        │ clock    │ payload  │
//! │ 1 byte   │ 16 bytes  │ len + utf-8   │ varint   │ variable │
//! └──────────┴───────────┴───────────────┴──────────┴──────────┘
//! ```
//!
//! Payloads are Yjs v1 updates / state vectors, or bincode-encoded
//! [`PeerInfo`] for `Join`. API requests do not use this format; they travel
//! as JSON text frames (see [`crate::api`]).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Message types for the sync protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum MessageType {
    /// Yrs state vector; asks the other side for what it is missing
    SyncStep1 = 1,
    /// Yrs state diff response
    SyncStep2 = 2,
    /// Incremental document update
    Update = 3,
    /// Peer attaches to a document
    Join = 5,
    /// Peer detached
    Leave = 6,
    /// Heartbeat ping
    Ping = 7,
    /// Heartbeat pong
    Pong = 8,
    /// Discard local state and resynchronize; sent after a revert
    Reload = 9,
}

/// Peer identity with display metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: Uuid,
    pub name: String,
}

impl PeerInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(Uuid::new_v4(), name)
    }

    pub fn with_id(peer_id: Uuid, name: impl Into<String>) -> Self {
        Self {
            peer_id,
            name: name.into(),
        }
    }
}

/// Top-level protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncMessage {
    pub msg_type: MessageType,
    /// Sender; nil when the server originates the message
    pub peer_id: Uuid,
    pub doc_id: String,
    /// Sender-local counter, informational
    pub clock: u64,
    pub payload: Vec<u8>,
}

impl SyncMessage {
    fn new(msg_type: MessageType, peer_id: Uuid, doc_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            msg_type,
            peer_id,
            doc_id: doc_id.into(),
            clock: 0,
            payload,
        }
    }

    /// Create an incremental update message.
    pub fn update(peer_id: Uuid, doc_id: impl Into<String>, clock: u64, yrs_update: Vec<u8>) -> Self {
        Self {
            clock,
            ..Self::new(MessageType::Update, peer_id, doc_id, yrs_update)
        }
    }

    /// Create a sync step 1 (state vector request).
    pub fn sync_step1(peer_id: Uuid, doc_id: impl Into<String>, state_vector: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep1, peer_id, doc_id, state_vector)
    }

    /// Create a sync step 2 (state diff response).
    pub fn sync_step2(peer_id: Uuid, doc_id: impl Into<String>, state_diff: Vec<u8>) -> Self {
        Self::new(MessageType::SyncStep2, peer_id, doc_id, state_diff)
    }

    /// Create a join request carrying the peer's identity.
    pub fn join(doc_id: impl Into<String>, info: &PeerInfo) -> Result<Self, ProtocolError> {
        let payload = bincode::serde::encode_to_vec(info, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Self::new(MessageType::Join, info.peer_id, doc_id, payload))
    }

    /// Create a peer left notification.
    pub fn leave(peer_id: Uuid, doc_id: impl Into<String>) -> Self {
        Self::new(MessageType::Leave, peer_id, doc_id, Vec::new())
    }

    /// Create a reload instruction for every peer of a document.
    pub fn reload(doc_id: impl Into<String>) -> Self {
        Self::new(MessageType::Reload, Uuid::nil(), doc_id, Vec::new())
    }

    pub fn ping(peer_id: Uuid) -> Self {
        Self::new(MessageType::Ping, peer_id, String::new(), Vec::new())
    }

    pub fn pong(peer_id: Uuid) -> Self {
        Self::new(MessageType::Pong, peer_id, String::new(), Vec::new())
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let (msg, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(msg)
    }

    /// Parse the peer identity of a `Join` message.
    pub fn peer_info(&self) -> Result<PeerInfo, ProtocolError> {
        if self.msg_type != MessageType::Join {
            return Err(ProtocolError::InvalidMessageType(self.msg_type));
        }
        let (info, _) =
            bincode::serde::decode_from_slice(&self.payload, bincode::config::standard())
                .map_err(|e| ProtocolError::Deserialization(e.to_string()))?;
        Ok(info)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Invalid message type: {0:?}")]
    InvalidMessageType(MessageType),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_update_roundtrip() {
        let peer = Uuid::new_v4();
        let payload = vec![1, 2, 3, 4, 5];

        let msg = SyncMessage::update(peer, "doc-1", 42, payload.clone());
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Update);
        assert_eq!(decoded.peer_id, peer);
        assert_eq!(decoded.doc_id, "doc-1");
        assert_eq!(decoded.clock, 42);
        assert_eq!(decoded.payload, payload);
    }

    #[test]
    fn test_join_carries_peer_info() {
        let info = PeerInfo::new("Alice");
        let msg = SyncMessage::join("doc-1", &info).unwrap();
        let decoded = SyncMessage::decode(&msg.encode().unwrap()).unwrap();

        assert_eq!(decoded.msg_type, MessageType::Join);
        assert_eq!(decoded.peer_id, info.peer_id);
        assert_eq!(decoded.peer_info().unwrap(), info);
    }

    #[test]
    fn test_reload_is_server_originated() {
        let msg = SyncMessage::reload("doc-9");
        assert_eq!(msg.msg_type, MessageType::Reload);
        assert!(msg.peer_id.is_nil());
        assert!(msg.payload.is_empty());
        assert_eq!(SyncMessage::decode(&msg.encode().unwrap()).unwrap(), msg);
    }

    #[test]
    fn test_peer_info_requires_join() {
        let msg = SyncMessage::ping(Uuid::new_v4());
        assert!(matches!(
            msg.peer_info(),
            Err(ProtocolError::InvalidMessageType(MessageType::Ping))
        ));
    }

    #[test]
    fn test_decode_invalid_bytes() {
        assert!(SyncMessage::decode(&[0xFF, 0xFE, 0xFD]).is_err());
    }

    #[test]
    fn test_message_type_values() {
        assert_eq!(MessageType::SyncStep1 as u8, 1);
        assert_eq!(MessageType::SyncStep2 as u8, 2);
        assert_eq!(MessageType::Update as u8, 3);
        assert_eq!(MessageType::Join as u8, 5);
        assert_eq!(MessageType::Leave as u8, 6);
        assert_eq!(MessageType::Ping as u8, 7);
        assert_eq!(MessageType::Pong as u8, 8);
        assert_eq!(MessageType::Reload as u8, 9);
    }

    #[test]
    fn test_update_size_efficient() {
        let msg = SyncMessage::update(Uuid::new_v4(), "doc", 1, vec![0u8; 50]);
        let encoded = msg.encode().unwrap();
        assert!(
            encoded.len() < 120,
            "Encoded size {} too large for 50-byte update",
            encoded.len()
        );
    }
}
