//! Durable storage for version history, document metadata and live documents.
//!
//! Architecture:
//! ```text
//! ┌──────────────────┐   records + meta    ┌────────────────────────────────────┐
//! │ VersionHistory   │ ──────────────────► │ HistoryBackend                     │
//! │ DocumentMetadata │                     │                                    │
//! └──────────────────┘                     │ "versions"  — immutable records    │
//! ┌──────────────────┐   state + updates   │ "meta"      — counter and title    │
//! │ LiveDocuments    │ ──────────────────► │ "documents" — compacted live state │
//! └──────────────────┘                     │ "updates"   — live update log      │
//!                                          └────────────────────────────────────┘
//! ```
//!
//! Every method is a single all-or-nothing write or a consistent read; callers
//! provide mutual exclusion for read-modify-write sequences (see [`crate::locks`]).

pub mod memory;
pub mod rocks;

pub use memory::MemoryBackend;
pub use rocks::{RocksStore, StoreConfig};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::model::{DocumentId, DocumentMeta, VersionRecord};

/// Storage errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Compression error: {0}")]
    Compression(String),

    /// A record already exists at this key; version records are write-once.
    #[error("Version {version} of document {doc_id} already exists")]
    Conflict { doc_id: DocumentId, version: u64 },

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<rocksdb::Error> for StorageError {
    fn from(e: rocksdb::Error) -> Self {
        StorageError::Database(e.to_string())
    }
}

/// Persisted state of a live document: the last compacted state plus the
/// updates appended after it, in sequence order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredDocument {
    pub state: Option<Vec<u8>>,
    pub updates: Vec<(u64, Vec<u8>)>,
}

impl StoredDocument {
    pub fn is_empty(&self) -> bool {
        self.state.is_none() && self.updates.is_empty()
    }

    /// Highest update sequence number contained, if any.
    pub fn last_seq(&self) -> Option<u64> {
        self.updates.last().map(|(seq, _)| *seq)
    }
}

/// Key/value collections backing the versioning core.
///
/// Implementations serialize nothing on their own beyond single calls;
/// `commit_version` is the only multi-record write and must be atomic.
pub trait HistoryBackend: Send + Sync {
    // ─── versions ─────────────────────────────────────────────────────

    fn get_version(
        &self,
        doc_id: &DocumentId,
        version: u64,
    ) -> Result<Option<VersionRecord>, StorageError>;

    /// All records of a document, in no particular order.
    fn scan_versions(&self, doc_id: &DocumentId) -> Result<Vec<VersionRecord>, StorageError>;

    /// Write one record; fails with [`StorageError::Conflict`] if the key exists.
    fn put_version(&self, record: &VersionRecord) -> Result<(), StorageError>;

    // ─── meta ─────────────────────────────────────────────────────────

    fn get_meta(&self, doc_id: &DocumentId) -> Result<Option<DocumentMeta>, StorageError>;

    fn put_meta(&self, meta: &DocumentMeta) -> Result<(), StorageError>;

    /// Atomically write a new record together with the meta that points at it.
    fn commit_version(
        &self,
        record: &VersionRecord,
        meta: &DocumentMeta,
    ) -> Result<(), StorageError>;

    // ─── live documents ───────────────────────────────────────────────

    fn load_document(&self, doc_id: &DocumentId) -> Result<StoredDocument, StorageError>;

    /// Append one update to the document's log. Returns its sequence number.
    fn append_update(&self, doc_id: &DocumentId, update: &[u8]) -> Result<u64, StorageError>;

    /// Replace the stored state and drop updates up to and including `through_seq`.
    /// Returns the number of updates removed.
    fn compact_document(
        &self,
        doc_id: &DocumentId,
        state: &[u8],
        through_seq: Option<u64>,
    ) -> Result<u64, StorageError>;
}

/// Serialize with bincode and compress with LZ4.
pub(crate) fn encode_value<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let raw = bincode::serde::encode_to_vec(value, bincode::config::standard())
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    Ok(lz4_flex::compress_prepend_size(&raw))
}

/// Inverse of [`encode_value`].
pub(crate) fn decode_value<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StorageError> {
    let raw = lz4_flex::decompress_size_prepended(bytes)
        .map_err(|e| StorageError::Compression(e.to_string()))?;
    let (value, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
        .map_err(|e| StorageError::Deserialization(e.to_string()))?;
    Ok(value)
}
