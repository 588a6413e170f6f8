//! Append-only ledger of immutable version records.

use std::sync::Arc;

use crate::model::{DocumentId, DocumentMeta, VersionRecord};
use crate::storage::{HistoryBackend, StorageError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum HistoryError {
    #[error("Version {version} of document {doc_id} not found")]
    VersionNotFound { doc_id: DocumentId, version: u64 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Version records of every document. Records are written once and never
/// mutated or deleted.
#[derive(Clone)]
pub struct VersionHistoryStore {
    backend: Arc<dyn HistoryBackend>,
}

impl VersionHistoryStore {
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        Self { backend }
    }

    /// Write one record. An existing `(doc_id, version)` is never overwritten.
    pub fn append(&self, record: &VersionRecord) -> Result<(), StorageError> {
        self.backend.put_version(record)?;
        log::debug!("Appended version {} of doc {}", record.version, record.doc_id);
        Ok(())
    }

    /// Write a record and the meta that now points at it in one atomic batch.
    pub fn commit(&self, record: &VersionRecord, meta: &DocumentMeta) -> Result<(), StorageError> {
        debug_assert_eq!(record.version, meta.current_version);
        self.backend.commit_version(record, meta)?;
        log::debug!("Committed version {} of doc {}", record.version, record.doc_id);
        Ok(())
    }

    /// Every record of a document, in storage order.
    pub fn list_by_doc(&self, doc_id: &DocumentId) -> Result<Vec<VersionRecord>, StorageError> {
        self.backend.scan_versions(doc_id)
    }

    /// Records sorted by version, newest first. Version 0 never appears.
    pub fn list_sorted(&self, doc_id: &DocumentId) -> Result<Vec<VersionRecord>, StorageError> {
        let mut records = self.list_by_doc(doc_id)?;
        records.retain(|r| r.version > 0);
        records.sort_unstable_by(|a, b| b.version.cmp(&a.version));
        Ok(records)
    }

    pub fn get(&self, doc_id: &DocumentId, version: u64) -> Result<VersionRecord, HistoryError> {
        self.backend
            .get_version(doc_id, version)?
            .ok_or_else(|| HistoryError::VersionNotFound {
                doc_id: doc_id.clone(),
                version,
            })
    }
}
