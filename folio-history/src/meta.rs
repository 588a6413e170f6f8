//! Per-document metadata: the version counter and the title.
//!
//! The store is the single authority for version numbering. Every
//! read-modify-write of a meta record runs under that document's meta lock,
//! and [`VersionAllocation`] keeps holding it until the new version is
//! committed or abandoned.

use std::sync::Arc;

use crate::history::VersionHistoryStore;
use crate::locks::{DocGuard, DocLocks};
use crate::model::{now_millis, Author, DocumentId, DocumentMeta, VersionRecord};
use crate::storage::{HistoryBackend, StorageError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum MetaError {
    #[error("Document {0} not found")]
    NotFound(DocumentId),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub struct DocumentMetadataStore {
    backend: Arc<dyn HistoryBackend>,
    locks: DocLocks,
}

impl DocumentMetadataStore {
    pub fn new(backend: Arc<dyn HistoryBackend>) -> Self {
        Self {
            backend,
            locks: DocLocks::new(),
        }
    }

    pub fn get(&self, doc_id: &DocumentId) -> Result<Option<DocumentMeta>, StorageError> {
        self.backend.get_meta(doc_id)
    }

    /// Return the meta of `doc_id`, creating it with version 0 and the
    /// default title on first touch.
    pub async fn get_or_create(&self, doc_id: &DocumentId) -> Result<DocumentMeta, StorageError> {
        if let Some(meta) = self.backend.get_meta(doc_id)? {
            return Ok(meta);
        }

        let _guard = self.locks.lock(doc_id).await;
        if let Some(meta) = self.backend.get_meta(doc_id)? {
            return Ok(meta);
        }
        let meta = DocumentMeta::new(doc_id.clone());
        self.backend.put_meta(&meta)?;
        log::info!("Created metadata for doc {doc_id}");
        Ok(meta)
    }

    /// Change the title. The version counter is left untouched.
    pub async fn set_title(
        &self,
        doc_id: &DocumentId,
        title: &str,
    ) -> Result<DocumentMeta, MetaError> {
        let _guard = self.locks.lock(doc_id).await;
        let mut meta = self
            .backend
            .get_meta(doc_id)?
            .ok_or_else(|| MetaError::NotFound(doc_id.clone()))?;
        meta.title = title.to_string();
        meta.updated_at = now_millis().max(meta.updated_at);
        self.backend.put_meta(&meta)?;
        Ok(meta)
    }

    /// Reserve `current_version + 1` for `doc_id`.
    ///
    /// Nothing is persisted here. The reservation holds the meta lock, so a
    /// concurrent allocation for the same document waits until this one is
    /// committed or dropped.
    pub async fn allocate_next_version(
        &self,
        doc_id: &DocumentId,
    ) -> Result<VersionAllocation, StorageError> {
        let guard = self.locks.lock(doc_id).await;
        let mut meta = self
            .backend
            .get_meta(doc_id)?
            .unwrap_or_else(|| DocumentMeta::new(doc_id.clone()));
        meta.current_version += 1;
        Ok(VersionAllocation {
            version: meta.current_version,
            meta,
            _guard: guard,
        })
    }
}

/// A reserved version number, valid until committed or dropped.
pub struct VersionAllocation {
    version: u64,
    /// Meta as it will be stored once the version is committed
    meta: DocumentMeta,
    _guard: DocGuard,
}

impl VersionAllocation {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn doc_id(&self) -> &DocumentId {
        &self.meta.doc_id
    }

    /// Build the record for this version and commit it together with the
    /// advanced meta. On error nothing is written and the number is released.
    pub fn commit(
        self,
        history: &VersionHistoryStore,
        full_state: Vec<u8>,
        snapshot: Vec<u8>,
        author: Author,
    ) -> Result<(VersionRecord, DocumentMeta), StorageError> {
        let VersionAllocation {
            version,
            mut meta,
            _guard,
        } = self;

        let now = now_millis();
        let created_at = now.max(meta.last_saved_at);
        meta.last_saved_at = created_at;
        meta.updated_at = now.max(meta.updated_at);

        let record = VersionRecord {
            doc_id: meta.doc_id.clone(),
            version,
            full_state,
            snapshot,
            author,
            created_at,
        };
        history.commit(&record, &meta)?;
        Ok((record, meta))
    }
}
