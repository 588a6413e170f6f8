//! Versioning operations exposed to the transport.
//!
//! Save, revert and rename of one document are serialized by a per-document
//! operation lock; different documents never wait on each other. The lock
//! order is always operation lock, then meta lock.

use std::sync::Arc;

use crate::error::ServiceError;
use crate::history::VersionHistoryStore;
use crate::live::{LiveConfig, LiveDocuments};
use crate::locks::DocLocks;
use crate::meta::DocumentMetadataStore;
use crate::model::{Author, DocumentId, DocumentMeta, VersionRecord, VersionSummary};
use crate::registry::ConnectionRegistry;
use crate::revert::{RevertEngine, RevertOutcome};
use crate::storage::HistoryBackend;

pub struct VersioningService {
    history: Arc<VersionHistoryStore>,
    meta: Arc<DocumentMetadataStore>,
    live: Arc<LiveDocuments>,
    registry: Arc<ConnectionRegistry>,
    engine: RevertEngine,
    ops: DocLocks,
}

impl VersioningService {
    pub fn new(backend: Arc<dyn HistoryBackend>, live_config: LiveConfig) -> Self {
        let history = Arc::new(VersionHistoryStore::new(backend.clone()));
        let meta = Arc::new(DocumentMetadataStore::new(backend.clone()));
        let live = Arc::new(LiveDocuments::new(backend, live_config));
        let registry = Arc::new(ConnectionRegistry::new());
        let engine = RevertEngine::new(history.clone(), meta.clone(), live.clone(), registry.clone());
        Self {
            history,
            meta,
            live,
            registry,
            engine,
            ops: DocLocks::new(),
        }
    }

    pub fn live(&self) -> &Arc<LiveDocuments> {
        &self.live
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn history(&self) -> &VersionHistoryStore {
        &self.history
    }

    pub fn engine(&self) -> &RevertEngine {
        &self.engine
    }

    /// Save the live document of `doc_id` as the next version.
    pub async fn save_version(
        &self,
        doc_id: &DocumentId,
        author: Author,
    ) -> Result<VersionRecord, ServiceError> {
        if !author.is_valid() {
            return Err(ServiceError::invalid("author name is required"));
        }

        let _op = self.ops.lock(doc_id).await;
        let result = self.save_locked(doc_id, author).await;
        match &result {
            Ok(record) => {
                log::info!(
                    "saveVersion: doc {doc_id} version {} by {}",
                    record.version,
                    record.author.name
                );
                self.release(doc_id).await;
            }
            Err(e) => log::error!("saveVersion failed for doc {doc_id}: {e}"),
        }
        result
    }

    async fn save_locked(
        &self,
        doc_id: &DocumentId,
        author: Author,
    ) -> Result<VersionRecord, ServiceError> {
        let allocation = self.meta.allocate_next_version(doc_id).await?;
        let room = self.live.open(doc_id).await?;
        let (full_state, snapshot) = room.doc().encode_state_and_snapshot();
        let (record, _meta) = allocation.commit(&self.history, full_state, snapshot, author)?;
        Ok(record)
    }

    /// Every version of `doc_id`, newest first.
    pub async fn list_versions(
        &self,
        doc_id: &DocumentId,
    ) -> Result<Vec<VersionSummary>, ServiceError> {
        let records = self.history.list_sorted(doc_id).map_err(|e| {
            log::error!("getVersionList failed for doc {doc_id}: {e}");
            ServiceError::from(e)
        })?;
        Ok(records.iter().map(VersionSummary::from_record).collect())
    }

    /// Roll the live document back to `version` and tell connected sessions
    /// to reload.
    pub async fn revert_version(
        &self,
        doc_id: &DocumentId,
        version: u64,
    ) -> Result<RevertOutcome, ServiceError> {
        if version == 0 {
            return Err(ServiceError::invalid("version must be positive"));
        }

        let _op = self.ops.lock(doc_id).await;
        let outcome = self.engine.revert(doc_id, version).await.map_err(|e| {
            log::error!("recoveryVersion failed for doc {doc_id} version {version}: {e}");
            ServiceError::from(e)
        })?;
        self.release(doc_id).await;
        Ok(outcome)
    }

    /// Unload a room the API opened once no session holds it.
    async fn release(&self, doc_id: &DocumentId) {
        if let Err(e) = self.live.close_if_idle(doc_id).await {
            log::warn!("Failed to close doc {doc_id} after API call: {e}");
        }
    }

    pub async fn rename_document(
        &self,
        doc_id: &DocumentId,
        title: &str,
    ) -> Result<DocumentMeta, ServiceError> {
        let title = title.trim();
        if title.is_empty() {
            return Err(ServiceError::invalid("title is required"));
        }

        let _op = self.ops.lock(doc_id).await;
        let meta = self.meta.set_title(doc_id, title).await.map_err(|e| {
            log::warn!("renameDocument failed for doc {doc_id}: {e}");
            ServiceError::from(e)
        })?;
        log::info!("renameDocument: doc {doc_id} is now {title:?}");
        Ok(meta)
    }

    /// Metadata of `doc_id`, created on first touch.
    pub async fn get_doc_info(&self, doc_id: &DocumentId) -> Result<DocumentMeta, ServiceError> {
        Ok(self.meta.get_or_create(doc_id).await?)
    }
}
