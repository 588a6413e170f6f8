//! CRDT-aware rollback of a live document to a saved version.
//!
//! A revert never replays history or replaces the live document. It computes
//! new CRDT operations that, merged into the live replica, restore the content
//! of the target version while keeping edits made concurrently:
//!
//! ```text
//!  live ──from_snapshot(target)──► past
//!   │                               │
//!   └──── changes_since(past) ─────►│ apply as one tracked batch
//!                                   │ undo that batch
//!                                   ▼
//!                                 undone ──rediff(live now)──► delta ──► live
//! ```
//!
//! [`RevertEngine::prepare`] works on private copies only. [`RevertEngine::commit`]
//! computes the final delta under the live room's write lock, so edits that
//! landed after `prepare` are preserved.

use std::sync::Arc;
use uuid::Uuid;

use crate::doc::{DocError, SharedDoc, TrackedDoc};
use crate::history::{HistoryError, VersionHistoryStore};
use crate::live::{LiveDocuments, LiveError};
use crate::meta::DocumentMetadataStore;
use crate::model::DocumentId;
use crate::registry::{ConnectionRegistry, Signal};
use crate::storage::StorageError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RevertError {
    #[error("Version {version} of document {doc_id} is beyond current version {current}")]
    InvalidVersion {
        doc_id: DocumentId,
        version: u64,
        current: u64,
    },

    #[error("Version {version} of document {doc_id} not found")]
    VersionNotFound { doc_id: DocumentId, version: u64 },

    #[error("Revert of document {doc_id} to version {version} failed: {reason}")]
    RevertFailed {
        doc_id: DocumentId,
        version: u64,
        reason: String,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RevertError {
    fn failed(doc_id: &DocumentId, version: u64, reason: impl ToString) -> Self {
        RevertError::RevertFailed {
            doc_id: doc_id.clone(),
            version,
            reason: reason.to_string(),
        }
    }
}

/// Rebuild `live` as it was at an encoded snapshot.
pub fn reconstruct(live: &SharedDoc, snapshot: &[u8]) -> Result<SharedDoc, DocError> {
    live.from_snapshot(snapshot)
}

/// Everything `live` has that `past` lacks, as one update.
pub fn changes_since(live: &SharedDoc, past: &SharedDoc) -> Vec<u8> {
    live.encode_diff(&past.state_vector())
}

/// Apply `changes` onto `past` as a tracked batch and undo it.
///
/// The result has the content of `past` but contains every operation of
/// `changes` plus the inverse operations, so merging it into a replica that
/// already saw `changes` rolls them back.
pub fn undo_changes(past: SharedDoc, changes: &[u8]) -> Result<SharedDoc, DocError> {
    let mut tracked = TrackedDoc::track(past);
    tracked.apply_tracked(changes)?;
    tracked.undo_last_batch();
    Ok(tracked.into_inner())
}

/// What `undone` has that `current` lacks.
pub fn rediff(undone: &SharedDoc, current: &SharedDoc) -> Vec<u8> {
    undone.encode_diff(&current.state_vector())
}

/// A computed rollback, not yet applied to the live document.
pub struct RevertPlan {
    doc_id: DocumentId,
    version: u64,
    undone: SharedDoc,
}

impl RevertPlan {
    pub fn doc_id(&self) -> &DocumentId {
        &self.doc_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Content the live document will show once the plan is committed,
    /// absent concurrent edits.
    pub fn target_text(&self) -> String {
        self.undone.text()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertOutcome {
    pub doc_id: DocumentId,
    pub version: u64,
    /// Size of the update merged into the live document
    pub update_len: usize,
    /// Connections that received the reload signal
    pub notified: usize,
}

pub struct RevertEngine {
    history: Arc<VersionHistoryStore>,
    meta: Arc<DocumentMetadataStore>,
    live: Arc<LiveDocuments>,
    registry: Arc<ConnectionRegistry>,
}

impl RevertEngine {
    pub fn new(
        history: Arc<VersionHistoryStore>,
        meta: Arc<DocumentMetadataStore>,
        live: Arc<LiveDocuments>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            history,
            meta,
            live,
            registry,
        }
    }

    /// Revert the live document of `doc_id` to `version` and signal every
    /// connected session to reload.
    pub async fn revert(&self, doc_id: &DocumentId, version: u64) -> Result<RevertOutcome, RevertError> {
        let plan = self.prepare(doc_id, version).await?;
        self.commit(plan).await
    }

    /// Validate the target and compute the rolled-back document. The live
    /// document is only read.
    pub async fn prepare(&self, doc_id: &DocumentId, version: u64) -> Result<RevertPlan, RevertError> {
        let meta = self.meta.get_or_create(doc_id).await?;
        if version > meta.current_version {
            return Err(RevertError::InvalidVersion {
                doc_id: doc_id.clone(),
                version,
                current: meta.current_version,
            });
        }

        let record = self.history.get(doc_id, version).map_err(|e| match e {
            HistoryError::VersionNotFound { doc_id, version } => {
                RevertError::VersionNotFound { doc_id, version }
            }
            HistoryError::Storage(e) => RevertError::Storage(e),
        })?;

        let room = self
            .live
            .open(doc_id)
            .await
            .map_err(|e| RevertError::failed(doc_id, version, e))?;
        // Fork so the rest of the computation never observes a moving replica
        let live = SharedDoc::from_state(room.doc().root_name(), &room.doc().encode_full_state())
            .map_err(|e| RevertError::failed(doc_id, version, e))?;
        drop(room);

        let past = reconstruct(&live, &record.snapshot)
            .map_err(|e| RevertError::failed(doc_id, version, e))?;
        let changes = changes_since(&live, &past);
        let undone = undo_changes(past, &changes)
            .map_err(|e| RevertError::failed(doc_id, version, e))?;

        log::debug!(
            "Prepared revert of doc {doc_id} to version {version} ({} bytes of changes)",
            changes.len()
        );
        Ok(RevertPlan {
            doc_id: doc_id.clone(),
            version,
            undone,
        })
    }

    /// Merge the plan into the live document against its current state and
    /// broadcast the reload signal.
    pub async fn commit(&self, plan: RevertPlan) -> Result<RevertOutcome, RevertError> {
        let RevertPlan {
            doc_id,
            version,
            undone,
        } = plan;

        let update = self
            .live
            .apply_with(&doc_id, Uuid::nil(), |current| Ok(rediff(&undone, current)))
            .await
            .map_err(|e| match e {
                LiveError::Doc(e) => RevertError::failed(&doc_id, version, e),
                LiveError::Storage(e) => RevertError::failed(&doc_id, version, e),
            })?;

        let notified = self.registry.broadcast(&doc_id, Signal::Reload).await;
        log::info!(
            "Reverted doc {doc_id} to version {version} ({} byte update, {notified} sessions notified)",
            update.len()
        );
        Ok(RevertOutcome {
            doc_id,
            version,
            update_len: update.len(),
            notified,
        })
    }
}
