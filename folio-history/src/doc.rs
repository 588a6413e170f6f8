//! Replicated document adapter over `yrs`.
//!
//! The versioning core only needs a narrow slice of the CRDT engine: apply an
//! update, encode full state / state vector / snapshot, rebuild a document as
//! of a snapshot, and undo one tracked batch. Everything here is synchronous;
//! a yrs transaction is never held across an `.await`.
//!
//! All documents are created with garbage collection disabled. Snapshots can
//! only be materialized when deleted content is still present.

use std::fmt;
use std::sync::Arc;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::{Encode, Encoder, EncoderV1};
use yrs::{
    Doc, GetString, Options, ReadTxn, Snapshot, StateVector, Text, TextRef, Transact,
    UndoManager, Update, WriteTxn,
};

/// Name of the shared text root the editor binding edits.
pub const DEFAULT_ROOT: &str = "default";

/// Origin attached to transactions the revert undo manager must capture.
const TRACKED_ORIGIN: &str = "folio-revert";

#[derive(Debug, Clone, thiserror::Error)]
pub enum DocError {
    #[error("Malformed update: {0}")]
    MalformedUpdate(String),

    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),

    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Failed to apply update: {0}")]
    Apply(String),

    #[error("Failed to materialize snapshot: {0}")]
    Materialize(String),
}

/// Decode a v1 update without applying it.
pub fn decode_update(update: &[u8]) -> Result<Update, DocError> {
    Update::decode_v1(update).map_err(|e| DocError::MalformedUpdate(e.to_string()))
}

/// Decode a v1 state vector.
pub fn decode_state_vector(sv: &[u8]) -> Result<StateVector, DocError> {
    StateVector::decode_v1(sv).map_err(|e| DocError::MalformedStateVector(e.to_string()))
}

/// A replicated document rooted at one shared text type.
///
/// Cloning is cheap and yields a handle to the same document.
#[derive(Clone)]
pub struct SharedDoc {
    doc: Doc,
    root: Arc<str>,
}

impl fmt::Debug for SharedDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDoc")
            .field("root", &self.root)
            .field("client_id", &self.doc.client_id())
            .finish()
    }
}

impl SharedDoc {
    /// Create an empty document with GC disabled.
    pub fn new(root: impl Into<Arc<str>>) -> Self {
        let doc = Doc::with_options(Options {
            skip_gc: true,
            ..Options::default()
        });
        Self {
            doc,
            root: root.into(),
        }
    }

    /// Create a document from an encoded full state.
    pub fn from_state(root: impl Into<Arc<str>>, state: &[u8]) -> Result<Self, DocError> {
        let doc = Self::new(root);
        doc.apply_update(state)?;
        Ok(doc)
    }

    pub fn root_name(&self) -> &str {
        &self.root
    }

    /// Apply a v1 update.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocError> {
        let update = decode_update(update)?;
        self.apply_decoded(update)
    }

    pub(crate) fn apply_decoded(&self, update: Update) -> Result<(), DocError> {
        let mut txn = self.doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    /// Full state as a v1 update.
    pub fn encode_full_state(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    pub fn state_vector(&self) -> StateVector {
        self.doc.transact().state_vector()
    }

    pub fn encode_state_vector(&self) -> Vec<u8> {
        self.state_vector().encode_v1()
    }

    /// Everything this document has that a peer at `remote_sv` lacks.
    pub fn encode_diff(&self, remote_sv: &StateVector) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_diff_v1(remote_sv)
    }

    /// [`encode_diff`](Self::encode_diff) for an encoded state vector.
    pub fn encode_diff_bytes(&self, remote_sv: &[u8]) -> Result<Vec<u8>, DocError> {
        let sv = decode_state_vector(remote_sv)?;
        Ok(self.encode_diff(&sv))
    }

    /// Causal frontier (state vector + delete set) as an encoded snapshot.
    pub fn encode_snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.snapshot().encode_v1()
    }

    /// Full state and snapshot read in one transaction, so both describe the
    /// same point in the document's history.
    pub fn encode_state_and_snapshot(&self) -> (Vec<u8>, Vec<u8>) {
        let txn = self.doc.transact();
        let state = txn.encode_state_as_update_v1(&StateVector::default());
        (state, txn.snapshot().encode_v1())
    }

    /// Build a new, independent document holding this document's content as
    /// of `snapshot`.
    pub fn from_snapshot(&self, snapshot: &[u8]) -> Result<SharedDoc, DocError> {
        let snapshot =
            Snapshot::decode_v1(snapshot).map_err(|e| DocError::MalformedSnapshot(e.to_string()))?;
        let mut encoder = EncoderV1::new();
        {
            let txn = self.doc.transact();
            txn.encode_state_from_snapshot(&snapshot, &mut encoder)
                .map_err(|e| DocError::Materialize(e.to_string()))?;
        }
        SharedDoc::from_state(self.root.clone(), &encoder.to_vec())
    }

    /// Current content of the shared text root.
    pub fn text(&self) -> String {
        let txn = self.doc.transact();
        txn.get_text(self.root.as_ref())
            .map(|text| text.get_string(&txn))
            .unwrap_or_default()
    }

    /// Insert text locally and return the resulting v1 update.
    pub fn insert_text(&self, index: u32, chunk: &str) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(self.root.as_ref());
        text.insert(&mut txn, index, chunk);
        txn.encode_update_v1()
    }

    /// Remove `len` characters locally and return the resulting v1 update.
    pub fn remove_text(&self, index: u32, len: u32) -> Vec<u8> {
        let mut txn = self.doc.transact_mut();
        let text = txn.get_or_insert_text(self.root.as_ref());
        text.remove_range(&mut txn, index, len);
        txn.encode_update_v1()
    }

    fn text_ref(&self) -> TextRef {
        let mut txn = self.doc.transact_mut();
        txn.get_or_insert_text(self.root.as_ref())
    }
}

/// A document whose next updates are captured as one undoable batch.
pub struct TrackedDoc {
    doc: SharedDoc,
    undo: UndoManager,
}

impl TrackedDoc {
    /// Start tracking `doc`. Changes made before this call are not undoable.
    pub fn track(doc: SharedDoc) -> Self {
        let text = doc.text_ref();
        let mut undo = UndoManager::new(&doc.doc, &text);
        undo.include_origin(TRACKED_ORIGIN);
        Self { doc, undo }
    }

    /// Apply a v1 update as a tracked batch.
    pub fn apply_tracked(&mut self, update: &[u8]) -> Result<(), DocError> {
        let update = decode_update(update)?;
        let mut txn = self.doc.doc.transact_mut_with(TRACKED_ORIGIN);
        txn.apply_update(update)
            .map_err(|e| DocError::Apply(e.to_string()))
    }

    /// Undo the last tracked batch. Returns `false` when there was nothing to undo.
    pub fn undo_last_batch(&mut self) -> bool {
        self.undo.undo_blocking()
    }

    pub fn doc(&self) -> &SharedDoc {
        &self.doc
    }

    /// Stop tracking and hand back the document.
    pub fn into_inner(self) -> SharedDoc {
        let TrackedDoc { doc, undo } = self;
        drop(undo);
        doc
    }
}
