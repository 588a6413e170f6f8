//! In-process [`HistoryBackend`] for tests and ephemeral servers.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use super::{HistoryBackend, StorageError, StoredDocument};
use crate::model::{DocumentId, DocumentMeta, VersionRecord};

#[derive(Default)]
struct Collections {
    versions: HashMap<DocumentId, BTreeMap<u64, VersionRecord>>,
    meta: HashMap<DocumentId, DocumentMeta>,
    documents: HashMap<DocumentId, Vec<u8>>,
    updates: HashMap<DocumentId, BTreeMap<u64, Vec<u8>>>,
}

/// Volatile backend; every call takes one mutex, so each call is atomic.
#[derive(Default)]
pub struct MemoryBackend {
    inner: Mutex<Collections>,
    sequence: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, Collections>, StorageError> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Unavailable("memory backend lock poisoned".into()))
    }
}

impl HistoryBackend for MemoryBackend {
    fn get_version(
        &self,
        doc_id: &DocumentId,
        version: u64,
    ) -> Result<Option<VersionRecord>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .versions
            .get(doc_id)
            .and_then(|records| records.get(&version))
            .cloned())
    }

    fn scan_versions(&self, doc_id: &DocumentId) -> Result<Vec<VersionRecord>, StorageError> {
        let inner = self.lock()?;
        Ok(inner
            .versions
            .get(doc_id)
            .map(|records| records.values().cloned().collect())
            .unwrap_or_default())
    }

    fn put_version(&self, record: &VersionRecord) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let records = inner.versions.entry(record.doc_id.clone()).or_default();
        if records.contains_key(&record.version) {
            return Err(StorageError::Conflict {
                doc_id: record.doc_id.clone(),
                version: record.version,
            });
        }
        records.insert(record.version, record.clone());
        Ok(())
    }

    fn get_meta(&self, doc_id: &DocumentId) -> Result<Option<DocumentMeta>, StorageError> {
        Ok(self.lock()?.meta.get(doc_id).cloned())
    }

    fn put_meta(&self, meta: &DocumentMeta) -> Result<(), StorageError> {
        self.lock()?.meta.insert(meta.doc_id.clone(), meta.clone());
        Ok(())
    }

    fn commit_version(
        &self,
        record: &VersionRecord,
        meta: &DocumentMeta,
    ) -> Result<(), StorageError> {
        let mut inner = self.lock()?;
        let exists = inner
            .versions
            .get(&record.doc_id)
            .is_some_and(|records| records.contains_key(&record.version));
        if exists {
            return Err(StorageError::Conflict {
                doc_id: record.doc_id.clone(),
                version: record.version,
            });
        }
        inner
            .versions
            .entry(record.doc_id.clone())
            .or_default()
            .insert(record.version, record.clone());
        inner.meta.insert(meta.doc_id.clone(), meta.clone());
        Ok(())
    }

    fn load_document(&self, doc_id: &DocumentId) -> Result<StoredDocument, StorageError> {
        let inner = self.lock()?;
        Ok(StoredDocument {
            state: inner.documents.get(doc_id).cloned(),
            updates: inner
                .updates
                .get(doc_id)
                .map(|log| log.iter().map(|(seq, u)| (*seq, u.clone())).collect())
                .unwrap_or_default(),
        })
    }

    fn append_update(&self, doc_id: &DocumentId, update: &[u8]) -> Result<u64, StorageError> {
        let mut inner = self.lock()?;
        let seq = self.sequence.fetch_add(1, Ordering::SeqCst);
        inner
            .updates
            .entry(doc_id.clone())
            .or_default()
            .insert(seq, update.to_vec());
        Ok(seq)
    }

    fn compact_document(
        &self,
        doc_id: &DocumentId,
        state: &[u8],
        through_seq: Option<u64>,
    ) -> Result<u64, StorageError> {
        let mut inner = self.lock()?;
        inner.documents.insert(doc_id.clone(), state.to_vec());
        let Some(through) = through_seq else {
            return Ok(0);
        };
        let Some(log) = inner.updates.get_mut(doc_id) else {
            return Ok(0);
        };
        let keep = log.split_off(&(through + 1));
        let removed = log.len() as u64;
        *log = keep;
        Ok(removed)
    }
}
