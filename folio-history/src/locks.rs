//! Per-document async mutex table.
//!
//! Each document id maps to its own `tokio::sync::Mutex`, so critical
//! sections on different documents never contend. Entries nobody holds are
//! pruned whenever a new entry is inserted.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::model::DocumentId;

/// Guard for one document's critical section. Released on drop.
pub type DocGuard = OwnedMutexGuard<()>;

#[derive(Default)]
pub struct DocLocks {
    locks: RwLock<HashMap<DocumentId, Arc<Mutex<()>>>>,
}

impl DocLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `doc_id`.
    pub async fn lock(&self, doc_id: &DocumentId) -> DocGuard {
        self.entry(doc_id).await.lock_owned().await
    }

    /// Acquire without waiting, if nobody holds the document.
    pub async fn try_lock(&self, doc_id: &DocumentId) -> Option<DocGuard> {
        self.entry(doc_id).await.try_lock_owned().ok()
    }

    /// Number of documents currently tracked (held or not yet pruned).
    pub async fn tracked(&self) -> usize {
        self.locks.read().await.len()
    }

    async fn entry(&self, doc_id: &DocumentId) -> Arc<Mutex<()>> {
        // Fast path: read lock
        {
            let locks = self.locks.read().await;
            if let Some(lock) = locks.get(doc_id) {
                return lock.clone();
            }
        }

        // Slow path: write lock to create
        let mut locks = self.locks.write().await;
        if let Some(lock) = locks.get(doc_id) {
            return lock.clone();
        }
        // Only the table references an idle entry
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        let lock = Arc::new(Mutex::new(()));
        locks.insert(doc_id.clone(), lock.clone());
        lock
    }
}
