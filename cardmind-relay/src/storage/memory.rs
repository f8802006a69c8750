//! In-process store used when no storage path is configured, and in tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{PersistenceStore, StoreError};
use crate::session::DocumentId;

/// Keeps every update in memory. Contents are lost when the process exits.
///
/// Loads and appends can be made to fail on demand to exercise error paths.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: Mutex<HashMap<DocumentId, Vec<Vec<u8>>>>,
    sequence: AtomicU64,
    fail_loads: AtomicBool,
    fail_appends: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `load` fail (or succeed again).
    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent `append` fail (or succeed again).
    pub fn set_fail_appends(&self, fail: bool) {
        self.fail_appends.store(fail, Ordering::SeqCst);
    }

    /// Number of updates stored for `doc_id`.
    pub fn update_count(&self, doc_id: &DocumentId) -> usize {
        self.documents
            .lock()
            .map(|docs| docs.get(doc_id).map_or(0, Vec::len))
            .unwrap_or(0)
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<DocumentId, Vec<Vec<u8>>>>, StoreError> {
        self.documents
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store lock poisoned".into()))
    }
}

impl PersistenceStore for MemoryStore {
    fn load(&self, doc_id: &DocumentId) -> Result<Vec<Vec<u8>>, StoreError> {
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("load of {doc_id} refused")));
        }
        Ok(self.lock()?.get(doc_id).cloned().unwrap_or_default())
    }

    fn append(&self, doc_id: &DocumentId, update: &[u8]) -> Result<u64, StoreError> {
        if self.fail_appends.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("append to {doc_id} refused")));
        }
        let mut docs = self.lock()?;
        docs.entry(doc_id.clone()).or_default().push(update.to_vec());
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst))
    }

    fn compact(&self, doc_id: &DocumentId, snapshot: &[u8]) -> Result<(), StoreError> {
        let mut docs = self.lock()?;
        docs.insert(doc_id.clone(), vec![snapshot.to_vec()]);
        Ok(())
    }
}
