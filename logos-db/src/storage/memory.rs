//! In-memory storage adapter.
//!
//! Survives `Repo` instances that share it, which makes it useful for
//! reopen/recovery tests without touching disk.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use super::{StorageAdapter, StoreError, StoredDocument};
use crate::repo::DocumentId;

#[derive(Debug, Default)]
pub struct MemoryStore {
    docs: Mutex<HashMap<DocumentId, StoredDocument>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of persisted documents.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.lock().contains_key(&id)
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<DocumentId, StoredDocument>> {
        self.docs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl StorageAdapter for MemoryStore {
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError> {
        Ok(self.lock().get(&id).cloned())
    }

    fn append_delta(&self, id: DocumentId, version: u64, delta: &[u8]) -> Result<(), StoreError> {
        let mut docs = self.lock();
        let doc = docs.entry(id).or_default();
        doc.deltas.push((version, delta.to_vec()));
        doc.version = doc.version.max(version);
        Ok(())
    }

    fn save_snapshot(
        &self,
        id: DocumentId,
        version: u64,
        snapshot: &[u8],
    ) -> Result<(), StoreError> {
        let mut docs = self.lock();
        let doc = docs.entry(id).or_default();
        doc.snapshot = Some(snapshot.to_vec());
        doc.deltas.retain(|(v, _)| *v > version);
        doc.version = doc.version.max(version);
        Ok(())
    }

    fn remove(&self, id: DocumentId) -> Result<(), StoreError> {
        self.lock().remove(&id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_drops_older_deltas() {
        let store = MemoryStore::new();
        let id = DocumentId::new();

        store.save_snapshot(id, 1, b"base").unwrap();
        store.append_delta(id, 2, b"d2").unwrap();
        store.append_delta(id, 3, b"d3").unwrap();
        store.save_snapshot(id, 2, b"compacted").unwrap();

        let doc = store.load(id).unwrap().unwrap();
        assert_eq!(doc.snapshot.as_deref(), Some(&b"compacted"[..]));
        assert_eq!(doc.deltas, vec![(3, b"d3".to_vec())]);
        assert_eq!(doc.version, 3);
    }

    #[test]
    fn test_remove() {
        let store = MemoryStore::new();
        let id = DocumentId::new();
        store.save_snapshot(id, 1, b"base").unwrap();
        assert!(store.contains(id));

        store.remove(id).unwrap();
        assert!(store.is_empty());
        assert!(store.load(id).unwrap().is_none());
    }
}
