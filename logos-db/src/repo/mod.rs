//! Mergeable document repository.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐  create/find/delete  ┌──────────────────────┐
//! │ Collection / │ ───────────────────► │ Repo                 │
//! │ Database     │ ◄─── DocHandle ───── │  id → DocHandle      │
//! └──────────────┘                      │  (yrs Doc + snapshot)│
//!                                       └──────────┬───────────┘
//!                                          flush   │   load
//!                                                  ▼
//!                                       ┌──────────────────────┐
//!                                       │ StorageAdapter       │
//!                                       │  MemoryStore         │
//!                                       │  DocumentStore (Rocks)│
//!                                       └──────────────────────┘
//! ```
//!
//! Mutations are applied to the in-memory document immediately; `flush` is
//! the durability barrier that writes incremental yrs updates to storage.

pub mod handle;
pub mod patch;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

pub use handle::DocHandle;
pub use patch::{diff, ChangeOrigin, ChangePayload, Patch, PatchAction, Prop};

use crate::config::RepoConfig;
use crate::error::RepoError;
use crate::storage::StorageAdapter;

/// Opaque document identifier assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(Uuid);

impl DocumentId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for DocumentId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

struct RepoInner {
    config: RepoConfig,
    /// Resident documents; released only through `Repo::unload`
    docs: RwLock<HashMap<DocumentId, DocHandle>>,
    /// One id per document deleted through this repository, kept for its
    /// lifetime so late peer updates for them are refused
    deleted: RwLock<HashSet<DocumentId>>,
    storage: Option<Arc<dyn StorageAdapter>>,
}

/// The document repository.
///
/// Cloning is cheap; clones share documents and storage.
#[derive(Clone)]
pub struct Repo {
    inner: Arc<RepoInner>,
}

impl Repo {
    pub fn new(config: RepoConfig, storage: Option<Arc<dyn StorageAdapter>>) -> Self {
        Self {
            inner: Arc::new(RepoInner {
                config,
                docs: RwLock::new(HashMap::new()),
                deleted: RwLock::new(HashSet::new()),
                storage,
            }),
        }
    }

    /// Repository without persistence; `flush` is a no-op.
    pub fn in_memory() -> Self {
        Self::new(RepoConfig::default(), None)
    }

    pub fn with_storage(storage: Arc<dyn StorageAdapter>) -> Self {
        Self::new(RepoConfig::default(), Some(storage))
    }

    pub fn config(&self) -> &RepoConfig {
        &self.inner.config
    }

    /// Allocate a new document holding `initial`.
    pub async fn create(&self, initial: Map<String, Value>) -> DocHandle {
        let id = DocumentId::new();
        let handle = DocHandle::with_value(id, self.inner.config.broadcast_capacity, initial);
        self.inner.docs.write().await.insert(id, handle.clone());
        log::debug!("Created document {id}");
        handle
    }

    /// Resolve an existing document, loading it from storage if needed.
    pub async fn find(&self, id: DocumentId) -> Result<DocHandle, RepoError> {
        if let Some(handle) = self.inner.docs.read().await.get(&id) {
            return Ok(handle.clone());
        }
        if self.inner.deleted.read().await.contains(&id) {
            return Err(RepoError::Deleted(id));
        }

        let storage = self.inner.storage.as_ref().ok_or(RepoError::NotFound(id))?;
        let stored = storage.load(id)?.ok_or(RepoError::NotFound(id))?;
        let updates = stored
            .snapshot
            .iter()
            .map(Vec::as_slice)
            .chain(stored.deltas.iter().map(|(_, delta)| delta.as_slice()));
        let handle = DocHandle::restore(
            id,
            self.inner.config.broadcast_capacity,
            updates,
            stored.version,
        )?;
        log::debug!(
            "Loaded document {id} from storage (version {}, {} deltas)",
            stored.version,
            stored.deltas.len()
        );

        // Another task may have loaded it concurrently; keep the first
        let mut docs = self.inner.docs.write().await;
        Ok(docs.entry(id).or_insert(handle).clone())
    }

    /// Remove a document from memory and storage.
    pub async fn delete(&self, id: DocumentId) -> Result<(), RepoError> {
        let handle = self.inner.docs.write().await.remove(&id);
        if let Some(handle) = &handle {
            handle.mark_deleted();
        }
        self.inner.deleted.write().await.insert(id);

        if let Some(storage) = &self.inner.storage {
            storage.remove(id)?;
        }
        log::debug!("Deleted document {id}");
        Ok(())
    }

    /// Release a document from memory; the next `find` reloads it from storage.
    ///
    /// Only a fully persisted document that no caller still holds is released.
    /// Returns whether it was.
    pub async fn unload(&self, id: DocumentId) -> bool {
        if self.inner.storage.is_none() {
            return false;
        }
        let mut docs = self.inner.docs.write().await;
        match docs.get(&id) {
            Some(handle) if handle.is_releasable() => {
                docs.remove(&id);
                log::debug!("Unloaded document {id}");
                true
            }
            _ => false,
        }
    }

    /// Durability barrier: persist every listed document that has changes.
    ///
    /// Unknown and deleted ids are skipped.
    pub async fn flush(&self, ids: &[DocumentId]) -> Result<(), RepoError> {
        let storage = match &self.inner.storage {
            Some(storage) => storage,
            None => return Ok(()),
        };

        let mut seen = HashSet::new();
        let handles: Vec<DocHandle> = {
            let docs = self.inner.docs.read().await;
            ids.iter()
                .filter(|id| seen.insert(**id))
                .filter_map(|id| docs.get(id).cloned())
                .collect()
        };

        for handle in handles {
            let write = match handle.pending_write(self.inner.config.compaction_threshold) {
                Some(write) => write,
                None => continue,
            };
            if write.snapshot {
                storage.save_snapshot(handle.id(), write.version, &write.update)?;
                log::debug!(
                    "Flushed snapshot for {} at version {}",
                    handle.id(),
                    write.version
                );
            } else {
                storage.append_delta(handle.id(), write.version, &write.update)?;
                log::debug!("Flushed delta for {} at version {}", handle.id(), write.version);
            }
            handle.mark_persisted(write);
        }

        Ok(())
    }

    /// Merge a peer's yrs update into document `id`, creating it if unknown.
    pub async fn apply_update(&self, id: DocumentId, update: &[u8]) -> Result<DocHandle, RepoError> {
        let handle = match self.find(id).await {
            Ok(handle) => handle,
            Err(RepoError::NotFound(_)) => {
                let handle = DocHandle::new(id, self.inner.config.broadcast_capacity);
                let mut docs = self.inner.docs.write().await;
                docs.entry(id).or_insert(handle).clone()
            }
            Err(e) => return Err(e),
        };
        handle.apply_update(update)?;
        Ok(handle)
    }

    /// Ids of every document currently held in memory.
    pub async fn document_ids(&self) -> Vec<DocumentId> {
        self.inner.docs.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_document_id_parse_display() {
        let id = DocumentId::new();
        let parsed: DocumentId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
        assert!("not-a-uuid".parse::<DocumentId>().is_err());
    }

    #[tokio::test]
    async fn test_create_then_find() {
        let repo = Repo::in_memory();
        let handle = repo.create(obj(json!({"a": 1}))).await;

        let found = repo.find(handle.id()).await.unwrap();
        assert_eq!(found.value(), obj(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_find_unknown_is_not_found() {
        let repo = Repo::in_memory();
        let id = DocumentId::new();
        assert!(matches!(repo.find(id).await, Err(RepoError::NotFound(e)) if e == id));
    }

    #[tokio::test]
    async fn test_delete_then_find_is_deleted() {
        let repo = Repo::in_memory();
        let handle = repo.create(obj(json!({"a": 1}))).await;
        repo.delete(handle.id()).await.unwrap();

        assert!(handle.is_deleted());
        assert!(matches!(repo.find(handle.id()).await, Err(RepoError::Deleted(_))));
    }

    #[tokio::test]
    async fn test_flush_then_reload_from_storage() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repo::new(RepoConfig::for_testing(), Some(store.clone()));
        let handle = repo.create(obj(json!({"title": "first"}))).await;
        repo.flush(&[handle.id()]).await.unwrap();

        // Several deltas, enough to trigger compaction
        for i in 0..6 {
            handle.change(|doc| {
                doc.insert("count".into(), json!(i));
            });
            repo.flush(&[handle.id()]).await.unwrap();
        }

        let reopened = Repo::new(RepoConfig::for_testing(), Some(store.clone()));
        let loaded = reopened.find(handle.id()).await.unwrap();
        assert_eq!(loaded.value(), obj(json!({"title": "first", "count": 5})));
    }

    #[tokio::test]
    async fn test_flush_without_changes_writes_nothing() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repo::new(RepoConfig::for_testing(), Some(store.clone()));
        let handle = repo.create(obj(json!({"a": 1}))).await;

        repo.flush(&[handle.id(), handle.id()]).await.unwrap();
        let version = store.load(handle.id()).unwrap().unwrap().version;
        repo.flush(&[handle.id()]).await.unwrap();
        assert_eq!(store.load(handle.id()).unwrap().unwrap().version, version);
    }

    #[tokio::test]
    async fn test_delete_removes_from_storage() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repo::new(RepoConfig::for_testing(), Some(store.clone()));
        let handle = repo.create(obj(json!({"a": 1}))).await;
        repo.flush(&[handle.id()]).await.unwrap();
        assert!(store.load(handle.id()).unwrap().is_some());

        repo.delete(handle.id()).await.unwrap();
        assert!(store.load(handle.id()).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unload_releases_persisted_documents_only() {
        let store = Arc::new(MemoryStore::new());
        let repo = Repo::new(RepoConfig::for_testing(), Some(store));
        let id = repo.create(obj(json!({"a": 1}))).await.id();

        // Unflushed changes stay resident
        assert!(!repo.unload(id).await);

        repo.flush(&[id]).await.unwrap();
        let held = repo.find(id).await.unwrap();
        assert!(!repo.unload(id).await);
        drop(held);

        assert!(repo.unload(id).await);
        assert!(repo.document_ids().await.is_empty());

        let reloaded = repo.find(id).await.unwrap();
        assert_eq!(reloaded.value(), obj(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_unload_without_storage_is_refused() {
        let repo = Repo::in_memory();
        let id = repo.create(obj(json!({"a": 1}))).await.id();
        assert!(!repo.unload(id).await);
        assert!(repo.find(id).await.is_ok());
    }

    #[tokio::test]
    async fn test_deleted_document_refuses_late_update() {
        let source = Repo::in_memory();
        let repo = Repo::in_memory();
        let handle = source.create(obj(json!({"a": 1}))).await;
        repo.apply_update(handle.id(), &handle.encode_state())
            .await
            .unwrap();
        repo.delete(handle.id()).await.unwrap();

        assert!(matches!(
            repo.apply_update(handle.id(), &handle.encode_state()).await,
            Err(RepoError::Deleted(_))
        ));
        assert!(repo.document_ids().await.is_empty());
    }

    #[tokio::test]
    async fn test_apply_update_creates_unknown_document() {
        let source = Repo::in_memory();
        let target = Repo::in_memory();
        let handle = source.create(obj(json!({"name": "posts"}))).await;

        let merged = target
            .apply_update(handle.id(), &handle.encode_state())
            .await
            .unwrap();
        assert_eq!(merged.value(), handle.value());
        assert_eq!(target.document_ids().await, vec![handle.id()]);
    }
}
