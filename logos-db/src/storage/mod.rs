//! Persistent storage behind the repository's durability barrier.
//!
//! Architecture:
//! ```text
//! ┌─────────────┐  snapshot / delta   ┌────────────────────────────────┐
//! │ Repo::flush │ ──────────────────► │ StorageAdapter                 │
//! └─────────────┘                     │  MemoryStore:   HashMap       │
//!                                     │  DocumentStore: RocksDB       │
//! ┌─────────────┐   StoredDocument    │    CF "documents" (LZ4)        │
//! │ Repo::find  │ ◄────────────────── │    CF "deltas"    (LZ4)        │
//! └─────────────┘                     │    CF "metadata"  (bincode)    │
//!                                     └────────────────────────────────┘
//! ```
//!
//! A document is restored by applying its snapshot followed by every delta
//! in version order. Saving a snapshot at version `v` drops deltas `<= v`.

pub mod memory;
pub mod rocks;

pub use memory::MemoryStore;
pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig, StoreError};

use crate::repo::DocumentId;

/// Everything persisted for one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredDocument {
    /// Full yrs state at the last compaction
    pub snapshot: Option<Vec<u8>>,
    /// Incremental yrs updates after the snapshot, in version order
    pub deltas: Vec<(u64, Vec<u8>)>,
    /// Highest persisted version
    pub version: u64,
}

/// Durable storage for yrs document updates.
pub trait StorageAdapter: Send + Sync {
    /// Load a document, or `None` if it was never persisted.
    fn load(&self, id: DocumentId) -> Result<Option<StoredDocument>, StoreError>;

    /// Persist an incremental update.
    fn append_delta(&self, id: DocumentId, version: u64, delta: &[u8]) -> Result<(), StoreError>;

    /// Replace the snapshot and drop every delta up to `version`.
    fn save_snapshot(&self, id: DocumentId, version: u64, snapshot: &[u8])
        -> Result<(), StoreError>;

    /// Remove a document entirely.
    fn remove(&self, id: DocumentId) -> Result<(), StoreError>;
}
