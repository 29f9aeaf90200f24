//! Runtime configuration for the repository and the database.

use std::path::PathBuf;

use crate::repo::DocumentId;

/// Repository configuration.
#[derive(Debug, Clone)]
pub struct RepoConfig {
    /// Change batches buffered per subscriber before it starts lagging
    pub broadcast_capacity: usize,
    /// Deltas persisted per document before they are folded into a snapshot
    pub compaction_threshold: u64,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            compaction_threshold: 100,
        }
    }
}

impl RepoConfig {
    /// Small buffers and aggressive compaction, so tests exercise both paths.
    pub fn for_testing() -> Self {
        Self {
            broadcast_capacity: 64,
            compaction_threshold: 4,
        }
    }
}

/// Database configuration.
#[derive(Debug, Clone, Default)]
pub struct DbConfig {
    /// Root document to reattach to. `None` creates a fresh database.
    pub root_id: Option<DocumentId>,
    /// RocksDB directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
    pub repo: RepoConfig,
}

impl DbConfig {
    /// Persistent database at `path`, reattaching to `root_id` when given.
    pub fn with_storage(path: impl Into<PathBuf>, root_id: Option<DocumentId>) -> Self {
        Self {
            root_id,
            storage_path: Some(path.into()),
            repo: RepoConfig::default(),
        }
    }

    /// Fresh in-memory database with test-sized repository settings.
    pub fn for_testing() -> Self {
        Self {
            root_id: None,
            storage_path: None,
            repo: RepoConfig::for_testing(),
        }
    }
}
