//! Error taxonomy for the repository and the collection engine.
//!
//! `RepoError` is raised by the document repository; `DbError` is what the
//! engine surfaces to callers. Bulk queries wrap every per-row failure in a
//! single `QueryError` instead of returning a partial result.

use std::fmt;

use thiserror::Error;

use crate::repo::DocumentId;
use crate::storage::StoreError;

/// Boxed error returned by migration functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Failures of the document repository.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("document not found: {0}")]
    NotFound(DocumentId),
    #[error("document deleted: {0}")]
    Deleted(DocumentId),
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
    #[error("codec error: {0}")]
    Codec(String),
}

/// Failures of the collection engine and database composer.
#[derive(Debug, Error)]
pub enum DbError {
    /// A referenced row, index or collection id could not be resolved.
    #[error("failed to resolve document {id}: {source}")]
    Resolution {
        id: DocumentId,
        #[source]
        source: RepoError,
    },
    /// The id was never registered in the collection, or has been deleted.
    #[error("row {id} is not part of collection `{collection}`")]
    Unavailable { id: DocumentId, collection: String },
    /// A migration function failed; earlier versions stay applied.
    #[error("migration to version {version} failed for document {id}: {source}")]
    Migration {
        id: DocumentId,
        version: u32,
        #[source]
        source: BoxError,
    },
    /// One or more row resolutions failed during a scan or index lookup.
    #[error(transparent)]
    Query(#[from] QueryError),
    #[error("failed to decode document {id}: {source}")]
    Decode {
        id: DocumentId,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("invalid schema: {0}")]
    Schema(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl DbError {
    pub(crate) fn resolution(id: DocumentId, source: RepoError) -> Self {
        DbError::Resolution { id, source }
    }
}

/// Aggregate of every per-row failure of a bulk query.
#[derive(Debug)]
pub struct QueryError {
    errors: Vec<DbError>,
}

impl QueryError {
    pub fn new(errors: Vec<DbError>) -> Self {
        Self { errors }
    }

    pub fn errors(&self) -> &[DbError] {
        &self.errors
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.errors.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{error}")?;
        }
        Ok(())
    }
}

impl std::error::Error for QueryError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.errors
            .first()
            .map(|e| e as &(dyn std::error::Error + 'static))
    }
}

impl IntoIterator for QueryError {
    type Item = DbError;
    type IntoIter = std::vec::IntoIter<DbError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.into_iter()
    }
}

impl<'a> IntoIterator for &'a QueryError {
    type Item = &'a DbError;
    type IntoIter = std::slice::Iter<'a, DbError>;

    fn into_iter(self) -> Self::IntoIter {
        self.errors.iter()
    }
}
