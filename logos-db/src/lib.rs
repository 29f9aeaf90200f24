//! # logos-db: Typed collections over mergeable documents
//!
//! Rows, secondary indexes and singleton documents stored as yrs CRDT
//! documents, so replicas can exchange updates and converge.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  name → id   ┌──────────────────┐
//! │ Database    │ ───────────► │ Collection<T>    │──► row documents
//! │ (root doc)  │              │ (byId + indexes) │──► index documents
//! └──────┬──────┘              └────────┬─────────┘
//!        │  Document<D>                 │ patches
//!        ▼                              ▼
//! ┌─────────────────────────────────────────────┐
//! │ Repo: DocHandle per document (yrs Doc)      │
//! │  change → diff → broadcast  │  flush ──┐    │
//! └─────────────────────────────────────────┼───┘
//!                                           ▼
//!                            ┌────────────────────────────┐
//!                            │ StorageAdapter             │
//!                            │  MemoryStore │ DocumentStore│
//!                            └────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`repo`]: Document repository, handles and structural patches
//! - [`storage`]: Snapshot/delta persistence (in-memory and RocksDB)
//! - [`document`]: Versioned documents and migration sequencing
//! - [`index`]: Index keys and bucket documents
//! - [`collection`]: Row CRUD, queries and re-indexing
//! - [`events`]: Patch-to-event translation and subscriptions
//! - [`database`]: Root document and named children
//!
//! ## Example
//!
//! ```no_run
//! use logos_db::{CollectionSchema, Database, DbConfig, FindOptions, Record};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Post {
//!     uri: String,
//!     title: String,
//! }
//!
//! impl Record for Post {
//!     const FIELDS: &'static [&'static str] = &["uri", "title"];
//! }
//!
//! # async fn run() -> Result<(), logos_db::DbError> {
//! let db = Database::connect(&DbConfig::default()).await?;
//! let posts = db
//!     .collection("posts", CollectionSchema::<Post>::new().index("uri", "uri"))
//!     .await?;
//!
//! posts.create(Post { uri: "hello".into(), title: "Hello".into() }).await?;
//! let found = posts.find_by_index("uri", "hello", FindOptions::new()).await?;
//! assert_eq!(found.len(), 1);
//! # Ok(())
//! # }
//! ```

pub mod collection;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod events;
pub mod index;
pub mod repo;
pub mod storage;

// Re-exports for convenience
pub use collection::{Collection, CollectionSchema, Comparator, Filter, FindOptions, Record, Row};
pub use config::{DbConfig, RepoConfig};
pub use database::Database;
pub use document::{migrate, Document, DocumentSchema, MigrationFn, Migrations};
pub use error::{BoxError, DbError, QueryError, RepoError};
pub use events::{translate, CollectionEvent, RowChange, Subscription};
pub use index::{IndexDescriptor, IndexKey};
pub use repo::{ChangeOrigin, ChangePayload, DocHandle, DocumentId, Patch, PatchAction, Prop, Repo};
pub use storage::{
    DocumentMetadata, DocumentStore, MemoryStore, StorageAdapter, StoreConfig, StoreError,
    StoredDocument,
};
