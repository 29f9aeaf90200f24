//! Database composer: the root document and its named children.
//!
//! ```text
//! root document { _mvid: 1, documents: { name: id }, collections: { name: id } }
//!        │                       │                         │
//!        │                       ▼                         ▼
//!   DbConfig::root_id       Document<D>               Collection<T>
//! ```
//!
//! Children are created on first access and reattached by id afterwards.
//! One `Database` hands out a single engine per name.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::collection::{Collection, CollectionSchema, Record};
use crate::config::DbConfig;
use crate::document::{init_or_create, Document, DocumentSchema, Migrations};
use crate::error::{DbError, RepoError};
use crate::repo::{DocHandle, DocumentId, Repo};
use crate::storage::{DocumentStore, StorageAdapter, StoreConfig};

const DOCUMENTS: &str = "documents";
const COLLECTIONS: &str = "collections";

type Registry = Mutex<HashMap<String, Arc<dyn Any + Send + Sync>>>;

fn root_migrations() -> Migrations {
    Migrations::new().with(1, |doc| {
        for field in [DOCUMENTS, COLLECTIONS] {
            if !doc.get(field).is_some_and(Value::is_object) {
                doc.insert(field.to_string(), Value::Object(Map::new()));
            }
        }
        Ok(())
    })
}

struct DatabaseInner {
    repo: Repo,
    root: DocHandle,
    documents: Registry,
    collections: Registry,
}

/// Entry point: named singleton documents and collections over one repository.
#[derive(Clone)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.inner.root.id())
            .finish()
    }
}

impl Database {
    /// Create or attach the root document named by `config.root_id`.
    pub async fn open(repo: Repo, config: &DbConfig) -> Result<Self, DbError> {
        let (root, should_flush) =
            init_or_create(&repo, &root_migrations(), config.root_id, Map::new()).await?;
        if should_flush {
            repo.flush(&[root.id()]).await?;
        }
        log::info!("Opened database {}", root.id());

        Ok(Self {
            inner: Arc::new(DatabaseInner {
                repo,
                root,
                documents: Mutex::new(HashMap::new()),
                collections: Mutex::new(HashMap::new()),
            }),
        })
    }

    /// Build the repository from `config`, backed by RocksDB when
    /// `storage_path` is set, and open the database on it.
    pub async fn connect(config: &DbConfig) -> Result<Self, DbError> {
        let storage: Option<Arc<dyn StorageAdapter>> = match &config.storage_path {
            Some(path) => {
                let store = DocumentStore::open(StoreConfig {
                    path: path.clone(),
                    ..StoreConfig::default()
                })
                .map_err(RepoError::from)?;
                Some(Arc::new(store))
            }
            None => None,
        };
        Self::open(Repo::new(config.repo.clone(), storage), config).await
    }

    /// Root document id; pass it back as `DbConfig::root_id` to reattach.
    pub fn id(&self) -> DocumentId {
        self.inner.root.id()
    }

    pub fn repo(&self) -> &Repo {
        &self.inner.repo
    }

    /// Create or attach the singleton document `name`.
    pub async fn document<D>(&self, name: &str, schema: DocumentSchema<D>) -> Result<Document<D>, DbError>
    where
        D: Serialize + DeserializeOwned + 'static,
    {
        schema.migrations.validate()?;
        let mut registry = self.inner.documents.lock().await;
        if let Some(entry) = registry.get(name) {
            return downcast::<Document<D>>(name, entry);
        }

        let existing = self.linked(DOCUMENTS, name)?;
        let (handle, should_flush) =
            init_or_create(&self.inner.repo, &schema.migrations, existing, Map::new()).await?;
        self.finish_attach(DOCUMENTS, name, existing, handle.id(), should_flush)
            .await?;

        let document = Document::new(handle);
        registry.insert(name.to_string(), Arc::new(document.clone()));
        Ok(document)
    }

    /// Create or attach the collection `name`, re-indexing it if its
    /// declared indexes changed.
    pub async fn collection<T>(
        &self,
        name: &str,
        schema: CollectionSchema<T>,
    ) -> Result<Collection<T>, DbError>
    where
        T: Record,
    {
        let mut registry = self.inner.collections.lock().await;
        if let Some(entry) = registry.get(name) {
            return downcast::<Collection<T>>(name, entry);
        }

        let existing = self.linked(COLLECTIONS, name)?;
        let (collection, should_flush) =
            Collection::attach(&self.inner.repo, name, schema, existing).await?;
        self.finish_attach(COLLECTIONS, name, existing, collection.id(), should_flush)
            .await?;

        registry.insert(name.to_string(), Arc::new(collection.clone()));
        Ok(collection)
    }

    /// Names linked under `documents` in the root document.
    pub fn document_names(&self) -> Vec<String> {
        self.names(DOCUMENTS)
    }

    /// Names linked under `collections` in the root document.
    pub fn collection_names(&self) -> Vec<String> {
        self.names(COLLECTIONS)
    }

    fn names(&self, section: &str) -> Vec<String> {
        match self.inner.root.get(section) {
            Some(Value::Object(entries)) => entries.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    fn linked(&self, section: &str, name: &str) -> Result<Option<DocumentId>, DbError> {
        let Some(value) = self
            .inner
            .root
            .get(section)
            .and_then(|entries| entries.get(name).cloned())
        else {
            return Ok(None);
        };
        serde_json::from_value(value)
            .map(Some)
            .map_err(|source| DbError::Decode {
                id: self.id(),
                source,
            })
    }

    /// Link a new child into the root and flush whatever changed.
    async fn finish_attach(
        &self,
        section: &str,
        name: &str,
        existing: Option<DocumentId>,
        child: DocumentId,
        child_changed: bool,
    ) -> Result<(), DbError> {
        let mut flush = Vec::with_capacity(2);
        if existing.is_none() {
            self.inner.root.change(|doc| {
                let mut entries = match doc.remove(section) {
                    Some(Value::Object(entries)) => entries,
                    _ => Map::new(),
                };
                entries.insert(name.to_string(), Value::from(child.to_string()));
                doc.insert(section.to_string(), Value::Object(entries));
            });
            log::info!("Linked {section} entry {name} -> {child}");
            flush.push(self.id());
        }
        if child_changed {
            flush.push(child);
        }
        if !flush.is_empty() {
            self.inner.repo.flush(&flush).await?;
        }
        Ok(())
    }
}

fn downcast<E>(name: &str, entry: &Arc<dyn Any + Send + Sync>) -> Result<E, DbError>
where
    E: Clone + Send + Sync + 'static,
{
    entry
        .clone()
        .downcast::<E>()
        .map(|engine| (*engine).clone())
        .map_err(|_| DbError::Schema(format!("`{name}` is already attached with a different type")))
}
