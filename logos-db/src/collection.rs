//! Collection engine: typed rows, secondary indexes and queries.
//!
//! Architecture:
//! ```text
//! ┌──────────────────────────────┐
//! │ collection document          │
//! │  name                        │
//! │  byId    { rowId: marker }   │──► row documents { ..fields, _mvid, _collection }
//! │  indexes { name: descriptor }│──► index documents { bucket: { rowId: true } }
//! └──────────────────────────────┘
//! ```
//!
//! Writes on one collection are serialized; each write updates the row, the
//! `byId` marker and the affected buckets, then flushes everything it touched.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::Mutex;

use crate::document::{
    current_version, decode_fields, encode_fields, init_or_create, migrate, replace_fields,
    Migrations, VERSION_FIELD,
};
use crate::error::{BoxError, DbError, QueryError};
use crate::events::{self, CollectionEvent, Subscription};
use crate::index::{
    row_keys, serialize_key, IndexDescriptor, IndexDocument, IndexKey, KeyChanges, RowKeys,
};
use crate::repo::{DocHandle, DocumentId, Repo};

/// Field naming the collection a row belongs to.
pub const COLLECTION_FIELD: &str = "_collection";

const NAME: &str = "name";
const BY_ID: &str = "byId";
const INDEXES: &str = "indexes";

/// `byId` marker of a row that has not been updated since creation.
pub const CREATED_MARKER: i64 = 0;

/// A row type stored in a collection.
///
/// `FIELDS` lists the top-level field names; index keys are checked against it.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
    const FIELDS: &'static [&'static str];
}

/// Declaration of a collection: its indexes and row migrations.
pub struct CollectionSchema<T> {
    pub(crate) indexes: BTreeMap<String, IndexKey>,
    pub(crate) migrations: Migrations,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for CollectionSchema<T> {
    fn default() -> Self {
        Self {
            indexes: BTreeMap::new(),
            migrations: Migrations::new(),
            _marker: PhantomData,
        }
    }
}

impl<T: Record> CollectionSchema<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare index `name` over a field or an ordered list of fields.
    pub fn index(mut self, name: impl Into<String>, key: impl Into<IndexKey>) -> Self {
        self.indexes.insert(name.into(), key.into());
        self
    }

    pub fn row_migration<F>(mut self, version: u32, f: F) -> Self
    where
        F: Fn(&mut Map<String, Value>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.migrations.add(version, f);
        self
    }

    pub fn indexes(&self) -> &BTreeMap<String, IndexKey> {
        &self.indexes
    }

    pub fn migrations(&self) -> &Migrations {
        &self.migrations
    }

    pub(crate) fn validate(&self) -> Result<(), DbError> {
        self.migrations.validate()?;
        for (name, key) in &self.indexes {
            let fields = key.fields();
            if fields.is_empty() {
                return Err(DbError::Schema(format!("index `{name}` has an empty key")));
            }
            if let Some(unknown) = fields.iter().find(|field| !T::FIELDS.contains(*field)) {
                return Err(DbError::Schema(format!(
                    "index `{name}` references unknown field `{unknown}`"
                )));
            }
        }
        Ok(())
    }
}

/// A resolved row.
#[derive(Debug, Clone, PartialEq)]
pub struct Row<T> {
    pub id: DocumentId,
    /// Applied row migration version
    pub mvid: i64,
    pub collection: String,
    pub value: T,
}

pub type Filter<T> = Arc<dyn Fn(&Row<T>) -> bool + Send + Sync>;
pub type Comparator<T> = Arc<dyn Fn(&Row<T>, &Row<T>) -> Ordering + Send + Sync>;

/// Query options shared by `find` and `find_by_index`.
///
/// Page `offset` with size `limit` covers `[offset * limit, offset * limit + limit)`.
/// `offset` is ignored without a `limit`.
pub struct FindOptions<T> {
    pub filter: Option<Filter<T>>,
    pub sort: Option<Comparator<T>>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl<T> Default for FindOptions<T> {
    fn default() -> Self {
        Self {
            filter: None,
            sort: None,
            limit: None,
            offset: 0,
        }
    }
}

impl<T> Clone for FindOptions<T> {
    fn clone(&self) -> Self {
        Self {
            filter: self.filter.clone(),
            sort: self.sort.clone(),
            limit: self.limit,
            offset: self.offset,
        }
    }
}

impl<T> fmt::Debug for FindOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FindOptions")
            .field("filter", &self.filter.is_some())
            .field("sort", &self.sort.is_some())
            .field("limit", &self.limit)
            .field("offset", &self.offset)
            .finish()
    }
}

impl<T> FindOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, f: impl Fn(&Row<T>) -> bool + Send + Sync + 'static) -> Self {
        self.filter = Some(Arc::new(f));
        self
    }

    pub fn sort(mut self, f: impl Fn(&Row<T>, &Row<T>) -> Ordering + Send + Sync + 'static) -> Self {
        self.sort = Some(Arc::new(f));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

fn paginate<I>(items: Vec<I>, limit: usize, offset: usize) -> Vec<I> {
    items
        .into_iter()
        .skip(offset.saturating_mul(limit))
        .take(limit)
        .collect()
}

/// Collect per-row results; migration failures win, everything else is aggregated.
fn collect_rows<R>(results: Vec<Result<R, DbError>>) -> Result<Vec<R>, DbError> {
    let mut rows = Vec::with_capacity(results.len());
    let mut errors = Vec::new();
    for result in results {
        match result {
            Ok(row) => rows.push(row),
            Err(e @ DbError::Migration { .. }) => return Err(e),
            Err(e) => errors.push(e),
        }
    }
    if errors.is_empty() {
        Ok(rows)
    } else {
        Err(QueryError::new(errors).into())
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Run `f` over an object field, replacing a missing or non-object value.
fn with_object<R>(
    doc: &mut Map<String, Value>,
    field: &str,
    f: impl FnOnce(&mut Map<String, Value>) -> R,
) -> R {
    let mut object = match doc.remove(field) {
        Some(Value::Object(object)) => object,
        _ => Map::new(),
    };
    let out = f(&mut object);
    doc.insert(field.to_string(), Value::Object(object));
    out
}

struct CollectionInner<T> {
    name: String,
    repo: Repo,
    handle: DocHandle,
    indexes: BTreeMap<String, IndexKey>,
    migrations: Migrations,
    /// Single-writer queue for create/update/delete
    writes: Mutex<()>,
    _marker: PhantomData<fn() -> T>,
}

/// A named collection of typed rows.
///
/// Cloning is cheap; clones share the same writer queue.
pub struct Collection<T> {
    inner: Arc<CollectionInner<T>>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("id", &self.inner.handle.id())
            .field("indexes", &self.inner.indexes)
            .finish()
    }
}

impl<T: Record> Collection<T> {
    /// Create or attach the collection document, then bring its indexes in
    /// line with `schema`.
    ///
    /// Returns the collection and whether the collection document was created
    /// or changed and still needs a flush by the caller.
    pub(crate) async fn attach(
        repo: &Repo,
        name: &str,
        schema: CollectionSchema<T>,
        id: Option<DocumentId>,
    ) -> Result<(Self, bool), DbError> {
        schema.validate()?;

        let mut initial = Map::new();
        initial.insert(NAME.into(), Value::from(name));
        initial.insert(BY_ID.into(), Value::Object(Map::new()));
        initial.insert(INDEXES.into(), Value::Object(Map::new()));
        let (handle, should_flush) = init_or_create(repo, &Migrations::new(), id, initial).await?;

        let collection = Self {
            inner: Arc::new(CollectionInner {
                name: name.to_string(),
                repo: repo.clone(),
                handle,
                indexes: schema.indexes,
                migrations: schema.migrations,
                writes: Mutex::new(()),
                _marker: PhantomData,
            }),
        };

        let rewritten = collection.reindex().await?;
        if !rewritten.is_empty() {
            repo.flush(&rewritten).await?;
        }
        log::debug!(
            "Attached collection {name} ({}) with {} rows",
            collection.id(),
            collection.len()
        );
        Ok((collection, should_flush))
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Id of the collection document.
    pub fn id(&self) -> DocumentId {
        self.inner.handle.id()
    }

    /// Number of rows registered in `byId`.
    pub fn len(&self) -> usize {
        self.row_ids().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Declared index names.
    pub fn index_names(&self) -> Vec<&str> {
        self.inner.indexes.keys().map(String::as_str).collect()
    }

    pub fn contains(&self, id: DocumentId) -> bool {
        self.inner
            .handle
            .get(BY_ID)
            .and_then(|by_id| by_id.get(id.to_string()).cloned())
            .is_some()
    }

    /// Create a row and add it to every index it has a key for.
    pub async fn create(&self, value: T) -> Result<Row<T>, DbError> {
        let _write = self.inner.writes.lock().await;

        let mut fields = encode_fields(&value)?;
        fields.insert(
            VERSION_FIELD.into(),
            Value::from(self.inner.migrations.latest()),
        );
        fields.insert(COLLECTION_FIELD.into(), Value::from(self.name()));
        let keys = row_keys(&self.inner.indexes, &fields);

        let row = self.inner.repo.create(fields).await;
        let id = row.id();
        self.inner.handle.change(|doc| {
            with_object(doc, BY_ID, |by_id| {
                by_id.insert(id.to_string(), Value::from(CREATED_MARKER));
            });
        });

        let mut touched = vec![id, self.id()];
        for (name, bucket) in &keys {
            let index = self.index_document_or_create(name).await?;
            index.insert(bucket, id);
            touched.push(index.id());
        }

        self.inner.repo.flush(&touched).await?;
        log::debug!("Created row {id} in {}", self.name());
        self.row(&row)
    }

    /// Mutate a row and move it between buckets as its keys change.
    pub async fn update<F>(&self, id: DocumentId, f: F) -> Result<Row<T>, DbError>
    where
        F: FnOnce(&mut T),
    {
        let _write = self.inner.writes.lock().await;
        self.ensure_registered(id)?;

        let handle = self.resolve(id).await?;
        let before = handle.value();
        let mut value: T = decode_fields(id, &before)?;
        f(&mut value);
        let fields = encode_fields(&value)?;
        handle.change(|doc| replace_fields(doc, fields));

        let changes = KeyChanges::between(
            &row_keys(&self.inner.indexes, &before),
            &row_keys(&self.inner.indexes, &handle.value()),
        );
        let mut touched = vec![id, self.id()];
        for name in changes.names() {
            let index = self.index_document_or_create(name).await?;
            if let Some(bucket) = changes.removed.get(name) {
                index.remove(bucket, id);
            }
            if let Some(bucket) = changes.added.get(name) {
                index.insert(bucket, id);
            }
            touched.push(index.id());
        }

        self.touch(id);
        self.inner.repo.flush(&touched).await?;
        self.row(&handle)
    }

    /// Remove a row from `byId`, from every bucket, and from the repository.
    pub async fn delete(&self, id: DocumentId) -> Result<(), DbError> {
        let _write = self.inner.writes.lock().await;
        self.ensure_registered(id)?;

        // A row document that is already gone still leaves byId
        let keys = match self.resolve(id).await {
            Ok(handle) => row_keys(&self.inner.indexes, &handle.value()),
            Err(DbError::Resolution { source, .. }) => {
                log::warn!("Deleting unresolvable row {id} from {}: {source}", self.name());
                RowKeys::new()
            }
            Err(e) => return Err(e),
        };

        self.inner.handle.change(|doc| {
            with_object(doc, BY_ID, |by_id| {
                by_id.remove(&id.to_string());
            });
        });

        let mut touched = vec![self.id()];
        for (name, bucket) in &keys {
            if let Some(index) = self.index_document(name).await? {
                index.remove(bucket, id);
                touched.push(index.id());
            }
        }
        self.inner.repo.delete(id).await?;

        self.inner.repo.flush(&touched).await?;
        log::debug!("Deleted row {id} from {}", self.name());
        Ok(())
    }

    /// Resolve one registered row.
    ///
    /// A registered id whose document no longer resolves is `Unavailable`,
    /// the same as an id that was never registered.
    pub async fn find_by_id(&self, id: DocumentId) -> Result<Row<T>, DbError> {
        self.ensure_registered(id)?;
        match self.resolve_row(id).await {
            Err(DbError::Resolution { source, .. }) => {
                log::warn!(
                    "Row {} of collection `{}` is registered but unresolvable: {}",
                    id,
                    self.inner.name,
                    source
                );
                Err(DbError::Unavailable {
                    id,
                    collection: self.inner.name.clone(),
                })
            }
            other => other,
        }
    }

    /// Scan every row in `byId` order.
    pub async fn find(&self, options: FindOptions<T>) -> Result<Vec<Row<T>>, DbError> {
        self.query(self.row_ids(), options).await
    }

    /// Rows in bucket `key` of index `name`.
    ///
    /// `key` is a scalar for single-field indexes, or a sequence of values for
    /// composite ones.
    pub async fn find_by_index<K>(
        &self,
        name: &str,
        key: K,
        options: FindOptions<T>,
    ) -> Result<Vec<Row<T>>, DbError>
    where
        K: Serialize,
    {
        let key = serde_json::to_value(key).map_err(DbError::Encode)?;
        let index = match self.index_document(name).await? {
            Some(index) => index,
            None => return Ok(Vec::new()),
        };
        self.query(index.bucket(&serialize_key(&key)), options)
            .await
    }

    /// Deliver created, updated and deleted events until the subscription is dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(CollectionEvent<T>) + Send + 'static,
    {
        events::listen(self.clone(), callback)
    }

    pub(crate) fn handle(&self) -> &DocHandle {
        &self.inner.handle
    }

    /// Resolve, migrate and decode one row.
    pub(crate) async fn resolve_row(&self, id: DocumentId) -> Result<Row<T>, DbError> {
        let handle = self.resolve(id).await?;
        self.row(&handle)
    }

    async fn query(
        &self,
        ids: Vec<DocumentId>,
        options: FindOptions<T>,
    ) -> Result<Vec<Row<T>>, DbError> {
        let FindOptions {
            filter,
            sort,
            limit,
            offset,
        } = options;

        let presliced = filter.is_none() && sort.is_none() && limit.is_some();
        let ids = match limit {
            Some(limit) if presliced => paginate(ids, limit, offset),
            _ => ids,
        };

        let results = join_all(ids.into_iter().map(|id| self.resolve_row(id))).await;
        let mut rows = collect_rows(results)?;

        if let Some(filter) = filter {
            rows.retain(|row| filter(row));
        }
        if let Some(sort) = sort {
            rows.sort_by(|a, b| sort(a, b));
        }
        match limit {
            Some(limit) if !presliced => Ok(paginate(rows, limit, offset)),
            _ => Ok(rows),
        }
    }

    /// Resolve a row document and migrate it if stale.
    async fn resolve(&self, id: DocumentId) -> Result<DocHandle, DbError> {
        let handle = self
            .inner
            .repo
            .find(id)
            .await
            .map_err(|e| DbError::resolution(id, e))?;
        if migrate(&handle, &self.inner.migrations)? {
            self.inner.repo.flush(&[id]).await?;
        }
        Ok(handle)
    }

    fn row(&self, handle: &DocHandle) -> Result<Row<T>, DbError> {
        let doc = handle.value();
        Ok(Row {
            id: handle.id(),
            mvid: current_version(&doc),
            collection: doc
                .get(COLLECTION_FIELD)
                .and_then(Value::as_str)
                .unwrap_or(self.inner.name.as_str())
                .to_string(),
            value: decode_fields(handle.id(), &doc)?,
        })
    }

    fn ensure_registered(&self, id: DocumentId) -> Result<(), DbError> {
        if self.contains(id) {
            Ok(())
        } else {
            Err(DbError::Unavailable {
                id,
                collection: self.inner.name.clone(),
            })
        }
    }

    /// Row ids in `byId` key order.
    fn row_ids(&self) -> Vec<DocumentId> {
        let Some(Value::Object(by_id)) = self.inner.handle.get(BY_ID) else {
            return Vec::new();
        };
        by_id
            .keys()
            .filter_map(|id| match id.parse() {
                Ok(id) => Some(id),
                Err(e) => {
                    log::warn!("Skipping malformed row id {id} in {}: {e}", self.inner.name);
                    None
                }
            })
            .collect()
    }

    /// Stamp `byId[id]` with a value strictly greater than the previous one.
    fn touch(&self, id: DocumentId) {
        self.inner.handle.change(|doc| {
            with_object(doc, BY_ID, |by_id| {
                let previous = by_id
                    .get(&id.to_string())
                    .and_then(Value::as_i64)
                    .unwrap_or(CREATED_MARKER);
                let stamp = now_millis().max(previous.saturating_add(1));
                by_id.insert(id.to_string(), Value::from(stamp));
            });
        });
    }

    fn descriptors(&self) -> Result<BTreeMap<String, IndexDescriptor>, DbError> {
        match self.inner.handle.get(INDEXES) {
            Some(indexes) => serde_json::from_value(indexes).map_err(|source| DbError::Decode {
                id: self.id(),
                source,
            }),
            None => Ok(BTreeMap::new()),
        }
    }

    /// The index document for `name`, if one has been allocated.
    async fn index_document(&self, name: &str) -> Result<Option<IndexDocument>, DbError> {
        let Some(index_id) = self
            .descriptors()?
            .get(name)
            .and_then(|descriptor| descriptor.index_document_id)
        else {
            return Ok(None);
        };
        let handle = self
            .inner
            .repo
            .find(index_id)
            .await
            .map_err(|e| DbError::resolution(index_id, e))?;
        Ok(Some(IndexDocument::new(handle)))
    }

    /// The index document for declared index `name`, allocating it on demand.
    async fn index_document_or_create(&self, name: &str) -> Result<IndexDocument, DbError> {
        if let Some(index) = self.index_document(name).await? {
            return Ok(index);
        }
        let key = self
            .inner
            .indexes
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::Schema(format!("index `{name}` is not declared")))?;

        let index = IndexDocument::new(self.inner.repo.create(Map::new()).await);
        let descriptor = serde_json::to_value(IndexDescriptor {
            key,
            index_document_id: Some(index.id()),
        })
        .map_err(DbError::Encode)?;
        self.inner.handle.change(|doc| {
            with_object(doc, INDEXES, |indexes| {
                indexes.insert(name.to_string(), descriptor);
            });
        });
        log::debug!("Allocated index document {} for {}.{name}", index.id(), self.name());
        Ok(index)
    }

    /// Reconcile stored index descriptors with the declared ones.
    ///
    /// Changed and removed indexes lose their documents; new and changed ones
    /// get fresh documents that are backfilled from every row. Returns the
    /// documents that need a flush.
    async fn reindex(&self) -> Result<Vec<DocumentId>, DbError> {
        let stored = self.descriptors()?;
        let declared = &self.inner.indexes;

        let stale: Vec<(String, Option<DocumentId>)> = stored
            .iter()
            .filter(|(name, descriptor)| declared.get(*name) != Some(&descriptor.key))
            .map(|(name, descriptor)| (name.clone(), descriptor.index_document_id))
            .collect();
        let fresh: Vec<String> = declared
            .iter()
            .filter(|(name, key)| stored.get(*name).map(|d| &d.key) != Some(*key))
            .map(|(name, _)| name.clone())
            .collect();

        if stale.is_empty() && fresh.is_empty() {
            return Ok(Vec::new());
        }

        for (name, index_id) in &stale {
            if let Some(index_id) = index_id {
                self.inner.repo.delete(*index_id).await?;
            }
            log::info!("Dropped index {}.{name}", self.name());
        }

        let mut created = Vec::with_capacity(fresh.len());
        for name in fresh {
            let index = IndexDocument::new(self.inner.repo.create(Map::new()).await);
            created.push((name, index));
        }

        let mut descriptors = Map::new();
        for (name, index) in &created {
            let descriptor = IndexDescriptor {
                key: declared[name].clone(),
                index_document_id: Some(index.id()),
            };
            descriptors.insert(
                name.clone(),
                serde_json::to_value(descriptor).map_err(DbError::Encode)?,
            );
        }
        self.inner.handle.change(|doc| {
            with_object(doc, INDEXES, |indexes| {
                for (name, _) in &stale {
                    indexes.remove(name);
                }
                indexes.extend(descriptors);
            });
        });

        let mut touched = vec![self.id()];
        if !created.is_empty() {
            let ids = self.row_ids();
            log::info!(
                "Re-indexing {} rows of {} into {} indexes",
                ids.len(),
                self.name(),
                created.len()
            );
            let rows = collect_rows(join_all(ids.into_iter().map(|id| self.resolve(id))).await)?;
            let docs: Vec<(DocumentId, Map<String, Value>)> =
                rows.iter().map(|row| (row.id(), row.value())).collect();

            for (name, index) in &created {
                let key = &declared[name];
                let entries: Vec<(String, DocumentId)> = docs
                    .iter()
                    .filter_map(|(id, doc)| key.key_for_row(doc).map(|bucket| (bucket, *id)))
                    .collect();
                index.insert_all(&entries);
                touched.push(index.id());
            }
        }

        Ok(touched)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Post {
        uri: Option<String>,
        title: String,
    }

    impl Record for Post {
        const FIELDS: &'static [&'static str] = &["uri", "title"];
    }

    fn post(uri: &str, title: &str) -> Post {
        Post {
            uri: Some(uri.into()),
            title: title.into(),
        }
    }

    async fn posts(repo: &Repo) -> Collection<Post> {
        let schema = CollectionSchema::new().index("uri", "uri");
        Collection::attach(repo, "posts", schema, None).await.unwrap().0
    }

    #[test]
    fn test_schema_rejects_unknown_field() {
        let schema = CollectionSchema::<Post>::new().index("by_author", "author");
        assert!(matches!(schema.validate(), Err(DbError::Schema(_))));

        let empty = CollectionSchema::<Post>::new().index("none", Vec::<&str>::new());
        assert!(matches!(empty.validate(), Err(DbError::Schema(_))));

        let zero = CollectionSchema::<Post>::new().row_migration(0, |_| Ok(()));
        assert!(matches!(zero.validate(), Err(DbError::Schema(_))));
    }

    #[test]
    fn test_paginate() {
        let items: Vec<u32> = (0..10).collect();
        assert_eq!(paginate(items.clone(), 3, 0), vec![0, 1, 2]);
        assert_eq!(paginate(items.clone(), 3, 1), vec![3, 4, 5]);
        assert_eq!(paginate(items.clone(), 3, 3), vec![9]);
        assert!(paginate(items.clone(), 3, 4).is_empty());
        assert!(paginate(items, 0, 2).is_empty());
    }

    #[tokio::test]
    async fn test_create_sets_metadata_and_marker() {
        let repo = Repo::in_memory();
        let posts = posts(&repo).await;

        let row = posts.create(post("a", "First")).await.unwrap();
        assert_eq!(row.mvid, 0);
        assert_eq!(row.collection, "posts");
        assert_eq!(row.value, post("a", "First"));

        let by_id = posts.handle().get(BY_ID).unwrap();
        assert_eq!(by_id[row.id.to_string()], Value::from(CREATED_MARKER));
        assert_eq!(posts.len(), 1);
    }

    #[tokio::test]
    async fn test_update_touch_is_strictly_increasing() {
        let repo = Repo::in_memory();
        let posts = posts(&repo).await;
        let row = posts.create(post("a", "First")).await.unwrap();

        let marker = |posts: &Collection<Post>| {
            posts.handle().get(BY_ID).unwrap()[row.id.to_string()]
                .as_i64()
                .unwrap()
        };

        posts.update(row.id, |p| p.title = "Second".into()).await.unwrap();
        let first = marker(&posts);
        assert!(first > CREATED_MARKER);

        posts.update(row.id, |p| p.title = "Third".into()).await.unwrap();
        assert!(marker(&posts) > first);
    }

    #[tokio::test]
    async fn test_unregistered_id_is_unavailable() {
        let repo = Repo::in_memory();
        let posts = posts(&repo).await;
        let stranger = DocumentId::new();

        assert!(matches!(
            posts.find_by_id(stranger).await,
            Err(DbError::Unavailable { .. })
        ));
        assert!(matches!(
            posts.update(stranger, |_| {}).await,
            Err(DbError::Unavailable { .. })
        ));
        assert!(matches!(
            posts.delete(stranger).await,
            Err(DbError::Unavailable { .. })
        ));
    }

    #[tokio::test]
    async fn test_null_key_is_not_indexed() {
        let repo = Repo::in_memory();
        let posts = posts(&repo).await;
        let row = posts
            .create(Post {
                uri: None,
                title: "Draft".into(),
            })
            .await
            .unwrap();

        let index = posts.index_document("uri").await.unwrap().unwrap();
        assert!(index.buckets().is_empty());

        // Setting the field later adds it
        posts
            .update(row.id, |p| p.uri = Some("published".into()))
            .await
            .unwrap();
        assert_eq!(index.bucket("\"published\""), vec![row.id]);

        // Clearing it drops the row from the index
        posts.update(row.id, |p| p.uri = None).await.unwrap();
        assert!(index.buckets().is_empty());
    }

    #[tokio::test]
    async fn test_row_migration_applies_on_read() {
        let repo = Repo::in_memory();
        let (v0, _) = Collection::<Post>::attach(&repo, "posts", CollectionSchema::new(), None)
            .await
            .unwrap();
        let row = v0.create(post("a", "lower")).await.unwrap();
        assert_eq!(row.mvid, 0);

        let schema = CollectionSchema::<Post>::new().row_migration(1, |doc| {
            if let Some(Value::String(title)) = doc.get_mut("title") {
                *title = title.to_uppercase();
            }
            Ok(())
        });
        let (v1, _) = Collection::attach(&repo, "posts", schema, Some(v0.id()))
            .await
            .unwrap();

        let migrated = v1.find_by_id(row.id).await.unwrap();
        assert_eq!(migrated.mvid, 1);
        assert_eq!(migrated.value.title, "LOWER");

        // New rows start at the ceiling and are not migrated again
        let fresh = v1.create(post("b", "kept")).await.unwrap();
        assert_eq!(fresh.mvid, 1);
        assert_eq!(v1.find_by_id(fresh.id).await.unwrap().value.title, "kept");
    }

    #[tokio::test]
    async fn test_failed_row_migration_is_not_aggregated() {
        let repo = Repo::in_memory();
        let v0 = posts(&repo).await;
        let bad = v0.create(post("a", "bad")).await.unwrap();
        v0.create(post("a", "good")).await.unwrap();
        let lost = v0.create(post("a", "lost")).await.unwrap();
        repo.delete(lost.id).await.unwrap();

        let schema = CollectionSchema::<Post>::new()
            .index("uri", "uri")
            .row_migration(1, |doc| match doc.get("title") {
                Some(Value::String(title)) if title == "bad" => Err("cannot migrate".into()),
                _ => Ok(()),
            });
        let (v1, _) = Collection::attach(&repo, "posts", schema, Some(v0.id()))
            .await
            .unwrap();

        // The migration error wins over the unresolvable row
        match v1.find(FindOptions::new()).await {
            Err(DbError::Migration { id, version, .. }) => {
                assert_eq!(id, bad.id);
                assert_eq!(version, 1);
            }
            other => panic!("expected migration error, got {other:?}"),
        }
        match v1.find_by_index("uri", "a", FindOptions::new()).await {
            Err(DbError::Migration { id, version, .. }) => {
                assert_eq!(id, bad.id);
                assert_eq!(version, 1);
            }
            other => panic!("expected migration error, got {other:?}"),
        }

        // The failing step left the row at its old version
        let raw = repo.find(bad.id).await.unwrap();
        assert_eq!(raw.get(VERSION_FIELD), Some(Value::from(0)));
    }

    #[tokio::test]
    async fn test_changed_index_key_rebuilds_document() {
        let repo = Repo::in_memory();
        let first = posts(&repo).await;
        first.create(post("a", "Alpha")).await.unwrap();
        let old_index = first.index_document("uri").await.unwrap().unwrap().id();

        let schema = CollectionSchema::<Post>::new().index("uri", "title");
        let (second, _) = Collection::attach(&repo, "posts", schema, Some(first.id()))
            .await
            .unwrap();

        let new_index = second.index_document("uri").await.unwrap().unwrap();
        assert_ne!(new_index.id(), old_index);
        assert!(repo.find(old_index).await.is_err());
        assert_eq!(new_index.buckets().keys().collect::<Vec<_>>(), vec!["\"Alpha\""]);
    }

    #[tokio::test]
    async fn test_removed_index_is_dropped() {
        let repo = Repo::in_memory();
        let first = posts(&repo).await;
        let old_index = first.index_document("uri").await.unwrap().unwrap().id();

        let (second, _) =
            Collection::<Post>::attach(&repo, "posts", CollectionSchema::new(), Some(first.id()))
                .await
                .unwrap();
        assert!(second.descriptors().unwrap().is_empty());
        assert!(repo.find(old_index).await.is_err());
        assert!(second
            .find_by_index("uri", "a", FindOptions::new())
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_missing_row_document_is_aggregated() {
        let repo = Repo::in_memory();
        let posts = posts(&repo).await;
        let a = posts.create(post("a", "A")).await.unwrap();
        let b = posts.create(post("b", "B")).await.unwrap();
        posts.create(post("c", "C")).await.unwrap();

        // Drop two row documents behind the collection's back
        repo.delete(a.id).await.unwrap();
        repo.delete(b.id).await.unwrap();

        match posts.find(FindOptions::new()).await {
            Err(DbError::Query(errors)) => {
                assert_eq!(errors.len(), 2);
                assert!(errors
                    .errors()
                    .iter()
                    .all(|e| matches!(e, DbError::Resolution { .. })));
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }
}
