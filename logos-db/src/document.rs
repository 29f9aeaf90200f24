//! Versioned documents and migration sequencing.
//!
//! Every managed document carries `_mvid`, the last migration version applied
//! to it. `-1` marks a brand-new document that has not been bootstrapped yet.
//! Migrations run once each, in ascending version order, each in its own
//! mutation that also advances `_mvid`.

use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::broadcast::error::RecvError;

use crate::error::{BoxError, DbError};
use crate::events::Subscription;
use crate::repo::{DocHandle, DocumentId, Repo};

/// Field holding the applied migration version.
pub const VERSION_FIELD: &str = "_mvid";

/// `_mvid` of a document that has never been migrated.
pub const UNSET_VERSION: i64 = -1;

/// Engine-managed fields that never reach typed values.
pub(crate) const RESERVED_FIELDS: &[&str] = &[VERSION_FIELD, crate::collection::COLLECTION_FIELD];

/// A single migration step over the raw document fields.
pub type MigrationFn = Arc<dyn Fn(&mut Map<String, Value>) -> Result<(), BoxError> + Send + Sync>;

/// Ordered set of migrations keyed by positive version.
#[derive(Clone, Default)]
pub struct Migrations {
    steps: BTreeMap<u32, MigrationFn>,
}

impl fmt::Debug for Migrations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Migrations")
            .field("versions", &self.steps.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Migrations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the migration for `version`, replacing any previous one.
    pub fn add<F>(&mut self, version: u32, f: F)
    where
        F: Fn(&mut Map<String, Value>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.steps.insert(version, Arc::new(f));
    }

    pub fn with<F>(mut self, version: u32, f: F) -> Self
    where
        F: Fn(&mut Map<String, Value>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.add(version, f);
        self
    }

    /// Highest declared version, or 0 when there are none.
    pub fn latest(&self) -> u32 {
        self.steps.keys().next_back().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn versions(&self) -> impl Iterator<Item = u32> + '_ {
        self.steps.keys().copied()
    }

    pub(crate) fn validate(&self) -> Result<(), DbError> {
        if self.steps.contains_key(&0) {
            return Err(DbError::Schema(
                "migration versions must be positive; 0 is the baseline".into(),
            ));
        }
        Ok(())
    }
}

/// Current `_mvid` of a snapshot; `UNSET_VERSION` if absent.
pub fn current_version(doc: &Map<String, Value>) -> i64 {
    doc.get(VERSION_FIELD)
        .and_then(Value::as_i64)
        .unwrap_or(UNSET_VERSION)
}

/// Bring `handle` up to the latest declared migration.
///
/// Returns whether any mutation occurred. A failing step is not committed
/// and aborts the sequence; earlier steps stay applied.
pub fn migrate(handle: &DocHandle, migrations: &Migrations) -> Result<bool, DbError> {
    let current = current_version(&handle.value());

    if current == UNSET_VERSION && migrations.is_empty() {
        handle.change(|doc| {
            doc.insert(VERSION_FIELD.into(), Value::from(0));
        });
        return Ok(true);
    }

    let applied = u32::try_from(current.max(0)).unwrap_or(u32::MAX);
    let mut changed = false;
    for (&version, step) in migrations.steps.range(applied.saturating_add(1)..) {
        handle
            .try_change(|doc| {
                step(doc)?;
                doc.insert(VERSION_FIELD.into(), Value::from(version));
                Ok::<(), BoxError>(())
            })
            .map_err(|source| DbError::Migration {
                id: handle.id(),
                version,
                source,
            })?;
        log::debug!("Migrated document {} to version {version}", handle.id());
        changed = true;
    }

    Ok(changed)
}

/// Attach to `id`, or create a fresh document from `initial`, then migrate.
///
/// Returns the handle and whether a durability barrier is needed.
pub async fn init_or_create(
    repo: &Repo,
    migrations: &Migrations,
    id: Option<DocumentId>,
    initial: Map<String, Value>,
) -> Result<(DocHandle, bool), DbError> {
    let (handle, created) = match id {
        Some(id) => {
            let handle = repo
                .find(id)
                .await
                .map_err(|e| DbError::resolution(id, e))?;
            (handle, false)
        }
        None => {
            let mut initial = initial;
            initial.insert(VERSION_FIELD.into(), Value::from(UNSET_VERSION));
            (repo.create(initial).await, true)
        }
    };

    let migrated = migrate(&handle, migrations)?;
    Ok((handle, created || migrated))
}

/// Serialize a typed value into document fields.
pub(crate) fn encode_fields<T: Serialize>(value: &T) -> Result<Map<String, Value>, DbError> {
    match serde_json::to_value(value).map_err(DbError::Encode)? {
        Value::Object(fields) => Ok(fields),
        other => Err(DbError::Schema(format!(
            "documents must serialize to a JSON object, got `{other}`"
        ))),
    }
}

/// Deserialize document fields into a typed value, ignoring reserved fields.
pub(crate) fn decode_fields<T: DeserializeOwned>(
    id: DocumentId,
    doc: &Map<String, Value>,
) -> Result<T, DbError> {
    let fields: Map<String, Value> = doc
        .iter()
        .filter(|(key, _)| !RESERVED_FIELDS.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    serde_json::from_value(Value::Object(fields)).map_err(|source| DbError::Decode { id, source })
}

/// Replace every non-reserved field of `doc` with `fields`.
pub(crate) fn replace_fields(doc: &mut Map<String, Value>, fields: Map<String, Value>) {
    doc.retain(|key, _| RESERVED_FIELDS.contains(&key.as_str()) || fields.contains_key(key));
    for (key, value) in fields {
        if !RESERVED_FIELDS.contains(&key.as_str()) {
            doc.insert(key, value);
        }
    }
}

/// Declaration of a singleton document: its type and migrations.
pub struct DocumentSchema<D> {
    pub(crate) migrations: Migrations,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Default for DocumentSchema<D> {
    fn default() -> Self {
        Self {
            migrations: Migrations::new(),
            _marker: PhantomData,
        }
    }
}

impl<D> DocumentSchema<D> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn migration<F>(mut self, version: u32, f: F) -> Self
    where
        F: Fn(&mut Map<String, Value>) -> Result<(), BoxError> + Send + Sync + 'static,
    {
        self.migrations.add(version, f);
        self
    }

    pub fn migrations(&self) -> &Migrations {
        &self.migrations
    }
}

/// Typed view over a migrated document.
pub struct Document<D> {
    handle: DocHandle,
    _marker: PhantomData<fn() -> D>,
}

impl<D> Clone for Document<D> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            _marker: PhantomData,
        }
    }
}

impl<D> fmt::Debug for Document<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Document").field("id", &self.handle.id()).finish()
    }
}

impl<D> Document<D>
where
    D: Serialize + DeserializeOwned,
{
    pub(crate) fn new(handle: DocHandle) -> Self {
        Self {
            handle,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> DocumentId {
        self.handle.id()
    }

    pub fn handle(&self) -> &DocHandle {
        &self.handle
    }

    /// Applied migration version.
    pub fn version(&self) -> i64 {
        current_version(&self.handle.value())
    }

    pub fn get(&self) -> Result<D, DbError> {
        decode_fields(self.id(), &self.handle.value())
    }

    pub fn get_raw(&self) -> Map<String, Value> {
        self.handle.value()
    }

    /// Mutate the typed value; returns whether anything changed.
    pub fn change<F>(&self, f: F) -> Result<bool, DbError>
    where
        F: FnOnce(&mut D),
    {
        let id = self.id();
        self.handle.try_change(|doc| {
            let mut value: D = decode_fields(id, doc)?;
            f(&mut value);
            replace_fields(doc, encode_fields(&value)?);
            Ok(())
        })
    }

    pub fn change_raw<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        self.handle.change(f)
    }

    /// Call `callback` with the current value now and after every change.
    ///
    /// Snapshots that fail to decode are logged and skipped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        D: Send + 'static,
        F: Fn(D) + Send + 'static,
    {
        let id = self.id();
        let mut rx = self.handle.subscribe();

        match self.get() {
            Ok(value) => callback(value),
            Err(e) => log::warn!("Skipping initial snapshot of {id}: {e}"),
        }

        Subscription::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(payload) => match decode_fields::<D>(id, &payload.doc) {
                        Ok(value) => callback(value),
                        Err(e) => log::warn!("Skipping snapshot of {id}: {e}"),
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        log::warn!("Subscriber of {id} lagged, skipped {skipped} change batches");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Settings {
        theme: String,
        locale: String,
    }

    fn settings_migrations() -> Migrations {
        Migrations::new().with(1, |doc| {
            doc.insert("theme".into(), json!("dark"));
            doc.insert("locale".into(), json!("en"));
            Ok(())
        })
    }

    #[tokio::test]
    async fn test_new_document_without_migrations_gets_baseline() {
        let repo = Repo::in_memory();
        let (handle, should_flush) = init_or_create(&repo, &Migrations::new(), None, Map::new())
            .await
            .unwrap();
        assert!(should_flush);
        assert_eq!(current_version(&handle.value()), 0);

        // Second pass is a no-op
        assert!(!migrate(&handle, &Migrations::new()).unwrap());
    }

    #[tokio::test]
    async fn test_migrations_apply_in_order_once() {
        let repo = Repo::in_memory();
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut migrations = Migrations::new();
        for version in [3u32, 1, 2] {
            let order = order.clone();
            migrations.add(version, move |doc| {
                order.lock().unwrap().push(version);
                doc.insert(format!("v{version}"), json!(true));
                Ok(())
            });
        }

        let (handle, _) = init_or_create(&repo, &migrations, None, Map::new())
            .await
            .unwrap();
        assert_eq!(*order.lock().unwrap(), vec![1, 2, 3]);
        assert_eq!(current_version(&handle.value()), 3);

        assert!(!migrate(&handle, &migrations).unwrap());
        assert_eq!(order.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_only_newer_versions_apply() {
        let repo = Repo::in_memory();
        let handle = repo
            .create(match json!({"_mvid": 2}) {
                Value::Object(map) => map,
                _ => unreachable!(),
            })
            .await;

        let migrations = Migrations::new()
            .with(1, |_| Err("must not run".into()))
            .with(2, |_| Err("must not run".into()))
            .with(4, |doc| {
                doc.insert("four".into(), json!(4));
                Ok(())
            });

        assert!(migrate(&handle, &migrations).unwrap());
        assert_eq!(current_version(&handle.value()), 4);
        assert_eq!(handle.get("four"), Some(json!(4)));
    }

    #[tokio::test]
    async fn test_failed_migration_keeps_earlier_versions() {
        let repo = Repo::in_memory();
        let migrations = Migrations::new()
            .with(1, |doc| {
                doc.insert("a".into(), json!(1));
                Ok(())
            })
            .with(2, |doc| {
                doc.insert("b".into(), json!(2));
                Err("broken step".into())
            })
            .with(3, |_| Ok(()));

        let err = init_or_create(&repo, &migrations, None, Map::new())
            .await
            .unwrap_err();
        match err {
            DbError::Migration { version, .. } => assert_eq!(version, 2),
            other => panic!("expected migration error, got {other:?}"),
        }

        let id = repo.document_ids().await[0];
        let handle = repo.find(id).await.unwrap();
        assert_eq!(current_version(&handle.value()), 1);
        assert_eq!(handle.get("a"), Some(json!(1)));
        assert_eq!(handle.get("b"), None);
    }

    #[test]
    fn test_zero_version_rejected() {
        let migrations = Migrations::new().with(0, |_| Ok(()));
        assert!(matches!(migrations.validate(), Err(DbError::Schema(_))));
    }

    #[tokio::test]
    async fn test_typed_get_and_change() {
        let repo = Repo::in_memory();
        let (handle, _) = init_or_create(&repo, &settings_migrations(), None, Map::new())
            .await
            .unwrap();
        let settings: Document<Settings> = Document::new(handle);

        assert_eq!(
            settings.get().unwrap(),
            Settings {
                theme: "dark".into(),
                locale: "en".into()
            }
        );

        assert!(settings.change(|s| s.theme = "light".into()).unwrap());
        assert_eq!(settings.get().unwrap().theme, "light");
        assert_eq!(settings.version(), 1);
        assert!(!settings.change(|s| s.theme = "light".into()).unwrap());
    }

    #[tokio::test]
    async fn test_subscribe_receives_current_and_changes() {
        let repo = Repo::in_memory();
        let (handle, _) = init_or_create(&repo, &settings_migrations(), None, Map::new())
            .await
            .unwrap();
        let settings: Document<Settings> = Document::new(handle);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let subscription = settings.subscribe(move |s: Settings| {
            let _ = tx.send(s.theme);
        });

        assert_eq!(rx.recv().await.unwrap(), "dark");
        settings.change(|s| s.theme = "light".into()).unwrap();
        let next = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(next.unwrap(), "light");

        subscription.unsubscribe();
    }

    #[test]
    fn test_replace_fields_keeps_reserved() {
        let mut doc = match json!({"_mvid": 2, "_collection": "posts", "old": 1}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        let fields = match json!({"title": "t", "_mvid": 99}) {
            Value::Object(map) => map,
            _ => unreachable!(),
        };
        replace_fields(&mut doc, fields);
        assert_eq!(
            Value::Object(doc),
            json!({"_mvid": 2, "_collection": "posts", "title": "t"})
        );
    }
}
