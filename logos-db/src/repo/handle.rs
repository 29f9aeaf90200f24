//! Document handle: one yrs document plus its JSON snapshot and change fan-out.
//!
//! The yrs root map `"root"` mirrors the JSON document: objects become nested
//! yrs maps so peers merge them key by key, while scalars and arrays are leaf
//! `Any` values. Mutations run against a cloned snapshot; only the changed
//! keys are written back in one yrs transaction and the resulting patches are
//! broadcast to subscribers.
//!
//! ```text
//! change(f) ──► snapshot.clone() ──► f(&mut next) ──► diff(prev, next)
//!                                                        │
//!                         yrs root map ◄── write fields ─┤
//!                                                        ▼
//!                                      broadcast::Sender<ChangePayload>
//! ```

use std::convert::Infallible;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::{Map, Value};
use tokio::sync::broadcast;
use yrs::updates::decoder::Decode;
use yrs::{
    Any, Doc, In, Map as _, MapPrelim, MapRef, Out, ReadTxn, StateVector, Transact,
    TransactionMut, Update,
};

use super::patch::{diff, ChangeOrigin, ChangePayload};
use super::DocumentId;
use crate::error::RepoError;

/// Name of the yrs root map holding the document fields.
const ROOT: &str = "root";

/// Mutable per-document state, guarded by one lock.
struct DocState {
    /// Current merged snapshot
    value: Map<String, Value>,
    /// Changed since the last flush
    dirty: bool,
    /// State vector at the last flush (None = never persisted)
    persisted: Option<StateVector>,
    /// Last persisted delta/snapshot version
    version: u64,
    /// Version of the last persisted snapshot
    snapshot_version: u64,
    deleted: bool,
}

struct DocInner {
    id: DocumentId,
    doc: Doc,
    state: Mutex<DocState>,
    sender: broadcast::Sender<Arc<ChangePayload>>,
}

/// Shared handle to one repository document.
///
/// Cloning is cheap; all clones observe the same document.
#[derive(Clone)]
pub struct DocHandle {
    inner: Arc<DocInner>,
}

impl std::fmt::Debug for DocHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocHandle")
            .field("id", &self.inner.id)
            .finish()
    }
}

/// What a flush has to write for one document.
pub(crate) struct PendingWrite {
    pub update: Vec<u8>,
    pub state_vector: StateVector,
    pub version: u64,
    /// Write a full snapshot instead of a delta
    pub snapshot: bool,
}

impl DocHandle {
    pub(crate) fn new(id: DocumentId, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            inner: Arc::new(DocInner {
                id,
                doc: Doc::new(),
                state: Mutex::new(DocState {
                    value: Map::new(),
                    dirty: false,
                    persisted: None,
                    version: 0,
                    snapshot_version: 0,
                    deleted: false,
                }),
                sender,
            }),
        }
    }

    /// Create a handle whose yrs document holds `initial`.
    pub(crate) fn with_value(id: DocumentId, capacity: usize, initial: Map<String, Value>) -> Self {
        let handle = Self::new(id, capacity);
        {
            let mut state = handle.lock();
            handle.write_fields(&Map::new(), &initial);
            state.value = initial;
            state.dirty = true;
        }
        handle
    }

    /// Rebuild a handle from persisted yrs updates (snapshot first, then deltas).
    pub(crate) fn restore<'a>(
        id: DocumentId,
        capacity: usize,
        updates: impl IntoIterator<Item = &'a [u8]>,
        version: u64,
    ) -> Result<Self, RepoError> {
        let handle = Self::new(id, capacity);
        {
            let mut txn = handle.inner.doc.transact_mut();
            for bytes in updates {
                let update =
                    Update::decode_v1(bytes).map_err(|e| RepoError::Codec(e.to_string()))?;
                txn.apply_update(update)
                    .map_err(|e| RepoError::Codec(e.to_string()))?;
            }
        }
        let value = read_fields(&handle.inner.doc)?;
        let state_vector = handle.inner.doc.transact().state_vector();
        {
            let mut state = handle.lock();
            state.value = value;
            state.persisted = Some(state_vector);
            state.version = version;
            state.snapshot_version = version;
        }
        Ok(handle)
    }

    pub fn id(&self) -> DocumentId {
        self.inner.id
    }

    /// Synchronous snapshot of the current merged state.
    pub fn value(&self) -> Map<String, Value> {
        self.lock().value.clone()
    }

    /// Read a single top-level field.
    pub fn get(&self, field: &str) -> Option<Value> {
        self.lock().value.get(field).cloned()
    }

    pub fn is_deleted(&self) -> bool {
        self.lock().deleted
    }

    /// Apply `f` to a mutable view of the document.
    ///
    /// Returns whether anything changed.
    pub fn change<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        match self.try_change(|doc| {
            f(doc);
            Ok::<(), Infallible>(())
        }) {
            Ok(changed) => changed,
            Err(never) => match never {},
        }
    }

    /// Apply a fallible mutation; nothing is committed when `f` fails.
    pub fn try_change<F, E>(&self, f: F) -> Result<bool, E>
    where
        F: FnOnce(&mut Map<String, Value>) -> Result<(), E>,
    {
        let mut state = self.lock();
        if state.deleted {
            log::warn!("Ignoring change to deleted document {}", self.inner.id);
            return Ok(false);
        }

        let mut next = state.value.clone();
        f(&mut next)?;

        let patches = diff(&state.value, &next);
        if patches.is_empty() {
            return Ok(false);
        }

        self.write_fields(&state.value, &next);
        state.value = next;
        state.dirty = true;

        let payload = Arc::new(ChangePayload {
            document_id: self.inner.id,
            origin: ChangeOrigin::Local,
            patches,
            doc: state.value.clone(),
        });
        drop(state);

        // No receivers is not an error
        let _ = self.inner.sender.send(payload);
        Ok(true)
    }

    /// Subscribe to change batches.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<ChangePayload>> {
        self.inner.sender.subscribe()
    }

    /// Full yrs state, suitable for `Repo::apply_update` on a peer.
    pub fn encode_state(&self) -> Vec<u8> {
        let _state = self.lock();
        let txn = self.inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Merge a peer's yrs update and broadcast the resulting patches.
    pub(crate) fn apply_update(&self, update: &[u8]) -> Result<bool, RepoError> {
        let update = Update::decode_v1(update).map_err(|e| RepoError::Codec(e.to_string()))?;

        let mut state = self.lock();
        if state.deleted {
            return Err(RepoError::Deleted(self.inner.id));
        }
        {
            let mut txn = self.inner.doc.transact_mut();
            txn.apply_update(update)
                .map_err(|e| RepoError::Codec(e.to_string()))?;
        }

        let next = read_fields(&self.inner.doc)?;
        let patches = diff(&state.value, &next);
        if patches.is_empty() {
            return Ok(false);
        }
        state.value = next;
        state.dirty = true;

        let payload = Arc::new(ChangePayload {
            document_id: self.inner.id,
            origin: ChangeOrigin::Remote,
            patches,
            doc: state.value.clone(),
        });
        drop(state);

        let _ = self.inner.sender.send(payload);
        Ok(true)
    }

    /// Persisted, unchanged since, and referenced only by the caller.
    pub(crate) fn is_releasable(&self) -> bool {
        if Arc::strong_count(&self.inner) != 1 {
            return false;
        }
        let state = self.lock();
        !state.dirty && state.persisted.is_some()
    }

    pub(crate) fn mark_deleted(&self) {
        let mut state = self.lock();
        state.deleted = true;
        state.dirty = false;
    }

    /// Encode what has changed since the last flush, if anything.
    pub(crate) fn pending_write(&self, compaction_threshold: u64) -> Option<PendingWrite> {
        let state = self.lock();
        if !state.dirty || state.deleted {
            return None;
        }

        let txn = self.inner.doc.transact();
        let version = state.version + 1;
        let snapshot = match &state.persisted {
            None => true,
            Some(_) => version - state.snapshot_version >= compaction_threshold,
        };
        let base = match (&state.persisted, snapshot) {
            (Some(sv), false) => sv.clone(),
            _ => StateVector::default(),
        };

        Some(PendingWrite {
            update: txn.encode_state_as_update_v1(&base),
            state_vector: txn.state_vector(),
            version,
            snapshot,
        })
    }

    /// Record a successful flush of `write`.
    pub(crate) fn mark_persisted(&self, write: PendingWrite) {
        let mut state = self.lock();
        // Changes made while the write was in flight stay dirty
        let current = self.inner.doc.transact().state_vector();
        state.dirty = current != write.state_vector;
        state.persisted = Some(write.state_vector);
        state.version = write.version;
        if write.snapshot {
            state.snapshot_version = write.version;
        }
    }

    fn write_fields(&self, before: &Map<String, Value>, after: &Map<String, Value>) {
        let root = self.inner.doc.get_or_insert_map(ROOT);
        let mut txn = self.inner.doc.transact_mut();
        write_object(&root, &mut txn, before, after);
    }

    fn lock(&self) -> MutexGuard<'_, DocState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Apply the key-level difference between `before` and `after` to `map`.
///
/// Objects present on both sides recurse into the existing nested map, so
/// concurrent writes to sibling keys survive a merge.
fn write_object(
    map: &MapRef,
    txn: &mut TransactionMut,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
) {
    for key in before.keys() {
        if !after.contains_key(key) {
            map.remove(txn, key.as_str());
        }
    }
    for (key, value) in after {
        let previous = before.get(key);
        if previous == Some(value) {
            continue;
        }
        match (value, previous) {
            (Value::Object(next), Some(Value::Object(prev))) => match map.get(&*txn, key) {
                Some(Out::YMap(nested)) => write_object(&nested, txn, prev, next),
                _ => {
                    map.insert(txn, key.as_str(), object_prelim(next));
                }
            },
            (Value::Object(next), _) => {
                map.insert(txn, key.as_str(), object_prelim(next));
            }
            (leaf, _) => {
                map.insert(txn, key.as_str(), json_to_any(leaf));
            }
        }
    }
}

fn object_prelim(object: &Map<String, Value>) -> MapPrelim {
    object
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::Object(nested) => In::Map(object_prelim(nested)),
                leaf => In::Any(json_to_any(leaf)),
            };
            (key.as_str(), value)
        })
        .collect()
}

/// Leaf conversion. Integers keep their integer form through `BigInt`.
fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => Any::String(s.as_str().into()),
        Value::Array(items) => Any::Array(items.iter().map(json_to_any).collect()),
        Value::Object(map) => Any::Map(Arc::new(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_any(v)))
                .collect(),
        )),
    }
}

fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), any_to_json(v)))
                .collect(),
        ),
    }
}

/// Decode the yrs root map back into a JSON snapshot.
fn read_fields(doc: &Doc) -> Result<Map<String, Value>, RepoError> {
    let root = doc.get_or_insert_map(ROOT);
    let txn = doc.transact();
    read_object(&root, &txn, "")
}

fn read_object<T: ReadTxn>(
    map: &MapRef,
    txn: &T,
    path: &str,
) -> Result<Map<String, Value>, RepoError> {
    let mut fields = Map::new();
    for (key, out) in map.iter(txn) {
        let value = match out {
            Out::Any(any) => any_to_json(&any),
            Out::YMap(nested) => {
                Value::Object(read_object(&nested, txn, &format!("{path}{key}/"))?)
            }
            _ => {
                return Err(RepoError::Codec(format!(
                    "field `{path}{key}` is not a map or plain value"
                )))
            }
        };
        fields.insert(key.to_string(), value);
    }
    Ok(fields)
}
