//! Row-level change events.
//!
//! Collection subscribers see the collection document's patch stream turned
//! into semantic events:
//!
//! ```text
//! Put    [byId, id] = 0      → Created(id)
//! Put    [byId, id] = stamp  → Updated(id)
//! Delete [byId, id]          → Deleted(id)
//! ```
//!
//! Created and updated rows are resolved before the callback runs; a row
//! that can no longer be resolved is logged and skipped.

use std::future::Future;

use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::collection::{Collection, Record, Row, CREATED_MARKER};
use crate::repo::{DocumentId, Patch, PatchAction};

const BY_ID: &str = "byId";

/// Row-level change derived from collection document patches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowChange {
    Created(DocumentId),
    Updated(DocumentId),
    Deleted(DocumentId),
}

impl RowChange {
    pub fn id(&self) -> DocumentId {
        match self {
            RowChange::Created(id) | RowChange::Updated(id) | RowChange::Deleted(id) => *id,
        }
    }
}

/// Event delivered to collection subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum CollectionEvent<T> {
    Created { id: DocumentId, row: Row<T> },
    Updated { id: DocumentId, row: Row<T> },
    Deleted { id: DocumentId },
}

impl<T> CollectionEvent<T> {
    pub fn id(&self) -> DocumentId {
        match self {
            CollectionEvent::Created { id, .. }
            | CollectionEvent::Updated { id, .. }
            | CollectionEvent::Deleted { id } => *id,
        }
    }
}

fn put_change(id: &str, value: &Value) -> Option<RowChange> {
    let id = match id.parse() {
        Ok(id) => id,
        Err(e) => {
            log::warn!("Ignoring byId patch for malformed row id {id}: {e}");
            return None;
        }
    };
    if value.as_i64() == Some(CREATED_MARKER) {
        Some(RowChange::Created(id))
    } else {
        Some(RowChange::Updated(id))
    }
}

/// Translate raw patches into row changes, in patch order.
///
/// Only paths under `byId` are considered. A `Put` of the whole `byId` map,
/// as produced when a merge introduces it, expands to one change per entry.
pub fn translate(patches: &[Patch]) -> Vec<RowChange> {
    let mut changes = Vec::new();
    for patch in patches {
        if patch.key_at(0) != Some(BY_ID) {
            continue;
        }
        match (patch.action, patch.path.len(), patch.key_at(1)) {
            (PatchAction::Put, 2, Some(id)) => {
                let value = patch.value.as_ref().unwrap_or(&Value::Null);
                changes.extend(put_change(id, value));
            }
            (PatchAction::Delete, 2, Some(id)) => match id.parse() {
                Ok(id) => changes.push(RowChange::Deleted(id)),
                Err(e) => log::warn!("Ignoring byId patch for malformed row id {id}: {e}"),
            },
            (PatchAction::Put, 1, _) => {
                if let Some(Value::Object(entries)) = &patch.value {
                    changes.extend(entries.iter().filter_map(|(id, value)| put_change(id, value)));
                }
            }
            _ => {}
        }
    }
    changes
}

/// Handle to a running subscription; dropping it stops delivery.
#[derive(Debug)]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub(crate) fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            task: tokio::spawn(future),
        }
    }

    /// Stop delivery.
    pub fn unsubscribe(self) {}

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the task that feeds `callback` from the collection's patch stream.
pub(crate) fn listen<T, F>(collection: Collection<T>, callback: F) -> Subscription
where
    T: Record,
    F: Fn(CollectionEvent<T>) + Send + 'static,
{
    let mut rx = collection.handle().subscribe();
    Subscription::spawn(async move {
        loop {
            let payload = match rx.recv().await {
                Ok(payload) => payload,
                Err(RecvError::Lagged(skipped)) => {
                    log::warn!(
                        "Subscriber of {} lagged, skipped {skipped} change batches",
                        collection.name()
                    );
                    continue;
                }
                Err(RecvError::Closed) => break,
            };

            for change in translate(&payload.patches) {
                let event = match change {
                    RowChange::Deleted(id) => CollectionEvent::Deleted { id },
                    RowChange::Created(id) | RowChange::Updated(id) => {
                        let row = match collection.resolve_row(id).await {
                            Ok(row) => row,
                            Err(e) => {
                                log::warn!(
                                    "Skipping event for row {id} of {}: {e}",
                                    collection.name()
                                );
                                continue;
                            }
                        };
                        if matches!(change, RowChange::Created(_)) {
                            CollectionEvent::Created { id, row }
                        } else {
                            CollectionEvent::Updated { id, row }
                        }
                    }
                };
                callback(event);
            }
        }
    })
}
