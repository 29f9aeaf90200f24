//! Structural patches describing how a document changed.
//!
//! Patches are derived by diffing the document snapshot before and after a
//! mutation (local change or merged remote update):
//!
//! ```text
//! before {a: 1, m: {x: 1}}      after {m: {x: 2, y: 3}, b: [1]}
//!
//!   Delete [a]
//!   Put    [b]     = [1]
//!   Put    [m, x]  = 2
//!   Put    [m, y]  = 3
//! ```
//!
//! Objects are recursed; scalars and arrays are replaced wholesale.

use std::fmt;

use serde_json::{Map, Value};

use super::DocumentId;

/// One segment of a patch path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Prop {
    Key(String),
    Index(usize),
}

impl Prop {
    pub fn as_key(&self) -> Option<&str> {
        match self {
            Prop::Key(key) => Some(key),
            Prop::Index(_) => None,
        }
    }
}

impl From<&str> for Prop {
    fn from(key: &str) -> Self {
        Prop::Key(key.to_string())
    }
}

impl fmt::Display for Prop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Prop::Key(key) => write!(f, "{key}"),
            Prop::Index(i) => write!(f, "{i}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchAction {
    Put,
    Delete,
}

/// A single structural change.
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
    pub action: PatchAction,
    pub path: Vec<Prop>,
    /// New value for `Put`; `None` for `Delete`
    pub value: Option<Value>,
}

impl Patch {
    pub fn put(path: Vec<Prop>, value: Value) -> Self {
        Self {
            action: PatchAction::Put,
            path,
            value: Some(value),
        }
    }

    pub fn delete(path: Vec<Prop>) -> Self {
        Self {
            action: PatchAction::Delete,
            path,
            value: None,
        }
    }

    /// Key at `depth` in the path, if that segment is a map key.
    pub fn key_at(&self, depth: usize) -> Option<&str> {
        self.path.get(depth).and_then(Prop::as_key)
    }
}

/// Where a change batch came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Mutation through a local handle
    Local,
    /// Merged update received from a peer
    Remote,
}

/// One change batch: the patches plus the resulting snapshot.
#[derive(Debug, Clone)]
pub struct ChangePayload {
    pub document_id: DocumentId,
    pub origin: ChangeOrigin,
    pub patches: Vec<Patch>,
    pub doc: Map<String, Value>,
}

/// Diff two document snapshots into patches.
pub fn diff(before: &Map<String, Value>, after: &Map<String, Value>) -> Vec<Patch> {
    let mut patches = Vec::new();
    diff_object(&mut Vec::new(), before, after, &mut patches);
    patches
}

fn diff_object(
    path: &mut Vec<Prop>,
    before: &Map<String, Value>,
    after: &Map<String, Value>,
    out: &mut Vec<Patch>,
) {
    for key in before.keys() {
        if !after.contains_key(key) {
            path.push(Prop::Key(key.clone()));
            out.push(Patch::delete(path.clone()));
            path.pop();
        }
    }

    for (key, next) in after {
        path.push(Prop::Key(key.clone()));
        match (before.get(key), next) {
            (Some(prev), next) if prev == next => {}
            (Some(Value::Object(prev)), Value::Object(next)) => {
                diff_object(path, prev, next, out);
            }
            _ => out.push(Patch::put(path.clone(), next.clone())),
        }
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn obj(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_diff_identical_is_empty() {
        let doc = obj(json!({"a": 1, "m": {"x": [1, 2]}}));
        assert!(diff(&doc, &doc).is_empty());
    }

    #[test]
    fn test_diff_nested_put_and_delete() {
        let before = obj(json!({"a": 1, "byId": {"r1": 0, "r2": 0}}));
        let after = obj(json!({"a": 1, "byId": {"r1": 5, "r3": 0}}));

        let patches = diff(&before, &after);
        assert_eq!(
            patches,
            vec![
                Patch::delete(vec!["byId".into(), "r2".into()]),
                Patch::put(vec!["byId".into(), "r1".into()], json!(5)),
                Patch::put(vec!["byId".into(), "r3".into()], json!(0)),
            ]
        );
    }

    #[test]
    fn test_diff_new_object_is_single_put() {
        let before = obj(json!({}));
        let after = obj(json!({"indexes": {"uri": {"key": "uri"}}}));

        let patches = diff(&before, &after);
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].path, vec![Prop::from("indexes")]);
        assert_eq!(patches[0].value, Some(json!({"uri": {"key": "uri"}})));
    }

    #[test]
    fn test_diff_array_replaced_wholesale() {
        let before = obj(json!({"tags": ["a"]}));
        let after = obj(json!({"tags": ["a", "b"]}));

        let patches = diff(&before, &after);
        assert_eq!(
            patches,
            vec![Patch::put(vec!["tags".into()], json!(["a", "b"]))]
        );
    }

    #[test]
    fn test_key_at() {
        let patch = Patch::delete(vec!["byId".into(), Prop::Index(3)]);
        assert_eq!(patch.key_at(0), Some("byId"));
        assert_eq!(patch.key_at(1), None);
        assert_eq!(patch.key_at(2), None);
    }
}
