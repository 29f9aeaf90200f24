//! Secondary indexes.
//!
//! Each declared index owns one document mapping a serialized key to the set
//! of row ids in that bucket:
//!
//! ```text
//! index document
//! ├── "\"test\""          → { <rowId>: true, <rowId>: true }
//! └── "\"a\"|42"          → { <rowId>: true }
//! ```
//!
//! Composite keys are the JSON encoding of each field joined with `|`.
//! Rows with a null or missing key field belong to no bucket.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::repo::{DocHandle, DocumentId};

/// Separator between composite key parts.
pub const KEY_SEPARATOR: &str = "|";

/// Field path(s) an index is keyed on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexKey {
    Field(String),
    Composite(Vec<String>),
}

impl IndexKey {
    pub fn field(name: impl Into<String>) -> Self {
        IndexKey::Field(name.into())
    }

    pub fn composite<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        IndexKey::Composite(fields.into_iter().map(Into::into).collect())
    }

    /// Participating field names in key order.
    pub fn fields(&self) -> Vec<&str> {
        match self {
            IndexKey::Field(field) => vec![field.as_str()],
            IndexKey::Composite(fields) => fields.iter().map(String::as_str).collect(),
        }
    }

    /// Serialized bucket key for `row`, or `None` if any field is null or missing.
    pub fn key_for_row(&self, row: &Map<String, Value>) -> Option<String> {
        let mut values = Vec::new();
        for field in self.fields() {
            match row.get(field) {
                None | Some(Value::Null) => return None,
                Some(value) => values.push(value),
            }
        }
        match self {
            IndexKey::Field(_) => values.first().map(|value| encode_value(value)),
            IndexKey::Composite(_) => Some(join_values(values)),
        }
    }
}

impl From<&str> for IndexKey {
    fn from(field: &str) -> Self {
        IndexKey::Field(field.to_string())
    }
}

impl From<String> for IndexKey {
    fn from(field: String) -> Self {
        IndexKey::Field(field)
    }
}

impl From<Vec<&str>> for IndexKey {
    fn from(fields: Vec<&str>) -> Self {
        IndexKey::composite(fields)
    }
}

impl<const N: usize> From<[&str; N]> for IndexKey {
    fn from(fields: [&str; N]) -> Self {
        IndexKey::composite(fields)
    }
}

/// Stored index declaration inside the collection document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDescriptor {
    pub key: IndexKey,
    /// `None` until an index document has been allocated
    pub index_document_id: Option<DocumentId>,
}

/// JSON-encode a value the way `JSON.stringify` does for index keys.
///
/// Integral floats drop their fractional part, so `1.0` encodes as `1`.
pub fn encode_value(value: &Value) -> String {
    match value {
        Value::Number(n) if n.is_f64() => match n.as_f64() {
            Some(f) if f == 0.0 => "0".to_string(),
            Some(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 1e21 => format!("{f:.0}"),
            _ => value.to_string(),
        },
        _ => value.to_string(),
    }
}

fn join_values<'a>(values: impl IntoIterator<Item = &'a Value>) -> String {
    values
        .into_iter()
        .map(encode_value)
        .collect::<Vec<_>>()
        .join(KEY_SEPARATOR)
}

/// Serialize a lookup key.
///
/// A non-empty array is treated as a composite key; anything else is
/// encoded directly.
pub fn serialize_key(key: &Value) -> String {
    match key {
        Value::Array(parts) if !parts.is_empty() => join_values(parts),
        other => encode_value(other),
    }
}

/// Bucket key per index name, for the indexes `row` participates in.
pub type RowKeys = BTreeMap<String, String>;

pub fn row_keys<'a>(
    indexes: impl IntoIterator<Item = (&'a String, &'a IndexKey)>,
    row: &Map<String, Value>,
) -> RowKeys {
    indexes
        .into_iter()
        .filter_map(|(name, key)| key.key_for_row(row).map(|bucket| (name.clone(), bucket)))
        .collect()
}

/// Bucket moves caused by one row mutation.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct KeyChanges {
    /// Buckets the row must be inserted into
    pub added: RowKeys,
    /// Buckets the row must be removed from
    pub removed: RowKeys,
}

impl KeyChanges {
    pub fn between(before: &RowKeys, after: &RowKeys) -> Self {
        let mut changes = Self::default();
        for (name, bucket) in before {
            if after.get(name) != Some(bucket) {
                changes.removed.insert(name.clone(), bucket.clone());
            }
        }
        for (name, bucket) in after {
            if before.get(name) != Some(bucket) {
                changes.added.insert(name.clone(), bucket.clone());
            }
        }
        changes
    }

    /// Index names touched by either side.
    pub fn names(&self) -> BTreeSet<&str> {
        self.added
            .keys()
            .chain(self.removed.keys())
            .map(String::as_str)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Bucket operations over one index document.
#[derive(Debug, Clone)]
pub struct IndexDocument {
    handle: DocHandle,
}

impl IndexDocument {
    pub fn new(handle: DocHandle) -> Self {
        Self { handle }
    }

    pub fn id(&self) -> DocumentId {
        self.handle.id()
    }

    pub fn handle(&self) -> &DocHandle {
        &self.handle
    }

    /// Add `row` to `bucket`; returns whether the document changed.
    pub fn insert(&self, bucket: &str, row: DocumentId) -> bool {
        self.handle.change(|doc| {
            insert_member(doc, bucket, row);
        })
    }

    /// Remove `row` from `bucket`, dropping the bucket once it is empty.
    pub fn remove(&self, bucket: &str, row: DocumentId) -> bool {
        self.handle.change(|doc| {
            remove_member(doc, bucket, row);
        })
    }

    /// Insert many memberships in one mutation.
    pub fn insert_all(&self, entries: &[(String, DocumentId)]) -> bool {
        self.handle.change(|doc| {
            for (bucket, row) in entries {
                insert_member(doc, bucket, *row);
            }
        })
    }

    /// Row ids in `bucket`, in id order.
    pub fn bucket(&self, bucket: &str) -> Vec<DocumentId> {
        self.handle
            .get(bucket)
            .map(|members| parse_members(bucket, &members))
            .unwrap_or_default()
    }

    /// Every bucket with its members.
    pub fn buckets(&self) -> BTreeMap<String, Vec<DocumentId>> {
        self.handle
            .value()
            .iter()
            .map(|(bucket, members)| (bucket.clone(), parse_members(bucket, members)))
            .collect()
    }
}

fn insert_member(doc: &mut Map<String, Value>, bucket: &str, row: DocumentId) {
    let members = doc
        .entry(bucket.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !members.is_object() {
        *members = Value::Object(Map::new());
    }
    if let Value::Object(members) = members {
        members.insert(row.to_string(), Value::Bool(true));
    }
}

fn remove_member(doc: &mut Map<String, Value>, bucket: &str, row: DocumentId) {
    let emptied = match doc.get_mut(bucket) {
        Some(Value::Object(members)) => {
            members.remove(&row.to_string());
            members.is_empty()
        }
        Some(_) => true,
        None => false,
    };
    if emptied {
        doc.remove(bucket);
    }
}

fn parse_members(bucket: &str, members: &Value) -> Vec<DocumentId> {
    let Value::Object(members) = members else {
        log::warn!("Index bucket {bucket} is not a set of row ids");
        return Vec::new();
    };
    members
        .keys()
        .filter_map(|id| match id.parse() {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("Skipping malformed row id {id} in bucket {bucket}: {e}");
                None
            }
        })
        .collect()
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
    fn test_single_field_key() {
        let key = IndexKey::from("uri");
        assert_eq!(
            key.key_for_row(&obj(json!({"uri": "test"}))),
            Some("\"test\"".to_string())
        );
        assert_eq!(key.key_for_row(&obj(json!({"uri": null}))), None);
        assert_eq!(key.key_for_row(&obj(json!({"other": 1}))), None);
    }

    #[test]
    fn test_composite_key_joins_json() {
        let key = IndexKey::from(["author", "year"]);
        let row = obj(json!({"author": "ada", "year": 1843}));
        assert_eq!(key.key_for_row(&row), Some("\"ada\"|1843".to_string()));
        assert_eq!(serialize_key(&json!(["ada", 1843])), "\"ada\"|1843");

        // Any null participant excludes the row
        let partial = obj(json!({"author": "ada", "year": null}));
        assert_eq!(key.key_for_row(&partial), None);
    }

    #[test]
    fn test_serialize_key_scalars_and_empty_array() {
        assert_eq!(serialize_key(&json!("a|b")), "\"a|b\"");
        assert_eq!(serialize_key(&json!(true)), "true");
        assert_eq!(serialize_key(&json!([])), "[]");
        assert_eq!(serialize_key(&json!({"a": 1})), "{\"a\":1}");
    }

    #[test]
    fn test_integral_float_encodes_like_integer() {
        assert_eq!(encode_value(&json!(1.0)), "1");
        assert_eq!(encode_value(&json!(-0.0)), "0");
        assert_eq!(encode_value(&json!(2.5)), "2.5");
        assert_eq!(encode_value(&json!(1)), encode_value(&json!(1.0)));
    }

    #[test]
    fn test_index_key_serde_shape() {
        assert_eq!(serde_json::to_value(IndexKey::from("uri")).unwrap(), json!("uri"));
        assert_eq!(
            serde_json::to_value(IndexKey::from(["a", "b"])).unwrap(),
            json!(["a", "b"])
        );

        let descriptor = IndexDescriptor {
            key: IndexKey::from("uri"),
            index_document_id: None,
        };
        assert_eq!(
            serde_json::to_value(&descriptor).unwrap(),
            json!({"key": "uri", "indexDocumentId": null})
        );
        let parsed: IndexDescriptor =
            serde_json::from_value(json!({"key": ["a", "b"], "indexDocumentId": null})).unwrap();
        assert_eq!(parsed.key, IndexKey::from(["a", "b"]));
    }

    #[test]
    fn test_key_changes() {
        let before: RowKeys = [("uri".to_string(), "\"a\"".to_string())].into();
        let after: RowKeys = [
            ("uri".to_string(), "\"b\"".to_string()),
            ("tag".to_string(), "\"x\"".to_string()),
        ]
        .into();

        let changes = KeyChanges::between(&before, &after);
        assert_eq!(changes.removed.get("uri").map(String::as_str), Some("\"a\""));
        assert_eq!(changes.added.get("uri").map(String::as_str), Some("\"b\""));
        assert_eq!(changes.added.get("tag").map(String::as_str), Some("\"x\""));
        assert_eq!(changes.names().into_iter().collect::<Vec<_>>(), vec!["tag", "uri"]);

        assert!(KeyChanges::between(&after, &after).is_empty());
    }

    #[tokio::test]
    async fn test_bucket_insert_remove_drops_empty() {
        let repo = crate::repo::Repo::in_memory();
        let index = IndexDocument::new(repo.create(Map::new()).await);
        let a = DocumentId::new();
        let b = DocumentId::new();

        assert!(index.insert("\"x\"", a));
        assert!(index.insert("\"x\"", b));
        assert!(!index.insert("\"x\"", a));
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(index.bucket("\"x\""), expected);

        assert!(index.remove("\"x\"", a));
        assert_eq!(index.bucket("\"x\""), vec![b]);
        assert!(index.remove("\"x\"", b));
        assert!(index.buckets().is_empty());
        assert!(!index.remove("\"x\"", b));
    }
}
