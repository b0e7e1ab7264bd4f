//! The realtime document store capability.
//!
//! Everything the rest of the workspace knows about persistence goes through
//! [`RealtimeStore`]: document reads and writes, append-only collections,
//! one-shot queries and push subscriptions. Subscriptions are plain
//! [`Stream`](futures::Stream)s; dropping one unsubscribes.

use std::cmp::Ordering;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::path::{CollectionPath, DocPath};

/// Field map of a single document.
pub type Fields = serde_json::Map<String, Value>;

/// Stream of full-document snapshots. `None` means the document is absent.
pub type DocStream = BoxStream<'static, Option<Document>>;

/// Stream of query result snapshots.
pub type QueryStream = BoxStream<'static, QuerySnapshot>;

#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>>;

    /// Write a document. With `merge`, fields are added or overwritten and
    /// fields not mentioned are kept; without it the document is replaced.
    async fn set(&self, path: &DocPath, fields: Fields, merge: bool) -> Result<()>;

    /// Write a document that must not exist yet. Fails with
    /// [`StoreError::AlreadyExists`] otherwise; the check and the write are
    /// one atomic step.
    async fn create(&self, path: &DocPath, fields: Fields) -> Result<()>;

    /// Apply a partial update. Fails with [`StoreError::NotFound`] when the
    /// document does not exist, so it never recreates a deleted document.
    async fn update(&self, path: &DocPath, patch: Patch) -> Result<()>;

    /// Delete a document. Deleting an absent document is not an error.
    async fn delete(&self, path: &DocPath) -> Result<()>;

    /// Append a document with a store-generated id and return the id.
    async fn append(&self, collection: &CollectionPath, fields: Fields) -> Result<String>;

    async fn query(&self, query: &Query) -> Result<Vec<Document>>;

    /// Subscribe to one document. The current state is delivered first,
    /// then one snapshot per applied write, in write order.
    async fn subscribe_doc(&self, path: &DocPath) -> Result<DocStream>;

    /// Subscribe to a query. The first snapshot reports every current match
    /// as [`ChangeKind::Added`].
    async fn subscribe_query(&self, query: &Query) -> Result<QueryStream>;
}

// ---------------------------------------------------------------------------
// Documents
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub path: DocPath,
    pub fields: Fields,
}

impl Document {
    pub fn id(&self) -> &str {
        self.path.id()
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Deserialize the field map into a typed record.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(Value::Object(self.fields.clone()))?)
    }
}

/// Serialize a record into a field map. The record must serialize to a JSON
/// object.
pub fn to_fields<T: Serialize>(value: &T) -> Result<Fields> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::Serialization(format!(
            "expected an object, got {other}"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Partial updates
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum FieldUpdate {
    Set(Value),
    /// Append each value not already present in the array field.
    ArrayUnion(Vec<Value>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Patch {
    ops: Vec<(String, FieldUpdate)>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.ops
            .push((field.to_string(), FieldUpdate::Set(value.into())));
        self
    }

    pub fn array_union(mut self, field: &str, values: Vec<Value>) -> Self {
        self.ops
            .push((field.to_string(), FieldUpdate::ArrayUnion(values)));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn apply(&self, fields: &mut Fields) {
        for (field, op) in &self.ops {
            match op {
                FieldUpdate::Set(value) => {
                    fields.insert(field.clone(), value.clone());
                }
                FieldUpdate::ArrayUnion(values) => {
                    let entry = fields
                        .entry(field.clone())
                        .or_insert_with(|| Value::Array(Vec::new()));
                    if !entry.is_array() {
                        *entry = Value::Array(Vec::new());
                    }
                    if let Value::Array(items) = entry {
                        for value in values {
                            if !items.contains(value) {
                                items.push(value.clone());
                            }
                        }
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Queries
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

/// Equality filters plus ordering over one collection. Documents comparing
/// equal on every ordering field are ordered by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: CollectionPath,
    pub filters: Vec<Filter>,
    pub order_by: Vec<OrderBy>,
}

impl Query {
    pub fn new(collection: CollectionPath) -> Self {
        Self {
            collection,
            filters: Vec::new(),
            order_by: Vec::new(),
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn order_by(mut self, field: &str, direction: Direction) -> Self {
        self.order_by.push(OrderBy {
            field: field.to_string(),
            direction,
        });
        self
    }

    pub fn matches(&self, doc: &Document) -> bool {
        doc.path.parent() == self.collection
            && self
                .filters
                .iter()
                .all(|f| doc.fields.get(&f.field) == Some(&f.value))
    }

    pub fn sort(&self, docs: &mut [Document]) {
        docs.sort_by(|a, b| {
            for order in &self.order_by {
                let ord = compare_values(a.get(&order.field), b.get(&order.field));
                let ord = match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.id().cmp(b.id())
        });
    }
}

/// Total order over JSON values: absent/null < bool < number < string.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    fn rank(v: Option<&Value>) -> u8 {
        match v {
            None | Some(Value::Null) => 0,
            Some(Value::Bool(_)) => 1,
            Some(Value::Number(_)) => 2,
            Some(Value::String(_)) => 3,
            Some(Value::Array(_)) => 4,
            Some(Value::Object(_)) => 5,
        }
    }

    match (a, b) {
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            match (x.as_i64(), y.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = x.as_f64().unwrap_or(0.0);
                    let y = y.as_f64().unwrap_or(0.0);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

// ---------------------------------------------------------------------------
// Query snapshots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub kind: ChangeKind,
    pub document: Document,
}

/// Full ordered result set plus what changed since the previous delivery to
/// the same subscriber.
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySnapshot {
    pub documents: Vec<Document>,
    pub changes: Vec<DocumentChange>,
}

impl QuerySnapshot {
    /// Compute the changes between two ordered result sets.
    pub fn diff(previous: &[Document], current: Vec<Document>) -> Self {
        let mut changes = Vec::new();

        for doc in &current {
            match previous.iter().find(|p| p.path == doc.path) {
                None => changes.push(DocumentChange {
                    kind: ChangeKind::Added,
                    document: doc.clone(),
                }),
                Some(prev) if prev.fields != doc.fields => changes.push(DocumentChange {
                    kind: ChangeKind::Modified,
                    document: doc.clone(),
                }),
                Some(_) => {}
            }
        }

        for prev in previous {
            if !current.iter().any(|d| d.path == prev.path) {
                changes.push(DocumentChange {
                    kind: ChangeKind::Removed,
                    document: prev.clone(),
                });
            }
        }

        Self {
            documents: current,
            changes,
        }
    }

    pub fn added(&self) -> impl Iterator<Item = &Document> {
        self.changes
            .iter()
            .filter(|c| c.kind == ChangeKind::Added)
            .map(|c| &c.document)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(path: &str, fields: Value) -> Document {
        Document {
            path: DocPath::parse(path).unwrap(),
            fields: fields.as_object().cloned().unwrap_or_default(),
        }
    }

    #[test]
    fn test_array_union_skips_existing_values() {
        let mut fields = json!({ "hiddenFor": ["alice"] })
            .as_object()
            .cloned()
            .unwrap();

        Patch::new()
            .array_union("hiddenFor", vec![json!("alice"), json!("bob")])
            .apply(&mut fields);

        assert_eq!(fields["hiddenFor"], json!(["alice", "bob"]));
    }

    #[test]
    fn test_query_orders_ties_by_id() {
        let query = Query::new(CollectionPath::parse("chats/x/messages").unwrap())
            .order_by("createdAt", Direction::Ascending);

        let mut docs = vec![
            doc("chats/x/messages/b", json!({ "createdAt": 10 })),
            doc("chats/x/messages/c", json!({ "createdAt": 5 })),
            doc("chats/x/messages/a", json!({ "createdAt": 10 })),
        ];
        query.sort(&mut docs);

        let ids: Vec<_> = docs.iter().map(|d| d.id().to_string()).collect();
        assert_eq!(ids, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_query_filters_by_collection_and_fields() {
        let query = Query::new(CollectionPath::parse("chats/x/messages").unwrap())
            .where_eq("seen", true);

        assert!(query.matches(&doc("chats/x/messages/a", json!({ "seen": true }))));
        assert!(!query.matches(&doc("chats/x/messages/a", json!({ "seen": false }))));
        assert!(!query.matches(&doc("chats/y/messages/a", json!({ "seen": true }))));
    }

    #[test]
    fn test_diff_reports_each_kind() {
        let before = vec![
            doc("c/a", json!({ "v": 1 })),
            doc("c/b", json!({ "v": 1 })),
        ];
        let after = vec![doc("c/a", json!({ "v": 2 })), doc("c/c", json!({ "v": 1 }))];

        let snapshot = QuerySnapshot::diff(&before, after);
        let kinds: Vec<_> = snapshot
            .changes
            .iter()
            .map(|c| (c.document.id().to_string(), c.kind))
            .collect();

        assert_eq!(
            kinds,
            vec![
                ("a".to_string(), ChangeKind::Modified),
                ("c".to_string(), ChangeKind::Added),
                ("b".to_string(), ChangeKind::Removed),
            ]
        );
    }
}
