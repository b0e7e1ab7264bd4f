//! In-process [`RealtimeStore`] backend.
//!
//! [`MemoryStore`] keeps every document in one ordered map behind a single
//! lock. Every write is applied and fanned out to subscribers while the lock
//! is held, so each subscriber observes writes in the order they were
//! applied. Two sessions sharing one `Arc<MemoryStore>` behave like two
//! devices connected to the same backend.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use futures::channel::mpsc::{unbounded, UnboundedSender};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::path::{CollectionPath, DocPath};
use crate::store::{
    DocStream, Document, Fields, Patch, Query, QuerySnapshot, QueryStream, RealtimeStore,
};

struct DocWatcher {
    path: DocPath,
    tx: UnboundedSender<Option<Document>>,
}

struct QueryWatcher {
    query: Query,
    last: Vec<Document>,
    tx: UnboundedSender<QuerySnapshot>,
}

struct Inner {
    docs: BTreeMap<DocPath, Fields>,
    sequences: HashMap<CollectionPath, u64>,
    doc_watchers: Vec<DocWatcher>,
    query_watchers: Vec<QueryWatcher>,
    available: bool,
}

pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                docs: BTreeMap::new(),
                sequences: HashMap::new(),
                doc_watchers: Vec::new(),
                query_watchers: Vec::new(),
                available: true,
            }),
        }
    }

    /// Simulate losing (or regaining) the backend. While unavailable every
    /// operation fails with [`StoreError::Unavailable`].
    pub async fn set_available(&self, available: bool) {
        let mut inner = self.inner.lock().await;
        inner.available = available;
        debug!(available, "memory store availability changed");
    }

    /// Number of live subscriptions. Closed subscriptions are pruned first.
    pub async fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock().await;
        inner.doc_watchers.retain(|w| !w.tx.is_closed());
        inner.query_watchers.retain(|w| !w.tx.is_closed());
        inner.doc_watchers.len() + inner.query_watchers.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Inner {
    fn check(&self) -> Result<()> {
        if self.available {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".into()))
        }
    }

    fn document(&self, path: &DocPath) -> Option<Document> {
        self.docs.get(path).map(|fields| Document {
            path: path.clone(),
            fields: fields.clone(),
        })
    }

    fn run_query(&self, query: &Query) -> Vec<Document> {
        let mut docs: Vec<Document> = self
            .docs
            .iter()
            .map(|(path, fields)| Document {
                path: path.clone(),
                fields: fields.clone(),
            })
            .filter(|doc| query.matches(doc))
            .collect();
        query.sort(&mut docs);
        docs
    }

    fn next_id(&mut self, collection: &CollectionPath) -> String {
        let seq = self.sequences.entry(collection.clone()).or_insert(0);
        *seq += 1;
        let suffix = Uuid::new_v4().simple().to_string();
        format!("{:08x}{}", *seq, &suffix[..12])
    }

    /// Push the new state of `path` to every interested subscriber.
    fn notify(&mut self, path: &DocPath) {
        let current = self.document(path);
        self.doc_watchers.retain(|w| {
            if w.path == *path {
                w.tx.unbounded_send(current.clone()).is_ok()
            } else {
                !w.tx.is_closed()
            }
        });

        let parent = path.parent();
        let mut watchers = std::mem::take(&mut self.query_watchers);
        watchers.retain_mut(|w| {
            if w.query.collection != parent {
                return !w.tx.is_closed();
            }
            let snapshot = QuerySnapshot::diff(&w.last, self.run_query(&w.query));
            if snapshot.changes.is_empty() {
                return !w.tx.is_closed();
            }
            w.last = snapshot.documents.clone();
            w.tx.unbounded_send(snapshot).is_ok()
        });
        self.query_watchers = watchers;

        trace!(path = %path, "notified subscribers");
    }
}

#[async_trait]
impl RealtimeStore for MemoryStore {
    async fn get(&self, path: &DocPath) -> Result<Option<Document>> {
        let inner = self.inner.lock().await;
        inner.check()?;
        Ok(inner.document(path))
    }

    async fn set(&self, path: &DocPath, fields: Fields, merge: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check()?;

        match inner.docs.get_mut(path) {
            Some(existing) if merge => existing.extend(fields),
            _ => {
                inner.docs.insert(path.clone(), fields);
            }
        }

        debug!(path = %path, merge, "set document");
        inner.notify(path);
        Ok(())
    }

    async fn create(&self, path: &DocPath, fields: Fields) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check()?;

        if inner.docs.contains_key(path) {
            return Err(StoreError::AlreadyExists(path.to_string()));
        }
        inner.docs.insert(path.clone(), fields);

        debug!(path = %path, "created document");
        inner.notify(path);
        Ok(())
    }

    async fn update(&self, path: &DocPath, patch: Patch) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check()?;

        let existing = inner
            .docs
            .get_mut(path)
            .ok_or_else(|| StoreError::NotFound(path.to_string()))?;
        patch.apply(existing);

        debug!(path = %path, "updated document");
        inner.notify(path);
        Ok(())
    }

    async fn delete(&self, path: &DocPath) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.check()?;

        if inner.docs.remove(path).is_some() {
            debug!(path = %path, "deleted document");
            inner.notify(path);
        }
        Ok(())
    }

    async fn append(&self, collection: &CollectionPath, fields: Fields) -> Result<String> {
        let mut inner = self.inner.lock().await;
        inner.check()?;

        let id = inner.next_id(collection);
        let path = collection.doc(&id);
        inner.docs.insert(path.clone(), fields);

        debug!(path = %path, "appended document");
        inner.notify(&path);
        Ok(id)
    }

    async fn query(&self, query: &Query) -> Result<Vec<Document>> {
        let inner = self.inner.lock().await;
        inner.check()?;
        Ok(inner.run_query(query))
    }

    async fn subscribe_doc(&self, path: &DocPath) -> Result<DocStream> {
        let mut inner = self.inner.lock().await;
        inner.check()?;

        let (tx, rx) = unbounded();
        // The receiver is held locally, so the initial send cannot fail.
        let _ = tx.unbounded_send(inner.document(path));
        inner.doc_watchers.push(DocWatcher {
            path: path.clone(),
            tx,
        });

        debug!(path = %path, "document subscription opened");
        Ok(rx.boxed())
    }

    async fn subscribe_query(&self, query: &Query) -> Result<QueryStream> {
        let mut inner = self.inner.lock().await;
        inner.check()?;

        let (tx, rx) = unbounded();
        let initial = QuerySnapshot::diff(&[], inner.run_query(query));
        let last = initial.documents.clone();
        let _ = tx.unbounded_send(initial);
        inner.query_watchers.push(QueryWatcher {
            query: query.clone(),
            last,
            tx,
        });

        debug!(collection = %query.collection, "query subscription opened");
        Ok(rx.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ChangeKind, Direction};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        value.as_object().cloned().unwrap_or_default()
    }

    fn messages() -> CollectionPath {
        CollectionPath::parse("chats/x/messages").unwrap()
    }

    #[tokio::test]
    async fn test_merge_keeps_other_fields() {
        let store = MemoryStore::new();
        let path = DocPath::parse("chats/x").unwrap();

        store
            .set(&path, fields(json!({ "disappearingMode": "24h" })), true)
            .await
            .unwrap();
        store
            .set(&path, fields(json!({ "wallpaperUrl": "u" })), true)
            .await
            .unwrap();

        let doc = store.get(&path).await.unwrap().unwrap();
        assert_eq!(doc.fields["disappearingMode"], "24h");
        assert_eq!(doc.fields["wallpaperUrl"], "u");

        store
            .set(&path, fields(json!({ "wallpaperUrl": "v" })), false)
            .await
            .unwrap();
        let doc = store.get(&path).await.unwrap().unwrap();
        assert!(doc.get("disappearingMode").is_none());
    }

    #[tokio::test]
    async fn test_update_missing_document_fails() {
        let store = MemoryStore::new();
        let path = messages().doc("gone");

        let err = store
            .update(&path, Patch::new().set("seen", true))
            .await
            .unwrap_err();
        assert!(err.is_expected_teardown());
        assert!(store.get(&path).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_refuses_existing_document() {
        let store = MemoryStore::new();
        let path = DocPath::parse("chats/x/call/signaling").unwrap();

        store.create(&path, fields(json!({ "offer": 1 }))).await.unwrap();
        let err = store
            .create(&path, fields(json!({ "offer": 2 })))
            .await
            .unwrap_err();
        assert_eq!(err, StoreError::AlreadyExists(path.to_string()));
        assert_eq!(store.get(&path).await.unwrap().unwrap().fields["offer"], 1);

        store.delete(&path).await.unwrap();
        store.create(&path, fields(json!({ "offer": 3 }))).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let store = MemoryStore::new();
        let path = DocPath::parse("chats/x/call/signaling").unwrap();
        store.delete(&path).await.unwrap();
        store.delete(&path).await.unwrap();
    }

    #[tokio::test]
    async fn test_appended_ids_are_monotonic() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for i in 0..20 {
            ids.push(store.append(&messages(), fields(json!({ "n": i }))).await.unwrap());
        }

        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn test_doc_subscription_sees_writes_in_order() {
        let store = MemoryStore::new();
        let path = DocPath::parse("chats/x/call/signaling").unwrap();
        let mut stream = store.subscribe_doc(&path).await.unwrap();

        assert_eq!(stream.next().await, Some(None));

        store.set(&path, fields(json!({ "offer": 1 })), false).await.unwrap();
        store.set(&path, fields(json!({ "answer": 2 })), true).await.unwrap();
        store.delete(&path).await.unwrap();

        let first = stream.next().await.unwrap().unwrap();
        assert!(first.get("answer").is_none());
        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.fields["answer"], 2);
        assert_eq!(stream.next().await, Some(None));
    }

    #[tokio::test]
    async fn test_query_subscription_reports_changes() {
        let store = MemoryStore::new();
        let first = store.append(&messages(), fields(json!({ "t": 1 }))).await.unwrap();

        let query = Query::new(messages()).order_by("t", Direction::Ascending);
        let mut stream = store.subscribe_query(&query).await.unwrap();

        let initial = stream.next().await.unwrap();
        assert_eq!(initial.added().count(), 1);

        store.append(&messages(), fields(json!({ "t": 2 }))).await.unwrap();
        let next = stream.next().await.unwrap();
        assert_eq!(next.documents.len(), 2);
        assert_eq!(next.changes.len(), 1);
        assert_eq!(next.changes[0].kind, ChangeKind::Added);

        store.delete(&messages().doc(&first)).await.unwrap();
        let next = stream.next().await.unwrap();
        assert_eq!(next.changes[0].kind, ChangeKind::Removed);
    }

    #[tokio::test]
    async fn test_dropping_stream_unsubscribes() {
        let store = MemoryStore::new();
        let path = DocPath::parse("chats/x").unwrap();

        let stream = store.subscribe_doc(&path).await.unwrap();
        assert_eq!(store.subscriber_count().await, 1);

        drop(stream);
        store.set(&path, Fields::new(), false).await.unwrap();
        assert_eq!(store.subscriber_count().await, 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_rejects_operations() {
        let store = MemoryStore::new();
        store.set_available(false).await;

        let err = store.get(&DocPath::parse("chats/x").unwrap()).await.unwrap_err();
        assert!(err.is_unavailable());

        store.set_available(true).await;
        assert!(store.get(&DocPath::parse("chats/x").unwrap()).await.is_ok());
    }
}
