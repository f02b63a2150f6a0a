//! Document store abstraction and the in-memory store
//!
//! A store holds JSON documents addressed by collection and key, each with
//! append-only sub-collections. Every read side is a [`Watch`]: the current
//! state is delivered first, then one snapshot per change, in write order.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};

use log::{debug, trace};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A stored JSON object
pub type Document = serde_json::Map<String, Value>;

/// Write guard: the stored value of `field` must equal one of `one_of`.
///
/// A missing field compares as `null`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precondition {
    pub field: String,
    pub one_of: Vec<Value>,
}

impl Precondition {
    pub fn one_of(field: impl Into<String>, values: impl IntoIterator<Item = Value>) -> Self {
        Self { field: field.into(), one_of: values.into_iter().collect() }
    }

    /// The field must be missing or `null`
    pub fn absent(field: impl Into<String>) -> Self {
        Self::one_of(field, [Value::Null])
    }

    pub fn holds(&self, document: &Document) -> bool {
        let value = document.get(&self.field).unwrap_or(&Value::Null);
        self.one_of.contains(value)
    }
}

/// Selects the document of a collection with the greatest `order_by` value
/// among those matching every filter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatestQuery {
    pub collection: String,
    pub filters: Vec<(String, Value)>,
    pub order_by: String,
}

impl LatestQuery {
    pub fn new(collection: impl Into<String>, order_by: impl Into<String>) -> Self {
        Self { collection: collection.into(), filters: vec![], order_by: order_by.into() }
    }

    /// Require `field` to equal `value`
    pub fn filter(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.push((field.into(), value.into()));
        self
    }

    pub fn matches(&self, document: &Document) -> bool {
        self.filters
            .iter()
            .all(|(field, value)| document.get(field).unwrap_or(&Value::Null) == value)
    }

    fn order_key(&self, document: &Document) -> OrderKey {
        match document.get(&self.order_by) {
            Some(Value::Number(n)) => OrderKey::Number(n.as_f64().unwrap_or_default()),
            Some(Value::String(s)) => OrderKey::Text(s.clone()),
            _ => OrderKey::Missing,
        }
    }
}

#[derive(Debug, PartialEq, PartialOrd)]
enum OrderKey {
    Missing,
    Number(f64),
    Text(String),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("document {collection}/{key} not found")]
    NotFound { collection: String, key: String },
    #[error("document {collection}/{key} already exists")]
    AlreadyExists { collection: String, key: String },
    /// A write guard did not hold. Carries the stored document.
    #[error("write precondition failed")]
    PreconditionFailed { current: Document },
    #[error("invalid document ({0})")]
    InvalidDocument(String),
    #[error("store unavailable ({0})")]
    Unavailable(String),
}

impl StoreError {
    fn not_found(collection: &str, key: &str) -> Self {
        Self::NotFound { collection: collection.to_string(), key: key.to_string() }
    }
}

/// Stops a watch. Cancelling, or dropping, closes the watch channel.
pub struct WatchCancel(Option<Box<dyn FnOnce() + Send + Sync>>);

impl WatchCancel {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self(Some(Box::new(cancel)))
    }

    pub fn noop() -> Self {
        Self(None)
    }

    pub fn cancel(mut self) {
        if let Some(cancel) = self.0.take() {
            cancel()
        }
    }
}

impl Drop for WatchCancel {
    fn drop(&mut self) {
        if let Some(cancel) = self.0.take() {
            cancel()
        }
    }
}

impl fmt::Debug for WatchCancel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WatchCancel").field(&self.0.is_some()).finish()
    }
}

/// A live subscription: snapshots arrive on the channel until cancelled
#[derive(Debug)]
pub struct Watch<T> {
    rx: flume::Receiver<T>,
    cancel: WatchCancel,
}

impl<T> Watch<T> {
    pub fn new(rx: flume::Receiver<T>, cancel: WatchCancel) -> Self {
        Self { rx, cancel }
    }

    /// Next snapshot. `None` once the watch is cancelled or the store is gone.
    pub async fn recv(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn into_parts(self) -> (flume::Receiver<T>, WatchCancel) {
        (self.rx, self.cancel)
    }

    pub fn cancel(self) {
        self.cancel.cancel()
    }
}

/// A shared document store.
///
/// `merge` is atomic with respect to its preconditions: the guards are
/// evaluated and the fields written under one lock, or not at all.
#[trait_variant::make(SignallingStore: Send)]
pub trait LocalSignallingStore: Send + Sync {
    /// Create a document. Fails if the key is taken.
    async fn create(&self, collection: &str, key: &str, document: Document) -> Result<(), StoreError>;

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError>;

    /// Merge `fields` into an existing document, returning the merged document
    async fn merge(
        &self,
        collection: &str,
        key: &str,
        fields: Document,
        preconditions: Vec<Precondition>,
    ) -> Result<Document, StoreError>;

    /// Watch one document. `None` while it does not exist.
    async fn watch(&self, collection: &str, key: &str) -> Result<Watch<Option<Document>>, StoreError>;

    /// Append an item to a sub-collection of a document
    async fn append(&self, collection: &str, key: &str, sub: &str, item: Document) -> Result<(), StoreError>;

    /// Watch a sub-collection: existing items first, then each appended item
    async fn watch_appended(&self, collection: &str, key: &str, sub: &str) -> Result<Watch<Document>, StoreError>;

    /// Watch the result of a [`LatestQuery`], as `(key, document)`.
    ///
    /// A snapshot is delivered whenever the result changes.
    async fn watch_latest(&self, query: LatestQuery) -> Result<Watch<Option<(String, Document)>>, StoreError>;
}

type DocKey = (String, String);

#[derive(Default)]
struct SubCollection {
    items: Vec<Document>,
    watchers: HashMap<u64, flume::Sender<Document>>,
}

#[derive(Default)]
struct DocEntry {
    document: Option<Document>,
    watchers: HashMap<u64, flume::Sender<Option<Document>>>,
    subs: HashMap<String, SubCollection>,
}

impl SubCollection {
    fn is_empty(&self) -> bool {
        self.items.is_empty() && self.watchers.is_empty()
    }
}

impl DocEntry {
    /// Nothing stored and nobody listening, so the entry can go
    fn is_empty(&self) -> bool {
        self.document.is_none() && self.watchers.is_empty() && self.subs.values().all(SubCollection::is_empty)
    }
}

struct QueryWatch {
    query: LatestQuery,
    tx: flume::Sender<Option<(String, Document)>>,
    last: Option<(String, Document)>,
}

#[derive(Default)]
struct StoreInner {
    docs: HashMap<DocKey, DocEntry>,
    queries: HashMap<u64, QueryWatch>,
}

impl StoreInner {
    fn latest(&self, query: &LatestQuery) -> Option<(String, Document)> {
        self.docs
            .iter()
            .filter(|((collection, _), _)| collection == &query.collection)
            .filter_map(|((_, key), entry)| entry.document.as_ref().map(|doc| (key, doc)))
            .filter(|(_, doc)| query.matches(doc))
            .max_by(|(a_key, a), (b_key, b)| {
                query
                    .order_key(a)
                    .partial_cmp(&query.order_key(b))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a_key.cmp(b_key))
            })
            .map(|(key, doc)| (key.clone(), doc.clone()))
    }

    fn document_changed(&mut self, doc_key: &DocKey) {
        if let Some(entry) = self.docs.get_mut(doc_key) {
            let snapshot = entry.document.clone();
            entry.watchers.retain(|_, tx| tx.send(snapshot.clone()).is_ok());
        }
        let results: Vec<_> = self
            .queries
            .iter()
            .filter(|(_, watch)| watch.query.collection == doc_key.0)
            .map(|(id, watch)| (*id, self.latest(&watch.query)))
            .collect();
        for (id, result) in results {
            let Some(watch) = self.queries.get_mut(&id) else { continue };
            if watch.last == result {
                continue;
            }
            watch.last = result.clone();
            if watch.tx.send(result).is_err() {
                self.queries.remove(&id);
            }
        }
    }

    fn watcher_count(&self) -> usize {
        let doc_watchers: usize = self
            .docs
            .values()
            .map(|entry| {
                entry.watchers.len() + entry.subs.values().map(|sub| sub.watchers.len()).sum::<usize>()
            })
            .sum();
        doc_watchers + self.queries.len()
    }
}

/// Process-local [`SignallingStore`].
///
/// Clones share the same documents.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
    next_watch: Arc<AtomicU64>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of watches currently registered
    pub fn live_watches(&self) -> usize {
        self.inner.lock().watcher_count()
    }

    fn watch_id(&self) -> u64 {
        self.next_watch.fetch_add(1, Ordering::Relaxed)
    }

    fn cancel_with(&self, remove: impl FnOnce(&mut StoreInner) + Send + Sync + 'static) -> WatchCancel {
        let inner: Weak<Mutex<StoreInner>> = Arc::downgrade(&self.inner);
        WatchCancel::new(move || {
            if let Some(inner) = inner.upgrade() {
                remove(&mut *inner.lock());
            }
        })
    }
}

impl fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MemoryStore")
            .field("documents", &inner.docs.values().filter(|e| e.document.is_some()).count())
            .field("watches", &inner.watcher_count())
            .finish()
    }
}

impl SignallingStore for MemoryStore {
    async fn create(&self, collection: &str, key: &str, document: Document) -> Result<(), StoreError> {
        let doc_key = (collection.to_string(), key.to_string());
        let mut inner = self.inner.lock();
        let entry = inner.docs.entry(doc_key.clone()).or_default();
        if entry.document.is_some() {
            return Err(StoreError::AlreadyExists {
                collection: collection.to_string(),
                key: key.to_string(),
            });
        }
        entry.document = Some(document);
        trace!("created {collection}/{key}");
        inner.document_changed(&doc_key);
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .docs
            .get(&(collection.to_string(), key.to_string()))
            .and_then(|entry| entry.document.clone()))
    }

    async fn merge(
        &self,
        collection: &str,
        key: &str,
        fields: Document,
        preconditions: Vec<Precondition>,
    ) -> Result<Document, StoreError> {
        let doc_key = (collection.to_string(), key.to_string());
        let mut inner = self.inner.lock();
        let document = inner
            .docs
            .get_mut(&doc_key)
            .and_then(|entry| entry.document.as_mut())
            .ok_or_else(|| StoreError::not_found(collection, key))?;
        if !preconditions.iter().all(|p| p.holds(document)) {
            debug!("rejected write to {collection}/{key}, precondition failed");
            return Err(StoreError::PreconditionFailed { current: document.clone() });
        }
        document.extend(fields);
        let merged = document.clone();
        trace!("merged {collection}/{key}");
        inner.document_changed(&doc_key);
        Ok(merged)
    }

    async fn watch(&self, collection: &str, key: &str) -> Result<Watch<Option<Document>>, StoreError> {
        let doc_key = (collection.to_string(), key.to_string());
        let id = self.watch_id();
        let (tx, rx) = flume::unbounded();
        {
            let mut inner = self.inner.lock();
            let entry = inner.docs.entry(doc_key.clone()).or_default();
            // initial snapshot, before any later change can be sent
            let _ = tx.send(entry.document.clone());
            entry.watchers.insert(id, tx);
        }
        let cancel = self.cancel_with(move |inner| {
            if let Some(entry) = inner.docs.get_mut(&doc_key) {
                entry.watchers.remove(&id);
                if entry.is_empty() {
                    inner.docs.remove(&doc_key);
                }
            }
        });
        Ok(Watch::new(rx, cancel))
    }

    async fn append(&self, collection: &str, key: &str, sub: &str, item: Document) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let sub_collection = inner
            .docs
            .entry((collection.to_string(), key.to_string()))
            .or_default()
            .subs
            .entry(sub.to_string())
            .or_default();
        sub_collection.watchers.retain(|_, tx| tx.send(item.clone()).is_ok());
        sub_collection.items.push(item);
        trace!("appended to {collection}/{key}/{sub}");
        Ok(())
    }

    async fn watch_appended(&self, collection: &str, key: &str, sub: &str) -> Result<Watch<Document>, StoreError> {
        let doc_key = (collection.to_string(), key.to_string());
        let sub = sub.to_string();
        let id = self.watch_id();
        let (tx, rx) = flume::unbounded();
        {
            let mut inner = self.inner.lock();
            let sub_collection = inner
                .docs
                .entry(doc_key.clone())
                .or_default()
                .subs
                .entry(sub.clone())
                .or_default();
            for item in &sub_collection.items {
                let _ = tx.send(item.clone());
            }
            sub_collection.watchers.insert(id, tx);
        }
        let cancel = self.cancel_with(move |inner| {
            let Some(entry) = inner.docs.get_mut(&doc_key) else { return };
            if let Some(sub_collection) = entry.subs.get_mut(&sub) {
                sub_collection.watchers.remove(&id);
                if sub_collection.is_empty() {
                    entry.subs.remove(&sub);
                }
            }
            if entry.is_empty() {
                inner.docs.remove(&doc_key);
            }
        });
        Ok(Watch::new(rx, cancel))
    }

    async fn watch_latest(&self, query: LatestQuery) -> Result<Watch<Option<(String, Document)>>, StoreError> {
        let id = self.watch_id();
        let (tx, rx) = flume::unbounded();
        {
            let mut inner = self.inner.lock();
            let last = inner.latest(&query);
            let _ = tx.send(last.clone());
            inner.queries.insert(id, QueryWatch { query, tx, last });
        }
        let cancel = self.cancel_with(move |inner| {
            inner.queries.remove(&id);
        });
        Ok(Watch::new(rx, cancel))
    }
}

/// JSON text form of a document, used on the wire
#[cfg(any(feature = "server", feature = "client"))]
pub(crate) fn encode_document(document: &Document) -> String {
    Value::Object(document.clone()).to_string()
}

#[cfg(any(feature = "server", feature = "client"))]
pub(crate) fn decode_document(json: &str) -> Result<Document, StoreError> {
    match serde_json::from_str(json) {
        Ok(Value::Object(document)) => Ok(document),
        Ok(_) => Err(StoreError::InvalidDocument("not a JSON object".to_string())),
        Err(e) => Err(StoreError::InvalidDocument(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::{Document, LatestQuery, MemoryStore, Precondition, SignallingStore, StoreError, Value};
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(document) => document,
            other => panic!("not an object: {other}"),
        }
    }

    #[tokio::test]
    async fn create_rejects_existing_key() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.create("calls", "c1", doc(json!({ "status": "calling" }))).await?;
        let result = store.create("calls", "c1", doc(json!({}))).await;
        assert!(matches!(result, Err(StoreError::AlreadyExists { .. })));
        assert_eq!(store.get("calls", "c1").await?.unwrap()["status"], "calling");
        assert_eq!(store.get("calls", "c2").await?, None);
        Ok(())
    }

    #[tokio::test]
    async fn merge_checks_preconditions_atomically() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.create("calls", "c1", doc(json!({ "status": "calling" }))).await?;

        let guard = vec![Precondition::one_of("status", [json!("calling")]), Precondition::absent("answer")];
        let merged = store
            .merge("calls", "c1", doc(json!({ "status": "connected", "answer": "a" })), guard.clone())
            .await?;
        assert_eq!(merged["status"], "connected");

        match store.merge("calls", "c1", doc(json!({ "answer": "b" })), guard).await {
            Err(StoreError::PreconditionFailed { current }) => assert_eq!(current["answer"], "a"),
            other => panic!("unexpected merge result {other:?}"),
        }
        let missing = store.merge("calls", "nope", doc(json!({})), vec![]).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn watch_delivers_current_state_then_changes_in_order() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let watch = store.watch("calls", "c1").await?;
        assert_eq!(watch.recv().await, Some(None));

        store.create("calls", "c1", doc(json!({ "n": 0 }))).await?;
        for n in 1..=3 {
            store.merge("calls", "c1", doc(json!({ "n": n })), vec![]).await?;
        }
        for n in 0..=3 {
            assert_eq!(watch.recv().await.flatten().unwrap()["n"], n);
        }
        assert_eq!(store.live_watches(), 1);
        watch.cancel();
        assert_eq!(store.live_watches(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_watch_channel_closes() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let (rx, cancel) = store.watch_appended("calls", "c1", "callerCandidates").await?.into_parts();
        cancel.cancel();
        store.append("calls", "c1", "callerCandidates", doc(json!({ "candidate": "x" }))).await?;
        assert!(rx.recv_async().await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_watches_on_missing_documents_leave_nothing_behind() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let watch = store.watch("calls", "gone").await?;
        let appended = store.watch_appended("calls", "gone", "calleeCandidates").await?;
        assert_eq!(store.inner.lock().docs.len(), 1);
        watch.cancel();
        assert_eq!(store.inner.lock().docs.len(), 1);
        appended.cancel();
        assert!(store.inner.lock().docs.is_empty());

        // entries holding data survive their last watcher
        store.append("calls", "c1", "callerCandidates", doc(json!({ "candidate": "x" }))).await?;
        store.watch("calls", "c1").await?.cancel();
        store.watch_appended("calls", "c1", "callerCandidates").await?.cancel();
        assert_eq!(store.inner.lock().docs.len(), 1);
        assert_eq!(store.watch_appended("calls", "c1", "callerCandidates").await?.recv().await.unwrap()["candidate"], "x");
        Ok(())
    }

    #[tokio::test]
    async fn appended_items_replay_then_stream() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        store.append("calls", "c1", "calleeCandidates", doc(json!({ "i": 0 }))).await?;
        let watch = store.watch_appended("calls", "c1", "calleeCandidates").await?;
        store.append("calls", "c1", "calleeCandidates", doc(json!({ "i": 1 }))).await?;
        // other sub-collections stay separate
        store.append("calls", "c1", "callerCandidates", doc(json!({ "i": 9 }))).await?;
        assert_eq!(watch.recv().await.unwrap()["i"], 0);
        assert_eq!(watch.recv().await.unwrap()["i"], 1);
        assert_eq!(watch.try_recv(), None);
        Ok(())
    }

    #[tokio::test]
    async fn latest_query_tracks_newest_match() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let query = LatestQuery::new("calls", "startedAt")
            .filter("recipientId", "bob")
            .filter("status", "calling");
        let watch = store.watch_latest(query).await?;
        assert_eq!(watch.recv().await, Some(None));

        store.create("calls", "c1", doc(json!({ "recipientId": "bob", "status": "calling", "startedAt": 1 }))).await?;
        assert_eq!(watch.recv().await.flatten().map(|(key, _)| key), Some("c1".to_string()));

        // other recipients do not ring
        store.create("calls", "c0", doc(json!({ "recipientId": "eve", "status": "calling", "startedAt": 5 }))).await?;
        store.create("calls", "c2", doc(json!({ "recipientId": "bob", "status": "calling", "startedAt": 2 }))).await?;
        assert_eq!(watch.recv().await.flatten().map(|(key, _)| key), Some("c2".to_string()));

        store.merge("calls", "c2", doc(json!({ "status": "ended" })), vec![]).await?;
        assert_eq!(watch.recv().await.flatten().map(|(key, _)| key), Some("c1".to_string()));
        store.merge("calls", "c1", doc(json!({ "status": "rejected" })), vec![]).await?;
        assert_eq!(watch.recv().await, Some(None));
        assert_eq!(watch.try_recv(), None);
        Ok(())
    }
}
