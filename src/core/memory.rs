//! Purpose: In-process `Store` with live subscriptions, for tests and embedded use.
//! Exports: `MemoryStore`.
//! Role: Reference backend; mirrors hosted-store semantics closely enough for the reactive layer.
//! Invariants: Records are ordered by id within a collection; queries return that order.
//! Invariants: Watchers receive the current state on registration and after every change.
//! Invariants: Closed watchers are pruned on the next push; the lock is never held across `.await`.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::UnboundedSender;

use crate::core::error::{Error, ErrorKind};
use crate::core::ids::auto_id;
use crate::core::record::{Fields, Filter, Record};
use crate::core::store::{
    DocSnapshot, QuerySnapshot, Store, Subscription, validate_collection_name, validate_record_id,
};

type Collection = BTreeMap<String, Fields>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Default)]
struct Inner {
    collections: HashMap<String, Collection>,
    doc_watchers: Vec<DocWatcher>,
    query_watchers: Vec<QueryWatcher>,
}

struct DocWatcher {
    collection: String,
    id: String,
    tx: UnboundedSender<Result<DocSnapshot, Error>>,
}

struct QueryWatcher {
    collection: String,
    filter: Option<Filter>,
    tx: UnboundedSender<Result<QuerySnapshot, Error>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a record without going through the write path (no stamping, no id checks).
    pub fn insert(&self, collection: &str, id: &str, fields: Fields) {
        let mut inner = self.lock();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        inner.notify(collection, id);
    }

    /// Synchronous read for assertions and tooling.
    pub fn snapshot(&self, collection: &str, id: &str) -> Option<Fields> {
        self.lock()
            .collections
            .get(collection)
            .and_then(|records| records.get(id))
            .cloned()
    }

    pub fn len(&self, collection: &str) -> usize {
        self.lock()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.doc_watchers.retain(|watcher| !watcher.tx.is_closed());
        inner.query_watchers.retain(|watcher| !watcher.tx.is_closed());
        inner.doc_watchers.len() + inner.query_watchers.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain maps behind; keep serving them.
        self.inner
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}

impl Inner {
    fn record(&self, collection: &str, id: &str) -> DocSnapshot {
        self.collections
            .get(collection)
            .and_then(|records| records.get(id))
            .map(|fields| Record::new(id, fields.clone()))
    }

    fn query(&self, collection: &str, filter: Option<&Filter>) -> QuerySnapshot {
        let Some(records) = self.collections.get(collection) else {
            return Vec::new();
        };
        records
            .iter()
            .filter(|(_, fields)| filter.is_none_or(|filter| filter.matches(fields)))
            .map(|(id, fields)| Record::new(id.clone(), fields.clone()))
            .collect()
    }

    fn notify(&mut self, collection: &str, id: &str) {
        let doc = self.record(collection, id);
        self.doc_watchers.retain(|watcher| {
            if watcher.collection != collection || watcher.id != id {
                return !watcher.tx.is_closed();
            }
            watcher.tx.send(Ok(doc.clone())).is_ok()
        });

        let mut query_watchers = std::mem::take(&mut self.query_watchers);
        query_watchers.retain(|watcher| {
            if watcher.collection != collection {
                return !watcher.tx.is_closed();
            }
            let snapshot = self.query(collection, watcher.filter.as_ref());
            watcher.tx.send(Ok(snapshot)).is_ok()
        });
        self.query_watchers = query_watchers;
    }
}

impl Store for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> Result<DocSnapshot, Error> {
        validate_collection_name(collection)?;
        validate_record_id(collection, id)?;
        Ok(self.lock().record(collection, id))
    }

    async fn query(
        &self,
        collection: &str,
        filter: Option<&Filter>,
    ) -> Result<QuerySnapshot, Error> {
        validate_collection_name(collection)?;
        Ok(self.lock().query(collection, filter))
    }

    async fn add(&self, collection: &str, fields: Fields) -> Result<String, Error> {
        validate_collection_name(collection)?;
        let mut inner = self.lock();
        let records = inner.collections.entry(collection.to_string()).or_default();
        let mut id = auto_id()?;
        while records.contains_key(&id) {
            id = auto_id()?;
        }
        records.insert(id.clone(), fields);
        inner.notify(collection, &id);
        Ok(id)
    }

    async fn update(&self, collection: &str, id: &str, changes: Fields) -> Result<(), Error> {
        validate_collection_name(collection)?;
        validate_record_id(collection, id)?;
        let mut inner = self.lock();
        let existing = inner
            .collections
            .get_mut(collection)
            .and_then(|records| records.get_mut(id))
            .ok_or_else(|| {
                Error::new(ErrorKind::NotFound)
                    .with_message("cannot update a missing record")
                    .with_collection(collection)
                    .with_id(id)
            })?;
        for (key, value) in changes {
            existing.insert(key, value);
        }
        inner.notify(collection, id);
        Ok(())
    }

    async fn set(&self, collection: &str, id: &str, fields: Fields) -> Result<(), Error> {
        validate_collection_name(collection)?;
        validate_record_id(collection, id)?;
        let mut inner = self.lock();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), fields);
        inner.notify(collection, id);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), Error> {
        validate_collection_name(collection)?;
        validate_record_id(collection, id)?;
        let mut inner = self.lock();
        let removed = inner
            .collections
            .get_mut(collection)
            .and_then(|records| records.remove(id))
            .is_some();
        if removed {
            inner.notify(collection, id);
        }
        Ok(())
    }

    async fn watch(&self, collection: &str, id: &str) -> Result<Subscription<DocSnapshot>, Error> {
        validate_collection_name(collection)?;
        validate_record_id(collection, id)?;
        let (tx, subscription) = Subscription::channel();
        let mut inner = self.lock();
        let initial = inner.record(collection, id);
        if tx.send(Ok(initial)).is_ok() {
            inner.doc_watchers.push(DocWatcher {
                collection: collection.to_string(),
                id: id.to_string(),
                tx,
            });
        }
        Ok(subscription)
    }

    async fn watch_query(
        &self,
        collection: &str,
        filter: Option<&Filter>,
    ) -> Result<Subscription<QuerySnapshot>, Error> {
        validate_collection_name(collection)?;
        let (tx, subscription) = Subscription::channel();
        let mut inner = self.lock();
        let initial = inner.query(collection, filter);
        if tx.send(Ok(initial)).is_ok() {
            inner.query_watchers.push(QueryWatcher {
                collection: collection.to_string(),
                filter: filter.cloned(),
                tx,
            });
        }
        Ok(subscription)
    }
}
