//! Purpose: Record State Cell plus its synchronizer and mutation operations.
//! Exports: `RecordState`, `Doc`, `Acquired`.
//! Role: Mirrors "the one record currently of interest" for a single collection.
//! Invariants: `doc == None` means never checked; `Some(empty)` with `exists == false` means missing.
//! Invariants: `loading` flips when an acquisition is called, not when its future is first polled.
//! Invariants: Mutations never refresh `doc`/`exists`; reload or keep a live `sync` running.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use super::auth::AuthState;
use super::cell::{CellState, OverlapPolicy, StateCell};
use super::mutate::{Pending, Writer, ready};
use super::ownership::{Ownership, is_creator};
use super::subscription::{SyncHandle, spawn_pump};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{Fields, Filter, Record, StampClock, slug};
use crate::core::store::{DocSnapshot, Store};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct RecordState {
    pub loading: bool,
    pub saving: bool,
    pub exists: bool,
    pub doc: Option<Fields>,
    pub id: Option<String>,
    pub slug: Option<String>,
}

impl RecordState {
    pub fn created_by(&self) -> Option<&str> {
        self.doc.as_ref().and_then(crate::core::record::created_by)
    }

    fn found(&mut self, record: Record) {
        self.slug = slug(&record.fields);
        self.doc = Some(record.fields);
        self.id = Some(record.id);
        self.exists = true;
    }

    fn missing(&mut self) {
        self.exists = false;
        self.doc = Some(Fields::new());
    }
}

impl CellState for RecordState {
    fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    fn set_saving(&mut self, saving: bool) {
        self.saving = saving;
    }

    fn record_created(&mut self, id: &str) {
        self.id = Some(id.to_string());
    }
}

/// Outcome of a one-shot acquisition.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acquired {
    Found,
    Missing,
    /// A newer acquisition started first; this resolution was not written to the cell.
    Superseded,
}

impl Acquired {
    pub fn exists(self) -> bool {
        self == Acquired::Found
    }
}

/// Synchronizer for one record of one collection.
///
/// Cloning shares the same cell; every clone writes to and observes the same state.
pub struct Doc<S> {
    collection: Arc<str>,
    store: Arc<S>,
    identity: watch::Receiver<AuthState>,
    closed: watch::Receiver<bool>,
    cell: StateCell<RecordState>,
    writer: Writer<S, RecordState>,
}

impl<S> Clone for Doc<S> {
    fn clone(&self) -> Self {
        Self {
            collection: Arc::clone(&self.collection),
            store: Arc::clone(&self.store),
            identity: self.identity.clone(),
            closed: self.closed.clone(),
            cell: self.cell.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<S: Store> Doc<S> {
    pub(crate) fn new(
        collection: Arc<str>,
        store: Arc<S>,
        identity: watch::Receiver<AuthState>,
        closed: watch::Receiver<bool>,
        clock: Arc<StampClock>,
        policy: OverlapPolicy,
    ) -> Self {
        let cell = StateCell::new(RecordState::default(), policy);
        let writer = Writer::new(
            Arc::clone(&store),
            Arc::clone(&collection),
            identity.clone(),
            clock,
            cell.clone(),
        );
        Self {
            collection,
            store,
            identity,
            closed,
            cell,
            writer,
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// Current state; a clone of the cell's value.
    pub fn state(&self) -> RecordState {
        self.cell.read(RecordState::clone)
    }

    pub fn subscribe(&self) -> watch::Receiver<RecordState> {
        self.cell.subscribe()
    }

    pub fn changes(&self) -> WatchStream<RecordState> {
        WatchStream::new(self.cell.subscribe())
    }

    /// True iff a record is loaded and the current identity created it.
    pub fn is_creator(&self) -> bool {
        let uid = self.identity.borrow().uid.clone();
        self.cell.read(|state| is_creator(uid.as_deref(), state))
    }

    pub fn ownership(&self) -> Ownership {
        Ownership::new(self.identity.clone(), self.cell.subscribe())
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if *self.closed.borrow() {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("session is closed")
                .with_collection(self.collection.as_ref()));
        }
        Ok(())
    }

    /// One-shot fetch by id.
    pub fn load(&self, id: &str) -> Pending<Acquired> {
        if let Err(err) = self.ensure_open() {
            return ready(Err(err));
        }
        let ticket = self.cell.begin_acquire();
        let store = Arc::clone(&self.store);
        let collection = Arc::clone(&self.collection);
        let id = id.to_string();
        Box::pin(async move {
            let snapshot = store.get(&collection, &id).await?;
            let outcome = if snapshot.is_some() {
                Acquired::Found
            } else {
                Acquired::Missing
            };
            let applied = ticket.commit(|state| {
                state.id = Some(id.clone());
                match snapshot {
                    Some(record) => state.found(record),
                    None => state.missing(),
                }
            });
            debug!(collection = %collection, id = %id, ?outcome, applied, "load resolved");
            Ok(if applied { outcome } else { Acquired::Superseded })
        })
    }

    /// One-shot query; the backend's first match becomes the current record.
    pub fn find(&self, field: &str, value: impl Into<Value>) -> Pending<Acquired> {
        if let Err(err) = self.ensure_open() {
            return ready(Err(err));
        }
        let ticket = self.cell.begin_acquire();
        let store = Arc::clone(&self.store);
        let collection = Arc::clone(&self.collection);
        let filter = Filter::eq(field, value);
        Box::pin(async move {
            let matches = store.query(&collection, Some(&filter)).await?;
            let first = matches.into_iter().next();
            let outcome = if first.is_some() {
                Acquired::Found
            } else {
                Acquired::Missing
            };
            let applied = ticket.commit(|state| match first {
                Some(record) => state.found(record),
                None => state.missing(),
            });
            debug!(collection = %collection, field = %filter.field, ?outcome, applied, "find resolved");
            Ok(if applied { outcome } else { Acquired::Superseded })
        })
    }

    /// Live subscription to the record at `id`.
    ///
    /// `loading` rises once and falls with the first delivered snapshot. The returned handle
    /// must be unsubscribed explicitly; dropping it leaves the subscription running.
    pub fn sync(&self, id: &str) -> Pending<SyncHandle> {
        if let Err(err) = self.ensure_open() {
            return ready(Err(err));
        }
        let ticket = self.cell.begin_acquire();
        let store = Arc::clone(&self.store);
        let collection = Arc::clone(&self.collection);
        let cell = self.cell.clone();
        let closed = self.closed.clone();
        let id = id.to_string();
        Box::pin(async move {
            let subscription = store.watch(&collection, &id).await?;
            Ok(spawn_pump(
                cell,
                ticket,
                subscription,
                closed,
                format!("{collection}/{id}"),
                apply_doc_snapshot,
            ))
        })
    }

    /// Writes a new stamped record; only the cell's `id` is updated.
    pub fn create(&self, fields: Fields) -> Pending<String> {
        match self.ensure_open() {
            Ok(()) => self.writer.create(fields),
            Err(err) => ready(Err(err)),
        }
    }

    pub fn update(&self, id: &str, changes: Fields) -> Pending<()> {
        match self.ensure_open() {
            Ok(()) => self.writer.update(id, changes),
            Err(err) => ready(Err(err)),
        }
    }

    /// Replaces the record wholesale, stamping `updatedAt`/`updatedBy`.
    pub fn set(&self, id: &str, fields: Fields) -> Pending<()> {
        match self.ensure_open() {
            Ok(()) => self.writer.set(id, fields),
            Err(err) => ready(Err(err)),
        }
    }

    pub fn remove(&self, id: &str) -> Pending<()> {
        match self.ensure_open() {
            Ok(()) => self.writer.remove(id),
            Err(err) => ready(Err(err)),
        }
    }
}

fn apply_doc_snapshot(state: &mut RecordState, snapshot: DocSnapshot) {
    match snapshot {
        Some(record) => state.found(record),
        None => {
            state.missing();
            state.id = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{RecordState, apply_doc_snapshot};
    use crate::core::record::{Fields, Record};
    use serde_json::json;

    fn fields(value: serde_json::Value) -> Fields {
        match value {
            serde_json::Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn default_state_is_unchecked() {
        let state = RecordState::default();
        assert!(state.doc.is_none());
        assert!(!state.exists);
        assert!(!state.loading);
    }

    #[test]
    fn snapshot_captures_slug_and_clears_on_delete() {
        let mut state = RecordState::default();
        apply_doc_snapshot(
            &mut state,
            Some(Record::new("a", fields(json!({"slug": "hello", "createdBy": "u1"})))),
        );
        assert!(state.exists);
        assert_eq!(state.slug.as_deref(), Some("hello"));
        assert_eq!(state.created_by(), Some("u1"));
        assert_eq!(state.id.as_deref(), Some("a"));

        apply_doc_snapshot(&mut state, None);
        assert!(!state.exists);
        assert_eq!(state.doc, Some(Fields::new()));
        assert_eq!(state.id, None);
    }
}
