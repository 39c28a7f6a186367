//! Purpose: Collection analog of `Doc`: an ordered set of records kept current.
//! Exports: `CollectionState`, `CollectionRef`.
//! Role: Same acquisition, subscription, and stamped-write contracts as `Doc`, over many records.
//! Invariants: `docs` keeps the backend's order; `exists` is true iff at least one record matched.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tracing::debug;

use super::auth::AuthState;
use super::cell::{CellState, OverlapPolicy, StateCell};
use super::doc::Acquired;
use super::mutate::{Pending, Writer, ready};
use super::subscription::{SyncHandle, spawn_pump};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{Fields, Filter, Record, StampClock};
use crate::core::store::{QuerySnapshot, Store};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct CollectionState {
    pub loading: bool,
    pub saving: bool,
    pub exists: bool,
    pub docs: Option<Vec<Record>>,
    /// Id returned by the most recent `create`.
    pub last_created: Option<String>,
}

impl CollectionState {
    pub fn get(&self, id: &str) -> Option<&Record> {
        self.docs.as_ref()?.iter().find(|record| record.id == id)
    }

    fn replace(&mut self, records: QuerySnapshot) {
        self.exists = !records.is_empty();
        self.docs = Some(records);
    }
}

impl CellState for CollectionState {
    fn set_loading(&mut self, loading: bool) {
        self.loading = loading;
    }

    fn set_saving(&mut self, saving: bool) {
        self.saving = saving;
    }

    fn record_created(&mut self, id: &str) {
        self.last_created = Some(id.to_string());
    }
}

/// Synchronizer for a whole collection or an equality-filtered slice of it.
pub struct CollectionRef<S> {
    name: Arc<str>,
    store: Arc<S>,
    closed: watch::Receiver<bool>,
    cell: StateCell<CollectionState>,
    writer: Writer<S, CollectionState>,
}

impl<S> Clone for CollectionRef<S> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            store: Arc::clone(&self.store),
            closed: self.closed.clone(),
            cell: self.cell.clone(),
            writer: self.writer.clone(),
        }
    }
}

impl<S: Store> CollectionRef<S> {
    pub(crate) fn new(
        name: Arc<str>,
        store: Arc<S>,
        identity: watch::Receiver<AuthState>,
        closed: watch::Receiver<bool>,
        clock: Arc<StampClock>,
        policy: OverlapPolicy,
    ) -> Self {
        let cell = StateCell::new(CollectionState::default(), policy);
        let writer = Writer::new(
            Arc::clone(&store),
            Arc::clone(&name),
            identity,
            clock,
            cell.clone(),
        );
        Self {
            name,
            store,
            closed,
            cell,
            writer,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> CollectionState {
        self.cell.read(CollectionState::clone)
    }

    pub fn subscribe(&self) -> watch::Receiver<CollectionState> {
        self.cell.subscribe()
    }

    pub fn changes(&self) -> WatchStream<CollectionState> {
        WatchStream::new(self.cell.subscribe())
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if *self.closed.borrow() {
            return Err(Error::new(ErrorKind::Closed)
                .with_message("session is closed")
                .with_collection(self.name.as_ref()));
        }
        Ok(())
    }

    /// One-shot fetch of every record.
    pub fn load(&self) -> Pending<Acquired> {
        self.acquire(None)
    }

    /// One-shot fetch of every record whose `field` equals `value`.
    pub fn find(&self, field: &str, value: impl Into<Value>) -> Pending<Acquired> {
        self.acquire(Some(Filter::eq(field, value)))
    }

    fn acquire(&self, filter: Option<Filter>) -> Pending<Acquired> {
        if let Err(err) = self.ensure_open() {
            return ready(Err(err));
        }
        let ticket = self.cell.begin_acquire();
        let store = Arc::clone(&self.store);
        let name = Arc::clone(&self.name);
        Box::pin(async move {
            let records = store.query(&name, filter.as_ref()).await?;
            let count = records.len();
            let outcome = if count == 0 {
                Acquired::Missing
            } else {
                Acquired::Found
            };
            let applied = ticket.commit(|state| state.replace(records));
            debug!(collection = %name, count, applied, "collection query resolved");
            Ok(if applied { outcome } else { Acquired::Superseded })
        })
    }

    /// Live subscription to the collection, optionally filtered.
    pub fn sync(&self, filter: Option<Filter>) -> Pending<SyncHandle> {
        if let Err(err) = self.ensure_open() {
            return ready(Err(err));
        }
        let ticket = self.cell.begin_acquire();
        let store = Arc::clone(&self.store);
        let name = Arc::clone(&self.name);
        let cell = self.cell.clone();
        let closed = self.closed.clone();
        Box::pin(async move {
            let subscription = store.watch_query(&name, filter.as_ref()).await?;
            let label = match &filter {
                Some(filter) => format!("{name}?{}={}", filter.field, filter.value),
                None => name.to_string(),
            };
            Ok(spawn_pump(
                cell,
                ticket,
                subscription,
                closed,
                label,
                CollectionState::replace,
            ))
        })
    }

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
