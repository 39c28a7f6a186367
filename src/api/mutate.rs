//! Purpose: Stamped write operations shared by record and collection synchronizers.
//! Exports: `Pending`, `Writer` (crate-internal).
//! Role: Create/update/set/remove through the store, tagging writes with the active identity.
//! Invariants: `saving` rises at call time and falls once the last pending write settles.
//! Invariants: Stamped writes without an identity fail with `Unauthenticated` before any I/O.
//! Invariants: Writes never touch the mirrored record/collection; only `record_created` does.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use super::auth::AuthState;
use super::cell::{CellState, StateCell};
use crate::core::error::{Error, ErrorKind};
use crate::core::record::{Fields, StampClock, stamp_create, stamp_update};
use crate::core::store::Store;

/// A backend call already started by the operation that returned it.
///
/// State flags were flipped before this value was handed back; awaiting it only observes the
/// resolution.
pub type Pending<T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'static>>;

pub(crate) fn ready<T: Send + 'static>(result: Result<T, Error>) -> Pending<T> {
    Box::pin(std::future::ready(result))
}

pub(crate) struct Writer<S, T> {
    store: Arc<S>,
    collection: Arc<str>,
    identity: watch::Receiver<AuthState>,
    clock: Arc<StampClock>,
    cell: StateCell<T>,
}

impl<S, T> Clone for Writer<S, T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            collection: Arc::clone(&self.collection),
            identity: self.identity.clone(),
            clock: Arc::clone(&self.clock),
            cell: self.cell.clone(),
        }
    }
}

impl<S: Store, T: CellState> Writer<S, T> {
    pub(crate) fn new(
        store: Arc<S>,
        collection: Arc<str>,
        identity: watch::Receiver<AuthState>,
        clock: Arc<StampClock>,
        cell: StateCell<T>,
    ) -> Self {
        Self {
            store,
            collection,
            identity,
            clock,
            cell,
        }
    }

    fn actor(&self) -> Result<String, Error> {
        self.identity.borrow().uid.clone().ok_or_else(|| {
            Error::new(ErrorKind::Unauthenticated)
                .with_message("a signed-in identity is required to stamp this write")
                .with_collection(self.collection.as_ref())
                .with_hint("Sign in before creating or changing records.")
        })
    }

    fn stamp_time(&self) -> Result<(String, u64), Error> {
        let actor = self.actor()?;
        let now = self.clock.now_ms()?;
        Ok((actor, now))
    }

    pub(crate) fn create(&self, fields: Fields) -> Pending<String> {
        let (actor, now) = match self.stamp_time() {
            Ok(stamp) => stamp,
            Err(err) => return ready(Err(err)),
        };
        let fields = stamp_create(fields, &actor, now);
        let guard = self.cell.begin_write();
        let store = Arc::clone(&self.store);
        let collection = Arc::clone(&self.collection);
        let cell = self.cell.clone();
        Box::pin(async move {
            let _guard = guard;
            let id = store.add(&collection, fields).await?;
            debug!(collection = %collection, id = %id, actor = %actor, "created record");
            cell.record_created(&id);
            Ok(id)
        })
    }

    pub(crate) fn update(&self, id: &str, changes: Fields) -> Pending<()> {
        let (actor, now) = match self.stamp_time() {
            Ok(stamp) => stamp,
            Err(err) => return ready(Err(err)),
        };
        let changes = stamp_update(changes, &actor, now);
        self.write(id, "updated", move |store, collection, id| async move {
            store.update(&collection, &id, changes).await
        })
    }

    pub(crate) fn set(&self, id: &str, fields: Fields) -> Pending<()> {
        let (actor, now) = match self.stamp_time() {
            Ok(stamp) => stamp,
            Err(err) => return ready(Err(err)),
        };
        let fields = stamp_update(fields, &actor, now);
        self.write(id, "replaced", move |store, collection, id| async move {
            store.set(&collection, &id, fields).await
        })
    }

    pub(crate) fn remove(&self, id: &str) -> Pending<()> {
        self.write(id, "removed", |store, collection, id| async move {
            store.delete(&collection, &id).await
        })
    }

    fn write<F, Fut>(&self, id: &str, verb: &'static str, op: F) -> Pending<()>
    where
        F: FnOnce(Arc<S>, Arc<str>, String) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        let guard = self.cell.begin_write();
        let store = Arc::clone(&self.store);
        let collection = Arc::clone(&self.collection);
        let id = id.to_string();
        Box::pin(async move {
            let _guard = guard;
            op(store, Arc::clone(&collection), id.clone()).await?;
            debug!(collection = %collection, id = %id, "{verb} record");
            Ok(())
        })
    }
}
