//! Purpose: Explicit context object owning the identity source and the store handle.
//! Exports: `Session`, `SessionConfig`.
//! Role: Hands out `Doc`/`CollectionRef` synchronizers bound to one identity and one store.
//! Invariants: `open` starts exactly one auth listener; `close` stops it and every live subscription.
//! Invariants: Operations issued through a closed session fail with `ErrorKind::Closed`.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use super::auth::{Auth, AuthBackend, AuthState};
use super::cell::OverlapPolicy;
use super::collection::CollectionRef;
use super::doc::Doc;
use crate::core::error::{Error, ErrorKind};
use crate::core::record::StampClock;
use crate::core::store::{Store, validate_collection_name};

#[derive(Clone, Copy, Debug, Default)]
pub struct SessionConfig {
    pub overlap: OverlapPolicy,
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_overlap(mut self, overlap: OverlapPolicy) -> Self {
        self.overlap = overlap;
        self
    }
}

pub struct Session<S, A> {
    store: Arc<S>,
    auth: Auth<A>,
    config: SessionConfig,
    clock: Arc<StampClock>,
    closed: watch::Sender<bool>,
    listener: Option<JoinHandle<()>>,
}

impl<S: Store, A: AuthBackend> Session<S, A> {
    /// Opens a session and waits for the auth backend's first report.
    pub async fn open(store: S, auth: A, config: SessionConfig) -> Result<Self, Error> {
        let auth = Auth::new(auth);
        let listener = auth.spawn_listener();
        let mut state = auth.state();
        state
            .wait_for(|state| !state.loading)
            .await
            .map_err(|err| {
                Error::new(ErrorKind::Unavailable)
                    .with_message("auth backend stopped before reporting")
                    .with_source(err)
            })?;
        let (closed, _rx) = watch::channel(false);
        debug!(overlap = ?config.overlap, uid = ?auth.uid(), "session opened");
        Ok(Self {
            store: Arc::new(store),
            auth,
            config,
            clock: Arc::new(StampClock::new()),
            closed,
            listener: Some(listener),
        })
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn auth(&self) -> &Auth<A> {
        &self.auth
    }

    pub fn identity(&self) -> watch::Receiver<AuthState> {
        self.auth.state()
    }

    pub fn config(&self) -> SessionConfig {
        self.config
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    fn ensure_open(&self) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::new(ErrorKind::Closed).with_message("session is closed"));
        }
        Ok(())
    }

    /// A synchronizer for one record of `collection`, with its own state cell.
    pub fn doc(&self, collection: &str) -> Result<Doc<S>, Error> {
        self.ensure_open()?;
        validate_collection_name(collection)?;
        Ok(Doc::new(
            Arc::from(collection),
            Arc::clone(&self.store),
            self.auth.state(),
            self.closed.subscribe(),
            Arc::clone(&self.clock),
            self.config.overlap,
        ))
    }

    pub fn collection(&self, name: &str) -> Result<CollectionRef<S>, Error> {
        self.ensure_open()?;
        validate_collection_name(name)?;
        Ok(CollectionRef::new(
            Arc::from(name),
            Arc::clone(&self.store),
            self.auth.state(),
            self.closed.subscribe(),
            Arc::clone(&self.clock),
            self.config.overlap,
        ))
    }

    /// Stops the auth listener and every subscription started through this session.
    pub fn close(&mut self) {
        if self.closed.send_replace(true) {
            return;
        }
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
        debug!("session closed");
    }
}

impl<S, A> Drop for Session<S, A> {
    fn drop(&mut self) {
        self.closed.send_replace(true);
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }
}
