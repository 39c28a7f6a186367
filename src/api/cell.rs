//! Purpose: Reactive state holder shared by the record and collection synchronizers.
//! Exports: `StateCell`, `OverlapPolicy`, `Ticket`, `WriteGuard`, `CellState`.
//! Role: Owns every write to a state value; tracks acquisition generations and pending writes.
//! Invariants: Each transition is one `send_modify`/`send_if_modified`; readers never see half of it.
//! Invariants: Generation checks run inside the watch lock, so staleness decisions are atomic.
//! Invariants: The generation channel is only locked while the state lock is held, never the reverse.
//! Invariants: `loading` and `saving` are always cleared on completion, failure, or drop.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::watch;
use tracing::debug;

/// How overlapping acquisitions on one cell are reconciled.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum OverlapPolicy {
    /// Only the most recently started acquisition may write; stale resolutions are dropped.
    #[default]
    LatestCall,
    /// Every resolution writes; whichever resolves last wins.
    LastResolved,
}

pub(crate) trait CellState: Send + Sync + 'static {
    fn set_loading(&mut self, loading: bool);
    fn set_saving(&mut self, saving: bool);
    fn record_created(&mut self, id: &str);
}

pub(crate) struct StateCell<T> {
    tx: Arc<watch::Sender<T>>,
    generation: Arc<watch::Sender<u64>>,
    pending_writes: Arc<AtomicUsize>,
    policy: OverlapPolicy,
}

impl<T> Clone for StateCell<T> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
            generation: Arc::clone(&self.generation),
            pending_writes: Arc::clone(&self.pending_writes),
            policy: self.policy,
        }
    }
}

impl<T: CellState> StateCell<T> {
    pub(crate) fn new(initial: T, policy: OverlapPolicy) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self {
            tx: Arc::new(tx),
            generation: Arc::new(watch::Sender::new(0)),
            pending_writes: Arc::new(AtomicUsize::new(0)),
            policy,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }

    pub(crate) fn read<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.tx.borrow())
    }

    pub(crate) fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    /// Starts an acquisition: bumps the generation and raises `loading`.
    pub(crate) fn begin_acquire(&self) -> Ticket<T> {
        let mut generation = 0;
        self.tx.send_modify(|state| {
            self.generation.send_modify(|latest| {
                *latest += 1;
                generation = *latest;
            });
            state.set_loading(true);
        });
        Ticket {
            cell: self.clone(),
            generation,
            settled: false,
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        match self.policy {
            OverlapPolicy::LatestCall => *self.generation.borrow() == generation,
            OverlapPolicy::LastResolved => true,
        }
    }

    /// Watches the generation of the latest acquisition.
    pub(crate) fn acquisitions(&self) -> watch::Receiver<u64> {
        self.generation.subscribe()
    }

    /// Applies `apply` and clears `loading` if `generation` may still write.
    pub(crate) fn commit(&self, generation: u64, apply: impl FnOnce(&mut T)) -> bool {
        self.commit_open(generation, || true, apply)
    }

    /// Like [`StateCell::commit`], but also skipped when `open` reports false.
    ///
    /// `open` runs under the cell lock, so a consumer that flips it before the check
    /// is guaranteed no later write lands.
    pub(crate) fn commit_open(
        &self,
        generation: u64,
        open: impl FnOnce() -> bool,
        apply: impl FnOnce(&mut T),
    ) -> bool {
        let mut superseded = false;
        let applied = self.tx.send_if_modified(|state| {
            if !self.is_current(generation) {
                superseded = true;
                return false;
            }
            if !open() {
                return false;
            }
            apply(state);
            state.set_loading(false);
            true
        });
        if superseded {
            debug!(generation, "discarding superseded resolution");
        }
        applied
    }

    fn abandon(&self, generation: u64) {
        self.tx.send_if_modified(|state| {
            if !self.is_current(generation) {
                return false;
            }
            state.set_loading(false);
            true
        });
    }

    /// Registers a pending write and raises `saving` until the guard drops.
    pub(crate) fn begin_write(&self) -> WriteGuard<T> {
        self.tx.send_modify(|state| {
            self.pending_writes.fetch_add(1, Ordering::SeqCst);
            state.set_saving(true);
        });
        WriteGuard { cell: self.clone() }
    }

    pub(crate) fn record_created(&self, id: &str) {
        self.tx.send_modify(|state| state.record_created(id));
    }
}

/// Ownership of one acquisition. Dropping an unsettled ticket clears `loading`.
pub(crate) struct Ticket<T: CellState> {
    cell: StateCell<T>,
    generation: u64,
    settled: bool,
}

impl<T: CellState> Ticket<T> {
    pub(crate) fn commit(mut self, apply: impl FnOnce(&mut T)) -> bool {
        self.settled = true;
        self.cell.commit(self.generation, apply)
    }

    /// Hands the generation to a long-lived consumer that commits repeatedly.
    pub(crate) fn into_generation(mut self) -> u64 {
        self.settled = true;
        self.generation
    }
}

impl<T: CellState> Drop for Ticket<T> {
    fn drop(&mut self) {
        if !self.settled {
            self.cell.abandon(self.generation);
        }
    }
}

pub(crate) struct WriteGuard<T: CellState> {
    cell: StateCell<T>,
}

impl<T: CellState> Drop for WriteGuard<T> {
    fn drop(&mut self) {
        let pending = &self.cell.pending_writes;
        self.cell.tx.send_if_modified(|state| {
            if pending.fetch_sub(1, Ordering::SeqCst) == 1 {
                state.set_saving(false);
                return true;
            }
            false
        });
    }
}
