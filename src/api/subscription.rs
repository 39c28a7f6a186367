//! Purpose: Drive backend push channels into a state cell.
//! Exports: `SyncHandle`.
//! Role: Long-lived pump task per live subscription, stopped explicitly.
//! Invariants: Dropping a `SyncHandle` does not stop the pump; `unsubscribe` or session close does.
//! Invariants: Under `OverlapPolicy::LatestCall` a pump ends once a newer acquisition starts,
//! whether or not the backend delivers anything further.
//! Invariants: No snapshot is applied after `unsubscribe` or session close has been signalled.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::cell::{CellState, OverlapPolicy, StateCell, Ticket};
use crate::core::store::Subscription;

/// Handle to a live subscription started by `sync`.
///
/// The subscription keeps delivering until [`SyncHandle::unsubscribe`] is called, a newer
/// acquisition supersedes it, or the owning session closes. Dropping the handle leaks the
/// subscription for the rest of the session.
#[must_use = "dropping a SyncHandle leaks the subscription; call unsubscribe() to stop it"]
#[derive(Debug)]
pub struct SyncHandle {
    stop: watch::Sender<bool>,
    active: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl SyncHandle {
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Stops delivery. Updates already applied to the cell stay in place.
    pub fn unsubscribe(mut self) {
        let _ = self.stop.send(true);
        self.active.store(false, Ordering::SeqCst);
        // Detach; the pump observes the stop signal on its next poll.
        drop(self.task.take());
    }

    /// Stops delivery and waits for the pump to exit.
    pub async fn unsubscribe_and_wait(mut self) {
        let _ = self.stop.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.active.store(false, Ordering::SeqCst);
    }
}

pub(crate) fn spawn_pump<T, U, F>(
    cell: StateCell<T>,
    ticket: Ticket<T>,
    mut subscription: Subscription<U>,
    mut session_closed: watch::Receiver<bool>,
    label: String,
    apply: F,
) -> SyncHandle
where
    T: CellState,
    U: Send + 'static,
    F: Fn(&mut T, U) + Send + 'static,
{
    let (stop, mut stopped) = watch::channel(false);
    let active = Arc::new(AtomicBool::new(true));
    let pump_active = Arc::clone(&active);
    let generation = ticket.into_generation();
    let mut acquisitions = cell.acquisitions();
    let supersedable = cell.policy() == OverlapPolicy::LatestCall;

    let task = tokio::spawn(async move {
        debug!(subscription = %label, generation, "subscription started");
        let mut stop_armed = true;
        loop {
            let item = tokio::select! {
                biased;
                requested = async { stopped.wait_for(|stop| *stop).await.is_ok() }, if stop_armed => {
                    if requested {
                        break;
                    }
                    // Handle dropped without unsubscribing; keep delivering.
                    stop_armed = false;
                    continue;
                }
                _ = async { let _ = session_closed.wait_for(|closed| *closed).await; } => break,
                _ = async { let _ = acquisitions.wait_for(|latest| *latest != generation).await; }, if supersedable => {
                    debug!(subscription = %label, generation, "subscription superseded");
                    break;
                }
                item = subscription.next() => item,
            };
            let open = || !*stopped.borrow() && !*session_closed.borrow();
            match item {
                Some(Ok(snapshot)) => {
                    if !cell.commit_open(generation, open, |state| apply(state, snapshot)) {
                        debug!(subscription = %label, generation, "subscription no longer current");
                        break;
                    }
                }
                Some(Err(err)) => {
                    warn!(subscription = %label, error = %err, "subscription delivered an error");
                    cell.commit_open(generation, open, |_| {});
                }
                None => {
                    debug!(subscription = %label, "backend closed subscription");
                    cell.commit_open(generation, open, |_| {});
                    break;
                }
            }
        }
        pump_active.store(false, Ordering::SeqCst);
        debug!(subscription = %label, generation, "subscription stopped");
    });

    SyncHandle {
        stop,
        active,
        task: Some(task),
    }
}
