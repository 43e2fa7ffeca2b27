use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::realtime::client::{ProbeState, RealtimeError, StreamState};
use crate::realtime::hub::{Hub, Listener};
use crate::realtime::proto::Event;

/// Caller's handle to one realtime subscription.
///
/// Events are read through [`events`](Self::events). Dropping the handle
/// unsubscribes.
pub struct Subscription<T> {
    hub: Hub<Event<T>>,
    cancel: CancellationToken,
    closed: AtomicBool,
    ready: watch::Receiver<ProbeState>,
    state: watch::Receiver<StreamState>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(
        hub: Hub<Event<T>>,
        cancel: CancellationToken,
        ready: watch::Receiver<ProbeState>,
        state: watch::Receiver<StreamState>,
    ) -> Self {
        Self {
            hub,
            cancel,
            closed: AtomicBool::new(false),
            ready,
            state,
        }
    }

    /// Registers a new listener for events delivered from now on.
    ///
    /// Each call returns an independent sequence; every listener receives
    /// every event. Sequences end once the subscription is closed.
    pub fn events(&self) -> Listener<Event<T>> {
        self.hub.listen()
    }

    /// Stops the stream and ends every event sequence. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.hub.close();
        debug!(event = "realtime_unsubscribed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.hub.is_closed()
    }

    /// Waits for the outcome of the first connection attempt.
    ///
    /// Resolves immediately for subscriptions created with
    /// `wait_for_probe` set, since those only exist after a successful probe.
    pub async fn ready(&self) -> Result<(), Arc<RealtimeError>> {
        let mut ready = self.ready.clone();
        let outcome = ready
            .wait_for(|state| !matches!(state, ProbeState::Pending))
            .await
            .map(|state| state.clone());

        match outcome {
            Ok(ProbeState::Failed(err)) => Err(err),
            Ok(_) => Ok(()),
            Err(_) => Err(Arc::new(RealtimeError::Cancelled)),
        }
    }

    /// Current state of the underlying connection.
    pub fn state(&self) -> StreamState {
        *self.state.borrow()
    }

    /// Watch receiver observing every connection state transition.
    pub fn state_changes(&self) -> watch::Receiver<StreamState> {
        self.state.clone()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
