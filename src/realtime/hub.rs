//! In-process fan-out of realtime events.
//!
//! Every listener owns an unbounded queue, so a slow listener never blocks
//! the publisher or its siblings. The registry lock is held only to register,
//! snapshot, or close; delivery runs on the snapshot.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures_util::Stream;
use tokio::sync::mpsc;

struct Registry<T> {
    listeners: Vec<mpsc::UnboundedSender<T>>,
    closed: bool,
}

struct HubInner<T> {
    registry: Mutex<Registry<T>>,
    // Serializes publishers so every listener sees the same order.
    publish: Mutex<()>,
}

/// Multicast channel: each published item is cloned to every listener
/// registered at the time of the call.
pub struct Hub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for Hub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for Hub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Hub<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                registry: Mutex::new(Registry {
                    listeners: Vec::new(),
                    closed: false,
                }),
                publish: Mutex::new(()),
            }),
        }
    }

    /// Registers a listener. Items published earlier are not replayed; after
    /// [`close`](Self::close) the returned listener is already finished.
    pub fn listen(&self) -> Listener<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut registry = self.registry();
        if !registry.closed {
            registry.listeners.push(tx);
        }
        Listener { rx }
    }

    /// Ends every listener's sequence. Idempotent.
    pub fn close(&self) {
        let mut registry = self.registry();
        registry.closed = true;
        registry.listeners.clear();
    }

    pub fn is_closed(&self) -> bool {
        self.registry().closed
    }

    pub fn listener_count(&self) -> usize {
        self.registry().listeners.len()
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, Registry<T>> {
        self.inner
            .registry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T: Clone> Hub<T> {
    /// Delivers `item` to every registered listener and returns how many
    /// received it.
    pub fn publish(&self, item: T) -> usize {
        let _order = self
            .inner
            .publish
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let snapshot = self.registry().listeners.clone();

        let mut delivered = 0;
        let mut saw_gone = false;
        for listener in &snapshot {
            if listener.send(item.clone()).is_ok() {
                delivered += 1;
            } else {
                saw_gone = true;
            }
        }

        if saw_gone {
            self.registry()
                .listeners
                .retain(|listener| !listener.is_closed());
        }
        delivered
    }
}

/// Receive side of one hub registration.
#[derive(Debug)]
pub struct Listener<T> {
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T> Listener<T> {
    /// Receives the next item; `None` once the hub is closed and drained.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Stream for Listener<T> {
    type Item = T;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        self.rx.poll_recv(cx)
    }
}
