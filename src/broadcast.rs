//! Fan-out of [`SerialEvent`]s to local listeners.
//!
//! Every subscriber owns an unbounded queue, so a listener that stops reading
//! only grows its own backlog and never holds up the others. The subscriber
//! list is copy-on-write: `publish` clones an `Arc` of the current list and
//! walks that, while `subscribe` swaps in a new list.

use crate::types::SerialEvent;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Clone)]
struct Subscriber {
    id: u64,
    tx: mpsc::UnboundedSender<SerialEvent>,
}

#[derive(Clone, Default)]
pub struct EventBroadcaster {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    subscribers: Mutex<Arc<Vec<Subscriber>>>,
    next_id: AtomicU64,
}

/// Receiving end handed to a listener. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SerialEvent>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the broadcaster is gone.
    pub async fn recv(&mut self) -> Option<SerialEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<SerialEvent> {
        self.rx.try_recv().ok()
    }
}

impl EventBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Only events published after this call are seen.
    pub fn subscribe(&self) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut guard = self.inner.subscribers.lock();
        let mut next: Vec<Subscriber> = guard
            .iter()
            .filter(|s| !s.tx.is_closed())
            .cloned()
            .collect();
        next.push(Subscriber { id, tx });
        *guard = Arc::new(next);

        debug!(subscriber = id, "Subscriber registered");
        Subscription { id, rx }
    }

    /// Deliver `event` to every current subscriber. Returns how many
    /// received it.
    pub fn publish(&self, event: SerialEvent) -> usize {
        let snapshot = self.inner.subscribers.lock().clone();

        let mut delivered = 0;
        let mut stale = false;
        for subscriber in snapshot.iter() {
            if subscriber.tx.send(event.clone()).is_ok() {
                delivered += 1;
            } else {
                stale = true;
            }
        }

        if stale {
            self.prune();
        }
        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .iter()
            .filter(|s| !s.tx.is_closed())
            .count()
    }

    fn prune(&self) {
        let mut guard = self.inner.subscribers.lock();
        let (closed, kept): (Vec<Subscriber>, Vec<Subscriber>) =
            guard.iter().cloned().partition(|s| s.tx.is_closed());
        for subscriber in &closed {
            debug!(subscriber = subscriber.id, "Subscriber dropped");
        }
        *guard = Arc::new(kept);
    }
}
