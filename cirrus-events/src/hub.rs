//! Deferred event delivery
//!
//! Each cache instance owns one `EventHub`. A posted event is held until the
//! barrier future it was posted with resolves (normally "the cache's lane is
//! idle"), then handed to a single delivery task that broadcasts it. Events
//! leave the hub in the order they were posted.

use crate::event::CacheEvent;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

/// Barrier a posted event waits on before delivery.
pub type IdleBarrier = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Count of events posted but not yet dispatched.
///
/// Greater than zero means the owning cache is between a mutation and the
/// event announcing it, so readers must treat it as transiently inconsistent.
#[derive(Debug, Clone, Default)]
pub struct PendingNotifications(Arc<AtomicUsize>);

impl PendingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    pub fn is_pending(&self) -> bool {
        self.count() > 0
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement(&self) {
        // Saturating: a decrement never runs without its increment, but do
        // not wrap if that is ever violated.
        let _ = self
            .0
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

struct Delivery {
    barrier: IdleBarrier,
    event: CacheEvent,
}

/// Per-cache event publisher.
///
/// Must be created inside a tokio runtime; construction spawns the delivery
/// task, which ends when the hub is dropped.
#[derive(Clone)]
pub struct EventHub {
    tx: broadcast::Sender<CacheEvent>,
    queue: mpsc::UnboundedSender<Delivery>,
    pending: PendingNotifications,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        let (queue, rx) = mpsc::unbounded_channel();
        let pending = PendingNotifications::new();
        tokio::spawn(deliver(rx, tx.clone(), pending.clone()));
        Self { tx, queue, pending }
    }

    /// Post `event` for delivery once `barrier` resolves.
    ///
    /// The pending counter is incremented before this returns and decremented
    /// only after the event has been broadcast. Never blocks, so it is safe to
    /// call from inside the work the barrier is waiting on.
    pub fn post_when_idle<F>(&self, barrier: F, event: CacheEvent)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.pending.increment();
        let delivery = Delivery {
            barrier: Box::pin(barrier),
            event,
        };
        if let Err(mpsc::error::SendError(dropped)) = self.queue.send(delivery) {
            debug!(
                event_type = dropped.event.event_type(),
                "Delivery task gone; dropping event"
            );
            self.pending.decrement();
        }
    }

    /// Post `event` with no barrier.
    pub fn post(&self, event: CacheEvent) {
        self.post_when_idle(std::future::ready(()), event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.tx.subscribe()
    }

    pub fn pending(&self) -> &PendingNotifications {
        &self.pending
    }
}

async fn deliver(
    mut rx: mpsc::UnboundedReceiver<Delivery>,
    tx: broadcast::Sender<CacheEvent>,
    pending: PendingNotifications,
) {
    while let Some(Delivery { barrier, event }) = rx.recv().await {
        barrier.await;
        let event_type = event.event_type();
        match tx.send(event) {
            Ok(receivers) => debug!(event_type, receivers, "Dispatched cache event"),
            Err(_) => debug!(event_type, "No receivers for cache event"),
        }
        pending.decrement();
    }
}
