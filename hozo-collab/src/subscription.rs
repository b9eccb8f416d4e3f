//! Cancellable event streams.
//!
//! An [`EventHub`] fans events out to any number of [`Subscription`]s.
//! Dropping a subscription (or calling [`Subscription::dispose`]) removes
//! it from the hub; the hub never blocks on slow subscribers.
//!
//! Transports own one hub per event kind and outlive individual
//! connections, so a session client subscribes once and keeps receiving
//! across reconnects.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::mpsc;

struct HubInner<T> {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, mpsc::UnboundedSender<T>)>>,
}

impl<T> HubInner<T> {
    fn subscribers(&self) -> MutexGuard<'_, Vec<(u64, mpsc::UnboundedSender<T>)>> {
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Multi-subscriber event fan-out.
pub struct EventHub<T> {
    inner: Arc<HubInner<T>>,
}

impl<T> Clone for EventHub<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone> Default for EventHub<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> EventHub<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(HubInner {
                next_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers().push((id, tx));
        Subscription {
            id,
            rx,
            hub: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every live subscriber. Returns how many got it.
    pub fn emit(&self, event: T) -> usize {
        let mut subscribers = self.inner.subscribers();
        subscribers.retain(|(_, tx)| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers();
        subscribers.retain(|(_, tx)| !tx.is_closed());
        subscribers.len()
    }
}

/// Receiving end of an [`EventHub`]. Unsubscribes on drop.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::UnboundedReceiver<T>,
    hub: Weak<HubInner<T>>,
}

impl<T> Subscription<T> {
    /// A subscription that never yields anything.
    pub fn closed() -> Self {
        let (_, rx) = mpsc::unbounded_channel();
        Self {
            id: 0,
            rx,
            hub: Weak::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the hub is gone.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribe. Queued events are discarded.
    pub fn dispose(self) {}
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.subscribers().retain(|(id, _)| *id != self.id);
        }
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_emit_reaches_every_subscriber() {
        let hub = EventHub::new();
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.emit(7u32), 2);
        assert_eq!(a.recv().await, Some(7));
        assert_eq!(b.recv().await, Some(7));
    }

    #[test]
    fn test_dispose_unsubscribes() {
        let hub = EventHub::new();
        let a = hub.subscribe();
        let mut b = hub.subscribe();
        assert_eq!(hub.subscriber_count(), 2);

        a.dispose();
        assert_eq!(hub.subscriber_count(), 1);
        assert_eq!(hub.emit("x"), 1);
        assert_eq!(b.try_recv(), Some("x"));
    }

    #[test]
    fn test_order_is_preserved() {
        let hub = EventHub::new();
        let mut sub = hub.subscribe();
        for i in 0..5 {
            hub.emit(i);
        }
        let got: Vec<i32> = std::iter::from_fn(|| sub.try_recv()).collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_recv_ends_when_hub_dropped() {
        let hub = EventHub::<u8>::new();
        let mut sub = hub.subscribe();
        drop(hub);
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_closed_subscription_yields_nothing() {
        let mut sub = Subscription::<u8>::closed();
        assert_eq!(sub.try_recv(), None);
        assert_eq!(sub.recv().await, None);
    }
}
