//! In-process publish/subscribe for stage events.
//!
//! Single topic: every [`StageEvent`] goes to every subscriber. Each
//! subscriber owns a bounded FIFO queue; when it overflows the oldest queued
//! event is dropped and the subscriber's drop counter is incremented, so a
//! slow observer can never stall the pipeline. Publication never blocks.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;
use tracing::debug;

use deskrail_core::StageEvent;

/// Default per-subscriber queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Subscribing to a closed bus fails; publishing to one is a no-op.
    #[error("bus is closed")]
    Closed,
}

struct SubscriberQueue {
    events: VecDeque<StageEvent>,
    dropped: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

struct BusInner {
    subscribers: HashMap<u64, SubscriberQueue>,
    closed: bool,
}

/// Single-topic fan-out bus with bounded per-subscriber queues.
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
    capacity: usize,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                subscribers: HashMap::new(),
                closed: false,
            })),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new subscriber with its own bounded queue.
    pub fn subscribe(&self) -> Result<Subscription, BusError> {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.closed {
            return Err(BusError::Closed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let dropped = Arc::new(AtomicU64::new(0));
        let notify = Arc::new(Notify::new());
        inner.subscribers.insert(
            id,
            SubscriberQueue {
                events: VecDeque::with_capacity(self.capacity.min(64)),
                dropped: dropped.clone(),
                notify: notify.clone(),
            },
        );
        Ok(Subscription {
            id,
            inner: self.inner.clone(),
            dropped,
            notify,
        })
    }

    /// Publish an event to all subscribers. Never blocks: full queues drop
    /// their oldest event. Publishing to a closed bus is a no-op.
    pub fn publish(&self, event: &StageEvent) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        if inner.closed {
            return;
        }
        for queue in inner.subscribers.values_mut() {
            if queue.events.len() >= self.capacity {
                queue.events.pop_front();
                queue.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.events.push_back(event.clone());
            queue.notify.notify_one();
        }
    }

    /// Close the bus: further publishes are no-ops, further subscribes fail.
    /// Existing subscribers drain whatever is already queued, then see `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.closed = true;
        for queue in inner.subscribers.values() {
            queue.notify.notify_one();
        }
        debug!(subscribers = inner.subscribers.len(), "event bus closed");
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().expect("bus lock poisoned").subscribers.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// A subscriber's receiving end. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    inner: Arc<Mutex<BusInner>>,
    dropped: Arc<AtomicU64>,
    notify: Arc<Notify>,
}

impl Subscription {
    /// Receive the next event in publication order.
    ///
    /// Returns `None` once the bus is closed and this queue is drained, or
    /// after [`Subscription::unsubscribe`].
    pub async fn recv(&mut self) -> Option<StageEvent> {
        loop {
            {
                let mut inner = self.inner.lock().expect("bus lock poisoned");
                match inner.subscribers.get_mut(&self.id) {
                    Some(queue) => {
                        if let Some(event) = queue.events.pop_front() {
                            return Some(event);
                        }
                        if inner.closed {
                            return None;
                        }
                    }
                    None => return None,
                }
            }
            // notify_one stores a permit, so a publish racing between the
            // check above and this await still wakes us.
            self.notify.notified().await;
        }
    }

    /// Events dropped from this subscriber's queue due to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Remove this subscriber and release its queue. Idempotent.
    pub fn unsubscribe(&mut self) {
        let mut inner = self.inner.lock().expect("bus lock poisoned");
        inner.subscribers.remove(&self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deskrail_core::{Stage, StageStatus};
    use uuid::Uuid;

    fn event(n: u64) -> StageEvent {
        StageEvent::ticket(
            Uuid::new_v4(),
            Uuid::new_v4(),
            Stage::SpamFilter,
            StageStatus::Completed,
        )
        .with_entry("n", n)
    }

    fn seq(event: &StageEvent) -> u64 {
        event.data["n"].as_u64().unwrap()
    }

    #[tokio::test]
    async fn per_subscriber_order_matches_publication_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().unwrap();

        for n in 0..5 {
            bus.publish(&event(n));
        }
        for n in 0..5 {
            assert_eq!(seq(&sub.recv().await.unwrap()), n);
        }
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::with_capacity(3);
        let mut sub = bus.subscribe().unwrap();

        for n in 0..5 {
            bus.publish(&event(n));
        }

        // 0 and 1 were dropped, 2..5 remain
        assert_eq!(sub.dropped(), 2);
        assert_eq!(seq(&sub.recv().await.unwrap()), 2);
        assert_eq!(seq(&sub.recv().await.unwrap()), 3);
        assert_eq!(seq(&sub.recv().await.unwrap()), 4);
    }

    #[tokio::test]
    async fn fan_out_reaches_all_subscribers() {
        let bus = EventBus::new();
        let mut a = bus.subscribe().unwrap();
        let mut b = bus.subscribe().unwrap();

        bus.publish(&event(7));

        assert_eq!(seq(&a.recv().await.unwrap()), 7);
        assert_eq!(seq(&b.recv().await.unwrap()), 7);
    }

    #[tokio::test]
    async fn slow_subscriber_does_not_affect_others() {
        let bus = EventBus::with_capacity(2);
        let mut fast = bus.subscribe().unwrap();
        let slow = bus.subscribe().unwrap();

        for n in 0..10 {
            bus.publish(&event(n));
            assert_eq!(seq(&fast.recv().await.unwrap()), n);
        }

        assert_eq!(fast.dropped(), 0);
        assert_eq!(slow.dropped(), 8);
    }

    #[tokio::test]
    async fn close_drains_then_ends() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().unwrap();

        bus.publish(&event(1));
        bus.close();
        // queued event still delivered
        assert_eq!(seq(&sub.recv().await.unwrap()), 1);
        assert!(sub.recv().await.is_none());
        // publish after close is a no-op
        bus.publish(&event(2));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscribe_after_close_fails() {
        let bus = EventBus::new();
        bus.close();
        assert!(matches!(bus.subscribe(), Err(BusError::Closed)));
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_releases_queue() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe().unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_wakes_on_late_publish() {
        let bus = Arc::new(EventBus::new());
        let mut sub = bus.subscribe().unwrap();

        let publisher = bus.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            publisher.publish(&event(99));
        });

        let received = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            sub.recv(),
        )
        .await
        .expect("recv timed out")
        .unwrap();
        assert_eq!(seq(&received), 99);
        handle.await.unwrap();
    }
}
