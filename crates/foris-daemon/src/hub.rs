//! Notification hub.
//!
//! Process-wide fan-out of notification envelopes. Every subscriber owns
//! a bounded FIFO queue; [`NotificationHub::publish`] appends to each
//! admitted queue without ever blocking on a slow consumer. On overflow
//! the oldest entry is dropped with a logged warning — notifications are
//! lossy hints, subscribers reconcile through requests.
//!
//! Delivery is ordered per subscriber (publish order on one thread) and
//! best-effort across subscribers.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use foris_core::Message;
use tokio::sync::Notify;
use tracing::warn;

/// Default bound of one subscriber's queue.
const DEFAULT_QUEUE_CAPACITY: usize = 128;

/// What a subscriber wants to see.
#[derive(Debug, Clone)]
pub enum SubscriptionFilter {
    All,
    /// Only notifications whose `(module, action)` is in the set.
    Selected(HashSet<(String, String)>),
}

impl SubscriptionFilter {
    /// Build a selected filter from `(module, action)` pairs.
    #[must_use]
    pub fn selected<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        Self::Selected(
            pairs
                .into_iter()
                .map(|(m, a)| (m.to_string(), a.to_string()))
                .collect(),
        )
    }

    fn admits(&self, module: &str, action: &str) -> bool {
        match self {
            Self::All => true,
            Self::Selected(pairs) => pairs
                .iter()
                .any(|(m, a)| m == module && a == action),
        }
    }
}

struct SubscriberSlot {
    id: u64,
    filter: SubscriptionFilter,
    capacity: usize,
    queue: Mutex<VecDeque<Message>>,
    notify: Notify,
}

struct HubInner {
    subscribers: Mutex<Vec<Weak<SubscriberSlot>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// Handle to the process-wide notification fan-out.
#[derive(Clone)]
pub struct NotificationHub {
    inner: Arc<HubInner>,
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationHub {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    /// Hub whose subscriber queues hold at most `capacity` entries.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(HubInner {
                subscribers: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                capacity,
            }),
        }
    }

    /// Register a subscriber; the subscription dies with the returned
    /// handle.
    #[must_use]
    pub fn subscribe(&self, filter: SubscriptionFilter) -> Subscription {
        let slot = Arc::new(SubscriberSlot {
            id: self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            filter,
            capacity: self.inner.capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        });
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::downgrade(&slot));
        Subscription { slot }
    }

    /// Deliver `message` to every subscriber whose filter admits it.
    ///
    /// Returns the number of subscribers the message was queued for.
    pub fn publish(&self, message: &Message) -> usize {
        let mut delivered = 0;
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        // Dead subscriptions are pruned on the way through.
        subscribers.retain(|weak| {
            let Some(slot) = weak.upgrade() else {
                return false;
            };
            if slot.filter.admits(&message.module, &message.action) {
                let mut queue = slot.queue.lock().unwrap_or_else(|e| e.into_inner());
                if queue.len() >= slot.capacity {
                    queue.pop_front();
                    warn!(
                        subscriber = slot.id,
                        module = %message.module,
                        action = %message.action,
                        "subscriber queue overflow; dropped oldest notification"
                    );
                }
                queue.push_back(message.clone());
                drop(queue);
                slot.notify.notify_one();
                delivered += 1;
            }
            true
        });
        delivered
    }

    /// Number of live subscriptions (test hook).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }
}

/// One subscriber's receiving side.
pub struct Subscription {
    slot: Arc<SubscriberSlot>,
}

impl Subscription {
    /// Pop the next notification, waiting until one arrives.
    pub async fn recv(&self) -> Message {
        loop {
            let notified = self.slot.notify.notified();
            if let Some(message) = self.try_recv() {
                return message;
            }
            notified.await;
        }
    }

    /// Pop the next notification if one is queued.
    #[must_use]
    pub fn try_recv(&self) -> Option<Message> {
        self.slot
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }
}
