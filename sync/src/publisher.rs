//! Event publisher.
//!
//! Fans data store events out to subscribers. Every subscriber has its own
//! bounded buffer: when a slow subscriber's buffer is full the oldest event
//! is dropped and the subscriber is told how many it missed, so publishing
//! never waits on a subscriber.

use crate::error::ApiError;
use crate::state::EngineState;
use dashmap::DashMap;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tether_engine::{ModelName, MutationEvent, Origin, Version};
use tokio::sync::Notify;

/// Counts of what one base sync of a model did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModelSyncStats {
    pub model: ModelName,
    pub full_sync: bool,
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    /// Remote records already known, out of date or superseded locally
    pub dropped: usize,
}

/// Everything observable about the data store.
#[derive(Debug, Clone, PartialEq)]
pub enum DataStoreEvent {
    /// A record changed locally or was changed by the remote
    Mutation {
        event: MutationEvent,
        origin: Origin,
    },
    OutboxMutationEnqueued {
        event: MutationEvent,
    },
    /// The remote accepted a local mutation
    OutboxMutationProcessed {
        event: MutationEvent,
        version: Version,
    },
    OutboxStatus {
        is_empty: bool,
    },
    /// The remote rejected a mutation because its condition did not hold
    ConditionalSaveFailed {
        event: MutationEvent,
    },
    /// A mutation was dropped from the outbox without reaching the remote
    MutationFailed {
        event: MutationEvent,
        error: ApiError,
        /// The failure was transient but the entry ran out of attempts
        retryable: bool,
    },
    SyncQueriesStarted {
        models: Vec<ModelName>,
    },
    ModelSynced {
        stats: ModelSyncStats,
    },
    SyncQueriesReady,
    SubscriptionsEstablished,
    /// Base sync finished and subscriptions are live
    Ready,
    NetworkStatus {
        active: bool,
    },
    StateChanged(EngineState),
    SyncFailed {
        error: String,
        fatal: bool,
    },
}

/// What a subscriber receives.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Event(DataStoreEvent),
    /// This many events were dropped because the subscriber fell behind
    Missed(u64),
}

/// Selects the events a subscriber is interested in.
pub type EventFilter = Arc<dyn Fn(&DataStoreEvent) -> bool + Send + Sync>;

#[derive(Default)]
struct Buffer {
    events: VecDeque<DataStoreEvent>,
    missed: u64,
    closed: bool,
}

struct Subscriber {
    filter: EventFilter,
    buffer: Mutex<Buffer>,
    notify: Notify,
}

impl Subscriber {
    fn close(&self) {
        self.buffer.lock().closed = true;
        self.notify.notify_one();
    }
}

struct Inner {
    subscribers: DashMap<u64, Arc<Subscriber>>,
    next_id: AtomicU64,
    capacity: usize,
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.subscribers.iter() {
            entry.value().close();
        }
    }
}

/// Publishes [`DataStoreEvent`]s to subscribers.
///
/// Cloning shares the subscriber set. Subscriptions end once every clone is
/// dropped.
#[derive(Clone)]
pub struct EventPublisher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher")
            .field("subscribers", &self.inner.subscribers.len())
            .field("capacity", &self.inner.capacity)
            .finish()
    }
}

impl EventPublisher {
    /// Create a publisher buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                subscribers: DashMap::new(),
                next_id: AtomicU64::new(1),
                capacity: capacity.max(1),
            }),
        }
    }

    /// Subscribe to events accepted by `filter`.
    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let subscriber = Arc::new(Subscriber {
            filter,
            buffer: Mutex::new(Buffer::default()),
            notify: Notify::new(),
        });
        self.inner.subscribers.insert(id, subscriber.clone());

        tracing::debug!(subscription = id, "Subscriber registered");

        Subscription {
            id,
            subscriber,
            publisher: Arc::downgrade(&self.inner),
        }
    }

    /// Subscribe to every event.
    pub fn subscribe_all(&self) -> Subscription {
        self.subscribe(Arc::new(|_| true))
    }

    /// Deliver an event to every interested subscriber.
    ///
    /// Returns the number of subscribers that received it.
    pub fn publish(&self, event: DataStoreEvent) -> usize {
        let mut delivered = 0;

        for entry in self.inner.subscribers.iter() {
            let subscriber = entry.value();
            if !(subscriber.filter)(&event) {
                continue;
            }

            {
                let mut buffer = subscriber.buffer.lock();
                if buffer.events.len() >= self.inner.capacity {
                    buffer.events.pop_front();
                    buffer.missed += 1;
                }
                buffer.events.push_back(event.clone());
            }
            subscriber.notify.notify_one();
            delivered += 1;
        }

        tracing::trace!(recipients = delivered, "Published event");

        delivered
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.len()
    }
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    subscriber: Arc<Subscriber>,
    publisher: Weak<Inner>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Subscription {
    /// Wait for the next delivery. Returns `None` once the publisher is gone
    /// and the buffer is drained.
    pub async fn recv(&mut self) -> Option<Delivery> {
        loop {
            if let Some(delivery) = self.try_take() {
                return delivery;
            }
            self.subscriber.notify.notified().await;
        }
    }

    /// Take the next delivery without waiting.
    pub fn try_recv(&mut self) -> Option<Delivery> {
        self.try_take().flatten()
    }

    /// Receive events as a stream.
    pub fn into_stream(self) -> impl Stream<Item = Delivery> + Send + 'static {
        futures::stream::unfold(self, |mut subscription| async move {
            let delivery = subscription.recv().await?;
            Some((delivery, subscription))
        })
    }

    /// Outer `None`: nothing yet. Inner `None`: closed and drained.
    fn try_take(&self) -> Option<Option<Delivery>> {
        let mut buffer = self.subscriber.buffer.lock();
        if buffer.missed > 0 {
            let missed = std::mem::take(&mut buffer.missed);
            return Some(Some(Delivery::Missed(missed)));
        }
        if let Some(event) = buffer.events.pop_front() {
            return Some(Some(Delivery::Event(event)));
        }
        if buffer.closed {
            return Some(None);
        }
        None
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.publisher.upgrade() {
            inner.subscribers.remove(&self.id);
            tracing::debug!(subscription = self.id, "Subscriber removed");
        }
    }
}
