//! Change events and the listener registries that fan them out.
//!
//! Listeners are invoked synchronously on the worker of the service that
//! applied the mutation, after the snapshot reflecting it was published. A
//! slow listener therefore delays the next task of
//! that service; adapters must not block inside a callback. A panicking
//! listener is caught and logged, the remaining listeners still run.

use parking_lot::Mutex;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::error;

use crate::broker::subscriber::{Publisher, Subscriber};
use crate::broker::topic::Topic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionChangeKind {
    Subscribe,
    Unsubscribe,
    Renew,
    Pause,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublisherChangeKind {
    Register,
    Unregister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicChangeKind {
    New,
    Delete,
}

#[derive(Debug, Clone)]
pub struct SubscriptionChangeEvent {
    pub kind: SubscriptionChangeKind,
    pub subscriber: Subscriber,
}

#[derive(Debug, Clone)]
pub struct PublisherChangeEvent {
    pub kind: PublisherChangeKind,
    pub publisher: Publisher,
}

#[derive(Debug, Clone)]
pub struct TopicChangeEvent {
    pub kind: TopicChangeKind,
    pub topic: Topic,
}

pub trait SubscriptionChangeListener: Send + Sync {
    fn subscription_changed(&self, event: &SubscriptionChangeEvent);
}

pub trait PublisherChangeListener: Send + Sync {
    fn publisher_changed(&self, event: &PublisherChangeEvent);
}

pub trait TopicChangeListener: Send + Sync {
    fn topic_changed(&self, event: &TopicChangeEvent);
}

impl<F> SubscriptionChangeListener for F
where
    F: Fn(&SubscriptionChangeEvent) + Send + Sync,
{
    fn subscription_changed(&self, event: &SubscriptionChangeEvent) {
        self(event)
    }
}

impl<F> PublisherChangeListener for F
where
    F: Fn(&PublisherChangeEvent) + Send + Sync,
{
    fn publisher_changed(&self, event: &PublisherChangeEvent) {
        self(event)
    }
}

impl<F> TopicChangeListener for F
where
    F: Fn(&TopicChangeEvent) + Send + Sync,
{
    fn topic_changed(&self, event: &TopicChangeEvent) {
        self(event)
    }
}

/// Handle returned on registration, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Registry of listener handles of one capability.
///
/// Registration happens under a short lock, independent of any task queue.
/// Firing clones the current list first so callbacks run without the lock
/// held and may themselves (un)register listeners.
pub struct ListenerSet<L: ?Sized> {
    listeners: Mutex<Vec<(ListenerId, Arc<L>)>>,
}

impl<L: ?Sized> Default for ListenerSet<L> {
    fn default() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl<L: ?Sized> fmt::Debug for ListenerSet<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerSet")
            .field("listeners", &self.len())
            .finish()
    }
}

impl<L: ?Sized> ListenerSet<L> {
    pub fn add(&self, listener: Arc<L>) -> ListenerId {
        let id = ListenerId(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Returns false if no listener was registered under `id`.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Invokes `call` once per listener registered right now.
    pub fn fire(&self, what: &str, call: impl Fn(&L)) {
        let current: Vec<(ListenerId, Arc<L>)> = self.listeners.lock().clone();
        for (id, listener) in current {
            if catch_unwind(AssertUnwindSafe(|| call(&listener))).is_err() {
                error!(%id, event = what, "listener panicked while handling event");
            }
        }
    }
}
