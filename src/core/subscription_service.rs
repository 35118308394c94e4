//! Subscriber and publisher registries.
//!
//! The public API only enqueues tasks. The worker checks membership, applies
//! the mutation, logs it and then notifies every registered listener, all on
//! its own execution context. Duplicate or unknown entries are logged and
//! ignored. Reads go through an immutable snapshot. The registries are
//! persistent maps, so a snapshot shares structure with the live state and
//! costs O(1) to take. The worker republishes it and fires the queued change
//! events once per batch of tasks, see `Worker::settle`.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

use crate::broker::subscriber::{EndpointKey, PAUSED_ATTRIBUTE, Publisher, Subscriber};
use crate::config::BrokerSettings;
use crate::core::events::{
    ListenerId, ListenerSet, PublisherChangeEvent, PublisherChangeKind, PublisherChangeListener,
    SubscriptionChangeEvent, SubscriptionChangeKind, SubscriptionChangeListener,
};
use crate::core::service::{ActorService, Service, Task, Worker};
use crate::utils::Result;

pub const SUBSCRIPTION_SERVICE: &str = "SubscriptionService";

#[derive(Debug)]
pub enum SubscriptionTask {
    NewSubscriber(Subscriber),
    DeleteSubscriber(EndpointKey),
    RenewSubscriber {
        key: EndpointKey,
        timeout: DateTime<Utc>,
    },
    PauseSubscriber(EndpointKey),
    NewPublisher(Publisher),
    DeletePublisher(EndpointKey),
}

impl Task for SubscriptionTask {
    fn kind(&self) -> &'static str {
        match self {
            SubscriptionTask::NewSubscriber(_) => "NEW_SUBSCRIBER",
            SubscriptionTask::DeleteSubscriber(_) => "DELETE_SUBSCRIBER",
            SubscriptionTask::RenewSubscriber { .. } => "RENEW_SUBSCRIBER",
            SubscriptionTask::PauseSubscriber(_) => "PAUSE_SUBSCRIBER",
            SubscriptionTask::NewPublisher(_) => "NEW_PUBLISHER",
            SubscriptionTask::DeletePublisher(_) => "DELETE_PUBLISHER",
        }
    }
}

/// Point-in-time copy of both registries.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionRegistry {
    subscribers: im::HashMap<EndpointKey, Subscriber>,
    by_topic: im::HashMap<String, im::HashSet<EndpointKey>>,
    publishers: im::HashMap<EndpointKey, Publisher>,
}

impl SubscriptionRegistry {
    pub fn all_subscribers(&self) -> Vec<Subscriber> {
        self.subscribers.values().cloned().collect()
    }

    pub fn subscribers_for_topic(&self, topic: &str) -> Vec<Subscriber> {
        self.by_topic
            .get(topic)
            .map(|keys| {
                keys.iter()
                    .filter_map(|key| self.subscribers.get(key))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_subscribers(&self, topic: &str) -> bool {
        self.by_topic.get(topic).is_some_and(|keys| !keys.is_empty())
    }

    pub fn subscriber(&self, host: &str, port: u16, topic: &str) -> Option<Subscriber> {
        self.subscribers
            .get(&EndpointKey::new(host, port, topic))
            .cloned()
    }

    pub fn subscriber_by_id(&self, id: &str) -> Option<Subscriber> {
        self.subscribers.values().find(|s| s.id() == id).cloned()
    }

    pub fn contains_subscriber(&self, key: &EndpointKey) -> bool {
        self.subscribers.contains_key(key)
    }

    pub fn all_publishers(&self) -> Vec<Publisher> {
        self.publishers.values().cloned().collect()
    }

    pub fn publisher(&self, host: &str, port: u16, topic: &str) -> Option<Publisher> {
        self.publishers
            .get(&EndpointKey::new(host, port, topic))
            .cloned()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.len()
    }

    fn insert_subscriber(&mut self, subscriber: Subscriber) {
        let key = subscriber.key().clone();
        self.by_topic
            .entry(key.topic.clone())
            .or_insert_with(im::HashSet::new)
            .insert(key.clone());
        self.subscribers.insert(key, subscriber);
    }

    fn remove_subscriber(&mut self, key: &EndpointKey) -> Option<Subscriber> {
        let removed = self.subscribers.remove(key)?;
        let emptied = self.by_topic.get_mut(&key.topic).is_some_and(|keys| {
            keys.remove(key);
            keys.is_empty()
        });
        if emptied {
            self.by_topic.remove(&key.topic);
        }
        Some(removed)
    }
}

/// Cloneable read handle over the latest `SubscriptionRegistry` snapshot.
#[derive(Debug, Clone)]
pub struct SubscriberView {
    rx: watch::Receiver<Arc<SubscriptionRegistry>>,
}

impl SubscriberView {
    pub fn snapshot(&self) -> Arc<SubscriptionRegistry> {
        self.rx.borrow().clone()
    }
}

enum PendingEvent {
    Subscription(SubscriptionChangeEvent),
    Publisher(PublisherChangeEvent),
}

struct SubscriptionWorker {
    registry: SubscriptionRegistry,
    subscription_ttl: Option<TimeDelta>,
    publisher_ttl: Option<TimeDelta>,
    subscription_listeners: Arc<ListenerSet<dyn SubscriptionChangeListener>>,
    publisher_listeners: Arc<ListenerSet<dyn PublisherChangeListener>>,
    snapshot: watch::Sender<Arc<SubscriptionRegistry>>,
    dirty: bool,
    pending: Vec<PendingEvent>,
}

pub(crate) fn ttl_from_secs(secs: u64) -> Option<TimeDelta> {
    if secs == 0 {
        return None;
    }
    i64::try_from(secs).ok().and_then(TimeDelta::try_seconds)
}

impl SubscriptionWorker {
    fn subscription_changed(&mut self, subscriber: Subscriber, kind: SubscriptionChangeKind) {
        self.dirty = true;
        self.pending
            .push(PendingEvent::Subscription(SubscriptionChangeEvent { kind, subscriber }));
    }

    fn publisher_changed(&mut self, publisher: Publisher, kind: PublisherChangeKind) {
        self.dirty = true;
        self.pending
            .push(PendingEvent::Publisher(PublisherChangeEvent { kind, publisher }));
    }

    fn add_subscriber(&mut self, mut subscriber: Subscriber) {
        if self.registry.subscribers.contains_key(subscriber.key()) {
            warn!("Attempt to add a subscriber that already exists: {subscriber}");
            return;
        }
        if subscriber.timeout().is_none() {
            if let Some(expiry) = self
                .subscription_ttl
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            {
                subscriber.set_timeout(expiry);
            }
        }
        info!("Added new subscriber: {subscriber}");
        self.registry.insert_subscriber(subscriber.clone());
        self.subscription_changed(subscriber, SubscriptionChangeKind::Subscribe);
    }

    fn remove_subscriber(&mut self, key: &EndpointKey) {
        let Some(subscriber) = self.registry.remove_subscriber(key) else {
            warn!("Attempt to remove a subscriber that did not exist: {key}");
            return;
        };
        info!("Removed subscriber: {subscriber}");
        self.subscription_changed(subscriber, SubscriptionChangeKind::Unsubscribe);
    }

    fn renew_subscriber(&mut self, key: &EndpointKey, timeout: DateTime<Utc>) {
        let Some(subscriber) = self.registry.subscribers.get_mut(key) else {
            warn!("Attempt to renew a subscriber that does not exist in the service: {key}");
            return;
        };
        subscriber.set_timeout(timeout);
        let subscriber = subscriber.clone();
        info!("Renewed subscriber: {subscriber} until {timeout}");
        self.subscription_changed(subscriber, SubscriptionChangeKind::Renew);
    }

    fn pause_subscriber(&mut self, key: &EndpointKey) {
        let Some(subscriber) = self.registry.subscribers.get_mut(key) else {
            warn!("Attempt to pause a subscriber that does not exist in the service: {key}");
            return;
        };
        subscriber.set_attribute(PAUSED_ATTRIBUTE, "true");
        let subscriber = subscriber.clone();
        info!("Paused subscriber: {subscriber}");
        self.subscription_changed(subscriber, SubscriptionChangeKind::Pause);
    }

    fn add_publisher(&mut self, mut publisher: Publisher) {
        if self.registry.publishers.contains_key(publisher.key()) {
            warn!("Attempt to add a publisher that already exists: {publisher}");
            return;
        }
        if publisher.timeout().is_none() {
            if let Some(expiry) = self
                .publisher_ttl
                .and_then(|ttl| Utc::now().checked_add_signed(ttl))
            {
                publisher.set_timeout(expiry);
            }
        }
        info!("Added publisher: {publisher}");
        self.registry
            .publishers
            .insert(publisher.key().clone(), publisher.clone());
        self.publisher_changed(publisher, PublisherChangeKind::Register);
    }

    fn remove_publisher(&mut self, key: &EndpointKey) {
        let Some(publisher) = self.registry.publishers.remove(key) else {
            warn!("Attempt to remove a publisher that did not exist: {key}");
            return;
        };
        info!("Removed publisher: {publisher}");
        self.publisher_changed(publisher, PublisherChangeKind::Unregister);
    }

    fn purge_expired(&mut self, now: DateTime<Utc>) {
        let expired_subs: Vec<EndpointKey> = self
            .registry
            .subscribers
            .values()
            .filter(|s| s.has_expired(now))
            .map(|s| s.key().clone())
            .collect();
        let expired_pubs: Vec<EndpointKey> = self
            .registry
            .publishers
            .values()
            .filter(|p| p.has_expired(now))
            .map(|p| p.key().clone())
            .collect();

        for key in expired_subs {
            info!("Subscription {key} expired");
            self.remove_subscriber(&key);
        }
        for key in expired_pubs {
            info!("Publisher registration {key} expired");
            self.remove_publisher(&key);
        }
    }
}

impl Worker for SubscriptionWorker {
    type Task = SubscriptionTask;

    fn handle(&mut self, task: SubscriptionTask) {
        match task {
            SubscriptionTask::NewSubscriber(s) => self.add_subscriber(s),
            SubscriptionTask::DeleteSubscriber(key) => self.remove_subscriber(&key),
            SubscriptionTask::RenewSubscriber { key, timeout } => {
                self.renew_subscriber(&key, timeout)
            }
            SubscriptionTask::PauseSubscriber(key) => self.pause_subscriber(&key),
            SubscriptionTask::NewPublisher(p) => self.add_publisher(p),
            SubscriptionTask::DeletePublisher(key) => self.remove_publisher(&key),
        }
    }

    fn tick(&mut self) {
        self.purge_expired(Utc::now());
    }

    /// Publishes the snapshot, then fires the events of the batch in order.
    fn settle(&mut self) {
        if std::mem::take(&mut self.dirty) {
            self.snapshot.send_replace(Arc::new(self.registry.clone()));
        }
        for event in std::mem::take(&mut self.pending) {
            match event {
                PendingEvent::Subscription(event) => self
                    .subscription_listeners
                    .fire("subscription change", |l| l.subscription_changed(&event)),
                PendingEvent::Publisher(event) => self
                    .publisher_listeners
                    .fire("publisher change", |l| l.publisher_changed(&event)),
            }
        }
    }
}

/// Owner of the subscriber and publisher registries.
#[derive(Clone)]
pub struct SubscriptionService {
    actor: Arc<ActorService<SubscriptionWorker>>,
    view: SubscriberView,
    subscription_listeners: Arc<ListenerSet<dyn SubscriptionChangeListener>>,
    publisher_listeners: Arc<ListenerSet<dyn PublisherChangeListener>>,
}

impl SubscriptionService {
    pub fn new(settings: &BrokerSettings) -> Self {
        let (snapshot, rx) = watch::channel(Arc::new(SubscriptionRegistry::default()));
        let subscription_listeners: Arc<ListenerSet<dyn SubscriptionChangeListener>> =
            Arc::new(ListenerSet::default());
        let publisher_listeners: Arc<ListenerSet<dyn PublisherChangeListener>> =
            Arc::new(ListenerSet::default());

        let worker = SubscriptionWorker {
            registry: SubscriptionRegistry::default(),
            subscription_ttl: ttl_from_secs(settings.default_subscription_ttl_secs),
            publisher_ttl: ttl_from_secs(settings.default_publisher_ttl_secs),
            subscription_listeners: subscription_listeners.clone(),
            publisher_listeners: publisher_listeners.clone(),
            snapshot,
            dirty: false,
            pending: Vec::new(),
        };
        let actor = ActorService::new(SUBSCRIPTION_SERVICE, worker, settings.queue_capacity)
            .with_tick(Duration::from_millis(settings.expiry_sweep_interval_ms));

        Self {
            actor: Arc::new(actor),
            view: SubscriberView { rx },
            subscription_listeners,
            publisher_listeners,
        }
    }

    pub async fn add_subscriber(&self, subscriber: Subscriber) -> Result<()> {
        self.actor
            .queue()
            .submit(SubscriptionTask::NewSubscriber(subscriber))
            .await
    }

    pub async fn remove_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        self.actor
            .queue()
            .submit(SubscriptionTask::DeleteSubscriber(subscriber.key().clone()))
            .await
    }

    /// Non-waiting variant of `remove_subscriber`, usable from `Drop` and
    /// listener callbacks. Fails with `QueueFull` instead of waiting.
    pub fn try_remove_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        self.actor
            .queue()
            .try_submit(SubscriptionTask::DeleteSubscriber(subscriber.key().clone()))
    }

    /// Moves the expiry of an existing subscriber to `timeout`.
    pub async fn renew_subscriber(
        &self,
        subscriber: &Subscriber,
        timeout: DateTime<Utc>,
    ) -> Result<()> {
        self.actor
            .queue()
            .submit(SubscriptionTask::RenewSubscriber {
                key: subscriber.key().clone(),
                timeout,
            })
            .await
    }

    pub async fn pause_subscriber(&self, subscriber: &Subscriber) -> Result<()> {
        self.actor
            .queue()
            .submit(SubscriptionTask::PauseSubscriber(subscriber.key().clone()))
            .await
    }

    pub async fn add_publisher(&self, publisher: Publisher) -> Result<()> {
        self.actor
            .queue()
            .submit(SubscriptionTask::NewPublisher(publisher))
            .await
    }

    pub async fn remove_publisher(&self, publisher: &Publisher) -> Result<()> {
        self.actor
            .queue()
            .submit(SubscriptionTask::DeletePublisher(publisher.key().clone()))
            .await
    }

    /// Waits until every task queued so far has been applied.
    pub async fn flush(&self) -> Result<()> {
        self.actor.queue().flush().await
    }

    pub fn view(&self) -> SubscriberView {
        self.view.clone()
    }

    pub fn all_subscribers(&self) -> Vec<Subscriber> {
        self.view.snapshot().all_subscribers()
    }

    pub fn subscribers_for_topic(&self, topic: &str) -> Vec<Subscriber> {
        self.view.snapshot().subscribers_for_topic(topic)
    }

    pub fn subscriber(&self, host: &str, port: u16, topic: &str) -> Option<Subscriber> {
        self.view.snapshot().subscriber(host, port, topic)
    }

    pub fn subscriber_by_id(&self, id: &str) -> Option<Subscriber> {
        self.view.snapshot().subscriber_by_id(id)
    }

    pub fn all_publishers(&self) -> Vec<Publisher> {
        self.view.snapshot().all_publishers()
    }

    pub fn publisher(&self, host: &str, port: u16, topic: &str) -> Option<Publisher> {
        self.view.snapshot().publisher(host, port, topic)
    }

    pub fn add_subscription_change_listener(
        &self,
        listener: Arc<dyn SubscriptionChangeListener>,
    ) -> ListenerId {
        self.subscription_listeners.add(listener)
    }

    pub fn remove_subscription_change_listener(&self, id: ListenerId) -> bool {
        self.subscription_listeners.remove(id)
    }

    pub fn add_publisher_change_listener(
        &self,
        listener: Arc<dyn PublisherChangeListener>,
    ) -> ListenerId {
        self.publisher_listeners.add(listener)
    }

    pub fn remove_publisher_change_listener(&self, id: ListenerId) -> bool {
        self.publisher_listeners.remove(id)
    }
}

#[async_trait]
impl Service for SubscriptionService {
    fn name(&self) -> &'static str {
        SUBSCRIPTION_SERVICE
    }

    fn boot(&self) -> Result<()> {
        self.actor.boot()
    }

    async fn stop(&self) {
        self.actor.stop().await
    }

    fn is_running(&self) -> bool {
        self.actor.is_running()
    }
}
