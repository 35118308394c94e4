//! Hierarchical topic namespace.
//!
//! Matching is exact-path only. Wildcard syntax (`+`, `#`, XPath-like WSN
//! expressions) is expanded by the protocol adapters before calling in.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::broker::topic::{TOPIC_SEPARATOR, Topic, normalize, segments};
use crate::config::BrokerSettings;
use crate::core::events::{
    ListenerId, ListenerSet, TopicChangeEvent, TopicChangeKind, TopicChangeListener,
};
use crate::core::service::{ActorService, Service, Task, Worker};
use crate::core::subscription_service::SubscriberView;
use crate::utils::{BrokerError, Result};

pub const TOPIC_SERVICE: &str = "TopicService";

type Reply<T> = Option<oneshot::Sender<Result<T>>>;

pub enum TopicTask {
    NewTopic { path: String, reply: Reply<Topic> },
    DeleteTopic { path: String, reply: Reply<Topic> },
}

impl Task for TopicTask {
    fn kind(&self) -> &'static str {
        match self {
            TopicTask::NewTopic { .. } => "NEW_TOPIC",
            TopicTask::DeleteTopic { .. } => "DELETE_TOPIC",
        }
    }
}

/// Point-in-time copy of the namespace, keyed by full path. Cloning shares
/// structure with the worker's map.
#[derive(Debug, Clone, Default)]
pub struct TopicRegistry {
    topics: im::HashMap<String, Topic>,
}

impl TopicRegistry {
    pub fn get(&self, path: &str) -> Option<&Topic> {
        normalize(path).and_then(|p| self.topics.get(&p))
    }

    pub fn by_id(&self, id: &str) -> Option<&Topic> {
        self.topics.values().find(|t| t.id() == id)
    }

    pub fn all(&self) -> Vec<Topic> {
        self.topics.values().cloned().collect()
    }

    pub fn roots(&self) -> Vec<Topic> {
        self.topics.values().filter(|t| t.is_root()).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

struct TopicWorker {
    registry: TopicRegistry,
    subscribers: Option<SubscriberView>,
    listeners: Arc<ListenerSet<dyn TopicChangeListener>>,
    snapshot: watch::Sender<Arc<TopicRegistry>>,
}

impl TopicWorker {
    fn fire(&self, topic: &Topic, kind: TopicChangeKind) {
        let event = TopicChangeEvent {
            kind,
            topic: topic.clone(),
        };
        self.listeners
            .fire("topic change", |l| l.topic_changed(&event));
    }

    fn add_topic(&mut self, raw: &str) -> Result<Topic> {
        let parts = segments(raw);
        if parts.is_empty() {
            warn!("Rejected empty topic path '{raw}'");
            return Err(BrokerError::InvalidTopic(raw.to_string()));
        }

        let mut created = Vec::new();
        let mut parent: Option<String> = None;
        for part in parts {
            let path = match parent.as_deref() {
                Some(p) => format!("{p}{TOPIC_SEPARATOR}{part}"),
                None => part.to_string(),
            };
            if !self.registry.topics.contains_key(&path) {
                let node = Topic::new(part, parent.as_deref());
                if let Some(p) = parent.as_deref().and_then(|p| self.registry.topics.get_mut(p)) {
                    p.add_child(&path);
                }
                debug!("Created topic node {path}");
                self.registry.topics.insert(path.clone(), node);
                created.push(path.clone());
            }
            parent = Some(path);
        }

        // parent is the leaf after the loop
        let leaf = parent
            .and_then(|p| self.registry.topics.get(&p).cloned())
            .ok_or_else(|| BrokerError::InvalidTopic(raw.to_string()))?;

        if created.is_empty() {
            debug!("Topic {} already exists", leaf.full_path());
            return Ok(leaf);
        }

        info!("Added topic {}", leaf.full_path());
        self.snapshot.send_replace(Arc::new(self.registry.clone()));
        for path in created {
            if let Some(topic) = self.registry.topics.get(&path) {
                self.fire(topic, TopicChangeKind::New);
            }
        }
        Ok(leaf)
    }

    fn delete_topic(&mut self, raw: &str) -> Result<Topic> {
        let Some(path) = normalize(raw) else {
            return Err(BrokerError::InvalidTopic(raw.to_string()));
        };
        let Some(topic) = self.registry.topics.get(&path) else {
            warn!("Attempt to delete a topic that does not exist: {path}");
            return Err(BrokerError::TopicNotFound(path));
        };
        if !topic.is_leaf() {
            warn!("Refusing to delete topic {path}: it has child topics");
            return Err(BrokerError::TopicHasChildren(path));
        }
        if self
            .subscribers
            .as_ref()
            .is_some_and(|view| view.snapshot().has_subscribers(&path))
        {
            warn!("Refusing to delete topic {path}: it has active subscribers");
            return Err(BrokerError::TopicHasSubscribers(path));
        }

        let Some(topic) = self.registry.topics.remove(&path) else {
            return Err(BrokerError::TopicNotFound(path));
        };
        if let Some(parent) = topic.parent().and_then(|p| self.registry.topics.get_mut(p)) {
            parent.remove_child(&path);
        }
        info!("Deleted topic {path}");
        self.snapshot.send_replace(Arc::new(self.registry.clone()));
        self.fire(&topic, TopicChangeKind::Delete);
        Ok(topic)
    }
}

impl Worker for TopicWorker {
    type Task = TopicTask;

    fn handle(&mut self, task: TopicTask) {
        match task {
            TopicTask::NewTopic { path, reply } => {
                let result = self.add_topic(&path);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
            TopicTask::DeleteTopic { path, reply } => {
                let result = self.delete_topic(&path);
                if let Some(reply) = reply {
                    let _ = reply.send(result);
                }
            }
        }
    }
}

/// Owner of the topic namespace.
#[derive(Clone)]
pub struct TopicService {
    actor: Arc<ActorService<TopicWorker>>,
    view: watch::Receiver<Arc<TopicRegistry>>,
    listeners: Arc<ListenerSet<dyn TopicChangeListener>>,
}

impl TopicService {
    /// `subscribers` lets `delete_topic` refuse topics that still have
    /// active subscribers. Without it only the child check applies.
    pub fn new(settings: &BrokerSettings, subscribers: Option<SubscriberView>) -> Self {
        let (snapshot, view) = watch::channel(Arc::new(TopicRegistry::default()));
        let listeners: Arc<ListenerSet<dyn TopicChangeListener>> =
            Arc::new(ListenerSet::default());
        let worker = TopicWorker {
            registry: TopicRegistry::default(),
            subscribers,
            listeners: listeners.clone(),
            snapshot,
        };
        Self {
            actor: Arc::new(ActorService::new(
                TOPIC_SERVICE,
                worker,
                settings.queue_capacity,
            )),
            view,
            listeners,
        }
    }

    /// Creates every missing node along `path` and returns the leaf.
    pub async fn add_topic(&self, path: &str) -> Result<Topic> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .queue()
            .submit(TopicTask::NewTopic {
                path: path.to_string(),
                reply: Some(tx),
            })
            .await?;
        rx.await.map_err(|_| BrokerError::QueueClosed {
            service: TOPIC_SERVICE,
        })?
    }

    /// Fire-and-forget variant of `add_topic` that never waits, for use
    /// from listener callbacks and other workers.
    pub fn request_topic(&self, path: &str) -> Result<()> {
        self.actor.queue().try_submit(TopicTask::NewTopic {
            path: path.to_string(),
            reply: None,
        })
    }

    /// Removes a childless topic without active subscribers.
    pub async fn delete_topic(&self, path: &str) -> Result<Topic> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .queue()
            .submit(TopicTask::DeleteTopic {
                path: path.to_string(),
                reply: Some(tx),
            })
            .await?;
        rx.await.map_err(|_| BrokerError::QueueClosed {
            service: TOPIC_SERVICE,
        })?
    }

    pub async fn flush(&self) -> Result<()> {
        self.actor.queue().flush().await
    }

    pub fn snapshot(&self) -> Arc<TopicRegistry> {
        self.view.borrow().clone()
    }

    pub fn topic(&self, path: &str) -> Option<Topic> {
        self.snapshot().get(path).cloned()
    }

    pub fn topic_by_id(&self, id: &str) -> Option<Topic> {
        self.snapshot().by_id(id).cloned()
    }

    pub fn all_topics(&self) -> Vec<Topic> {
        self.snapshot().all()
    }

    pub fn add_topic_change_listener(&self, listener: Arc<dyn TopicChangeListener>) -> ListenerId {
        self.listeners.add(listener)
    }

    pub fn remove_topic_change_listener(&self, id: ListenerId) -> bool {
        self.listeners.remove(id)
    }
}

#[async_trait]
impl Service for TopicService {
    fn name(&self) -> &'static str {
        TOPIC_SERVICE
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
