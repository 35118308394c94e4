//! Message distribution.
//!
//! `distribute` enqueues the message; the worker resolves the recipients
//! from the subscription snapshot current at dispatch time and hands the
//! message to each owning adapter. Delivery is best-effort and isolated per
//! adapter: one failing or panicking adapter never stops the others.

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;
use tracing::{debug, error, warn};

use crate::broker::message::Message;
use crate::broker::subscriber::Subscriber;
use crate::config::BrokerSettings;
use crate::core::service::{ActorService, Service, Task, Worker};
use crate::core::subscription_service::SubscriberView;
use crate::core::topic_service::TopicService;
use crate::persistence::MessageStore;
use crate::protocol::ProtocolRegistry;
use crate::utils::{BrokerError, Result};

pub const MESSAGE_SERVICE: &str = "MessageService";

pub enum MessageTask {
    Distribute(Message),
    LatestMessage {
        topic: String,
        reply: oneshot::Sender<Option<Message>>,
    },
}

impl Task for MessageTask {
    fn kind(&self) -> &'static str {
        match self {
            MessageTask::Distribute(_) => "DISTRIBUTE_MESSAGE",
            MessageTask::LatestMessage { .. } => "LATEST_MESSAGE",
        }
    }
}

struct MessageWorker {
    broadcast_system_messages: bool,
    cache_messages: bool,
    latest: HashMap<String, Message>,
    store: Option<MessageStore>,
    subscribers: SubscriberView,
    protocols: ProtocolRegistry,
    topics: Option<TopicService>,
    distributed: Arc<AtomicU64>,
}

impl MessageWorker {
    fn remember(&mut self, topic: &str, message: &Message) {
        if !self.cache_messages {
            return;
        }
        self.latest.insert(topic.to_string(), message.clone());
        if let Some(store) = &self.store {
            if let Err(e) = store.store_latest(topic, message) {
                error!("Failed to persist latest message for {topic}: {e}");
            }
        }
    }

    fn recipients(&self, message: &Message) -> Vec<Subscriber> {
        let snapshot = self.subscribers.snapshot();
        let now = chrono::Utc::now();
        let candidates = match message.topic() {
            Some(topic) => snapshot.subscribers_for_topic(topic),
            None => snapshot.all_subscribers(),
        };
        candidates
            .into_iter()
            .filter(|s| !s.is_paused() && !s.has_expired(now))
            .collect()
    }

    fn distribute(&mut self, message: Message) {
        match message.topic() {
            Some(topic) => {
                let topic = topic.to_string();
                if let Some(topics) = &self.topics {
                    // already logged by the queue on failure
                    let _ = topics.request_topic(&topic);
                }
                self.remember(&topic, &message);
            }
            None if !self.broadcast_system_messages => {
                debug!(
                    "System message {} not broadcast (disabled)",
                    message.message_id()
                );
                return;
            }
            None => {}
        }

        let recipients = self.recipients(&message);
        if recipients.is_empty() {
            debug!(
                "No subscribers for {}",
                message.topic().unwrap_or("<system>")
            );
            return;
        }

        // one hand-off per adapter: it fans out to its own consumers
        let protocols: BTreeSet<&str> = recipients.iter().map(|s| s.origin_protocol()).collect();
        for protocol in protocols {
            let Some(server) = self.protocols.get(protocol) else {
                warn!("No protocol server registered for '{protocol}', skipping its subscribers");
                continue;
            };
            match catch_unwind(AssertUnwindSafe(|| server.send_message(&message))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Distribution via {protocol} failed: {e}"),
                Err(_) => error!("{protocol} panicked while sending message {}", message.message_id()),
            }
        }
        self.distributed.fetch_add(1, Ordering::Relaxed);
    }
}

impl Worker for MessageWorker {
    type Task = MessageTask;

    fn handle(&mut self, task: MessageTask) {
        match task {
            MessageTask::Distribute(message) => self.distribute(message),
            MessageTask::LatestMessage { topic, reply } => {
                let _ = reply.send(self.latest.get(&topic).cloned());
            }
        }
    }
}

/// Fans inbound messages out to every matching subscriber's adapter.
#[derive(Clone)]
pub struct MessageService {
    actor: Arc<ActorService<MessageWorker>>,
    distributed: Arc<AtomicU64>,
}

impl MessageService {
    /// `topics`, when given, is asked to create the topic of every published
    /// message. `store` makes the last-message cache durable; its entries are
    /// loaded back into the cache here.
    pub fn new(
        settings: &BrokerSettings,
        subscribers: SubscriberView,
        protocols: ProtocolRegistry,
        topics: Option<TopicService>,
        store: Option<MessageStore>,
    ) -> Result<Self> {
        let latest = match (&store, settings.cache_messages) {
            (Some(store), true) => store.load_all()?,
            _ => HashMap::new(),
        };
        let distributed = Arc::new(AtomicU64::new(0));
        let worker = MessageWorker {
            broadcast_system_messages: settings.broadcast_system_messages,
            cache_messages: settings.cache_messages,
            latest,
            store,
            subscribers,
            protocols,
            topics,
            distributed: distributed.clone(),
        };
        Ok(Self {
            actor: Arc::new(ActorService::new(
                MESSAGE_SERVICE,
                worker,
                settings.queue_capacity,
            )),
            distributed,
        })
    }

    /// Queues `message` for distribution.
    pub async fn distribute(&self, message: Message) -> Result<()> {
        self.actor
            .queue()
            .submit(MessageTask::Distribute(message))
            .await
    }

    /// Most recent message published on `topic`, when caching is enabled.
    pub async fn latest_message(&self, topic: &str) -> Result<Option<Message>> {
        let (tx, rx) = oneshot::channel();
        self.actor
            .queue()
            .submit(MessageTask::LatestMessage {
                topic: topic.to_string(),
                reply: tx,
            })
            .await?;
        rx.await.map_err(|_| BrokerError::QueueClosed {
            service: MESSAGE_SERVICE,
        })
    }

    pub async fn flush(&self) -> Result<()> {
        self.actor.queue().flush().await
    }

    /// Messages the worker has dispatched to at least one adapter.
    pub fn distributed_count(&self) -> u64 {
        self.distributed.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Service for MessageService {
    fn name(&self) -> &'static str {
        MESSAGE_SERVICE
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
