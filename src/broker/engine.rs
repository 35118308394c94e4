use std::sync::Arc;
use tracing::{error, info};

use crate::broker::message::Message;
use crate::config::Settings;
use crate::core::{
    BrokerStats, CoreService, MessageService, SubscriptionChangeEvent, SubscriptionChangeKind,
    SubscriptionService, TopicService,
};
use crate::persistence::MessageStore;
use crate::protocol::{ProtocolRegistry, ProtocolServer};
use crate::utils::Result;

/// Service handles an adapter needs to turn wire traffic into core calls.
///
/// Cheap to clone; every field is a handle onto the same running service.
#[derive(Clone)]
pub struct ServiceHandles {
    pub topics: TopicService,
    pub subscriptions: SubscriptionService,
    pub messages: MessageService,
}

/// Composition root of the broker.
///
/// Builds the three core services, wires them together and registers them
/// with the `CoreService` in boot order: topics, messages, subscriptions.
/// Protocol adapters are added afterwards and booted last.
pub struct Broker {
    settings: Settings,
    handles: ServiceHandles,
    core: CoreService,
    store: Option<MessageStore>,
}

impl Broker {
    /// Builds an unbooted broker. Opens the last-message store when
    /// `broker.cache_path` is configured.
    pub fn new(settings: &Settings) -> Result<Self> {
        let broker_settings = &settings.broker;
        let store = match &broker_settings.cache_path {
            Some(path) => Some(MessageStore::open(path)?),
            None => None,
        };

        let protocols = ProtocolRegistry::default();
        let subscriptions = SubscriptionService::new(broker_settings);
        let topics = TopicService::new(broker_settings, Some(subscriptions.view()));
        let messages = MessageService::new(
            broker_settings,
            subscriptions.view(),
            protocols.clone(),
            Some(topics.clone()),
            store.clone(),
        )?;

        // every subscribed topic exists in the namespace
        let namespace = topics.clone();
        subscriptions.add_subscription_change_listener(Arc::new(
            move |event: &SubscriptionChangeEvent| {
                if event.kind == SubscriptionChangeKind::Subscribe {
                    let _ = namespace.request_topic(event.subscriber.topic());
                }
            },
        ));

        let core = CoreService::new(protocols);
        core.register_service(Arc::new(topics.clone()))?;
        core.register_service(Arc::new(messages.clone()))?;
        core.register_service(Arc::new(subscriptions.clone()))?;

        Ok(Self {
            settings: settings.clone(),
            handles: ServiceHandles {
                topics,
                subscriptions,
                messages,
            },
            core,
            store,
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn handles(&self) -> ServiceHandles {
        self.handles.clone()
    }

    pub fn topics(&self) -> &TopicService {
        &self.handles.topics
    }

    pub fn subscriptions(&self) -> &SubscriptionService {
        &self.handles.subscriptions
    }

    pub fn messages(&self) -> &MessageService {
        &self.handles.messages
    }

    pub fn core(&self) -> &CoreService {
        &self.core
    }

    pub fn add_protocol_server(&self, server: Arc<dyn ProtocolServer>) -> Result<()> {
        self.core.add_protocol_server(server)
    }

    pub async fn boot(&self) -> Result<()> {
        info!("Booting {}...", self.settings.broker.system_name);
        self.core.boot().await
    }

    /// Queues a topic-less message stamped with the configured system name.
    pub async fn system_message(&self, content: &str) -> Result<()> {
        let message = Message::system(content, &self.settings.broker.system_name);
        self.handles.messages.distribute(message).await
    }

    pub fn stats(&self) -> BrokerStats {
        self.core.stats()
    }

    pub async fn shutdown(&self) {
        self.core.shutdown().await;
        if let Some(store) = &self.store {
            if let Err(e) = store.flush() {
                error!("Failed to flush message store: {e}");
            }
        }
        info!("{} stopped", self.settings.broker.system_name);
    }
}
