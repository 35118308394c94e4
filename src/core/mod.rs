//! The `core` module hosts the protocol-agnostic heart of the broker: the
//! actor-service base, the three registries (topics, subscriptions,
//! messages), the change events they emit and the orchestrator that boots
//! and stops them together with the protocol adapters.

pub mod core_service;
pub mod events;
pub mod message_service;
pub mod service;
pub mod subscription_service;
pub mod topic_service;

pub use core_service::{BrokerStats, CoreService};
pub use events::{
    ListenerId, PublisherChangeEvent, PublisherChangeKind, PublisherChangeListener,
    SubscriptionChangeEvent, SubscriptionChangeKind, SubscriptionChangeListener, TopicChangeEvent,
    TopicChangeKind, TopicChangeListener,
};
pub use message_service::MessageService;
pub use service::Service;
pub use subscription_service::{SubscriberView, SubscriptionRegistry, SubscriptionService};
pub use topic_service::{TopicRegistry, TopicService};
