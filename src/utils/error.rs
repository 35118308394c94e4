//! The `error` module defines the error type shared by the broker core,
//! its protocol adapters and the ambient layers (configuration, persistence).
//!
//! Mutating service calls are fire-and-forget from the caller's point of view:
//! an `Ok(())` only means the task was accepted into the owning service's
//! queue. What the worker later decides about it is reported through logs and
//! change events.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BrokerError>;

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("task queue of {service} is closed")]
    QueueClosed { service: &'static str },

    #[error("task queue of {service} is full")]
    QueueFull { service: &'static str },

    #[error("{service} has already been booted")]
    AlreadyBooted { service: &'static str },

    #[error("{service} failed to boot: {reason}")]
    ServiceBoot { service: String, reason: String },

    #[error("a protocol server named '{0}' is already registered")]
    DuplicateProtocol(String),

    #[error("invalid topic path '{0}'")]
    InvalidTopic(String),

    #[error("topic not found: {0}")]
    TopicNotFound(String),

    #[error("topic '{0}' still has child topics")]
    TopicHasChildren(String),

    #[error("topic '{0}' still has active subscribers")]
    TopicHasSubscribers(String),

    #[error("{protocol} failed to deliver message: {reason}")]
    Delivery { protocol: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Persistence(#[from] sled::Error),

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
}
