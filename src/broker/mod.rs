//! The `broker` module holds the entities the core services trade in
//! (topics, subscribers, publishers, messages) and the `Broker` composition
//! root that wires the core services together.

pub mod engine;
pub mod message;
pub mod subscriber;
pub mod topic;

pub use engine::{Broker, ServiceHandles};
