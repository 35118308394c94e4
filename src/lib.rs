//! # Crossbar
//!
//! `crossbar` is a protocol-agnostic publish/subscribe broker core. Protocol
//! adapters (WebSocket, in-process, or your own) translate their wire traffic
//! into calls on a small set of core services, and the core fans every
//! published message back out through the adapters that own a matching
//! subscriber.
//!
//! ## Core Modules
//!
//! - `core`: the actor-service base, the topic, subscription and message
//!   services, change events and the `CoreService` orchestrator.
//! - `broker`: the entities (topics, subscribers, publishers, messages) and
//!   the `Broker` composition root.
//! - `protocol`: the `ProtocolServer` contract and the bundled adapters.
//! - `client`: the broker-side handle of a WebSocket connection.
//! - `config`: layered configuration (defaults, file, environment).
//! - `persistence`: sled-backed last-message store.
//! - `utils`: the shared error type and logging setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod core;
pub mod persistence;
pub mod protocol;
pub mod utils;
