//! The `protocol` module defines the contract every wire-protocol adapter
//! implements, the counters adapters expose, and the registry the core uses
//! to find an adapter by protocol name.
//!
//! Two adapters ship with the crate:
//! - `local`: an in-process adapter with a caller-chosen protocol name,
//! - `websocket`: JSON frames over WebSocket.

pub mod local;
pub mod message;
pub mod websocket;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::broker::message::Message;
use crate::core::SubscriberView;
use crate::utils::{BrokerError, Result};

pub use local::{LocalServer, LocalSession};
pub use websocket::WebSocketServer;

/// Capability set of a protocol adapter.
///
/// The orchestrator drives the lifecycle: `boot` once, then `run` on its own
/// task until `stop_server` makes it return. `MessageService` calls
/// `send_message` from its worker, so it must not block; delivery problems
/// are handled inside the adapter and only reported back as an `Err`.
#[async_trait]
pub trait ProtocolServer: Send + Sync {
    /// Name subscribers and messages of this adapter carry as origin protocol.
    fn protocol_server_type(&self) -> &str;

    /// Acquires resources (sockets, listeners). A failure aborts broker boot.
    async fn boot(&self) -> Result<()>;

    /// Main loop. Returns when the adapter is stopped.
    async fn run(&self) -> Result<()>;

    async fn stop_server(&self);

    /// Deliver `message` to this adapter's consumers of its topic.
    fn send_message(&self, message: &Message) -> Result<()>;

    fn stats(&self) -> &ProtocolStats;

    fn total_requests(&self) -> u64 {
        self.stats().total_requests()
    }

    fn total_messages(&self) -> u64 {
        self.stats().total_messages()
    }

    fn total_bad_requests(&self) -> u64 {
        self.stats().total_bad_requests()
    }

    fn total_errors(&self) -> u64 {
        self.stats().total_errors()
    }
}

/// Monotonic counters, safe to bump from adapter I/O tasks while the
/// orchestrator reads them.
///
/// `requests` counts inbound requests, `messages` counts messages handed to
/// a consumer, `bad_requests` counts requests that could not be decoded and
/// `errors` counts I/O and delivery failures.
#[derive(Debug, Default)]
pub struct ProtocolStats {
    requests: AtomicU64,
    messages: AtomicU64,
    bad_requests: AtomicU64,
    errors: AtomicU64,
}

impl ProtocolStats {
    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_message(&self) {
        self.messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bad_request(&self) {
        self.bad_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    pub fn total_messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    pub fn total_bad_requests(&self) -> u64 {
        self.bad_requests.load(Ordering::Relaxed)
    }

    pub fn total_errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, protocol: &str) -> ProtocolStatsSnapshot {
        ProtocolStatsSnapshot {
            protocol: protocol.to_string(),
            total_requests: self.total_requests(),
            total_messages: self.total_messages(),
            total_bad_requests: self.total_bad_requests(),
            total_errors: self.total_errors(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolStatsSnapshot {
    pub protocol: String,
    pub total_requests: u64,
    pub total_messages: u64,
    pub total_bad_requests: u64,
    pub total_errors: u64,
}

/// Adapters known to the broker, in registration order.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    servers: Arc<RwLock<Vec<Arc<dyn ProtocolServer>>>>,
}

impl ProtocolRegistry {
    pub fn register(&self, server: Arc<dyn ProtocolServer>) -> Result<()> {
        let mut servers = self.servers.write();
        let name = server.protocol_server_type();
        if servers.iter().any(|s| s.protocol_server_type() == name) {
            return Err(BrokerError::DuplicateProtocol(name.to_string()));
        }
        servers.push(server);
        Ok(())
    }

    pub fn get(&self, protocol: &str) -> Option<Arc<dyn ProtocolServer>> {
        self.servers
            .read()
            .iter()
            .find(|s| s.protocol_server_type() == protocol)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn ProtocolServer>> {
        self.servers.read().clone()
    }

    pub fn len(&self) -> usize {
        self.servers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Endpoints `(host, port)` of `protocol` that should receive `message`
/// right now: subscribers of its topic (every subscriber for a system
/// message) that are neither paused nor expired. Each endpoint appears once.
pub fn recipient_endpoints(
    view: &SubscriberView,
    protocol: &str,
    message: &Message,
) -> BTreeSet<(String, u16)> {
    let snapshot = view.snapshot();
    let now = chrono::Utc::now();
    let candidates = match message.topic() {
        Some(topic) => snapshot.subscribers_for_topic(topic),
        None => snapshot.all_subscribers(),
    };
    candidates
        .into_iter()
        .filter(|s| s.origin_protocol() == protocol && !s.is_paused() && !s.has_expired(now))
        .map(|s| (s.host().to_string(), s.port()))
        .collect()
}

#[cfg(test)]
mod tests;
