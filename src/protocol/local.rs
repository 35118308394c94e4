//! In-process protocol adapter.
//!
//! Each `LocalSession` plays the role of a remote endpoint `(host, port)`
//! without any network in between. Useful for embedding the broker and for
//! bridging code that already lives in the same process.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};

use crate::broker::ServiceHandles;
use crate::broker::message::Message;
use crate::broker::subscriber::{Publisher, Subscriber};
use crate::broker::topic::normalize;
use crate::protocol::{ProtocolServer, ProtocolStats, recipient_endpoints};
use crate::utils::{BrokerError, Result};

type Endpoint = (String, u16);

struct LocalInner {
    protocol: String,
    handles: ServiceHandles,
    stats: ProtocolStats,
    sessions: RwLock<HashMap<Endpoint, (u64, mpsc::UnboundedSender<Message>)>>,
    next_session: AtomicU64,
    running: AtomicBool,
    shutdown: Notify,
}

/// Adapter whose consumers are in-process sessions.
#[derive(Clone)]
pub struct LocalServer {
    inner: Arc<LocalInner>,
}

impl LocalServer {
    /// `protocol` is the name subscribers and messages of this adapter carry.
    pub fn new(protocol: impl Into<String>, handles: ServiceHandles) -> Self {
        Self {
            inner: Arc::new(LocalInner {
                protocol: protocol.into(),
                handles,
                stats: ProtocolStats::default(),
                sessions: RwLock::new(HashMap::new()),
                next_session: AtomicU64::new(1),
                running: AtomicBool::new(false),
                shutdown: Notify::new(),
            }),
        }
    }

    /// Opens a session for the endpoint `(host, port)`. An existing session
    /// for the same endpoint stops receiving.
    pub fn attach(&self, host: impl Into<String>, port: u16) -> LocalSession {
        let host = host.into();
        let (tx, rx) = mpsc::unbounded_channel();
        let session_id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        if self
            .inner
            .sessions
            .write()
            .insert((host.clone(), port), (session_id, tx))
            .is_some()
        {
            warn!("Replaced existing local session {host}:{port}");
        }
        debug!("Attached local session {host}:{port} to {}", self.inner.protocol);
        LocalSession {
            server: self.inner.clone(),
            session_id,
            host,
            port,
            topics: BTreeSet::new(),
            rx,
        }
    }

    pub fn session_count(&self) -> usize {
        self.inner.sessions.read().len()
    }
}

#[async_trait]
impl ProtocolServer for LocalServer {
    fn protocol_server_type(&self) -> &str {
        &self.inner.protocol
    }

    async fn boot(&self) -> Result<()> {
        self.inner.running.store(true, Ordering::SeqCst);
        info!("Local protocol server {} ready", self.inner.protocol);
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        if self.inner.running.load(Ordering::SeqCst) {
            self.inner.shutdown.notified().await;
        }
        Ok(())
    }

    async fn stop_server(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.sessions.write().clear();
        self.inner.shutdown.notify_one();
        info!("Local protocol server {} stopped", self.inner.protocol);
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        let view = self.inner.handles.subscriptions.view();
        let endpoints = recipient_endpoints(&view, &self.inner.protocol, message);
        let sessions = self.inner.sessions.read();
        let mut lost = 0usize;
        for endpoint in endpoints {
            let Some((_, tx)) = sessions.get(&endpoint) else {
                debug!("No local session for {}:{}", endpoint.0, endpoint.1);
                continue;
            };
            if tx.send(message.clone()).is_ok() {
                self.inner.stats.record_message();
            } else {
                self.inner.stats.record_error();
                lost += 1;
            }
        }
        if lost > 0 {
            return Err(BrokerError::Delivery {
                protocol: self.inner.protocol.clone(),
                reason: format!("{lost} session(s) no longer receiving"),
            });
        }
        Ok(())
    }

    fn stats(&self) -> &ProtocolStats {
        &self.inner.stats
    }
}

/// A consumer/producer attached to a `LocalServer`.
pub struct LocalSession {
    server: Arc<LocalInner>,
    session_id: u64,
    host: String,
    port: u16,
    topics: BTreeSet<String>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl LocalSession {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn topic_path(&self, topic: &str) -> Result<String> {
        normalize(topic).ok_or_else(|| {
            self.server.stats.record_bad_request();
            BrokerError::InvalidTopic(topic.to_string())
        })
    }

    fn subscriber(&self, topic: &str) -> Subscriber {
        Subscriber::new(self.host.as_str(), self.port, topic, self.server.protocol.as_str())
    }

    pub async fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.server.stats.record_request();
        let topic = self.topic_path(topic)?;
        self.server
            .handles
            .subscriptions
            .add_subscriber(self.subscriber(&topic))
            .await?;
        self.topics.insert(topic);
        Ok(())
    }

    pub async fn unsubscribe(&mut self, topic: &str) -> Result<()> {
        self.server.stats.record_request();
        let topic = self.topic_path(topic)?;
        self.server
            .handles
            .subscriptions
            .remove_subscriber(&self.subscriber(&topic))
            .await?;
        self.topics.remove(&topic);
        Ok(())
    }

    pub async fn pause(&mut self, topic: &str) -> Result<()> {
        self.server.stats.record_request();
        let topic = self.topic_path(topic)?;
        self.server
            .handles
            .subscriptions
            .pause_subscriber(&self.subscriber(&topic))
            .await
    }

    pub async fn publish(&self, topic: &str, content: &str) -> Result<()> {
        self.server.stats.record_request();
        let topic = self.topic_path(topic)?;
        let protocol = self.server.protocol.as_str();
        let publisher = Publisher::new(self.host.as_str(), self.port, topic.as_str(), protocol);
        let message = Message::new(content, topic, Some(publisher), protocol);
        self.server.handles.messages.distribute(message).await
    }

    /// Next delivered message, or `None` once the server dropped the session.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Unsubscribes from every topic this session subscribed to and detaches.
    pub async fn close(mut self) -> Result<()> {
        let topics = std::mem::take(&mut self.topics);
        for topic in topics {
            self.server
                .handles
                .subscriptions
                .remove_subscriber(&self.subscriber(&topic))
                .await?;
        }
        Ok(())
    }
}

impl Drop for LocalSession {
    fn drop(&mut self) {
        let key = (self.host.clone(), self.port);
        {
            let mut sessions = self.server.sessions.write();
            // a newer session may own the endpoint by now, and with it
            // the same subscriber identities
            if !sessions.get(&key).is_some_and(|(id, _)| *id == self.session_id) {
                return;
            }
            sessions.remove(&key);
        }
        let subscriptions = &self.server.handles.subscriptions;
        for topic in std::mem::take(&mut self.topics) {
            let subscriber = self.subscriber(&topic);
            if let Err(e) = subscriptions.try_remove_subscriber(&subscriber) {
                warn!("Could not drop {subscriber} of a closed local session: {e}");
            }
        }
    }
}
