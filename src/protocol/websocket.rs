use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::accept_async;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::Message as WsMessage;

use crate::broker::ServiceHandles;
use crate::broker::message::Message;
use crate::broker::subscriber::{Publisher, Subscriber};
use crate::broker::topic::normalize;
use crate::client::Client;
use crate::protocol::message::{ClientMessage, ServerMessage};
use crate::protocol::{ProtocolServer, ProtocolStats, recipient_endpoints};
use crate::utils::{BrokerError, Result};

pub const WEBSOCKET_PROTOCOL: &str = "websocket";

type Endpoint = (String, u16);

/// Topics a connection subscribed or published to, undone on disconnect.
#[derive(Default)]
struct ConnectionState {
    subscriptions: BTreeSet<String>,
    publications: BTreeSet<String>,
}

struct WsInner {
    addr: String,
    handles: ServiceHandles,
    stats: ProtocolStats,
    listener: Mutex<Option<TcpListener>>,
    local_addr: Mutex<Option<SocketAddr>>,
    clients: RwLock<HashMap<Endpoint, Client>>,
    shutdown: watch::Sender<bool>,
}

/// JSON-over-WebSocket adapter.
///
/// Each connection is one endpoint: its subscriptions are registered under
/// the peer's ip and port and removed again when the connection closes.
#[derive(Clone)]
pub struct WebSocketServer {
    inner: Arc<WsInner>,
}

impl WebSocketServer {
    /// `addr` is bound in `boot`. Port `0` picks a free port, see `local_addr`.
    pub fn new(addr: impl Into<String>, handles: ServiceHandles) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(WsInner {
                addr: addr.into(),
                handles,
                stats: ProtocolStats::default(),
                listener: Mutex::new(None),
                local_addr: Mutex::new(None),
                clients: RwLock::new(HashMap::new()),
                shutdown,
            }),
        }
    }

    /// Address actually bound, once booted.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    pub fn connected_clients(&self) -> usize {
        self.inner.clients.read().len()
    }
}

#[async_trait]
impl ProtocolServer for WebSocketServer {
    fn protocol_server_type(&self) -> &str {
        WEBSOCKET_PROTOCOL
    }

    async fn boot(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.inner.addr)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: self.inner.addr.clone(),
                source,
            })?;
        let local = listener.local_addr().map_err(|source| BrokerError::Bind {
            addr: self.inner.addr.clone(),
            source,
        })?;
        info!("WebSocket server listening on ws://{local}");
        *self.inner.local_addr.lock() = Some(local);
        *self.inner.listener.lock() = Some(listener);
        Ok(())
    }

    async fn run(&self) -> Result<()> {
        let Some(listener) = self.inner.listener.lock().take() else {
            return Err(BrokerError::ServiceBoot {
                service: WEBSOCKET_PROTOCOL.to_string(),
                reason: "run called before boot".to_string(),
            });
        };
        let mut shutdown = self.inner.shutdown.subscribe();
        if *shutdown.borrow() {
            return Ok(());
        }

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tokio::spawn(handle_connection(self.inner.clone(), stream, peer));
                    }
                    Err(e) => {
                        self.inner.stats.record_error();
                        error!("Failed to accept connection: {e}");
                    }
                },
                _ = shutdown.changed() => break,
            }
        }
        info!("WebSocket server stopped accepting connections");
        Ok(())
    }

    async fn stop_server(&self) {
        self.inner.shutdown.send_replace(true);
        self.inner.clients.write().clear();
    }

    fn send_message(&self, message: &Message) -> Result<()> {
        let view = self.inner.handles.subscriptions.view();
        let endpoints = recipient_endpoints(&view, WEBSOCKET_PROTOCOL, message);
        if endpoints.is_empty() {
            return Ok(());
        }
        let frame = serde_json::to_string(&ServerMessage::from(message))?;

        let clients = self.inner.clients.read();
        let mut lost = 0usize;
        for endpoint in &endpoints {
            let Some(client) = clients.get(endpoint) else {
                debug!("No connection for {}:{}", endpoint.0, endpoint.1);
                continue;
            };
            match client.send_text(&frame) {
                Ok(()) => self.inner.stats.record_message(),
                Err(e) => {
                    self.inner.stats.record_error();
                    warn!("{e}");
                    lost += 1;
                }
            }
        }
        if lost > 0 {
            return Err(BrokerError::Delivery {
                protocol: WEBSOCKET_PROTOCOL.to_string(),
                reason: format!("{lost} connection(s) gone"),
            });
        }
        Ok(())
    }

    fn stats(&self) -> &ProtocolStats {
        &self.inner.stats
    }
}

async fn handle_connection(inner: Arc<WsInner>, stream: TcpStream, peer: SocketAddr) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            inner.stats.record_error();
            warn!("WebSocket handshake error from {peer}: {e}");
            return;
        }
    };
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let client = Client::new(peer, tx);
    let endpoint = (client.host(), client.port());
    inner.clients.write().insert(endpoint.clone(), client.clone());
    info!("{} connected from {peer}", client.id);

    let writer_id = client.id.clone();
    let writer = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if let Err(e) = ws_sender.send(msg).await {
                warn!("Failed to send message to {writer_id}: {e}");
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send loop closed for {writer_id}");
    });

    let mut shutdown = inner.shutdown.subscribe();
    let mut state = ConnectionState::default();
    loop {
        tokio::select! {
            frame = ws_receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => {
                    handle_frame(&inner, &client, text.as_str(), &mut state).await;
                }
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    inner.stats.record_error();
                    warn!("Connection error on {}: {e}", client.id);
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }

    info!("{} disconnected", client.id);
    inner.clients.write().remove(&endpoint);
    let subscriptions = &inner.handles.subscriptions;
    for topic in state.subscriptions {
        let subscriber = Subscriber::new(endpoint.0.as_str(), endpoint.1, topic, WEBSOCKET_PROTOCOL);
        if let Err(e) = subscriptions.remove_subscriber(&subscriber).await {
            error!("Failed to drop subscription of {}: {e}", client.id);
        }
    }
    for topic in state.publications {
        let publisher = Publisher::new(endpoint.0.as_str(), endpoint.1, topic, WEBSOCKET_PROTOCOL);
        if let Err(e) = subscriptions.remove_publisher(&publisher).await {
            error!("Failed to drop publisher registration of {}: {e}", client.id);
        }
    }
    drop(client);
    let _ = writer.await;
}

async fn handle_frame(
    inner: &WsInner,
    client: &Client,
    text: &str,
    state: &mut ConnectionState,
) {
    inner.stats.record_request();
    let request = match serde_json::from_str::<ClientMessage>(text) {
        Ok(request) => request,
        Err(e) => {
            inner.stats.record_bad_request();
            warn!("Invalid client message from {}: {e} | {text}", client.id);
            reply_error(client, format!("invalid request: {e}"));
            return;
        }
    };

    let raw_topic = match &request {
        ClientMessage::Subscribe { topic }
        | ClientMessage::Unsubscribe { topic }
        | ClientMessage::Publish { topic, .. } => topic.clone(),
    };
    let Some(topic) = normalize(&raw_topic) else {
        inner.stats.record_bad_request();
        reply_error(client, format!("invalid topic '{raw_topic}'"));
        return;
    };

    let (host, port) = (client.host(), client.port());
    let outcome = match request {
        ClientMessage::Subscribe { .. } => {
            let subscriber = Subscriber::new(host, port, topic.as_str(), WEBSOCKET_PROTOCOL);
            let result = inner.handles.subscriptions.add_subscriber(subscriber).await;
            if result.is_ok() {
                debug!("{} subscribed to {topic}", client.id);
                state.subscriptions.insert(topic);
            }
            result
        }
        ClientMessage::Unsubscribe { .. } => {
            let subscriber = Subscriber::new(host, port, topic.as_str(), WEBSOCKET_PROTOCOL);
            let result = inner.handles.subscriptions.remove_subscriber(&subscriber).await;
            if result.is_ok() {
                debug!("{} unsubscribed from {topic}", client.id);
                state.subscriptions.remove(&topic);
            }
            result
        }
        ClientMessage::Publish { payload, .. } => {
            let publisher = Publisher::new(host, port, topic.as_str(), WEBSOCKET_PROTOCOL);
            if state.publications.insert(topic.clone()) {
                if let Err(e) = inner.handles.subscriptions.add_publisher(publisher.clone()).await {
                    warn!("Could not register publisher {publisher}: {e}");
                }
            }
            debug!("{} published to {topic}", client.id);
            let message = Message::new(payload, topic, Some(publisher), WEBSOCKET_PROTOCOL);
            inner.handles.messages.distribute(message).await
        }
    };

    if let Err(e) = outcome {
        inner.stats.record_error();
        error!("Request from {} failed: {e}", client.id);
        reply_error(client, e.to_string());
    }
}

fn reply_error(client: &Client, message: String) {
    if let Err(e) = client.send(&ServerMessage::Error { message }) {
        debug!("Could not report error to {}: {e}", client.id);
    }
}
