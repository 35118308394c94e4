use std::net::SocketAddr;
use tokio::sync::mpsc::UnboundedSender;
use tungstenite::protocol::Message as WsMessage;

use crate::protocol::message::ServerMessage;
use crate::protocol::websocket::WEBSOCKET_PROTOCOL;
use crate::utils::{BrokerError, Result};

/// Represents a connected WebSocket client.
///
/// The peer address doubles as the subscriber endpoint: every subscription
/// made over this connection is registered as `(peer ip, peer port, topic)`.
#[derive(Debug, Clone)]
pub struct Client {
    /// Unique identifier for the connection, used in logs.
    pub id: String,

    /// Remote address of the peer.
    pub addr: SocketAddr,

    /// Channel to the connection's writer task.
    sender: UnboundedSender<WsMessage>,
}

impl Client {
    pub fn new(addr: SocketAddr, sender: UnboundedSender<WsMessage>) -> Self {
        Self {
            id: format!("client-{}", uuid::Uuid::new_v4()),
            addr,
            sender,
        }
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Queues an already serialized text frame.
    pub fn send_text(&self, text: &str) -> Result<()> {
        self.sender
            .send(WsMessage::text(text.to_string()))
            .map_err(|_| BrokerError::Delivery {
                protocol: WEBSOCKET_PROTOCOL.to_string(),
                reason: format!("{} is disconnected", self.id),
            })
    }

    pub fn send(&self, message: &ServerMessage) -> Result<()> {
        let text = serde_json::to_string(message)?;
        self.send_text(&text)
    }

    pub fn is_connected(&self) -> bool {
        !self.sender.is_closed()
    }
}
