use serde::{Deserialize, Serialize};

use crate::broker::message::Message;

/// Frames a WebSocket client may send.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { topic: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: String },

    #[serde(rename = "publish")]
    Publish { topic: String, payload: String },
}

/// Frames the server pushes to a WebSocket client.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// A delivered message. `topic` is absent for system messages.
    #[serde(rename = "message")]
    Message {
        message_id: String,
        topic: Option<String>,
        payload: String,
        timestamp: i64,
        origin_protocol: String,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl From<&Message> for ServerMessage {
    fn from(message: &Message) -> Self {
        ServerMessage::Message {
            message_id: message.message_id().to_string(),
            topic: message.topic().map(str::to_string),
            payload: message.content().to_string(),
            timestamp: message.timestamp(),
            origin_protocol: message.origin_protocol().to_string(),
        }
    }
}
