use crate::broker::subscriber::Publisher;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// A message travelling through the broker.
///
/// Adapters decode their wire format into this shape and hand it to
/// `MessageService::distribute`. The value is immutable once built: fields
/// are private and there are no setters, so what a subscriber's adapter
/// receives is exactly what the publisher's adapter submitted.
///
/// # Fields
///
/// - `content` - the payload, as text.
/// - `topic` - full topic path. `None` marks a system message.
/// - `publisher` - originating publisher; `None` for system messages.
/// - `origin_protocol` - name of the protocol server that produced it.
/// - `attributes` - protocol-specific metadata (e.g. a WS-Notification dialect).
/// - `timestamp` - milliseconds since the UNIX epoch at construction.
///
/// # Example
///
/// ```rust
/// use crossbar::broker::message::Message;
///
/// let msg = Message::new("23C", "weather", None, "mqtt")
///     .with_attribute("retain", "false");
/// assert_eq!(msg.topic(), Some("weather"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    message_id: String,
    content: String,
    topic: Option<String>,
    publisher: Option<Publisher>,
    origin_protocol: String,
    attributes: BTreeMap<String, String>,
    timestamp: i64,
}

impl Message {
    pub fn new(
        content: impl Into<String>,
        topic: impl Into<String>,
        publisher: Option<Publisher>,
        origin_protocol: impl Into<String>,
    ) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            content: content.into(),
            topic: Some(topic.into()),
            publisher,
            origin_protocol: origin_protocol.into(),
            attributes: BTreeMap::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// A broker-originated message without topic or publisher.
    pub fn system(content: impl Into<String>, system_name: impl Into<String>) -> Self {
        Self {
            message_id: Uuid::new_v4().to_string(),
            content: content.into(),
            topic: None,
            publisher: None,
            origin_protocol: system_name.into(),
            attributes: BTreeMap::new(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    pub fn publisher(&self) -> Option<&Publisher> {
        self.publisher.as_ref()
    }

    pub fn origin_protocol(&self) -> &str {
        &self.origin_protocol
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn is_system_message(&self) -> bool {
        self.topic.is_none()
    }
}
