//! Subscribers and publishers
//!
//! Both are bound to one remote endpoint and one topic. Their identity is the
//! `(host, port, topic)` triple: two values with the same triple are the same
//! registry entry, whatever their other fields hold.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

pub const PAUSED_ATTRIBUTE: &str = "paused";

/// Registry key shared by subscribers and publishers.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointKey {
    pub host: String,
    pub port: u16,
    pub topic: String,
}

impl EndpointKey {
    pub fn new(host: impl Into<String>, port: u16, topic: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            topic: topic.into(),
        }
    }

    /// Stable textual id, `host:port@topic`.
    pub fn id(&self) -> String {
        format!("{}:{}@{}", self.host, self.port, self.topic)
    }
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}@{}", self.host, self.port, self.topic)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    key: EndpointKey,
    origin_protocol: String,
    timeout: Option<DateTime<Utc>>,
    attributes: BTreeMap<String, String>,
}

impl Subscriber {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        topic: impl Into<String>,
        origin_protocol: impl Into<String>,
    ) -> Self {
        Self {
            key: EndpointKey::new(host, port, topic),
            origin_protocol: origin_protocol.into(),
            timeout: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: DateTime<Utc>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn id(&self) -> String {
        self.key.id()
    }

    pub fn host(&self) -> &str {
        &self.key.host
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    pub fn topic(&self) -> &str {
        &self.key.topic
    }

    pub fn origin_protocol(&self) -> &str {
        &self.origin_protocol
    }

    pub fn timeout(&self) -> Option<DateTime<Utc>> {
        self.timeout
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn is_paused(&self) -> bool {
        self.attribute(PAUSED_ATTRIBUTE) == Some("true")
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout.is_some_and(|t| t <= now)
    }

    pub(crate) fn set_timeout(&mut self, timeout: DateTime<Utc>) {
        self.timeout = Some(timeout);
    }

    pub(crate) fn set_attribute(&mut self, key: &str, value: &str) {
        self.attributes.insert(key.to_string(), value.to_string());
    }
}

impl PartialEq for Subscriber {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Subscriber {}

impl Hash for Subscriber {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subscriber [{}] via {}", self.key, self.origin_protocol)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Publisher {
    key: EndpointKey,
    origin_protocol: String,
    timeout: Option<DateTime<Utc>>,
    attributes: BTreeMap<String, String>,
}

impl Publisher {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        topic: impl Into<String>,
        origin_protocol: impl Into<String>,
    ) -> Self {
        Self {
            key: EndpointKey::new(host, port, topic),
            origin_protocol: origin_protocol.into(),
            timeout: None,
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: DateTime<Utc>) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn key(&self) -> &EndpointKey {
        &self.key
    }

    pub fn id(&self) -> String {
        self.key.id()
    }

    pub fn host(&self) -> &str {
        &self.key.host
    }

    pub fn port(&self) -> u16 {
        self.key.port
    }

    pub fn topic(&self) -> &str {
        &self.key.topic
    }

    pub fn origin_protocol(&self) -> &str {
        &self.origin_protocol
    }

    pub fn timeout(&self) -> Option<DateTime<Utc>> {
        self.timeout
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn has_expired(&self, now: DateTime<Utc>) -> bool {
        self.timeout.is_some_and(|t| t <= now)
    }

    pub(crate) fn set_timeout(&mut self, timeout: DateTime<Utc>) {
        self.timeout = Some(timeout);
    }
}

impl PartialEq for Publisher {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl Eq for Publisher {}

impl Hash for Publisher {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.key.hash(state);
    }
}

impl fmt::Display for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Publisher [{}] via {}", self.key, self.origin_protocol)
    }
}
