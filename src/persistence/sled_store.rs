use sled::{Db, Tree};
use std::collections::HashMap;
use tracing::warn;

use crate::broker::message::Message;
use crate::utils::Result;

const LATEST_TREE: &str = "latest_messages";

/// Durable last-value store: one entry per topic, overwritten on publish.
#[derive(Clone)]
pub struct MessageStore {
    db: Db,
    latest: Tree,
}

impl MessageStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path)?;
        let latest = db.open_tree(LATEST_TREE)?;
        Ok(Self { db, latest })
    }

    pub fn store_latest(&self, topic: &str, message: &Message) -> Result<()> {
        let serialized = serde_json::to_vec(message)?;
        self.latest.insert(topic.as_bytes(), serialized)?;
        Ok(())
    }

    pub fn load_latest(&self, topic: &str) -> Result<Option<Message>> {
        match self.latest.get(topic.as_bytes())? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    /// Every stored entry. Undecodable entries are skipped with a warning.
    pub fn load_all(&self) -> Result<HashMap<String, Message>> {
        let mut out = HashMap::new();
        for entry in self.latest.iter() {
            let (key, value) = entry?;
            let topic = String::from_utf8_lossy(&key).into_owned();
            match serde_json::from_slice::<Message>(&value) {
                Ok(message) => {
                    out.insert(topic, message);
                }
                Err(e) => warn!("Skipping undecodable cached message for {topic}: {e}"),
            }
        }
        Ok(out)
    }

    pub fn remove(&self, topic: &str) -> Result<()> {
        self.latest.remove(topic.as_bytes())?;
        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}

impl std::fmt::Debug for MessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageStore")
            .field("db", &"sled::Db")
            .field("entries", &self.latest.len())
            .finish()
    }
}
