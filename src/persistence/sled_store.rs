use chrono::Utc;
use sled::Db;
use tracing::{debug, warn};

use crate::broker::message::Message;
use crate::broker::topic::topic_matches;
use crate::{Error, Result};

const RETAINED_TREE: &str = "retained";

/// Keeps the last retained message of every topic, keyed by topic name.
#[derive(Clone)]
pub struct RetainedStore {
    db: Db,
}

impl RetainedStore {
    pub fn open(path: &str) -> Result<Self> {
        let db = sled::open(path).map_err(store_error)?;
        Ok(Self { db })
    }

    /// A store that lives only as long as the process.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(store_error)?;
        Ok(Self { db })
    }

    /// Replaces the topic's retained message. An empty payload clears it.
    pub fn store(&self, msg: &Message) -> Result<()> {
        let tree = self.db.open_tree(RETAINED_TREE).map_err(store_error)?;
        if msg.payload.is_empty() {
            tree.remove(msg.topic.as_bytes()).map_err(store_error)?;
            debug!("cleared retained message for {}", msg.topic);
            return Ok(());
        }

        let mut stored = msg.clone();
        stored.retain = true;
        if stored.timestamp == 0 {
            stored.timestamp = Utc::now().timestamp_millis();
        }
        let serialized = serde_json::to_vec(&stored).map_err(|e| Error::Encode(e.to_string()))?;
        tree.insert(msg.topic.as_bytes(), serialized)
            .map_err(store_error)?;
        Ok(())
    }

    /// Retained messages whose topic matches `filter`, in topic order.
    pub fn matching(&self, filter: &str) -> Result<Vec<Message>> {
        let tree = self.db.open_tree(RETAINED_TREE).map_err(store_error)?;
        let mut found = Vec::new();
        for entry in tree.iter() {
            let (key, value) = entry.map_err(store_error)?;
            let topic = String::from_utf8_lossy(&key);
            if !topic_matches(filter, &topic) {
                continue;
            }
            match serde_json::from_slice::<Message>(&value) {
                Ok(msg) => found.push(msg),
                Err(e) => warn!("skipping unreadable retained message for {}: {}", topic, e),
            }
        }
        Ok(found)
    }

    pub fn len(&self) -> usize {
        self.db
            .open_tree(RETAINED_TREE)
            .map(|tree| tree.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn store_error(e: sled::Error) -> Error {
    Error::Store(e.to_string())
}

impl std::fmt::Debug for RetainedStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainedStore")
            .field("db", &"sled::Db")
            .finish()
    }
}
