use std::collections::HashMap;

use crate::protocol::QoS;

pub type SubscriberId = String;

/// A subscription filter and the clients subscribed through it.
///
/// Filters are `/`-separated levels where `+` matches exactly one level and
/// a trailing `#` matches any number of remaining levels (including none).
#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    pub subscribers: HashMap<SubscriberId, QoS>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscribers: HashMap::new(),
        }
    }

    /// Adds the subscriber or updates its QoS.
    pub fn subscribe(&mut self, id: SubscriberId, qos: QoS) {
        self.subscribers.insert(id, qos);
    }

    pub fn unsubscribe(&mut self, id: &SubscriberId) {
        self.subscribers.remove(id);
    }

    pub fn matches(&self, topic: &str) -> bool {
        topic_matches(&self.name, topic)
    }
}

/// Checks `topic` against a subscription `filter`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A filter is valid when `#` only appears as the whole last level and `+`
/// only as a whole level.
pub fn is_valid_filter(filter: &str) -> bool {
    if filter.is_empty() {
        return false;
    }
    let levels: Vec<&str> = filter.split('/').collect();
    levels.iter().enumerate().all(|(i, level)| match *level {
        "#" => i == levels.len() - 1,
        "+" => true,
        other => !other.contains('#') && !other.contains('+'),
    })
}
