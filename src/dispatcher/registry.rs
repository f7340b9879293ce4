//! Local subscriptions: per topic, the callbacks in registration order and
//! the endpoint that receives the topic's traffic.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::dispatcher::message::Callback;
use crate::protocol::{Protocol, QoS};
use crate::signaling::Listener;

/// What a subscription listens with.
#[derive(Debug)]
pub enum Endpoint {
    /// Subscribed on the control broker.
    Broker,
    /// A STREAM or DATAGRAM listener.
    Direct { protocol: Protocol, port: u16 },
    /// A signaling listener accepting peer sessions.
    Peer(Listener),
}

impl Endpoint {
    pub fn protocol(&self) -> Protocol {
        match self {
            Endpoint::Broker => Protocol::Broker,
            Endpoint::Direct { protocol, .. } => *protocol,
            Endpoint::Peer(_) => Protocol::PeerRtc,
        }
    }

    /// Port advertised for this endpoint.
    pub fn port(&self) -> u16 {
        match self {
            Endpoint::Broker => 0,
            Endpoint::Direct { port, .. } => *port,
            Endpoint::Peer(listener) => listener.port(),
        }
    }
}

pub struct SubscriptionRecord {
    pub callbacks: Vec<Callback>,
    pub endpoint: Endpoint,
    pub qos: QoS,
    /// Advertised through discovery.
    pub advertised: bool,
}

impl SubscriptionRecord {
    fn add(&mut self, callback: Callback) -> bool {
        if self.callbacks.iter().any(|c| Arc::ptr_eq(c, &callback)) {
            return false;
        }
        self.callbacks.push(callback);
        true
    }
}

/// Result of offering a fresh record to the registry.
pub enum Insert {
    Inserted,
    /// Someone subscribed the topic first; the callback joined their record
    /// and the offered endpoint is handed back for teardown.
    Merged(Endpoint),
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    topics: Mutex<HashMap<String, SubscriptionRecord>>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `callback` to an existing subscription. Returns `None` if the
    /// topic has no subscription yet, otherwise whether the callback was new.
    pub fn add_callback(&self, topic: &str, callback: &Callback) -> Option<bool> {
        self.topics
            .lock()
            .get_mut(topic)
            .map(|record| record.add(callback.clone()))
    }

    pub fn insert(&self, topic: &str, record: SubscriptionRecord) -> Insert {
        let mut topics = self.topics.lock();
        match topics.get_mut(topic) {
            Some(existing) => {
                for callback in record.callbacks {
                    existing.add(callback);
                }
                Insert::Merged(record.endpoint)
            }
            None => {
                topics.insert(topic.to_string(), record);
                Insert::Inserted
            }
        }
    }

    /// Snapshot of the callbacks for `topic`, in registration order.
    pub fn callbacks(&self, topic: &str) -> Vec<Callback> {
        self.topics
            .lock()
            .get(topic)
            .map(|record| record.callbacks.clone())
            .unwrap_or_default()
    }

    pub fn remove(&self, topic: &str) -> Option<SubscriptionRecord> {
        self.topics.lock().remove(topic)
    }

    pub fn drain(&self) -> Vec<(String, SubscriptionRecord)> {
        self.topics.lock().drain().collect()
    }

    pub fn protocol(&self, topic: &str) -> Option<Protocol> {
        self.topics
            .lock()
            .get(topic)
            .map(|record| record.endpoint.protocol())
    }

    /// Topics subscribed on the control broker, with their QoS.
    pub fn broker_topics(&self) -> Vec<(String, QoS)> {
        let mut topics: Vec<(String, QoS)> = self
            .topics
            .lock()
            .iter()
            .filter(|(_, record)| matches!(record.endpoint, Endpoint::Broker))
            .map(|(topic, record)| (topic.clone(), record.qos))
            .collect();
        topics.sort_by(|a, b| a.0.cmp(&b.0));
        topics
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }
}
