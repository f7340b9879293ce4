//! Broker engine
//!
//! The in-memory control broker responsible for:
//! - tracking connected clients and their subscription filters
//! - routing published messages to every client with a matching filter
//! - keeping the last retained message per topic and replaying it to new
//!   subscribers
//! - publishing a client's last-will message when it drops without saying
//!   goodbye
//!
//! The API is synchronous and meant to be held behind a lock
//! (`Arc<Mutex<Broker>>`) by the transport layer. Delivery only pushes into
//! per-client channels, so no network I/O happens under the lock.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::Result;
use crate::broker::message::Message;
use crate::broker::topic::{SubscriberId, Topic, is_valid_filter};
use crate::client::Client;
use crate::persistence::RetainedStore;
use crate::protocol::QoS;
use crate::transport::message::ServerFrame;

#[derive(Debug)]
pub struct Broker {
    pub topics: HashMap<String, Topic>,
    pub clients: HashMap<SubscriberId, Client>,
    retained: RetainedStore,
}

impl Broker {
    pub fn new(retained: RetainedStore) -> Self {
        Self {
            topics: HashMap::new(),
            clients: HashMap::new(),
            retained,
        }
    }

    /// A broker whose retained messages are kept in a temporary store.
    pub fn in_memory() -> Result<Self> {
        Ok(Self::new(RetainedStore::temporary()?))
    }

    /// Registers a client. A client reconnecting with the same id replaces
    /// the previous connection, whose will is discarded.
    pub fn register_client(&mut self, client: Client) {
        if self.clients.insert(client.id.clone(), client).is_some() {
            debug!("replaced existing client registration");
        }
    }

    pub fn remove_client(&mut self, client_id: &SubscriberId) -> Option<Client> {
        self.clients.remove(client_id)
    }

    pub fn has_client(&self, client_id: &SubscriberId) -> bool {
        self.clients.contains_key(client_id)
    }

    /// Subscribes a client through `filter` and replays every retained
    /// message the filter matches.
    pub fn subscribe(&mut self, filter: &str, subscriber: SubscriberId, qos: QoS) {
        if !is_valid_filter(filter) {
            warn!("rejecting invalid filter '{}' from {}", filter, subscriber);
            self.send_to(
                &subscriber,
                ServerFrame::Error {
                    reason: format!("invalid filter '{filter}'"),
                },
            );
            return;
        }

        self.topics
            .entry(filter.to_string())
            .or_insert_with(|| Topic::new(filter))
            .subscribe(subscriber.clone(), qos);

        match self.retained.matching(filter) {
            Ok(stored) => {
                for msg in stored {
                    self.send_to(&subscriber, ServerFrame::Deliver(msg));
                }
            }
            Err(e) => warn!("failed to load retained messages for '{}': {}", filter, e),
        }
    }

    pub fn unsubscribe(&mut self, filter: &str, subscriber: &SubscriberId) {
        if let Some(t) = self.topics.get_mut(filter) {
            t.unsubscribe(subscriber);
            if t.subscribers.is_empty() {
                self.topics.remove(filter);
            }
        }
    }

    /// Routes `msg` to every subscriber whose filter matches its topic, once
    /// per subscriber even when several of its filters match.
    pub fn publish(&mut self, mut msg: Message) {
        if msg.timestamp == 0 {
            msg.timestamp = Utc::now().timestamp_millis();
        }

        if msg.retain {
            if let Err(e) = self.retained.store(&msg) {
                warn!("failed to retain message on '{}': {}", msg.topic, e);
            }
        }

        let recipients: HashSet<&SubscriberId> = self
            .topics
            .values()
            .filter(|t| t.matches(&msg.topic))
            .flat_map(|t| t.subscribers.keys())
            .collect();

        if recipients.is_empty() {
            debug!("no subscribers for '{}'", msg.topic);
            return;
        }

        // Live deliveries are never flagged as retained.
        let mut delivery = msg;
        delivery.retain = false;
        for sub_id in recipients {
            self.send_to(sub_id, ServerFrame::Deliver(delivery.clone()));
        }
    }

    /// Removes a client and all its subscriptions. When the client left
    /// without a graceful disconnect its will is published.
    pub fn cleanup_client(&mut self, client_id: &SubscriberId, graceful: bool) {
        let removed = self.remove_client(client_id);

        self.topics.retain(|_, topic| {
            topic.unsubscribe(client_id);
            !topic.subscribers.is_empty()
        });

        if let Some(will) = removed.and_then(|c| c.will) {
            if graceful {
                debug!("discarding will of {}", client_id);
            } else {
                info!("publishing will of {} on {}", client_id, will.topic);
                self.publish(Message {
                    topic: will.topic,
                    payload: will.payload,
                    qos: will.qos,
                    retain: will.retain,
                    reply: None,
                    timestamp: 0,
                });
            }
        }

        info!("cleaned up client {}", client_id);
    }

    pub fn retained(&self) -> &RetainedStore {
        &self.retained
    }

    fn send_to(&self, client_id: &SubscriberId, frame: ServerFrame) {
        match self.clients.get(client_id) {
            Some(client) => {
                if let Err(e) = client.sender.send(frame) {
                    warn!("failed to send to {}: {}", client_id, e);
                }
            }
            None => warn!("no client registered with id: {}", client_id),
        }
    }
}
