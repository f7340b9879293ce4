//! Routing table
//!
//! Records which remote `(host, port, protocol)` endpoints currently serve a
//! topic. The table is fed exclusively by discovery announcements and read on
//! every outbound publish.
//!
//! Concurrency notes:
//! - All state sits behind one internal lock; every public method takes and
//!   releases it, so each operation is atomic and callers never hold it.
//! - `lookup` hands out a copy, so fan-out never runs under the lock.
//! - There is no TTL. A host that vanishes without announcing its departure
//!   keeps its entries until it is seen leaving.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::protocol::Protocol;
use crate::signaling::SessionHandle;

/// One reachability fact for a topic.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub host: String,
    pub port: u16,
    pub protocol: Protocol,
    pub session: Option<SessionHandle>,
}

impl RouteEntry {
    fn new(host: &str, port: u16, protocol: Protocol) -> Self {
        Self {
            host: host.to_string(),
            port,
            protocol,
            session: None,
        }
    }
}

/// A topic entry carried by one announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteUpdate {
    pub topic: String,
    pub port: u16,
    pub protocol: Protocol,
}

type PortMap = BTreeMap<u16, RouteEntry>;
type HostMap = BTreeMap<String, PortMap>;

#[derive(Debug, Default)]
pub struct RoutingTable {
    topics: Mutex<HashMap<String, HostMap>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `(topic, host, port)`.
    ///
    /// A live session survives an update that keeps the protocol. When the
    /// protocol changes the old session is detached and returned so the
    /// caller can close it.
    pub fn upsert(
        &self,
        topic: &str,
        host: &str,
        port: u16,
        protocol: Protocol,
    ) -> Option<SessionHandle> {
        let mut topics = self.topics.lock();
        Self::upsert_locked(&mut topics, topic, host, port, protocol)
    }

    /// Applies every entry of one announcement under a single lock
    /// acquisition, so readers see all of it or none of it.
    pub fn apply(&self, host: &str, updates: &[RouteUpdate]) -> Vec<SessionHandle> {
        let mut topics = self.topics.lock();
        updates
            .iter()
            .filter_map(|u| Self::upsert_locked(&mut topics, &u.topic, host, u.port, u.protocol))
            .collect()
    }

    fn upsert_locked(
        topics: &mut HashMap<String, HostMap>,
        topic: &str,
        host: &str,
        port: u16,
        protocol: Protocol,
    ) -> Option<SessionHandle> {
        let ports = topics
            .entry(topic.to_string())
            .or_default()
            .entry(host.to_string())
            .or_default();

        match ports.get_mut(&port) {
            Some(entry) if entry.protocol == protocol => None,
            Some(entry) => {
                entry.protocol = protocol;
                entry.session.take()
            }
            None => {
                ports.insert(port, RouteEntry::new(host, port, protocol));
                None
            }
        }
    }

    /// Removes every entry for `host` across all topics and returns the
    /// sessions that were attached to them.
    pub fn remove_host(&self, host: &str) -> Vec<SessionHandle> {
        let mut topics = self.topics.lock();
        let mut displaced = Vec::new();
        for hosts in topics.values_mut() {
            if let Some(ports) = hosts.remove(host) {
                displaced.extend(ports.into_values().filter_map(|e| e.session));
            }
        }
        topics.retain(|_, hosts| !hosts.is_empty());
        displaced
    }

    /// Drops the given `(topic, port)` entries of `host` and returns their
    /// sessions. Missing entries are skipped.
    pub fn retire(&self, host: &str, entries: &[(String, u16)]) -> Vec<SessionHandle> {
        let mut topics = self.topics.lock();
        let mut displaced = Vec::new();
        for (topic, port) in entries {
            let Some(hosts) = topics.get_mut(topic) else {
                continue;
            };
            if let Some(ports) = hosts.get_mut(host) {
                if let Some(entry) = ports.remove(port) {
                    displaced.extend(entry.session);
                }
                if ports.is_empty() {
                    hosts.remove(host);
                }
            }
            if hosts.is_empty() {
                topics.remove(topic);
            }
        }
        displaced
    }

    /// Snapshot of the entries serving `topic`, ordered by host then port.
    pub fn lookup(&self, topic: &str) -> Vec<RouteEntry> {
        let topics = self.topics.lock();
        topics
            .get(topic)
            .map(|hosts| {
                hosts
                    .values()
                    .flat_map(|ports| ports.values().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drops every entry for `topic`.
    pub fn forget_topic(&self, topic: &str) -> Vec<SessionHandle> {
        let mut topics = self.topics.lock();
        topics
            .remove(topic)
            .map(|hosts| {
                hosts
                    .into_values()
                    .flat_map(|ports| ports.into_values())
                    .filter_map(|e| e.session)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the session attached to the entry, creating it with `create`
    /// while the lock is held when there is none yet. Returns `None` if the
    /// entry disappeared in the meantime.
    pub fn session_or_insert_with<F>(
        &self,
        topic: &str,
        host: &str,
        port: u16,
        create: F,
    ) -> Option<SessionHandle>
    where
        F: FnOnce() -> SessionHandle,
    {
        let mut topics = self.topics.lock();
        let entry = topics.get_mut(topic)?.get_mut(host)?.get_mut(&port)?;
        if let Some(existing) = entry.session.as_ref().filter(|s| !s.is_closed()) {
            return Some(existing.clone());
        }
        let session = create();
        entry.session = Some(session.clone());
        Some(session)
    }

    /// Detaches the session `id` from the entry, if it is still the one
    /// attached. Used when a session closes so the next publish re-creates it.
    pub fn detach_session(&self, topic: &str, host: &str, port: u16, id: Uuid) -> bool {
        let mut topics = self.topics.lock();
        let Some(entry) = topics
            .get_mut(topic)
            .and_then(|hosts| hosts.get_mut(host))
            .and_then(|ports| ports.get_mut(&port))
        else {
            return false;
        };
        if entry.session.as_ref().is_some_and(|s| s.id() == id) {
            entry.session = None;
            true
        } else {
            false
        }
    }

    /// Empties the table and returns every attached session.
    pub fn clear(&self) -> Vec<SessionHandle> {
        let mut topics = self.topics.lock();
        topics
            .drain()
            .flat_map(|(_, hosts)| hosts.into_values())
            .flat_map(|ports| ports.into_values())
            .filter_map(|e| e.session)
            .collect()
    }

    pub fn topics(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Total number of entries across all topics.
    pub fn len(&self) -> usize {
        self.topics
            .lock()
            .values()
            .flat_map(|hosts| hosts.values())
            .map(|ports| ports.len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
