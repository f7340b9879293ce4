//! Discovery engine
//!
//! Keeps the local routing table in step with the announcements other nodes
//! publish, and publishes this node's own advertised capabilities.
//!
//! Topic layout:
//! - every node publishes a retained announcement on `<base>/<node id>`;
//! - every node subscribes to `<base>/+`, so the broker replays one
//!   announcement per known node on connect;
//! - the node's will is its `"disconnected"` announcement, so a crash
//!   retracts its routes everywhere.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::Result;
use crate::broker::message::{Message, Will};
use crate::config::{DiscoverySettings, Settings};
use crate::control::ControlChannel;
use crate::discovery::announcement::{Announcement, PeerStatus, TopicCapability};
use crate::protocol::{Protocol, QoS};
use crate::routing::{RouteUpdate, RoutingTable};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub node_id: String,
    /// Address advertised to peers.
    pub host: String,
    pub topic_base: String,
    pub last_will: bool,
}

impl DiscoveryConfig {
    pub fn new(
        node_id: impl Into<String>,
        host: impl Into<String>,
        settings: &DiscoverySettings,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            host: host.into(),
            topic_base: settings.topic_base.trim_end_matches('/').to_string(),
            last_will: settings.last_will,
        }
    }
}

impl From<&Settings> for DiscoveryConfig {
    fn from(s: &Settings) -> Self {
        Self::new(s.node.id.clone(), s.node.host.clone(), &s.discovery)
    }
}

pub struct DiscoveryEngine {
    config: DiscoveryConfig,
    control: Arc<dyn ControlChannel>,
    table: Arc<RoutingTable>,
    advertised: Mutex<BTreeMap<String, TopicCapability>>,
    /// Last port each remote node announced per topic, keyed by the node's
    /// announcement topic. Several nodes may share a host.
    announced_ports: Mutex<HashMap<String, HashMap<String, u16>>>,
}

impl DiscoveryEngine {
    pub fn new(
        config: DiscoveryConfig,
        control: Arc<dyn ControlChannel>,
        table: Arc<RoutingTable>,
    ) -> Self {
        Self {
            config,
            control,
            table,
            advertised: Mutex::new(BTreeMap::new()),
            announced_ports: Mutex::new(HashMap::new()),
        }
    }

    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// The topic this node announces itself on.
    pub fn node_topic(&self) -> String {
        format!("{}/{}", self.config.topic_base, self.config.node_id)
    }

    pub fn subscription_filter(&self) -> String {
        format!("{}/+", self.config.topic_base)
    }

    pub fn is_discovery_topic(&self, topic: &str) -> bool {
        topic
            .strip_prefix(self.config.topic_base.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
            .is_some_and(|node| !node.is_empty() && !node.contains('/'))
    }

    /// The will to register with the control channel before connecting.
    pub fn will(&self) -> Result<Option<Will>> {
        if !self.config.last_will {
            return Ok(None);
        }
        Ok(Some(Will {
            topic: self.node_topic(),
            payload: Announcement::disconnected(self.config.host.clone()).encode()?,
            qos: QoS::AtLeastOnce,
            retain: true,
        }))
    }

    /// Subscribes to every node's announcement and re-publishes the local
    /// one. Called after each (re)connect of the control channel.
    pub async fn start(&self) -> Result<()> {
        self.control
            .subscribe(&self.subscription_filter(), QoS::AtLeastOnce)
            .await?;
        if !self.advertised.lock().is_empty() {
            self.announce().await?;
        }
        info!("discovery started on {}", self.node_topic());
        Ok(())
    }

    /// Adds `topic` to the advertised capabilities and announces the table.
    pub async fn advertise(&self, topic: &str, protocol: Protocol, port: u16) -> Result<()> {
        self.advertised
            .lock()
            .insert(topic.to_string(), TopicCapability { protocol, port });
        debug!("advertising '{}' via {} on port {}", topic, protocol, port);
        self.announce().await
    }

    /// Removes `topic` from the advertised capabilities. Announces only if
    /// something changed.
    pub async fn withdraw(&self, topic: &str) -> Result<()> {
        if self.advertised.lock().remove(topic).is_none() {
            return Ok(());
        }
        debug!("withdrawing '{}'", topic);
        self.announce().await
    }

    pub fn advertised(&self) -> BTreeMap<String, TopicCapability> {
        self.advertised.lock().clone()
    }

    async fn announce(&self) -> Result<()> {
        let announcement = {
            let advertised = self.advertised.lock();
            Announcement {
                status: PeerStatus::Connected,
                host: self.config.host.clone(),
                topics: advertised.clone(),
            }
        };
        self.publish(&announcement).await
    }

    /// Announces the departure of this node. The channel stays connected;
    /// the caller disconnects it afterwards.
    pub async fn shutdown(&self) -> Result<()> {
        self.advertised.lock().clear();
        self.publish(&Announcement::disconnected(self.config.host.clone()))
            .await?;
        info!("announced departure of {}", self.config.node_id);
        Ok(())
    }

    async fn publish(&self, announcement: &Announcement) -> Result<()> {
        let payload = announcement.encode()?;
        self.control
            .publish(
                Message::new(self.node_topic(), payload)
                    .with_qos(QoS::AtLeastOnce)
                    .retained(true),
            )
            .await
    }

    /// Applies one inbound announcement to the routing table. A malformed
    /// payload is rejected before anything is touched.
    pub fn handle_announcement(&self, topic: &str, payload: &[u8]) -> Result<()> {
        if payload.is_empty() {
            debug!("ignoring cleared announcement on {}", topic);
            return Ok(());
        }
        if topic == self.node_topic() {
            return Ok(());
        }

        let announcement = Announcement::decode(payload)?;
        let displaced = match announcement.status {
            PeerStatus::Disconnected => {
                info!("{} left, dropping its routes", announcement.host);
                self.announced_ports.lock().remove(topic);
                self.table.remove_host(&announcement.host)
            }
            PeerStatus::Connected => {
                let updates = announcement.route_updates();
                debug!("{} serves {} topic(s)", announcement.host, updates.len());
                let moved = self.moved_ports(topic, &updates);
                let mut displaced = self.table.apply(&announcement.host, &updates);
                if !moved.is_empty() {
                    debug!("{} moved {} topic(s) to new ports", announcement.host, moved.len());
                    displaced.extend(self.table.retire(&announcement.host, &moved));
                }
                displaced
            }
        };

        for session in displaced {
            debug!("closing displaced session to {}", session.peer());
            session.close();
        }
        Ok(())
    }

    /// Records the ports in `updates` for the node announcing on `topic` and
    /// returns the `(topic, port)` pairs they replace.
    fn moved_ports(&self, topic: &str, updates: &[RouteUpdate]) -> Vec<(String, u16)> {
        let mut announced = self.announced_ports.lock();
        let known = announced.entry(topic.to_string()).or_default();
        updates
            .iter()
            .filter_map(|u| match known.insert(u.topic.clone(), u.port) {
                Some(old) if old != u.port => Some((u.topic.clone(), old)),
                _ => None,
            })
            .collect()
    }

    /// Logs and swallows announcement errors; used from delivery callbacks.
    pub fn on_delivery(&self, topic: &str, payload: &[u8]) {
        if let Err(e) = self.handle_announcement(topic, payload) {
            warn!("discarding announcement on {}: {}", topic, e);
        }
    }
}
