//! Discovery announcements and their MessagePack encoding.
//!
//! On the wire an announcement is one map:
//!
//! ```text
//! { "status": "connected", "host": "10.0.0.7",
//!   "camera/front": { "protocol": 16, "port": 40123 }, ... }
//! ```
//!
//! `status` and `host` are reserved; every other key is a topic. A
//! `"disconnected"` announcement carries no topics.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::protocol::Protocol;
use crate::routing::RouteUpdate;
use crate::{Error, Result};

pub const STATUS_KEY: &str = "status";
pub const HOST_KEY: &str = "host";

/// Topics that would collide with the reserved announcement keys.
pub fn is_reserved_key(topic: &str) -> bool {
    topic == STATUS_KEY || topic == HOST_KEY
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Connected,
    Disconnected,
}

impl PeerStatus {
    pub const fn as_str(self) -> &'static str {
        match self {
            PeerStatus::Connected => "connected",
            PeerStatus::Disconnected => "disconnected",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "connected" => Some(PeerStatus::Connected),
            "disconnected" => Some(PeerStatus::Disconnected),
            _ => None,
        }
    }
}

impl fmt::Display for PeerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a remote node serves one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicCapability {
    pub protocol: Protocol,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Announcement {
    pub status: PeerStatus,
    pub host: String,
    pub topics: BTreeMap<String, TopicCapability>,
}

#[derive(Serialize, Deserialize)]
struct WireAnnouncement {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    status: Option<String>,
    host: String,
    #[serde(flatten)]
    topics: BTreeMap<String, WireCapability>,
}

#[derive(Serialize, Deserialize)]
struct WireCapability {
    protocol: u32,
    port: u32,
}

impl Announcement {
    pub fn connected(host: impl Into<String>) -> Self {
        Self {
            status: PeerStatus::Connected,
            host: host.into(),
            topics: BTreeMap::new(),
        }
    }

    pub fn disconnected(host: impl Into<String>) -> Self {
        Self {
            status: PeerStatus::Disconnected,
            host: host.into(),
            topics: BTreeMap::new(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>, protocol: Protocol, port: u16) -> Self {
        self.topics
            .insert(topic.into(), TopicCapability { protocol, port });
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.host.is_empty() {
            return Err(Error::invalid_argument("announcement without host"));
        }
        if let Some(topic) = self.topics.keys().find(|t| is_reserved_key(t)) {
            return Err(Error::invalid_argument(format!(
                "topic '{topic}' collides with a reserved key"
            )));
        }

        let topics = match self.status {
            PeerStatus::Connected => self
                .topics
                .iter()
                .map(|(topic, cap)| {
                    (
                        topic.clone(),
                        WireCapability {
                            protocol: cap.protocol.bits(),
                            port: u32::from(cap.port),
                        },
                    )
                })
                .collect(),
            PeerStatus::Disconnected => BTreeMap::new(),
        };

        let wire = WireAnnouncement {
            status: Some(self.status.as_str().to_string()),
            host: self.host.clone(),
            topics,
        };
        Ok(rmp_serde::to_vec_named(&wire)?)
    }

    /// Decodes an announcement as a unit. Structural problems reject the
    /// whole payload; a topic entry with an unknown protocol or an
    /// out-of-range port is skipped with a warning.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let wire: WireAnnouncement = rmp_serde::from_slice(bytes)
            .map_err(|e| Error::MalformedAnnouncement(e.to_string()))?;

        if wire.host.is_empty() {
            return Err(Error::MalformedAnnouncement("empty host".into()));
        }

        let status = match wire.status.as_deref() {
            None => PeerStatus::Connected,
            Some(s) => PeerStatus::parse(s)
                .ok_or_else(|| Error::MalformedAnnouncement(format!("unknown status '{s}'")))?,
        };

        let mut announcement = Announcement {
            status,
            host: wire.host,
            topics: BTreeMap::new(),
        };
        if status == PeerStatus::Disconnected {
            return Ok(announcement);
        }

        for (topic, cap) in wire.topics {
            let Some(protocol) = Protocol::from_bits(cap.protocol) else {
                warn!(
                    "skipping '{}' from {}: unknown protocol {:#x}",
                    topic, announcement.host, cap.protocol
                );
                continue;
            };
            let Ok(port) = u16::try_from(cap.port) else {
                warn!(
                    "skipping '{}' from {}: port {} out of range",
                    topic, announcement.host, cap.port
                );
                continue;
            };
            announcement
                .topics
                .insert(topic, TopicCapability { protocol, port });
        }
        Ok(announcement)
    }

    /// The routing updates this announcement stands for.
    pub fn route_updates(&self) -> Vec<RouteUpdate> {
        self.topics
            .iter()
            .map(|(topic, cap)| RouteUpdate {
                topic: topic.clone(),
                port: cap.port,
                protocol: cap.protocol,
            })
            .collect()
    }
}
