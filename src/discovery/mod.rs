//! Peer discovery.
//!
//! Nodes announce the topics they can serve (and how) through retained
//! messages on the control broker; every node turns the announcements it
//! sees into routing-table entries.

pub mod announcement;
pub mod engine;

pub use announcement::{Announcement, PeerStatus, TopicCapability, is_reserved_key};
pub use engine::{DiscoveryConfig, DiscoveryEngine};
