//! # meshsub
//!
//! `meshsub` is a multi-transport publish/subscribe layer for devices on a
//! local network. Peers find each other and learn which topics the others
//! serve through announcements on a shared control broker, then exchange
//! payload over whichever transport each subscriber asked for: the broker
//! itself, raw stream or datagram sockets, or a peer-to-peer channel
//! negotiated through a signaling handshake.
//!
//! ## Core Modules
//!
//! - `dispatcher`: the publish/subscribe API of a node.
//! - `routing`: the per-topic table of reachable endpoints.
//! - `discovery`: announcement encoding and routing-table maintenance.
//! - `signaling`: the handshake state machine and peer sessions.
//! - `direct`: the stream and datagram transports.
//! - `control`: clients for the control broker.
//! - `broker`, `client`, `transport`, `persistence`: the control broker
//!   itself, its WebSocket front end and its retained-message store.
//! - `config`, `utils`: configuration, errors and logging.

pub mod broker;
pub mod client;
pub mod config;
pub mod control;
pub mod direct;
pub mod discovery;
pub mod dispatcher;
pub mod persistence;
pub mod protocol;
pub mod routing;
pub mod signaling;
pub mod transport;
pub mod utils;

pub use dispatcher::{Callback, Dispatcher, Message, NodeEvent};
pub use protocol::{Protocol, ProtocolSet, QoS};
pub use utils::{Error, Result};
