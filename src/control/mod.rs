//! Control-channel clients.
//!
//! The control channel connects a node to the shared broker. It carries the
//! discovery announcements and every broker-mediated publish. `ControlChannel`
//! is the boundary the rest of the crate programs against:
//!
//! - `WsControlClient` talks to a broker over WebSocket.
//! - `LocalControlClient` attaches to an in-process `Broker`.

pub mod local;
pub mod ws;

use std::sync::Arc;

use async_trait::async_trait;

use crate::Result;
use crate::broker::message::Message;
use crate::protocol::QoS;

pub use crate::broker::message::{ReplyInfo, Will};
pub use local::LocalControlClient;
pub use ws::WsControlClient;

/// Receives every message the broker delivers to this client.
pub type DeliverySink = Arc<dyn Fn(Message) + Send + Sync>;

/// Told why the link to the broker went away. Not called for `disconnect`.
pub type LinkLostSink = Arc<dyn Fn(&str) + Send + Sync>;

#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Identifier the broker knows this client by.
    fn client_id(&self) -> &str;

    /// Installs the sink deliveries are handed to. Set it before `connect`
    /// so retained messages replayed on subscribe are not missed.
    fn set_sink(&self, sink: DeliverySink);

    fn set_link_lost_sink(&self, sink: LinkLostSink);

    /// Registers the last-will message sent with the next `connect`.
    fn set_will(&self, will: Option<Will>);

    /// False once the link is lost, after which `connect` dials again.
    fn is_connected(&self) -> bool;

    async fn connect(&self, host: &str, port: u16) -> Result<()>;

    async fn publish(&self, message: Message) -> Result<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;

    async fn unsubscribe(&self, filter: &str) -> Result<()>;

    /// Graceful disconnect; the broker discards the will.
    async fn disconnect(&self) -> Result<()>;
}
