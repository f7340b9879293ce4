use tokio::sync::mpsc::UnboundedSender;

use crate::broker::message::Will;
use crate::transport::message::ServerFrame;

/// A control-channel client connected to the broker.
///
/// The broker never writes to a socket itself: it pushes frames into
/// `sender` and the connection's own task forwards them.
#[derive(Debug)]
pub struct Client {
    /// Identifier the client announced in its `connect` frame.
    pub id: String,

    /// Channel to the task that writes to the client.
    pub sender: UnboundedSender<ServerFrame>,

    /// Published by the broker if the client goes away without `disconnect`.
    pub will: Option<Will>,
}

impl Client {
    pub fn new(sender: UnboundedSender<ServerFrame>) -> Self {
        Self::with_id(format!("client-{}", uuid::Uuid::new_v4()), sender)
    }

    pub fn with_id(id: impl Into<String>, sender: UnboundedSender<ServerFrame>) -> Self {
        Self {
            id: id.into(),
            sender,
            will: None,
        }
    }

    pub fn with_will(mut self, will: Option<Will>) -> Self {
        self.will = will;
        self
    }
}
