use std::sync::Arc;

use crate::broker::message::Message as BrokerMessage;
use crate::protocol::{Protocol, QoS};
use crate::signaling::{CloseReason, FrameMeta};

/// Marks reply topics: `<topic>_AittRe_<token>`.
pub const REPLY_POSTFIX: &str = "_AittRe_";

/// A message handed to subscriber callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    /// Transport the message arrived on.
    pub protocol: Protocol,
    pub qos: QoS,
    pub correlation: Option<String>,
    /// Set when the sender expects an answer through `send_reply`.
    pub reply_topic: Option<String>,
    pub sequence: u32,
    pub end_sequence: bool,
    /// Frame coordinates, for messages that came over a peer channel.
    pub frame: Option<FrameMeta>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: Vec<u8>, protocol: Protocol) -> Self {
        Self {
            topic: topic.into(),
            payload,
            protocol,
            qos: QoS::default(),
            correlation: None,
            reply_topic: None,
            sequence: 0,
            end_sequence: false,
            frame: None,
        }
    }

    pub fn is_reply_topic(&self) -> bool {
        self.topic.contains(REPLY_POSTFIX)
    }
}

impl From<BrokerMessage> for Message {
    fn from(msg: BrokerMessage) -> Self {
        let mut out = Message::new(msg.topic, msg.payload, Protocol::Broker);
        out.qos = msg.qos;
        if let Some(reply) = msg.reply {
            out.reply_topic = Some(reply.reply_topic);
            out.correlation = reply.correlation;
            out.sequence = reply.sequence;
            out.end_sequence = reply.end;
        }
        out
    }
}

pub type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

/// Notifications about background activity that never surface as errors of
/// a call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    SessionReady {
        topic: String,
        peer: String,
    },
    SessionClosed {
        topic: String,
        peer: String,
        reason: CloseReason,
    },
    /// A session failed or timed out before or during its handshake.
    ConnectionFailure {
        topic: String,
        peer: String,
        reason: String,
    },
    TransportFailure {
        topic: String,
        peer: String,
        protocol: Protocol,
        reason: String,
    },
    /// The control channel dropped without `disconnect`. Broker delivery and
    /// discovery stop until `connect` is called again.
    ControlDisconnected { reason: String },
}
