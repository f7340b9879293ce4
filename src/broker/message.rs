//! Messages as the broker stores and routes them.
//!
//! A `Message` is what a client publishes and what subscribers receive. The
//! payload is opaque bytes; `reply` carries request/response metadata the
//! broker passes through untouched.

use serde::{Deserialize, Serialize};

use crate::protocol::QoS;

/// Request/response metadata carried alongside a payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyInfo {
    /// Topic the responder should publish to.
    pub reply_topic: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,
    #[serde(default)]
    pub sequence: u32,
    /// Set on the last reply of a sequence.
    #[serde(default)]
    pub end: bool,
}

/// Message the broker publishes on a client's behalf when the client drops
/// without a `disconnect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Will {
    pub topic: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub qos: QoS,
    #[serde(default)]
    pub retain: bool,
}

/// A published message as seen by the broker and its subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
    #[serde(default)]
    pub qos: QoS,
    /// On publish: keep as the topic's retained message. On delivery: the
    /// message was replayed from the retained store.
    #[serde(default)]
    pub retain: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply: Option<ReplyInfo>,
    #[serde(default)]
    pub timestamp: i64,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::default(),
            retain: false,
            reply: None,
            timestamp: 0,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retained(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub fn with_reply(mut self, reply: ReplyInfo) -> Self {
        self.reply = Some(reply);
        self
    }
}
