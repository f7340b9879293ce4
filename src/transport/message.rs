//! Control protocol frames exchanged between control-channel clients and the
//! broker, one JSON object per WebSocket text frame, tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::broker::message::{Message, Will};
use crate::protocol::QoS;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientFrame {
    #[serde(rename = "connect")]
    Connect {
        client_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        will: Option<Will>,
    },

    #[serde(rename = "subscribe")]
    Subscribe {
        filter: String,
        #[serde(default)]
        qos: QoS,
    },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { filter: String },

    #[serde(rename = "publish")]
    Publish(Message),

    #[serde(rename = "disconnect")]
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerFrame {
    #[serde(rename = "connack")]
    ConnAck { client_id: String },

    #[serde(rename = "deliver")]
    Deliver(Message),

    #[serde(rename = "error")]
    Error { reason: String },
}

impl ClientFrame {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

impl ServerFrame {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Encode(e.to_string()))
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
