use serde::{Deserialize, Serialize};

/// A connectivity candidate exchanged during the handshake.
///
/// `label` is the media line index and `id` the media stream id the candidate
/// belongs to; `candidate` is the candidate line itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub label: u32,
    pub id: String,
    pub candidate: String,
}

/// Messages carried on the point-to-point signaling stream, one JSON object
/// per WebSocket text frame, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SignalMessage {
    #[serde(rename = "offer")]
    Offer { sdp: String },

    #[serde(rename = "answer")]
    Answer { sdp: String },

    #[serde(rename = "candidate")]
    Candidate(IceCandidate),

    /// Graceful teardown.
    #[serde(rename = "bye")]
    Bye,
}

impl SignalMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::Candidate(_) => "candidate",
            SignalMessage::Bye => "bye",
        }
    }

    pub fn to_json(&self) -> crate::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::Error::Encode(e.to_string()))
    }

    pub fn from_json(text: &str) -> crate::Result<Self> {
        serde_json::from_str(text).map_err(|e| crate::Error::SignalingProtocolViolation(e.to_string()))
    }
}
