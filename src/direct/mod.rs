//! Direct (connectionless) transports.
//!
//! `STREAM` and `DATAGRAM` publishes go straight to the port a subscriber
//! advertised, without a handshake. Both share one envelope:
//!
//! ```text
//! [topic len: u16 BE][topic utf-8][payload len: u32 BE][payload]
//! ```

pub mod datagram;
pub mod stream;

use std::sync::Arc;

use async_trait::async_trait;

use crate::protocol::Protocol;
use crate::{Error, Result};

pub use datagram::DatagramTransport;
pub use stream::StreamTransport;

/// Receives `(topic, payload)` for every envelope a listener accepts.
pub type PayloadSink = Arc<dyn Fn(String, Vec<u8>) + Send + Sync>;

#[async_trait]
pub trait DirectTransport: Send + Sync {
    fn protocol(&self) -> Protocol;

    /// Opens a listening endpoint for `topic` and returns its port.
    async fn listen(&self, topic: &str, sink: PayloadSink) -> Result<u16>;

    async fn send(&self, host: &str, port: u16, topic: &str, payload: &[u8]) -> Result<()>;

    /// Closes the endpoint bound to `port`. Unknown ports are ignored.
    fn unlisten(&self, port: u16);
}

const TOPIC_LEN_BYTES: usize = 2;
const PAYLOAD_LEN_BYTES: usize = 4;

pub(crate) fn encode_envelope(topic: &str, payload: &[u8]) -> Result<Vec<u8>> {
    let topic_len = u16::try_from(topic.len())
        .map_err(|_| Error::invalid_argument("topic too long for a direct envelope"))?;
    let payload_len = u32::try_from(payload.len())
        .map_err(|_| Error::invalid_argument("payload too large for a direct envelope"))?;

    let mut buf =
        Vec::with_capacity(TOPIC_LEN_BYTES + topic.len() + PAYLOAD_LEN_BYTES + payload.len());
    buf.extend_from_slice(&topic_len.to_be_bytes());
    buf.extend_from_slice(topic.as_bytes());
    buf.extend_from_slice(&payload_len.to_be_bytes());
    buf.extend_from_slice(payload);
    Ok(buf)
}

pub(crate) fn decode_envelope(buf: &[u8]) -> Result<(String, Vec<u8>)> {
    let truncated = || Error::Decode("truncated envelope".into());

    let (len, rest) = buf.split_at_checked(TOPIC_LEN_BYTES).ok_or_else(truncated)?;
    let topic_len = usize::from(u16::from_be_bytes([len[0], len[1]]));
    let (topic, rest) = rest.split_at_checked(topic_len).ok_or_else(truncated)?;
    let topic =
        String::from_utf8(topic.to_vec()).map_err(|e| Error::Decode(e.to_string()))?;

    let (len, rest) = rest.split_at_checked(PAYLOAD_LEN_BYTES).ok_or_else(truncated)?;
    let payload_len = u32::from_be_bytes([len[0], len[1], len[2], len[3]]) as usize;
    if rest.len() != payload_len {
        return Err(Error::Decode(format!(
            "payload length {} does not match {} remaining bytes",
            payload_len,
            rest.len()
        )));
    }
    Ok((topic, rest.to_vec()))
}

#[cfg(test)]
mod tests;
