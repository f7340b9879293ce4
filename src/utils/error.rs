//! The `error` module defines the error type shared by every `meshsub` component.
//!
//! Variants mirror how a failure is handled: `InvalidArgument` is raised to the
//! caller before any side effect, while announcement, signaling and transport
//! failures are logged and absorbed (or reported as `NodeEvent`s) by the
//! component that hit them.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no route for topic: {0}")]
    RouteNotFound(String),

    #[error("malformed announcement: {0}")]
    MalformedAnnouncement(String),

    #[error("signaling protocol violation: {0}")]
    SignalingProtocolViolation(String),

    #[error("transport failure: {0}")]
    TransportFailure(String),

    #[error("handshake did not complete within {0} ms")]
    HandshakeTimeout(u64),

    #[error("session is closed")]
    SessionClosed,

    #[error("control channel is not connected")]
    NotConnected,

    #[error("encode error: {0}")]
    Encode(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error("retained store error: {0}")]
    Store(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn transport(msg: impl std::fmt::Display) -> Self {
        Self::TransportFailure(msg.to_string())
    }
}

impl From<rmp_serde::encode::Error> for Error {
    fn from(e: rmp_serde::encode::Error) -> Self {
        Self::Encode(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for Error {
    fn from(e: rmp_serde::decode::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Decode(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
