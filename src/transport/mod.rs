//! The `transport` module is the network face of the control broker.
//!
//! It defines the frames exchanged with control-channel clients and runs the
//! WebSocket server that parses them and forwards requests to the broker.

pub mod message;
pub mod websocket;

pub use websocket::BrokerServer;

#[cfg(test)]
mod tests;
