//! The `client` module defines the broker's view of a connected
//! control-channel client: its identifier, the channel frames are pushed
//! into, and its last-will message.

pub mod pubsub_client;
pub use pubsub_client::Client;
