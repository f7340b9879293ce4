//! The control broker: the rendezvous point every node's control channel
//! connects to. It carries discovery announcements and broker-mediated
//! publishes.

pub mod engine;
pub mod message;
pub mod topic;

pub use engine::Broker;
