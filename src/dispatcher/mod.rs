//! Public publish/subscribe API of a node.

pub mod engine;
pub mod message;
pub mod registry;

pub use engine::{Dispatcher, DispatcherBuilder, DispatcherConfig};
pub use message::{Callback, Message, NodeEvent, REPLY_POSTFIX};

#[cfg(test)]
mod tests;
