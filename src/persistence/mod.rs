//! The `persistence` module stores the broker's retained messages.
//!
//! A subscriber that arrives after a retained publish still receives the last
//! message of every matching topic. Discovery relies on this so a late
//! joiner learns every node's announcement. Storage uses `sled`.

pub mod sled_store;

pub use sled_store::RetainedStore;
