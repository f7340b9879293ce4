//! Per-topic routing state fed by discovery.

pub mod table;

pub use table::{RouteEntry, RouteUpdate, RoutingTable};

#[cfg(test)]
mod tests;
