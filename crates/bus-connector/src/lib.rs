//! Bidirectional bridge between two message buses.
//!
//! A [`BusConnector`] makes every message published on one bus visible once on
//! the other. Each [`BusAdapter`] remembers the ids it has seen on its own bus
//! and drops those when they come back across the bridge, which breaks the
//! forwarding loop without a shared dedup cache.

mod adapter;
mod config;
mod connector;
mod tracked;

pub use adapter::{BusAdapter, MessageIdTracker};
pub use config::{BridgeConfig, DEFAULT_TRACKED_CAPACITY};
pub use connector::BusConnector;
pub use tracked::TrackedIds;
