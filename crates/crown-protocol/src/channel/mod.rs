//! Pub/sub channels.
//!
//! A [`Channel`] is a local outbound queue with a priority, a rate
//! limit, and a picker strategy. The [`ChannelManager`] owns the
//! channel registry, the per-device subscriber sets, and the routing
//! rules that differ between the master (the King fans messages out to
//! subscribers) and a client (everything goes up to the King).

mod config;
mod manager;
mod queue;

pub use config::{ChannelConfig, MessageRate, PickerStrategy};
pub use manager::{ChannelManager, ChannelMode};
pub use queue::Channel;

use bytes::Bytes;

/// A message delivered to a local subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub channel_id: i16,
    /// Short id of the publishing device.
    pub source_id: u16,
    pub payload: Bytes,
}
