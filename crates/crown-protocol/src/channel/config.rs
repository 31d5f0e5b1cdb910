use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How often a channel's dispatcher forwards queued messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRate {
    /// Forward as soon as something is queued.
    NoLimit,
    /// Forward at a fixed period; only the most recently queued
    /// message survives each period, older ones are dropped.
    FixedDiscardOld { interval: Duration },
}

/// What happens to queued messages when a new publish arrives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PickerStrategy {
    /// Queue everything (up to capacity) and send in publish order.
    ProcessAll,
    /// While a message is pending, new publishes are dropped.
    DiscardNew,
    /// A new publish replaces whatever was pending.
    DiscardOld,
}

/// Per-channel tuning. Lower `priority` drains first on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub priority: i32,
    /// Pending-queue bound for [`PickerStrategy::ProcessAll`]; `publish`
    /// returns false once this is reached.
    pub queue_capacity: usize,
    pub rate: MessageRate,
    pub picker: PickerStrategy,
    /// Whether the publisher's own subscribers see its messages.
    pub transmit_reflexive: bool,
    /// Master only: forward even when the subscriber set is empty.
    pub transmit_if_no_subscribers: bool,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            priority: 0,
            queue_capacity: 128,
            rate: MessageRate::NoLimit,
            picker: PickerStrategy::ProcessAll,
            transmit_reflexive: false,
            transmit_if_no_subscribers: true,
        }
    }
}
