//! Per-connection messaging link.
//!
//! One [`FrameSender`] and one [`FrameReceiver`] pair exists per active
//! connection, each owning a dedicated task. The sender drains a
//! priority queue and fragments oversized payloads into chunk frames;
//! the receiver reassembles chunk runs and delivers whole messages in
//! arrival order.

mod queue;
mod receiver;
mod sender;

pub use queue::PriorityQueue;
pub use receiver::FrameReceiver;
pub use sender::{split_frames, FrameSender};

use bytes::Bytes;
use crown_wire::{Frame, FrameFlags};

use crate::types::DeviceId;

/// Priority used for admin control traffic. Always ahead of
/// application channels (whose priorities are plain i32s around 0).
pub const ADMIN_MESSAGE_PRIORITY: i32 = i32::MIN;

/// A message queued for transmission on one connection.
///
/// The payload is size-unbounded; the sender splits it into as many
/// frames as needed at write time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel_id: i16,
    pub flags: FrameFlags,
    pub payload: Bytes,
    /// Frame source id to stamp instead of the sending device's own,
    /// used when forwarding another device's message to keep the
    /// original publisher visible to subscribers.
    pub source_override: Option<u16>,
}

impl OutboundMessage {
    pub fn app(channel_id: i16, payload: Bytes) -> Self {
        OutboundMessage {
            channel_id,
            flags: FrameFlags::empty(),
            payload,
            source_override: None,
        }
    }

    pub fn forwarded(channel_id: i16, source_id: u16, payload: Bytes) -> Self {
        OutboundMessage {
            channel_id,
            flags: FrameFlags::empty(),
            payload,
            source_override: Some(source_id),
        }
    }

    pub fn admin(message: &crown_wire::AdminMessage) -> Result<Self, crown_wire::WireError> {
        Ok(OutboundMessage {
            channel_id: crown_wire::ADMIN_CHANNEL_ID,
            flags: FrameFlags::ADMIN,
            payload: message.encode()?,
            source_override: None,
        })
    }
}

/// A fully reassembled message delivered by a receiver.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    /// Device on the far end of the connection that delivered this.
    pub from: DeviceId,
    /// Reassembled frame (chunk flags cleared), or a raw chunk frame
    /// when the receiver runs in forward-chunks mode.
    pub frame: Frame,
}
