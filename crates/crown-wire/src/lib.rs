//! Crown wire layer.
//!
//! Implements the binary envelope every crown connection speaks
//! (`Frame`) and the typed control messages carried inside admin
//! frames (`AdminMessage`).
//!
//! Wire format: fixed big-endian header, hand-encoded. No schema
//! evolution — the layout is part of the protocol.

pub mod admin;
pub mod error;
pub mod frame;
pub mod types;

pub use admin::AdminMessage;
pub use error::WireError;
pub use frame::{
    Frame, FrameFlags, FrameHeader, ADMIN_CHANNEL_ID, ADMIN_HEADER_LEN, FRAME_HEADER_LEN,
    FRAME_VERSION, MAX_PAYLOAD_SIZE,
};
pub use types::DeviceState;
