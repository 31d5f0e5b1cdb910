use crown_wire::DeviceState;

use crate::transport::TransportError;

/// Protocol-level errors for crown.
///
/// Ordinary network conditions never surface through this type — they
/// become lifecycle events or boolean returns. `CrownError` is for
/// programming errors (bad config, disallowed transition) and for the
/// handful of APIs that can fail before any network activity starts.
#[derive(Debug, thiserror::Error)]
pub enum CrownError {
    #[error("wire error: {0}")]
    Wire(#[from] crown_wire::WireError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("state transition {from} -> {to} is not allowed")]
    InvalidTransition { from: DeviceState, to: DeviceState },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("runtime shut down")]
    RuntimeGone,
}
