//! Crown protocol layer.
//!
//! Implements kingdom formation, leader election, succession and
//! pub/sub messaging on top of `crown-wire` (the binary frame and
//! admin-message format). Transports plug in through the
//! [`transport::Connection`] and [`transport::Connector`] contracts;
//! discovery beacons feed sightings in, the runtime does the rest.

pub mod channel;
pub mod config;
pub mod connections;
pub mod error;
pub mod kingdom;
pub mod link;
pub mod runtime;
pub mod transport;
pub mod types;

pub use channel::{
    Channel, ChannelConfig, ChannelManager, ChannelMessage, ChannelMode, MessageRate,
    PickerStrategy,
};
pub use config::CrownConfig;
pub use connections::{ConnectionEvent, ConnectionManager, RetryPolicy};
pub use error::CrownError;
pub use kingdom::{
    transition_allowed, KingdomEffect, KingdomMachine, LifecycleEvent, StateKind, TransitionReason,
};
pub use link::{FrameReceiver, FrameSender, InboundMessage, OutboundMessage, PriorityQueue};
pub use runtime::{
    CrownRuntime, RoleSnapshot, RuntimeChannels, RuntimeCommand, RuntimeHandle,
};
pub use transport::{
    Connection, ConnectionMetadata, Connector, DiscoveryEvent, TransportError,
};
pub use types::{now_ms, DeviceId};
