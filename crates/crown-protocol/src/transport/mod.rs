//! Transport contracts.
//!
//! Crown never opens sockets itself. Concrete transports (Bluetooth,
//! TCP, WebSocket, ...) implement [`Connection`] and [`Connector`] and
//! hand accepted connections plus beacon sightings to the runtime; the
//! in-memory implementation in [`mem`] serves tests and loopback use.

pub mod mem;

use std::sync::Arc;

use async_trait::async_trait;
use crown_wire::DeviceState;

use crate::types::DeviceId;

/// Errors from the transport seam.
///
/// Always treated as recoverable by the protocol: a failed read or
/// write surfaces as a connection-closed event, a failed connect feeds
/// the retry/backoff loop.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error("i/o failure: {0}")]
    Io(String),

    #[error("no route to {device}")]
    Unreachable { device: DeviceId },
}

/// A duplex byte stream bound to one remote device.
///
/// `disconnect` is idempotent: the first call halts further reads and
/// writes, later calls are no-ops. `closed` resolves exactly once the
/// connection is fully down, regardless of which side closed it or how
/// many tasks await it.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The device on the far end.
    fn remote_device(&self) -> DeviceId;

    /// Unique id of this connection instance (a device may have several).
    fn connection_id(&self) -> u64;

    /// Read exactly `buf.len()` bytes, blocking only the calling task.
    async fn read_exact(&self, buf: &mut [u8]) -> Result<(), TransportError>;

    /// Write all of `data`, blocking only the calling task.
    async fn write_all(&self, data: &[u8]) -> Result<(), TransportError>;

    /// Halt reads/writes now; close listeners fire asynchronously once.
    async fn disconnect(&self);

    /// Resolves when the connection is closed (either side, any cause).
    async fn closed(&self);
}

/// Opens outbound connections for one connection-type string.
#[async_trait]
pub trait Connector: Send + Sync {
    /// The connection-type string this connector serves (matched
    /// against beacon metadata).
    fn connection_type(&self) -> &str;

    /// Attempt a single connect. Errors are retryable by policy.
    async fn connect(&self, device: &DeviceId) -> Result<Arc<dyn Connection>, TransportError>;
}

/// How a device said it can be reached, as reported by beacons.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionMetadata {
    pub connection_types: Vec<String>,
}

impl ConnectionMetadata {
    pub fn new(connection_types: Vec<String>) -> Self {
        ConnectionMetadata { connection_types }
    }

    pub fn supports(&self, connection_type: &str) -> bool {
        self.connection_types
            .iter()
            .any(|t| t == connection_type)
    }
}

/// A beacon sighting: a nearby device, its last-known state, and how
/// to reach it. The core consumes these; it never initiates discovery.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub device: DeviceId,
    pub state: DeviceState,
    pub metadata: ConnectionMetadata,
}
