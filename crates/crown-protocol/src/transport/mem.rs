//! In-memory transport.
//!
//! Duplex pipe pairs over `tokio::io::duplex`, plus a process-wide
//! registry (`MemNetwork`) that plays the role of a physical medium:
//! registered devices get an acceptor feed, and a [`MemConnector`]
//! resolves targets through the registry.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, watch, Mutex};

use super::{Connection, ConnectionMetadata, Connector, TransportError};
use crate::types::DeviceId;

/// Connection-type string of the in-memory transport.
pub const MEM_CONNECTION_TYPE: &str = "mem";

/// Pipe capacity. Large enough that a full chunked message never
/// deadlocks a test writing without a concurrent reader.
const PIPE_CAPACITY: usize = 4 * 0xFFFF;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One side of an in-memory duplex connection.
pub struct MemConnection {
    id: u64,
    remote: DeviceId,
    reader: Mutex<ReadHalf<DuplexStream>>,
    writer: Mutex<WriteHalf<DuplexStream>>,
    disconnected: AtomicBool,
    closed_tx: watch::Sender<bool>,
}

impl MemConnection {
    fn new(remote: DeviceId, stream: DuplexStream) -> Self {
        let (reader, writer) = tokio::io::split(stream);
        let (closed_tx, _) = watch::channel(false);
        MemConnection {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            remote,
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            disconnected: AtomicBool::new(false),
            closed_tx,
        }
    }

    fn mark_closed(&self) {
        // First marker wins; listeners observe exactly one close.
        // send_replace updates the value even with no receiver alive
        // yet, so a waiter subscribing after the close still sees it.
        if !self.disconnected.swap(true, Ordering::SeqCst) {
            self.closed_tx.send_replace(true);
        }
    }

    fn is_down(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }
}

/// Create a connected pair. `a_id`/`b_id` are the identities of the two
/// endpoints; the first returned connection lives at `a` (remote `b`),
/// the second at `b` (remote `a`).
pub fn pair(a_id: DeviceId, b_id: DeviceId) -> (Arc<MemConnection>, Arc<MemConnection>) {
    let (stream_a, stream_b) = tokio::io::duplex(PIPE_CAPACITY);
    (
        Arc::new(MemConnection::new(b_id, stream_a)),
        Arc::new(MemConnection::new(a_id, stream_b)),
    )
}

#[async_trait]
impl Connection for MemConnection {
    fn remote_device(&self) -> DeviceId {
        self.remote.clone()
    }

    fn connection_id(&self) -> u64 {
        self.id
    }

    async fn read_exact(&self, buf: &mut [u8]) -> Result<(), TransportError> {
        if self.is_down() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock().await;
        match reader.read_exact(buf).await {
            Ok(_) => Ok(()),
            Err(_) => {
                drop(reader);
                self.mark_closed();
                Err(TransportError::Closed)
            }
        }
    }

    async fn write_all(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_down() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        match writer.write_all(data).await {
            Ok(()) => Ok(()),
            Err(_) => {
                drop(writer);
                self.mark_closed();
                Err(TransportError::Closed)
            }
        }
    }

    async fn disconnect(&self) {
        if self.is_down() {
            return;
        }
        // Shut the write half so the peer's pending read sees EOF.
        {
            let mut writer = self.writer.lock().await;
            let _ = writer.shutdown().await;
        }
        self.mark_closed();
    }

    async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Process-wide in-memory medium.
///
/// Cheap to clone; all clones share the registry.
#[derive(Clone, Default)]
pub struct MemNetwork {
    acceptors: Arc<DashMap<DeviceId, mpsc::Sender<Arc<dyn Connection>>>>,
}

impl MemNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device. Returns its connector and the acceptor feed
    /// of inbound connections.
    pub fn register(
        &self,
        device: DeviceId,
    ) -> (MemConnector, mpsc::Receiver<Arc<dyn Connection>>) {
        let (tx, rx) = mpsc::channel(16);
        self.acceptors.insert(device.clone(), tx);
        (
            MemConnector {
                local: device,
                network: self.clone(),
            },
            rx,
        )
    }

    /// Remove a device from the medium (simulates going out of range).
    /// Existing connections stay up until disconnected.
    pub fn unregister(&self, device: &DeviceId) {
        self.acceptors.remove(device);
    }

    /// Metadata advertising this transport.
    pub fn metadata() -> ConnectionMetadata {
        ConnectionMetadata::new(vec![MEM_CONNECTION_TYPE.to_string()])
    }
}

/// Connector over the in-memory medium.
pub struct MemConnector {
    local: DeviceId,
    network: MemNetwork,
}

#[async_trait]
impl Connector for MemConnector {
    fn connection_type(&self) -> &str {
        MEM_CONNECTION_TYPE
    }

    async fn connect(&self, device: &DeviceId) -> Result<Arc<dyn Connection>, TransportError> {
        let acceptor = self
            .network
            .acceptors
            .get(device)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable {
                device: device.clone(),
            })?;

        let (ours, theirs) = pair(self.local.clone(), device.clone());
        let inbound: Arc<dyn Connection> = theirs;
        acceptor
            .send(inbound)
            .await
            .map_err(|_| TransportError::Unreachable {
                device: device.clone(),
            })?;
        Ok(ours)
    }
}
