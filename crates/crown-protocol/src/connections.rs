//! Connection bookkeeping.
//!
//! Maps each remote device to its live connections, wires a
//! sender/receiver pair onto every connection, and runs the
//! exponential-backoff outbound connect. All mutation is per-key on
//! the device table; there is no manager-wide lock.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crown_wire::{AdminMessage, FrameFlags};
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::link::{
    FrameReceiver, FrameSender, InboundMessage, OutboundMessage, ADMIN_MESSAGE_PRIORITY,
};
use crate::transport::{Connection, ConnectionMetadata, Connector};
use crate::types::DeviceId;

// ── Events ──────────────────────────────────────────────────────────

/// Connection lifecycle, as observed by the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A connection went live (outbound or accepted).
    Established { device: DeviceId, connection_id: u64 },
    /// A connection went down. Fired exactly once per connection, no
    /// matter which side closed it or how many times `disconnect` ran.
    Closed { device: DeviceId, connection_id: u64 },
    /// An outbound connect exhausted its retries.
    ConnectFailed { device: DeviceId },
}

/// Backoff schedule for outbound connects.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub backoff_factor: f64,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            base_delay: Duration::from_millis(200),
            backoff_factor: 2.0,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry `attempt` (0-based), with jitter so two
    /// devices connecting to each other do not stay in lockstep.
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * self.backoff_factor.powi(attempt as i32);
        let jitter = rand::random_range(0.0..=0.25) * base;
        Duration::from_millis((base + jitter) as u64)
    }
}

// ── Manager ─────────────────────────────────────────────────────────

struct ConnectionHandle {
    id: u64,
    conn: Arc<dyn Connection>,
    sender: Arc<FrameSender>,
    receiver: Arc<FrameReceiver>,
}

/// Owns every live connection of the local device.
pub struct ConnectionManager {
    local: DeviceId,
    keep_alive: Duration,
    retry: RetryPolicy,
    connectors: Vec<Arc<dyn Connector>>,
    connections: DashMap<DeviceId, Vec<Arc<ConnectionHandle>>>,
    /// Last beacon metadata seen per device, used to pick a connector.
    metadata: DashMap<DeviceId, ConnectionMetadata>,
    /// Devices with a connect task in flight.
    connecting: DashMap<DeviceId, ()>,
    next_handle_id: AtomicU64,
    inbound_tx: mpsc::Sender<InboundMessage>,
    events_tx: mpsc::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        local: DeviceId,
        keep_alive: Duration,
        retry: RetryPolicy,
        connectors: Vec<Arc<dyn Connector>>,
        inbound_tx: mpsc::Sender<InboundMessage>,
        events_tx: mpsc::Sender<ConnectionEvent>,
    ) -> Arc<Self> {
        Arc::new(ConnectionManager {
            local,
            keep_alive,
            retry,
            connectors,
            connections: DashMap::new(),
            metadata: DashMap::new(),
            connecting: DashMap::new(),
            next_handle_id: AtomicU64::new(1),
            inbound_tx,
            events_tx,
        })
    }

    pub fn local_device(&self) -> &DeviceId {
        &self.local
    }

    /// Remember how a device said it can be reached. Every beacon
    /// sighting refreshes this, connected or not.
    pub fn note_metadata(&self, device: DeviceId, metadata: ConnectionMetadata) {
        self.metadata.insert(device, metadata);
    }

    pub fn is_connected(&self, device: &DeviceId) -> bool {
        self.connections
            .get(device)
            .map(|handles| !handles.is_empty())
            .unwrap_or(false)
    }

    pub fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| entry.key().clone())
            .collect()
    }

    /// Adopt a connection (accepted or dialed): wire up its link pair
    /// and watch for close. Emits `Established` now and `Closed` later.
    pub fn add_connection(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        let device = conn.remote_device();
        let id = self.next_handle_id.fetch_add(1, Ordering::Relaxed);

        let sender = Arc::new(FrameSender::new(self.local.short_id()));
        let receiver = Arc::new(FrameReceiver::new());
        sender.activate(conn.clone(), self.keep_alive);
        receiver.activate(conn.clone(), self.inbound_tx.clone());

        let handle = Arc::new(ConnectionHandle {
            id,
            conn: conn.clone(),
            sender,
            receiver,
        });
        self.connections
            .entry(device.clone())
            .or_default()
            .push(handle);

        tracing::debug!(local = %self.local, remote = %device, id, "connection established");
        let _ = self.events_tx.try_send(ConnectionEvent::Established {
            device: device.clone(),
            connection_id: id,
        });

        // The close watcher is the single point of removal, so Closed
        // fires exactly once even when disconnect races a peer close.
        let manager = self.clone();
        tokio::spawn(async move {
            conn.closed().await;
            manager.remove_connection(&device, id);
        });
    }

    fn remove_connection(&self, device: &DeviceId, id: u64) {
        let removed = match self.connections.get_mut(device) {
            Some(mut handles) => {
                let before = handles.len();
                let mut taken = None;
                handles.retain(|h| {
                    if h.id == id {
                        taken = Some(h.clone());
                        false
                    } else {
                        true
                    }
                });
                debug_assert!(handles.len() + 1 >= before);
                taken
            }
            None => None,
        };
        if let Some(handle) = removed {
            handle.sender.deactivate();
            handle.receiver.deactivate();
            tracing::debug!(local = %self.local, remote = %device, id, "connection closed");
            let _ = self.events_tx.try_send(ConnectionEvent::Closed {
                device: device.clone(),
                connection_id: id,
            });
        }
    }

    /// Dial `device` with backoff. No-op if already connected or a
    /// connect is in flight. Emits `Established` or `ConnectFailed`.
    pub fn spawn_connect(self: &Arc<Self>, device: DeviceId) {
        if self.is_connected(&device) {
            return;
        }
        if self.connecting.insert(device.clone(), ()).is_some() {
            return;
        }
        let manager = self.clone();
        tokio::spawn(async move {
            let outcome = manager.connect_with_backoff(&device).await;
            manager.connecting.remove(&device);
            match outcome {
                Some(conn) => manager.add_connection(conn),
                None => {
                    tracing::warn!(local = %manager.local, remote = %device, "connect gave up");
                    let _ = manager
                        .events_tx
                        .try_send(ConnectionEvent::ConnectFailed { device });
                }
            }
        });
    }

    async fn connect_with_backoff(&self, device: &DeviceId) -> Option<Arc<dyn Connection>> {
        let connector = self.resolve_connector(device)?;
        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                tokio::time::sleep(self.retry.delay(attempt - 1)).await;
            }
            match connector.connect(device).await {
                Ok(conn) => return Some(conn),
                Err(e) => {
                    tracing::debug!(
                        local = %self.local, remote = %device, attempt,
                        "connect attempt failed: {e}"
                    );
                }
            }
        }
        None
    }

    /// Pick a connector whose type the target advertised.
    fn resolve_connector(&self, device: &DeviceId) -> Option<Arc<dyn Connector>> {
        let metadata = self.metadata.get(device)?;
        self.connectors
            .iter()
            .find(|c| metadata.supports(c.connection_type()))
            .cloned()
    }

    /// Queue a message toward `device`. Returns false when no
    /// connection exists (the caller decides whether that matters).
    pub fn send_to(&self, device: &DeviceId, priority: i32, message: OutboundMessage) -> bool {
        match self.connections.get(device) {
            Some(handles) => match handles.first() {
                Some(handle) => {
                    handle.sender.enqueue(priority, message);
                    true
                }
                None => false,
            },
            None => false,
        }
    }

    pub fn send_admin(&self, device: &DeviceId, message: &AdminMessage) -> bool {
        let out = match OutboundMessage::admin(message) {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!(target = %device, "unencodable admin message: {e}");
                return false;
            }
        };
        self.send_to(device, ADMIN_MESSAGE_PRIORITY, out)
    }

    /// Queue an admin message on every live connection.
    pub fn broadcast_admin(&self, message: &AdminMessage) {
        let mut out = match OutboundMessage::admin(message) {
            Ok(out) => out,
            Err(e) => {
                tracing::warn!("unencodable admin message: {e}");
                return;
            }
        };
        out.flags = out.flags.with(FrameFlags::BROADCAST);
        for entry in self.connections.iter() {
            if let Some(handle) = entry.value().first() {
                handle.sender.enqueue(ADMIN_MESSAGE_PRIORITY, out.clone());
            }
        }
    }

    /// Drop every connection to `device`. Close events arrive via the
    /// per-connection watchers.
    pub async fn disconnect_device(&self, device: &DeviceId) {
        let handles: Vec<Arc<ConnectionHandle>> = self
            .connections
            .get(device)
            .map(|h| h.clone())
            .unwrap_or_default();
        for handle in handles {
            handle.conn.disconnect().await;
        }
    }

    pub async fn disconnect_all(&self) {
        let devices = self.connected_devices();
        for device in devices {
            self.disconnect_device(&device).await;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────
