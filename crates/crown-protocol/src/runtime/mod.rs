/// Protocol runtime — wires the kingdom machine, connection manager
/// and channel manager into one live event loop.
///
/// The runtime owns all mutable protocol state; applications talk to
/// it through a cloneable [`RuntimeHandle`] and a stream of
/// [`LifecycleEvent`]s, and never touch raw frames.
mod r#loop;

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};

use crate::channel::{Channel, ChannelConfig, ChannelManager, ChannelMessage};
use crate::config::CrownConfig;
use crate::connections::ConnectionManager;
use crate::error::CrownError;
use crate::kingdom::{KingdomMachine, LifecycleEvent, StateKind};
use crate::transport::{Connection, Connector, DiscoveryEvent};
use crate::types::DeviceId;

// ── Commands (app → runtime) ────────────────────────────────────────

/// Commands the application sends to the runtime event loop.
pub enum RuntimeCommand {
    /// Leave Stopped and begin reacting to discovery.
    Start,
    /// Drop all connections and go back to Stopped.
    Stop,
    /// Query the current role bookkeeping.
    GetRoles { reply: oneshot::Sender<RoleSnapshot> },
    /// Tear the runtime down entirely.
    Shutdown,
}

/// Point-in-time view of this device's place in the kingdom.
#[derive(Debug, Clone)]
pub struct RoleSnapshot {
    pub state: StateKind,
    pub king: Option<DeviceId>,
    pub prince: Option<DeviceId>,
    pub connected: Vec<DeviceId>,
}

// ── RuntimeHandle (app-facing API) ──────────────────────────────────

/// Handle to a running [`CrownRuntime`].
///
/// Cheap to clone. Channel operations go straight to the channel
/// manager; role commands round-trip through the event loop.
#[derive(Clone)]
pub struct RuntimeHandle {
    cmd_tx: mpsc::Sender<RuntimeCommand>,
    channels: Arc<ChannelManager>,
    local: DeviceId,
}

impl RuntimeHandle {
    pub fn local_device(&self) -> &DeviceId {
        &self.local
    }

    pub async fn start(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Start).await;
    }

    pub async fn stop(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Stop).await;
    }

    pub async fn shutdown(&self) {
        let _ = self.cmd_tx.send(RuntimeCommand::Shutdown).await;
    }

    /// Current role view, or a Stopped snapshot once the runtime is
    /// gone.
    pub async fn roles(&self) -> RoleSnapshot {
        let (tx, rx) = oneshot::channel();
        let _ = self
            .cmd_tx
            .send(RuntimeCommand::GetRoles { reply: tx })
            .await;
        rx.await.unwrap_or(RoleSnapshot {
            state: StateKind::Stopped,
            king: None,
            prince: None,
            connected: Vec::new(),
        })
    }

    /// Fetch or lazily create a channel. Atomic per id.
    pub fn channel(&self, channel_id: i16) -> Arc<Channel> {
        self.channels.create_or_get_channel(channel_id)
    }

    pub fn set_channel_config(&self, channel_id: i16, config: ChannelConfig) {
        self.channel(channel_id).set_config(config);
    }

    /// Queue a publish on `channel_id`. Returns false when the
    /// channel's pending queue is full.
    pub fn publish(&self, channel_id: i16, payload: Bytes) -> bool {
        self.channel(channel_id).publish(payload)
    }

    /// Subscribe to `channel_id`; messages arrive once the King has
    /// applied the subscription.
    pub fn subscribe(&self, channel_id: i16) -> mpsc::Receiver<ChannelMessage> {
        self.channels.subscribe(channel_id)
    }

    pub fn unsubscribe(&self, channel_id: i16) {
        self.channels.unsubscribe(channel_id);
    }
}

// ── CrownRuntime ────────────────────────────────────────────────────

/// Channels returned to the application when the runtime starts.
pub struct RuntimeChannels {
    /// Handle to drive the runtime.
    pub handle: RuntimeHandle,
    /// Kingdom lifecycle events, in occurrence order.
    pub events: mpsc::Receiver<LifecycleEvent>,
}

/// The crown runtime — spawn it and communicate via channels.
pub struct CrownRuntime;

impl CrownRuntime {
    /// Validate the configuration, wire up the managers and spawn the
    /// event loop. `discovery_rx` feeds beacon sightings, `acceptor_rx`
    /// feeds transport-accepted inbound connections.
    pub fn spawn(
        local: DeviceId,
        config: CrownConfig,
        connectors: Vec<Arc<dyn Connector>>,
        discovery_rx: mpsc::Receiver<DiscoveryEvent>,
        acceptor_rx: mpsc::Receiver<Arc<dyn Connection>>,
    ) -> Result<RuntimeChannels, CrownError> {
        config.validate()?;

        let (cmd_tx, cmd_rx) = mpsc::channel::<RuntimeCommand>(64);
        let (events_tx, events_rx) = mpsc::channel::<LifecycleEvent>(256);
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (conn_events_tx, conn_events_rx) = mpsc::channel(256);

        let connections = ConnectionManager::new(
            local.clone(),
            config.keep_alive_interval,
            config.retry_policy(),
            connectors,
            inbound_tx.clone(),
            conn_events_tx,
        );
        let channels = ChannelManager::new(local.clone(), connections.clone(), inbound_tx);
        let machine = KingdomMachine::new(local.clone(), config.clone());

        tokio::spawn(r#loop::runtime_loop(
            config,
            machine,
            connections,
            channels.clone(),
            cmd_rx,
            discovery_rx,
            acceptor_rx,
            inbound_rx,
            conn_events_rx,
            events_tx,
        ));

        Ok(RuntimeChannels {
            handle: RuntimeHandle {
                cmd_tx,
                channels,
                local,
            },
            events: events_rx,
        })
    }
}
