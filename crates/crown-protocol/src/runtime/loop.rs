/// The runtime event loop.
///
/// A single async task owns the kingdom machine and multiplexes over
/// application commands, beacon sightings, accepted connections,
/// connection events, inbound frames and the timer tick. The machine
/// returns effects; this loop is the only place they are executed.
use std::collections::HashSet;
use std::sync::Arc;

use crown_wire::AdminMessage;
use tokio::sync::mpsc;

use super::{RoleSnapshot, RuntimeCommand};
use crate::channel::ChannelManager;
use crate::config::CrownConfig;
use crate::connections::{ConnectionEvent, ConnectionManager};
use crate::kingdom::{KingdomEffect, KingdomMachine, LifecycleEvent};
use crate::link::InboundMessage;
use crate::transport::{Connection, DiscoveryEvent};
use crate::types::{now_ms, DeviceId};

#[allow(clippy::too_many_arguments)]
pub(super) async fn runtime_loop(
    config: CrownConfig,
    mut machine: KingdomMachine,
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelManager>,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    mut discovery_rx: mpsc::Receiver<DiscoveryEvent>,
    mut acceptor_rx: mpsc::Receiver<Arc<dyn Connection>>,
    mut inbound_rx: mpsc::Receiver<InboundMessage>,
    mut conn_events_rx: mpsc::Receiver<ConnectionEvent>,
    events_tx: mpsc::Sender<LifecycleEvent>,
) {
    // Devices we dialed ourselves; everything else that establishes
    // is an accepted (inbound) connection.
    let mut dialed: HashSet<DeviceId> = HashSet::new();

    let mut tick = tokio::time::interval(config.tick_interval);
    // Skip the immediate first tick.
    tick.tick().await;

    loop {
        let effects: Vec<KingdomEffect> = tokio::select! {
            // ── 1. Application commands ─────────────────────────
            cmd = cmd_rx.recv() => {
                match cmd {
                    Some(RuntimeCommand::Start) => machine.handle_start(now_ms()),
                    Some(RuntimeCommand::Stop) => machine.handle_stop(now_ms()),
                    Some(RuntimeCommand::GetRoles { reply }) => {
                        let _ = reply.send(RoleSnapshot {
                            state: machine.state(),
                            king: machine.king(),
                            prince: machine.prince(),
                            connected: connections.connected_devices(),
                        });
                        Vec::new()
                    }
                    Some(RuntimeCommand::Shutdown) | None => break,
                }
            }

            // ── 2. Beacon sightings ─────────────────────────────
            Some(event) = discovery_rx.recv() => {
                connections.note_metadata(event.device.clone(), event.metadata);
                machine.handle_discovery(&event.device, event.state, now_ms())
            }

            // ── 3. Transport-accepted connections ───────────────
            Some(conn) = acceptor_rx.recv() => {
                connections.add_connection(conn);
                Vec::new()
            }

            // ── 4. Connection lifecycle ─────────────────────────
            Some(event) = conn_events_rx.recv() => {
                match event {
                    ConnectionEvent::Established { device, .. } => {
                        let inbound = !dialed.remove(&device);
                        machine.handle_connection_established(&device, inbound, now_ms())
                    }
                    ConnectionEvent::Closed { device, .. } => {
                        if !connections.is_connected(&device) {
                            machine.handle_connection_closed(&device, now_ms())
                        } else {
                            Vec::new()
                        }
                    }
                    ConnectionEvent::ConnectFailed { device } => {
                        dialed.remove(&device);
                        machine.handle_connect_failed(&device, now_ms())
                    }
                }
            }

            // ── 5. Inbound frames ───────────────────────────────
            Some(message) = inbound_rx.recv() => {
                route_inbound(&mut machine, &channels, message)
            }

            // ── 6. Timer sweep ──────────────────────────────────
            _ = tick.tick() => machine.tick(now_ms()),
        };

        execute_effects(effects, &connections, &channels, &events_tx, &mut dialed).await;
    }

    tracing::debug!(local = %machine.local_device(), "runtime loop shutting down");
    channels.shutdown();
    connections.disconnect_all().await;
}

/// Dispatch one reassembled inbound message: subscription changes to
/// the channel manager, other admin traffic to the machine, and
/// application frames to the channels.
fn route_inbound(
    machine: &mut KingdomMachine,
    channels: &Arc<ChannelManager>,
    message: InboundMessage,
) -> Vec<KingdomEffect> {
    if !message.frame.is_admin() {
        channels.handle_inbound(&message);
        return Vec::new();
    }
    match AdminMessage::from_frame(&message.frame) {
        Ok(
            admin @ (AdminMessage::AddSubscription { .. }
            | AdminMessage::RemoveSubscription { .. }),
        ) => {
            channels.handle_subscription(&admin);
            Vec::new()
        }
        Ok(admin) => machine.handle_admin(&message.from, &admin, now_ms()),
        Err(e) => {
            // Protocol violation: drop the message, keep the link.
            tracing::warn!(from = %message.from, "undecodable admin message: {e}");
            Vec::new()
        }
    }
}

async fn execute_effects(
    effects: Vec<KingdomEffect>,
    connections: &Arc<ConnectionManager>,
    channels: &Arc<ChannelManager>,
    events_tx: &mpsc::Sender<LifecycleEvent>,
    dialed: &mut HashSet<DeviceId>,
) {
    for effect in effects {
        match effect {
            KingdomEffect::SendAdmin { to, message } => {
                if !connections.send_admin(&to, &message) {
                    tracing::debug!(target = %to, "admin message had no connection");
                }
            }
            KingdomEffect::BroadcastAdmin { message } => {
                channels.broadcast_admin(&message);
            }
            KingdomEffect::Connect { device } => {
                dialed.insert(device.clone());
                connections.spawn_connect(device);
            }
            KingdomEffect::Disconnect { device } => {
                connections.disconnect_device(&device).await;
            }
            KingdomEffect::DisconnectAll => {
                connections.disconnect_all().await;
            }
            KingdomEffect::SetChannelMode { mode } => {
                channels.set_mode(mode);
            }
            KingdomEffect::Emit(event) => {
                let _ = events_tx.send(event).await;
            }
        }
    }
}
