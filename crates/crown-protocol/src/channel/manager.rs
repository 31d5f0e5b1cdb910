use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use crown_wire::{AdminMessage, Frame, FrameFlags, ADMIN_CHANNEL_ID};
use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::config::{ChannelConfig, MessageRate};
use super::queue::{Channel, Outgoing};
use super::ChannelMessage;
use crate::connections::ConnectionManager;
use crate::link::{InboundMessage, OutboundMessage};
use crate::types::DeviceId;

/// Buffer per local subscriber; overflow drops with a log line rather
/// than blocking the routing path.
const SUBSCRIBER_BUFFER: usize = 256;

/// Who routes published messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMode {
    /// We are the King: fan out to the authoritative subscriber sets.
    Master,
    /// We are a Peasant or Prince: everything goes up to the King.
    /// `king: None` while unjoined (Free); publishes are dropped.
    Client { king: Option<DeviceId> },
}

struct ChannelEntry {
    channel: Arc<Channel>,
    dispatcher: JoinHandle<()>,
}

/// Channel registry plus routing.
///
/// Registry and subscriber tables are concurrent maps keyed per
/// channel; no operation takes a manager-wide lock. The mode switch
/// (master on crowning, client on joining) re-announces local
/// subscriptions so the new King learns them.
pub struct ChannelManager {
    local: DeviceId,
    connections: Arc<ConnectionManager>,
    channels: DashMap<i16, ChannelEntry>,
    /// Per-channel delivery feeds of this device's own subscribers.
    local_subscribers: DashMap<i16, Vec<mpsc::Sender<ChannelMessage>>>,
    /// Authoritative device sets, maintained only while master.
    subscriptions: DashMap<i16, BTreeSet<DeviceId>>,
    mode: Mutex<ChannelMode>,
    /// Loopback into the runtime's inbound path, for exactly-once
    /// self-delivery of broadcast admin messages.
    loopback_tx: mpsc::Sender<InboundMessage>,
}

impl ChannelManager {
    pub fn new(
        local: DeviceId,
        connections: Arc<ConnectionManager>,
        loopback_tx: mpsc::Sender<InboundMessage>,
    ) -> Arc<Self> {
        Arc::new(ChannelManager {
            local,
            connections,
            channels: DashMap::new(),
            local_subscribers: DashMap::new(),
            subscriptions: DashMap::new(),
            mode: Mutex::new(ChannelMode::Client { king: None }),
            loopback_tx,
        })
    }

    pub fn mode(&self) -> ChannelMode {
        self.mode.lock().expect("channel mode lock").clone()
    }

    /// Fetch or create the channel for `id`. Atomic: concurrent calls
    /// for the same id all get the one instance whose dispatcher was
    /// spawned exactly once. `id` must not be the admin channel.
    pub fn create_or_get_channel(self: &Arc<Self>, id: i16) -> Arc<Channel> {
        debug_assert_ne!(id, ADMIN_CHANNEL_ID);
        self.channels
            .entry(id)
            .or_insert_with(|| {
                let channel = Arc::new(Channel::new(id, ChannelConfig::default()));
                let dispatcher =
                    tokio::spawn(dispatcher_loop(self.clone(), channel.clone()));
                ChannelEntry {
                    channel,
                    dispatcher,
                }
            })
            .channel
            .clone()
    }

    // ── Subscriptions ───────────────────────────────────────────────

    /// Subscribe locally and announce it toward the King. Delivery to
    /// the returned receiver starts once the King has applied the
    /// subscription (eventually consistent).
    pub fn subscribe(self: &Arc<Self>, channel_id: i16) -> mpsc::Receiver<ChannelMessage> {
        self.create_or_get_channel(channel_id);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        self.local_subscribers
            .entry(channel_id)
            .or_default()
            .push(tx);
        self.announce_subscription(channel_id, true);
        rx
    }

    /// Drop every local subscriber of `channel_id` and announce the
    /// removal toward the King.
    pub fn unsubscribe(&self, channel_id: i16) {
        self.local_subscribers.remove(&channel_id);
        self.announce_subscription(channel_id, false);
    }

    fn announce_subscription(&self, channel_id: i16, add: bool) {
        match self.mode() {
            ChannelMode::Master => {
                let mut set = self.subscriptions.entry(channel_id).or_default();
                if add {
                    set.insert(self.local.clone());
                } else {
                    set.remove(&self.local);
                }
            }
            ChannelMode::Client { king: Some(king) } => {
                let message = if add {
                    AdminMessage::AddSubscription {
                        channel_id,
                        device_id: self.local.as_str().to_string(),
                    }
                } else {
                    AdminMessage::RemoveSubscription {
                        channel_id,
                        device_id: self.local.as_str().to_string(),
                    }
                };
                if !self.connections.send_admin(&king, &message) {
                    tracing::debug!(channel_id, "no king connection for subscription change");
                }
            }
            // Applied once we join a kingdom.
            ChannelMode::Client { king: None } => {}
        }
    }

    /// Apply a subscription admin message. Only meaningful while
    /// master; clients never receive these.
    pub fn handle_subscription(&self, message: &AdminMessage) {
        match message {
            AdminMessage::AddSubscription {
                channel_id,
                device_id,
            } => {
                self.subscriptions
                    .entry(*channel_id)
                    .or_default()
                    .insert(DeviceId::new(device_id));
            }
            AdminMessage::RemoveSubscription {
                channel_id,
                device_id,
            } => {
                if let Some(mut set) = self.subscriptions.get_mut(channel_id) {
                    set.remove(&DeviceId::new(device_id));
                }
            }
            _ => {}
        }
    }

    // ── Mode ────────────────────────────────────────────────────────

    /// Switch routing mode. Crowning seeds the subscriber sets with
    /// our own subscriptions; joining a kingdom re-announces them to
    /// the new King.
    pub fn set_mode(&self, mode: ChannelMode) {
        {
            let mut current = self.mode.lock().expect("channel mode lock");
            if *current == mode {
                return;
            }
            tracing::debug!(local = %self.local, ?mode, "channel mode change");
            *current = mode.clone();
        }
        self.subscriptions.clear();
        let locally_subscribed: Vec<i16> = self
            .local_subscribers
            .iter()
            .filter(|entry| !entry.value().is_empty())
            .map(|entry| *entry.key())
            .collect();
        match mode {
            ChannelMode::Master => {
                for channel_id in locally_subscribed {
                    self.subscriptions
                        .entry(channel_id)
                        .or_default()
                        .insert(self.local.clone());
                }
            }
            ChannelMode::Client { king: Some(king) } => {
                for channel_id in locally_subscribed {
                    let message = AdminMessage::AddSubscription {
                        channel_id,
                        device_id: self.local.as_str().to_string(),
                    };
                    self.connections.send_admin(&king, &message);
                }
            }
            ChannelMode::Client { king: None } => {}
        }
    }

    // ── Routing ─────────────────────────────────────────────────────

    fn priority_of(&self, channel_id: i16) -> i32 {
        self.channels
            .get(&channel_id)
            .map(|entry| entry.channel.config().priority)
            .unwrap_or_default()
    }

    /// Route one locally published message per the current mode.
    fn route_outbound(&self, channel: &Channel, outgoing: Outgoing) {
        let config = channel.config();
        let channel_id = channel.id();
        match self.mode() {
            ChannelMode::Master => {
                let remote: Vec<DeviceId> = self
                    .subscriptions
                    .get(&channel_id)
                    .map(|set| {
                        set.iter()
                            .filter(|d| **d != self.local)
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                if remote.is_empty()
                    && !config.transmit_if_no_subscribers
                    && !outgoing.include_reflexive
                {
                    return;
                }
                for device in remote {
                    self.connections.send_to(
                        &device,
                        config.priority,
                        OutboundMessage::app(channel_id, outgoing.payload.clone()),
                    );
                }
            }
            ChannelMode::Client { king: Some(king) } => {
                self.connections.send_to(
                    &king,
                    config.priority,
                    OutboundMessage::app(channel_id, outgoing.payload.clone()),
                );
            }
            ChannelMode::Client { king: None } => {
                tracing::debug!(channel_id, "publish dropped, not in a kingdom");
                return;
            }
        }
        if outgoing.include_reflexive {
            self.deliver_local(ChannelMessage {
                channel_id,
                source_id: self.local.short_id(),
                payload: outgoing.payload,
            });
        }
    }

    /// Handle an application frame arriving from a connection: deliver
    /// to local subscribers and, while master, fan out to every other
    /// subscribed device except the one it came from.
    pub fn handle_inbound(&self, message: &InboundMessage) {
        let frame = &message.frame;
        let channel_id = frame.channel_id;
        self.deliver_local(ChannelMessage {
            channel_id,
            source_id: frame.source_id,
            payload: frame.payload.clone(),
        });
        if self.mode() != ChannelMode::Master {
            return;
        }
        let targets: Vec<DeviceId> = self
            .subscriptions
            .get(&channel_id)
            .map(|set| {
                set.iter()
                    .filter(|d| **d != self.local && **d != message.from)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        let priority = self.priority_of(channel_id);
        for device in targets {
            self.connections.send_to(
                &device,
                priority,
                OutboundMessage::forwarded(channel_id, frame.source_id, frame.payload.clone()),
            );
        }
    }

    fn deliver_local(&self, message: ChannelMessage) {
        if let Some(mut feeds) = self.local_subscribers.get_mut(&message.channel_id) {
            feeds.retain(|tx| match tx.try_send(message.clone()) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::warn!(
                        channel_id = message.channel_id,
                        "slow subscriber, message dropped"
                    );
                    true
                }
            });
        }
    }

    /// Deliver an admin message to every connected device and to
    /// ourselves, each exactly once.
    pub fn broadcast_admin(&self, message: &AdminMessage) {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!("unencodable admin broadcast: {e}");
                return;
            }
        };
        self.connections.broadcast_admin(message);
        let frame = Frame {
            flags: FrameFlags::HAS_PAYLOAD
                .with(FrameFlags::ADMIN)
                .with(FrameFlags::BROADCAST),
            channel_id: ADMIN_CHANNEL_ID,
            source_id: self.local.short_id(),
            payload,
        };
        if self
            .loopback_tx
            .try_send(InboundMessage {
                from: self.local.clone(),
                frame,
            })
            .is_err()
        {
            // A full inbound queue here loses our own copy of the
            // broadcast; make that visible instead of silent.
            tracing::warn!("self-delivery of admin broadcast dropped, inbound queue full");
        }
    }

    /// Stop every channel dispatcher. Used on runtime shutdown.
    pub fn shutdown(&self) {
        for entry in self.channels.iter() {
            entry.value().dispatcher.abort();
        }
        self.channels.clear();
    }
}

async fn dispatcher_loop(manager: Arc<ChannelManager>, channel: Arc<Channel>) {
    loop {
        match channel.config().rate {
            MessageRate::NoLimit => {
                channel.wait_for_publish().await;
                for outgoing in channel.take_all() {
                    manager.route_outbound(&channel, outgoing);
                }
            }
            MessageRate::FixedDiscardOld { interval } => {
                tokio::time::sleep(interval).await;
                if let Some(outgoing) = channel.take_latest() {
                    manager.route_outbound(&channel, outgoing);
                }
            }
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::RetryPolicy;
    use crate::transport::mem;
    use crate::transport::Connection;
    use bytes::Bytes;
    use crown_wire::{FrameHeader, FRAME_HEADER_LEN};
    use std::time::Duration;
    use tokio::time::timeout;

    fn make_manager(id: &str) -> (Arc<ChannelManager>, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (events_tx, _events_rx) = mpsc::channel(64);
        let connections = ConnectionManager::new(
            DeviceId::new(id),
            Duration::from_secs(60),
            RetryPolicy::default(),
            Vec::new(),
            inbound_tx.clone(),
            events_tx,
        );
        (
            ChannelManager::new(DeviceId::new(id), connections, inbound_tx),
            inbound_rx,
        )
    }

    fn attach_peer(
        manager: &Arc<ChannelManager>,
        peer: &str,
    ) -> Arc<mem::MemConnection> {
        // Our half must see `peer` as its remote or the manager would
        // register the link under its own device id.
        let (ours, theirs) = mem::pair(
            manager.local.clone(),
            DeviceId::new(peer),
        );
        manager.connections.add_connection(ours);
        theirs
    }

    async fn read_frame(conn: &Arc<mem::MemConnection>) -> Frame {
        let mut header_bytes = [0u8; FRAME_HEADER_LEN];
        conn.read_exact(&mut header_bytes).await.unwrap();
        let header = FrameHeader::decode(&header_bytes).unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        conn.read_exact(&mut payload).await.unwrap();
        Frame::from_parts(header, Bytes::from(payload))
    }

    #[tokio::test]
    async fn create_or_get_is_atomic() {
        let (manager, _inbound) = make_manager("alpha");
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.create_or_get_channel(7)
            }));
        }
        let first = manager.create_or_get_channel(7);
        for task in tasks {
            let channel = task.await.unwrap();
            assert!(Arc::ptr_eq(&first, &channel));
        }
        assert_eq!(manager.channels.len(), 1);
    }

    #[tokio::test]
    async fn client_publish_goes_to_the_king() {
        let (manager, _inbound) = make_manager("alpha");
        let king_side = attach_peer(&manager, "king");
        manager.set_mode(ChannelMode::Client {
            king: Some(DeviceId::new("king")),
        });

        let channel = manager.create_or_get_channel(5);
        assert!(channel.publish(Bytes::from_static(b"up")));

        let frame = timeout(Duration::from_secs(1), read_frame(&king_side))
            .await
            .unwrap();
        assert_eq!(frame.channel_id, 5);
        assert_eq!(&frame.payload[..], b"up");
    }

    #[tokio::test]
    async fn master_fans_out_except_origin() {
        let (manager, _inbound) = make_manager("king");
        let bravo = attach_peer(&manager, "bravo");
        let charlie = attach_peer(&manager, "charlie");
        manager.set_mode(ChannelMode::Master);
        manager.create_or_get_channel(5);
        for device in ["bravo", "charlie"] {
            manager.handle_subscription(&AdminMessage::AddSubscription {
                channel_id: 5,
                device_id: device.to_string(),
            });
        }

        let inbound_frame = Frame::new(5, DeviceId::new("bravo").short_id(), Bytes::from_static(b"m"));
        manager.handle_inbound(&InboundMessage {
            from: DeviceId::new("bravo"),
            frame: inbound_frame,
        });

        let frame = timeout(Duration::from_secs(1), read_frame(&charlie))
            .await
            .unwrap();
        assert_eq!(frame.channel_id, 5);
        assert_eq!(frame.source_id, DeviceId::new("bravo").short_id());

        // The origin gets nothing back.
        let echo = timeout(Duration::from_millis(100), read_frame(&bravo)).await;
        assert!(echo.is_err());
    }

    #[tokio::test]
    async fn reflexive_publish_reaches_local_subscriber() {
        let (manager, _inbound) = make_manager("king");
        manager.set_mode(ChannelMode::Master);
        let mut feed = manager.subscribe(9);
        let channel = manager.create_or_get_channel(9);

        assert!(channel.publish_with_reflexive(Bytes::from_static(b"self"), true));
        let message = timeout(Duration::from_secs(1), feed.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&message.payload[..], b"self");
        assert_eq!(message.source_id, DeviceId::new("king").short_id());

        assert!(channel.publish_with_reflexive(Bytes::from_static(b"quiet"), false));
        let silent = timeout(Duration::from_millis(100), feed.recv()).await;
        assert!(silent.is_err());
    }

    #[tokio::test]
    async fn subscribe_announces_to_the_king() {
        let (manager, _inbound) = make_manager("alpha");
        let king_side = attach_peer(&manager, "king");
        manager.set_mode(ChannelMode::Client {
            king: Some(DeviceId::new("king")),
        });

        let _feed = manager.subscribe(3);
        let frame = timeout(Duration::from_secs(1), read_frame(&king_side))
            .await
            .unwrap();
        assert!(frame.is_admin());
        assert_eq!(
            AdminMessage::from_frame(&frame).unwrap(),
            AdminMessage::AddSubscription {
                channel_id: 3,
                device_id: "alpha".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn joining_a_kingdom_reannounces_subscriptions() {
        let (manager, _inbound) = make_manager("alpha");
        let _feed = manager.subscribe(11);

        let king_side = attach_peer(&manager, "king");
        manager.set_mode(ChannelMode::Client {
            king: Some(DeviceId::new("king")),
        });

        let frame = timeout(Duration::from_secs(1), read_frame(&king_side))
            .await
            .unwrap();
        assert_eq!(
            AdminMessage::from_frame(&frame).unwrap(),
            AdminMessage::AddSubscription {
                channel_id: 11,
                device_id: "alpha".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn rate_limited_channel_forwards_only_the_newest() {
        let (manager, _inbound) = make_manager("king");
        let bravo = attach_peer(&manager, "bravo");
        manager.set_mode(ChannelMode::Master);
        let channel = manager.create_or_get_channel(2);
        channel.set_config(ChannelConfig {
            rate: MessageRate::FixedDiscardOld {
                interval: Duration::from_millis(50),
            },
            ..ChannelConfig::default()
        });
        manager.handle_subscription(&AdminMessage::AddSubscription {
            channel_id: 2,
            device_id: "bravo".to_string(),
        });
        // Let the dispatcher pick up the rate change before queueing.
        tokio::time::sleep(Duration::from_millis(10)).await;

        channel.publish(Bytes::from_static(b"one"));
        channel.publish(Bytes::from_static(b"two"));
        channel.publish(Bytes::from_static(b"three"));

        let frame = timeout(Duration::from_secs(1), read_frame(&bravo))
            .await
            .unwrap();
        assert_eq!(&frame.payload[..], b"three");
    }

    #[tokio::test]
    async fn broadcast_admin_loops_back_exactly_once() {
        let (manager, mut inbound) = make_manager("alpha");
        manager.broadcast_admin(&AdminMessage::Text {
            text: "hello".to_string(),
        });
        let message = timeout(Duration::from_secs(1), inbound.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.from, DeviceId::new("alpha"));
        assert!(message.frame.is_broadcast());
        let silent = timeout(Duration::from_millis(50), inbound.recv()).await;
        assert!(silent.is_err());
    }
}
