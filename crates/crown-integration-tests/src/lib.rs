//! Multi-node test harness for the crown protocol.
//!
//! Spins up full [`CrownRuntime`] instances over the in-memory
//! transport and simulates a discovery beacon: a background task that
//! periodically tells every node which other nodes exist and what
//! role each one currently holds, the same way a real mDNS or BLE
//! beacon would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crown_protocol::transport::mem::MemNetwork;
use crown_protocol::{
    CrownConfig, CrownRuntime, DeviceId, DiscoveryEvent, LifecycleEvent, RoleSnapshot,
    RuntimeHandle, StateKind,
};

/// How often the simulated beacon announces sightings.
pub const BEACON_INTERVAL: Duration = Duration::from_millis(75);

/// Protocol timings squeezed down so each convergence phase completes
/// in well under a second.
pub fn fast_config() -> CrownConfig {
    CrownConfig {
        keep_alive_interval: Duration::from_millis(100),
        crowning_preparation_timeout: Duration::from_millis(300),
        prince_ack_timeout: Duration::from_millis(300),
        king_without_peasants_timeout: Duration::from_millis(3000),
        merge_bow_down_timeout: Duration::from_millis(300),
        connector_retry_timeout: Duration::from_millis(50),
        exponential_backoff_factor: 2.0,
        max_connection_retries: 3,
        tick_interval: Duration::from_millis(25),
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn")
        .try_init();
}

/// One spawned runtime plus the plumbing the harness keeps for it.
pub struct TestNode {
    pub device: DeviceId,
    pub handle: RuntimeHandle,
    pub events: mpsc::Receiver<LifecycleEvent>,
    discovery_tx: mpsc::Sender<DiscoveryEvent>,
}

/// A set of nodes sharing one in-memory network.
#[derive(Default)]
pub struct TestCluster {
    pub network: MemNetwork,
    pub nodes: Vec<TestNode>,
    beacons: Vec<JoinHandle<()>>,
}

impl TestCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a runtime for `id`, start it, and add it to the cluster.
    pub async fn add_node(&mut self, id: &str) -> usize {
        let device = DeviceId::new(id);
        let (connector, acceptor_rx) = self.network.register(device.clone());
        let (discovery_tx, discovery_rx) = mpsc::channel(64);
        let runtime = CrownRuntime::spawn(
            device.clone(),
            fast_config(),
            vec![Arc::new(connector)],
            discovery_rx,
            acceptor_rx,
        )
        .expect("fast_config is valid");
        runtime.handle.start().await;
        self.nodes.push(TestNode {
            device,
            handle: runtime.handle,
            events: runtime.events,
            discovery_tx,
        });
        self.nodes.len() - 1
    }

    /// Beacon announcing every node to every other node.
    pub fn start_beacon(&mut self) {
        let all: Vec<usize> = (0..self.nodes.len()).collect();
        self.start_beacon_among(&all);
    }

    /// Beacon restricted to a subset, for split-network scenarios.
    /// Dead nodes show up as Stopped, which the machines ignore.
    pub fn start_beacon_among(&mut self, indices: &[usize]) {
        let feeds: Vec<(DeviceId, RuntimeHandle, mpsc::Sender<DiscoveryEvent>)> = indices
            .iter()
            .map(|&i| {
                let n = &self.nodes[i];
                (n.device.clone(), n.handle.clone(), n.discovery_tx.clone())
            })
            .collect();
        self.beacons.push(tokio::spawn(async move {
            loop {
                tokio::time::sleep(BEACON_INTERVAL).await;
                let mut sightings = Vec::with_capacity(feeds.len());
                for (device, handle, _) in &feeds {
                    let roles = handle.roles().await;
                    sightings.push((device.clone(), roles.state.wire_state()));
                }
                for (device, _, tx) in &feeds {
                    for (other, state) in &sightings {
                        if other == device {
                            continue;
                        }
                        let _ = tx
                            .send(DiscoveryEvent {
                                device: other.clone(),
                                state: *state,
                                metadata: MemNetwork::metadata(),
                            })
                            .await;
                    }
                }
            }
        }));
    }

    pub fn stop_beacons(&mut self) {
        for beacon in self.beacons.drain(..) {
            beacon.abort();
        }
    }

    /// Tear a node down abruptly, as if it powered off.
    pub async fn kill(&mut self, index: usize) {
        let node = &self.nodes[index];
        tracing::debug!(device = %node.device, "killing node");
        self.network.unregister(&node.device);
        node.handle.shutdown().await;
    }

    pub async fn snapshots(&self) -> Vec<RoleSnapshot> {
        let mut out = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            out.push(node.handle.roles().await);
        }
        out
    }

    /// Poll until `predicate` holds over all snapshots, failing with a
    /// role dump once `timeout` has elapsed.
    pub async fn wait_until<F>(
        &self,
        what: &str,
        timeout: Duration,
        predicate: F,
    ) -> anyhow::Result<()>
    where
        F: Fn(&[RoleSnapshot]) -> bool,
    {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snaps = self.snapshots().await;
            if predicate(&snaps) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                let dump: Vec<String> = self
                    .nodes
                    .iter()
                    .zip(&snaps)
                    .map(|(n, s)| {
                        format!(
                            "{}: {} king={:?} prince={:?}",
                            n.device, s.state, s.king, s.prince
                        )
                    })
                    .collect();
                bail!("timed out waiting for {what}:\n  {}", dump.join("\n  "));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}

impl Drop for TestCluster {
    fn drop(&mut self) {
        for beacon in &self.beacons {
            beacon.abort();
        }
    }
}

/// Exactly one King among the non-Stopped nodes, the given counts of
/// Princes and Peasants, and unanimous agreement on who the King is.
pub fn kingdom_shape(snaps: &[RoleSnapshot], princes: usize, peasants: usize) -> bool {
    let live: Vec<&RoleSnapshot> = snaps
        .iter()
        .filter(|s| s.state != StateKind::Stopped)
        .collect();
    let kings: Vec<&&RoleSnapshot> = live
        .iter()
        .filter(|s| s.state == StateKind::King)
        .collect();
    if kings.len() != 1 {
        return false;
    }
    let king_id = kings[0].king.clone();
    king_id.is_some()
        && live.iter().filter(|s| s.state == StateKind::Prince).count() == princes
        && live.iter().filter(|s| s.state == StateKind::Peasant).count() == peasants
        && live.iter().all(|s| s.king == king_id)
}
