//! Kingdom formation: N devices started together always converge to
//! exactly one King, one Prince once there are two devices, and
//! Peasants for the rest.

use std::time::Duration;

use crown_integration_tests::{init_tracing, kingdom_shape, TestCluster};
use crown_protocol::StateKind;

const CONVERGE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn lone_device_crowns_itself() -> anyhow::Result<()> {
    init_tracing();
    let mut cluster = TestCluster::new();
    cluster.add_node("node-a").await;
    cluster.start_beacon();

    cluster
        .wait_until("a kingdom of one", CONVERGE, |snaps| {
            kingdom_shape(snaps, 0, 0)
        })
        .await?;

    let roles = cluster.nodes[0].handle.roles().await;
    assert_eq!(roles.state, StateKind::King);
    assert_eq!(roles.king.as_ref().map(|d| d.as_str()), Some("node-a"));
    Ok(())
}

#[tokio::test]
async fn pair_forms_king_and_prince() -> anyhow::Result<()> {
    init_tracing();
    let mut cluster = TestCluster::new();
    cluster.add_node("node-a").await;
    cluster.add_node("node-b").await;
    cluster.start_beacon();

    cluster
        .wait_until("one King and one Prince", CONVERGE, |snaps| {
            kingdom_shape(snaps, 1, 0)
        })
        .await?;

    // Both agree on the same King and the Prince is the other device.
    let snaps = cluster.snapshots().await;
    let king = snaps[0].king.clone().expect("king known");
    assert_eq!(snaps[1].king, Some(king));
    Ok(())
}

#[tokio::test]
async fn trio_forms_full_court() -> anyhow::Result<()> {
    init_tracing();
    let mut cluster = TestCluster::new();
    for id in ["node-a", "node-b", "node-c"] {
        cluster.add_node(id).await;
    }
    cluster.start_beacon();

    cluster
        .wait_until("King, Prince and one Peasant", CONVERGE, |snaps| {
            kingdom_shape(snaps, 1, 1)
        })
        .await?;
    Ok(())
}

#[tokio::test]
async fn five_nodes_converge() -> anyhow::Result<()> {
    init_tracing();
    let mut cluster = TestCluster::new();
    for id in ["node-a", "node-b", "node-c", "node-d", "node-e"] {
        cluster.add_node(id).await;
    }
    cluster.start_beacon();

    cluster
        .wait_until("King, Prince and three Peasants", CONVERGE, |snaps| {
            kingdom_shape(snaps, 1, 3)
        })
        .await?;

    // Every member reports the same connected King.
    let snaps = cluster.snapshots().await;
    let king = snaps
        .iter()
        .find(|s| s.state == StateKind::King)
        .and_then(|s| s.king.clone())
        .expect("one King");
    for snap in &snaps {
        assert_eq!(snap.king.as_ref(), Some(&king));
    }
    Ok(())
}
