//! Succession and merge: the Prince takes over when the King dies,
//! and two kingdoms meeting each other collapse into one.

use std::time::Duration;

use crown_integration_tests::{init_tracing, kingdom_shape, TestCluster};
use crown_protocol::StateKind;

const CONVERGE: Duration = Duration::from_secs(5);

#[tokio::test]
async fn prince_takes_over_when_king_dies() -> anyhow::Result<()> {
    init_tracing();
    let mut cluster = TestCluster::new();
    for id in ["node-a", "node-b", "node-c"] {
        cluster.add_node(id).await;
    }
    cluster.start_beacon();
    cluster
        .wait_until("initial court", CONVERGE, |snaps| kingdom_shape(snaps, 1, 1))
        .await?;

    let snaps = cluster.snapshots().await;
    let king_index = snaps
        .iter()
        .position(|s| s.state == StateKind::King)
        .expect("one King");
    let heir = snaps[king_index].prince.clone().expect("a Prince is named");

    cluster.kill(king_index).await;

    // The heir crowns itself and the remaining Peasant follows it.
    cluster
        .wait_until("the heir on the throne", CONVERGE, |snaps| {
            kingdom_shape(snaps, 1, 0)
        })
        .await?;
    let snaps = cluster.snapshots().await;
    let new_king = snaps
        .iter()
        .find(|s| s.state == StateKind::King)
        .and_then(|s| s.king.clone())
        .expect("one King");
    assert_eq!(new_king, heir);
    Ok(())
}

#[tokio::test]
async fn kingdoms_merge_under_the_smaller_king() -> anyhow::Result<()> {
    init_tracing();
    let mut cluster = TestCluster::new();
    let a = cluster.add_node("node-a").await;
    let b = cluster.add_node("node-b").await;
    let c = cluster.add_node("node-c").await;
    let d = cluster.add_node("node-d").await;

    // Two isolated pairs first: {a, c} and {b, d}.
    cluster.start_beacon_among(&[a, c]);
    cluster.start_beacon_among(&[b, d]);
    cluster
        .wait_until("two separate kingdoms", CONVERGE, |snaps| {
            snaps.iter().filter(|s| s.state == StateKind::King).count() == 2
                && snaps.iter().filter(|s| s.state == StateKind::Prince).count() == 2
        })
        .await?;

    // Join the networks; the King with the larger id bows down.
    cluster.stop_beacons();
    cluster.start_beacon();
    cluster
        .wait_until("one merged kingdom", CONVERGE, |snaps| {
            kingdom_shape(snaps, 1, 2)
        })
        .await?;

    let snaps = cluster.snapshots().await;
    let king = snaps
        .iter()
        .find(|s| s.state == StateKind::King)
        .and_then(|s| s.king.clone())
        .expect("one King");
    assert_eq!(king.as_str(), "node-a");
    Ok(())
}
