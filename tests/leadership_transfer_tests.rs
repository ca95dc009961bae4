//! Graceful leadership transfer between servers.

mod test_harness;

use std::time::Duration;

use test_harness::{wait_for, TestCluster};

#[tokio::test]
async fn test_leadership_transfer_moves_the_leader() {
    let cluster = TestCluster::new(23000, 3, 0).await;
    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("a leader should be elected");
    assert!(cluster.wait_for_voters(3, Duration::from_secs(15)).await);

    let raft = cluster
        .node(&old_leader)
        .agent
        .raft
        .clone()
        .expect("servers have consensus");
    let target = raft
        .leadership_transfer(None)
        .await
        .expect("transfer should find a target");
    assert_ne!(target, old_leader);

    // The target wins the election and the old leader steps down.
    let transferred = wait_for(
        || async {
            let new_is_leader = cluster.node(&target).is_leader().await;
            let old_stepped_down = !cluster.node(&old_leader).is_leader().await;
            new_is_leader && old_stepped_down
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(transferred, "leadership should move to {target}");

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_transfer_to_explicit_target() {
    let cluster = TestCluster::new(23010, 3, 0).await;
    let old_leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .unwrap();
    assert!(cluster.wait_for_voters(3, Duration::from_secs(15)).await);

    let target = cluster
        .nodes
        .iter()
        .map(|n| n.name.clone())
        .find(|name| name != &old_leader)
        .unwrap();

    let raft = cluster.node(&old_leader).agent.raft.clone().unwrap();
    raft.leadership_transfer(Some(target.clone()))
        .await
        .expect("explicit transfer should succeed");

    let transferred = wait_for(
        || async { cluster.node(&target).is_leader().await },
        Duration::from_secs(10),
    )
    .await;
    assert!(transferred);

    cluster.shutdown().await;
}
