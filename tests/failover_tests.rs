//! Leader failover: a new leader emerges after a crash and forwarded
//! writes still commit.

mod test_harness;

use std::time::Duration;

use test_harness::{assert_eventually, shell_job, TestCluster};

#[tokio::test]
async fn test_three_server_cluster_forms() {
    let cluster = TestCluster::new(22000, 3, 0).await;
    cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("a leader should be elected");

    assert!(
        cluster.wait_for_voters(3, Duration::from_secs(15)).await,
        "the reconcile loop should add every alive server as a voter"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_leader_crash_elects_new_leader_and_forwards_writes() {
    let cluster = TestCluster::new(22010, 3, 0).await;
    let first_leader = cluster
        .wait_for_leader(Duration::from_secs(10))
        .await
        .expect("a leader should be elected");
    assert!(cluster.wait_for_voters(3, Duration::from_secs(15)).await);

    // A job created before the failover must survive it.
    cluster
        .set_job(&first_leader, &shell_job("durable", "echo ok"))
        .await
        .unwrap();

    cluster.node(&first_leader).kill();

    let new_leader = cluster
        .wait_for_new_leader(&first_leader, Duration::from_secs(10))
        .await
        .expect("a new leader should take over");
    assert_ne!(new_leader, first_leader);

    // Pick the remaining follower and write through it; the request is
    // forwarded to the new leader and committed.
    let follower = cluster
        .nodes
        .iter()
        .find(|n| n.name != first_leader && n.name != new_leader)
        .expect("one follower remains");

    let client = cluster.client.clone();
    let follower_addr = follower.rpc_addr.clone();
    assert_eventually(
        || async {
            client
                .set_job(&follower_addr, &shell_job("after-failover", "echo ok"))
                .await
                .is_ok()
        },
        Duration::from_secs(10),
        "a SetJob against a follower should forward to the new leader",
    )
    .await;

    // Both jobs are visible on the new leader's replica.
    let new_leader_node = cluster.node(&new_leader);
    assert!(new_leader_node.agent.store.get_job("durable").is_ok());
    assert_eventually(
        || async {
            new_leader_node
                .agent
                .store
                .get_job("after-failover")
                .is_ok()
        },
        Duration::from_secs(5),
        "the forwarded job should be applied",
    )
    .await;

    cluster.shutdown().await;
}
