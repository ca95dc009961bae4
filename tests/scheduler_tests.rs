//! Scheduled dispatch across tagged workers, and the concurrency gate.

mod test_harness;

use std::collections::HashSet;
use std::time::Duration;

use cronmesh::job;
use cronmesh::store::ExecutionOptions;
use test_harness::{assert_eventually, shell_job, test_config, TestCluster};

use cronmesh::agent::Agent;

#[tokio::test]
async fn test_interval_job_targets_tagged_workers() {
    // One server plus two workers carrying the `tier=web` tag.
    let base_port = 24000;
    let mut cluster = TestCluster::new(base_port, 1, 0).await;
    for (i, name) in ["worker-1", "worker-2"].iter().enumerate() {
        let index = (1 + i) as u16;
        let data_dir = tempfile::tempdir().unwrap();
        let mut config = test_config(name, base_port, index, false, data_dir.path());
        config.join = vec![format!("127.0.0.1:{}", base_port + 100)];
        config.tags.insert("tier".into(), "web".into());
        let agent = Agent::start(config).await.unwrap();
        cluster.nodes.push(test_harness::TestNode {
            name: name.to_string(),
            agent,
            rpc_addr: format!("127.0.0.1:{}", base_port + index),
            data_dir,
        });
    }

    cluster.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    // Wait until the leader sees both workers alive.
    let leader = cluster.leader().await;
    let gossip = leader.agent.gossip.clone();
    assert_eventually(
        || async { gossip.members().len() == 3 },
        Duration::from_secs(10),
        "gossip should see the full cluster",
    )
    .await;

    let mut job = shell_job("webtick", "echo tick");
    job.schedule = "@every 300ms".into();
    job.tags.insert("tier".into(), "web:1".into());
    cluster.set_job("server-1", &job).await.unwrap();

    let store = leader.agent.store.clone();
    assert_eventually(
        || async {
            store
                .get_executions("webtick", &ExecutionOptions::default())
                .map(|e| e.iter().filter(|e| e.finished_at.is_some()).count() >= 3)
                .unwrap_or(false)
        },
        Duration::from_secs(15),
        "the interval schedule should keep producing executions",
    )
    .await;

    // Every execution ran on a tagged worker, exactly one node per fire.
    let executions = store
        .get_executions("webtick", &ExecutionOptions::default())
        .unwrap();
    let workers: HashSet<&str> = ["worker-1", "worker-2"].into_iter().collect();
    for execution in &executions {
        assert!(
            workers.contains(execution.node_name.as_str()),
            "execution ran on unexpected node {:?}",
            execution.node_name
        );
    }
    let mut groups: Vec<i64> = executions.iter().map(|e| e.group).collect();
    groups.sort_unstable();
    groups.dedup();
    assert_eq!(
        groups.len(),
        executions.len(),
        "cardinality 1 means one node per trigger"
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_forbid_gates_overlapping_runs() {
    let cluster = TestCluster::new(24100, 1, 0).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    let mut job = shell_job("slow", "sleep 1");
    job.schedule = "@every 200ms".into();
    job.concurrency = job::CONCURRENCY_FORBID.into();
    cluster.set_job("server-1", &job).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let leader = cluster.leader().await;
    let executions = leader
        .agent
        .store
        .get_executions("slow", &ExecutionOptions::default())
        .unwrap();
    assert!(
        executions.len() <= 2,
        "forbid policy should skip triggers while one run is active, got {}",
        executions.len()
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_disabled_job_never_fires() {
    let cluster = TestCluster::new(24200, 1, 0).await;
    cluster.wait_for_leader(Duration::from_secs(10)).await.unwrap();

    let mut job = shell_job("dormant", "echo nope");
    job.schedule = "@every 100ms".into();
    job.disabled = true;
    cluster.set_job("server-1", &job).await.unwrap();

    tokio::time::sleep(Duration::from_millis(600)).await;

    let leader = cluster.leader().await;
    let executions = leader
        .agent
        .store
        .get_executions("dormant", &ExecutionOptions::default())
        .unwrap();
    assert!(executions.is_empty(), "disabled jobs must not be scheduled");

    cluster.shutdown().await;
}
