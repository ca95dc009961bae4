//! Test harness for multi-agent cluster integration tests.
//!
//! Spawns full in-process agents (gossip + consensus + RPC) on loopback
//! ports and provides helpers to wait for cluster conditions.

// Each test binary uses a different slice of the harness.
#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cronmesh::agent::Agent;
use cronmesh::config::{Config, Profile};
use cronmesh::grpc::GrpcClient;
use cronmesh::job::Job;

/// A cluster-unique agent configuration with fast timings for tests.
///
/// Raft state lives in a per-node temp dir; only the first server
/// bootstraps, everyone else is added by the leader's reconcile loop.
pub fn test_config(
    name: &str,
    base_port: u16,
    index: u16,
    server: bool,
    data_dir: &std::path::Path,
) -> Config {
    Config {
        node_name: name.to_string(),
        server,
        profile: Profile::Local,
        bind_addr: "127.0.0.1".parse().unwrap(),
        rpc_port: base_port + index,
        gossip_port: base_port + 100 + index,
        data_dir: data_dir.to_path_buf(),
        bootstrap_expect: if index == 0 && server { 1 } else { 0 },
        serf_reconnect_timeout: Duration::from_secs(60),
        reconcile_interval: Duration::from_secs(2),
        ..Config::default()
    }
}

pub struct TestNode {
    pub name: String,
    pub agent: Arc<Agent>,
    pub rpc_addr: String,
    /// Keeps the node's on-disk state alive for the test's duration.
    pub data_dir: tempfile::TempDir,
}

impl TestNode {
    pub async fn is_leader(&self) -> bool {
        self.agent.is_leader().await
    }

    /// Simulate a crash: stop every loop without a graceful leave.
    pub fn kill(&self) {
        self.agent.shutdown_token().cancel();
    }
}

pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    pub client: GrpcClient,
}

impl TestCluster {
    /// Start `num_servers` consensus servers (plus `num_workers` gossip-only
    /// workers) and wire them into one cluster.
    pub async fn new(base_port: u16, num_servers: u16, num_workers: u16) -> Self {
        let mut nodes = Vec::new();
        let seed_gossip = format!("127.0.0.1:{}", base_port + 100);

        for i in 0..(num_servers + num_workers) {
            let server = i < num_servers;
            let name = if server {
                format!("server-{}", i + 1)
            } else {
                format!("worker-{}", i + 1 - num_servers)
            };
            let data_dir = tempfile::tempdir().expect("temp dir for test node");
            let mut config = test_config(&name, base_port, i, server, data_dir.path());
            if i > 0 {
                config.join = vec![seed_gossip.clone()];
            }

            let agent = Agent::start(config)
                .await
                .unwrap_or_else(|e| panic!("failed to start {name}: {e}"));
            let rpc_addr = format!("127.0.0.1:{}", base_port + i);
            nodes.push(TestNode {
                name,
                agent,
                rpc_addr,
                data_dir,
            });
        }

        Self {
            nodes,
            client: GrpcClient::default(),
        }
    }

    pub fn node(&self, name: &str) -> &TestNode {
        self.nodes
            .iter()
            .find(|n| n.name == name)
            .unwrap_or_else(|| panic!("no node named {name}"))
    }

    /// Wait until some node reports leadership, returning its name.
    pub async fn wait_for_leader(&self, limit: Duration) -> Option<String> {
        let found = wait_for(
            || async {
                for node in &self.nodes {
                    if node.is_leader().await {
                        return true;
                    }
                }
                false
            },
            limit,
        )
        .await;

        if !found {
            return None;
        }
        for node in &self.nodes {
            if node.is_leader().await {
                return Some(node.name.clone());
            }
        }
        None
    }

    pub async fn leader(&self) -> &TestNode {
        for node in &self.nodes {
            if node.is_leader().await {
                return node;
            }
        }
        panic!("no leader in cluster");
    }

    /// Wait for a leader other than `excluded`.
    pub async fn wait_for_new_leader(&self, excluded: &str, limit: Duration) -> Option<String> {
        let found = wait_for(
            || async {
                for node in &self.nodes {
                    if node.name != excluded && node.is_leader().await {
                        return true;
                    }
                }
                false
            },
            limit,
        )
        .await;

        if !found {
            return None;
        }
        for node in &self.nodes {
            if node.name != excluded && node.is_leader().await {
                return Some(node.name.clone());
            }
        }
        None
    }

    /// Wait until the leader's voter set has `expected` members.
    pub async fn wait_for_voters(&self, expected: usize, limit: Duration) -> bool {
        wait_for(
            || async {
                for node in &self.nodes {
                    if node.is_leader().await {
                        if let Some(raft) = &node.agent.raft {
                            return raft.get_configuration().await.len() == expected;
                        }
                    }
                }
                false
            },
            limit,
        )
        .await
    }

    /// Submit a job through a specific node's RPC endpoint.
    pub async fn set_job(&self, via: &str, job: &Job) -> cronmesh::error::Result<()> {
        self.client.set_job(&self.node(via).rpc_addr, job).await
    }

    pub async fn shutdown(&self) {
        for node in &self.nodes {
            node.kill();
        }
    }
}

/// A minimal job running the given shell command on demand.
pub fn shell_job(name: &str, command: &str) -> Job {
    Job {
        name: name.to_string(),
        schedule: "@manually".to_string(),
        executor: "shell".to_string(),
        executor_config: [("command".to_string(), command.to_string())]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

/// Wait for a condition to become true, polling every 50ms.
pub async fn wait_for<F, Fut>(condition: F, limit: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < limit {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

/// Assert a condition eventually becomes true.
pub async fn assert_eventually<F, Fut>(condition: F, limit: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    assert!(wait_for(condition, limit).await, "{message}");
}
