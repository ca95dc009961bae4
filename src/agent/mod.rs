//! The agent: one process of the cluster, wiring gossip, consensus, the
//! scheduler, the dispatcher and the RPC surface together.

pub mod dispatch;
pub mod leader;
pub mod retry_join;
pub mod server_parts;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{CronmeshError, Result};
use crate::execution::Execution;
use crate::fsm::{self, Fsm, FsmResponse, MessageType};
use crate::gossip::{Gossip, GossipConfig, Member, MemberEvent, MemberStatus};
use crate::grpc::GrpcClient;
use crate::job::{self, Job};
use crate::notifier::Notifier;
use crate::plugins::Plugins;
use crate::proto;
use crate::raft::{RaftConfig, RaftNode};
use crate::sched::{JobRunner, Scheduler};
use crate::store::Store;
use crate::VERSION;

use server_parts::{build_reserved_tags, is_server, ServerParts, RESERVED_TAGS};

/// How long a replicated apply may wait for commit.
pub const RAFT_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Agent {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub fsm: Arc<Fsm>,
    pub raft: Option<Arc<RaftNode>>,
    pub gossip: Arc<Gossip>,
    pub plugins: Arc<Plugins>,
    pub client: GrpcClient,
    pub notifier: Arc<Notifier>,

    sched: OnceLock<Arc<Scheduler>>,

    /// Streams this dispatcher currently has open, by execution key.
    pub active_executions: Mutex<HashMap<String, proto::Execution>>,
    /// Executions currently running on this worker, by group id.
    pub running_executions: Mutex<HashMap<String, proto::Execution>>,

    /// When set, no new executions are triggered on this node.
    pub global_lock: AtomicBool,

    reconcile_tx: mpsc::Sender<Member>,
    reconcile_rx: Mutex<Option<mpsc::Receiver<Member>>>,

    shutdown: CancellationToken,
}

struct AgentRunner {
    agent: std::sync::Weak<Agent>,
}

#[async_trait]
impl JobRunner for AgentRunner {
    async fn run_job(&self, job_name: String) {
        if let Some(agent) = self.agent.upgrade() {
            if let Err(e) = agent.trigger_job(&job_name).await {
                tracing::error!(job = %job_name, error = %e, "job: Error running job");
            }
        }
    }
}

impl Agent {
    /// Assemble and start an agent: store, consensus (servers only),
    /// gossip, plugin discovery, the RPC server and the background loops.
    pub async fn start(config: Config) -> Result<Arc<Agent>> {
        config.validate()?;
        let config = Arc::new(config);
        let shutdown = CancellationToken::new();

        let store = Arc::new(Store::new());
        let fsm = Arc::new(Fsm::new(store.clone()));

        let tls_client = crate::tls::client_tls_config(&config.tls).await?;

        let (raft, raft_rx) = if config.server {
            let (min, max, heartbeat) = config.raft_timing();
            let raft_config = RaftConfig {
                node_id: config.node_name.clone(),
                advertise_addr: config.advertise_rpc_addr().to_string(),
                raft_dir: if config.dev_mode {
                    None
                } else {
                    Some(config.raft_dir())
                },
                bootstrap: config.effective_bootstrap(),
                election_timeout_min_ms: min,
                election_timeout_max_ms: max,
                heartbeat_interval_ms: heartbeat,
            };
            let (node, rx) = RaftNode::new(raft_config, fsm.clone())?;
            (Some(Arc::new(node.with_tls(tls_client.clone()))), Some(rx))
        } else {
            (None, None)
        };

        let mut gossip_config = GossipConfig::new(&config.node_name, config.bind_gossip_addr());
        gossip_config.advertise_addr = config.advertise_gossip_addr();
        gossip_config.tags = build_reserved_tags(&config, VERSION);
        gossip_config.encrypt_key = config.encrypt.clone();
        gossip_config.probe_interval = config.profile.probe_interval();
        gossip_config.failure_timeout = config.profile.failure_timeout();
        gossip_config.reconnect_timeout = config.serf_reconnect_timeout;
        let (gossip, events_rx) = Gossip::new(gossip_config).await?;

        let plugins = Arc::new(Plugins::discover(config.plugin_dir.as_deref())?);
        let notifier = Arc::new(Notifier::new(&config));

        let (reconcile_tx, reconcile_rx) = mpsc::channel(64);

        let agent = Arc::new(Agent {
            config: config.clone(),
            store,
            fsm,
            raft: raft.clone(),
            gossip: gossip.clone(),
            plugins,
            client: GrpcClient::new(tls_client),
            notifier,
            sched: OnceLock::new(),
            active_executions: Mutex::new(HashMap::new()),
            running_executions: Mutex::new(HashMap::new()),
            global_lock: AtomicBool::new(false),
            reconcile_tx,
            reconcile_rx: Mutex::new(Some(reconcile_rx)),
            shutdown,
        });

        let runner = Arc::new(AgentRunner {
            agent: Arc::downgrade(&agent),
        });
        let _ = agent.sched.set(Arc::new(Scheduler::new(runner)));

        // Gossip exchange loop.
        tokio::spawn(gossip.clone().run(agent.shutdown.clone()));

        // Serf event loop: log member events and feed the reconciler.
        {
            let agent = agent.clone();
            tokio::spawn(async move { agent.event_loop(events_rx).await });
        }

        // Consensus loop and leadership monitor, servers only.
        if let (Some(raft), Some(rx)) = (raft, raft_rx) {
            {
                let raft = raft.clone();
                let shutdown = agent.shutdown.clone();
                tokio::spawn(async move { raft.run(rx, shutdown).await });
            }
            let agent_for_leader = agent.clone();
            tokio::spawn(async move { leader::monitor_leadership(agent_for_leader).await });
        }

        // Shared RPC listener for all services.
        crate::grpc::serve(agent.clone()).await?;

        // Initial join and retry-join.
        if !config.join.is_empty() {
            let contacted = gossip.join(&config.join).await;
            tracing::info!(contacted, "agent: initial join");
        }
        if !config.retry_join.is_empty() {
            let gossip = gossip.clone();
            let retry = config.retry_join.clone();
            let interval = config.retry_interval;
            let max = config.retry_max;
            let shutdown = agent.shutdown.clone();
            tokio::spawn(async move {
                if let Err(e) = retry_join::retry_join(gossip, retry, interval, max, shutdown).await
                {
                    tracing::error!(error = %e, "agent: retry join failed, shutting down");
                    std::process::exit(1);
                }
            });
        }

        tracing::info!(node = %config.node_name, server = config.server, "agent: started");
        Ok(agent)
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        self.sched.get().expect("scheduler is set at construction")
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Graceful stop: drain the scheduler and local executions, then leave
    /// gossip and stop every loop.
    pub async fn stop(&self) -> Result<()> {
        tracing::info!("agent: gracefully shutting down");
        self.scheduler().stop().await;

        let deadline = tokio::time::Instant::now() + self.config.drain_timeout;
        loop {
            let running = self.running_executions.lock().unwrap().len();
            if running == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(running, "agent: drain timeout reached, terminating anyway");
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }

        self.plugins.shutdown().await;
        self.gossip.leave().await;
        self.shutdown.cancel();
        Ok(())
    }

    async fn event_loop(&self, mut events: mpsc::Receiver<MemberEvent>) {
        tracing::info!("agent: Listen for events");
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => return,
                event = events.recv() => {
                    let Some(event) = event else { return };
                    let member = event.member().clone();
                    tracing::debug!(
                        node = %self.config.node_name,
                        member = %member.name,
                        status = %member.status,
                        "agent: Member event"
                    );
                    // The leader reconciles the voter set from every
                    // member event; on other nodes the queue just drops
                    // when full.
                    if let Err(e) = self.reconcile_tx.try_send(member) {
                        tracing::trace!(error = %e, "agent: reconcile queue full, dropping event");
                    }
                }
            }
        }
    }

    pub(crate) fn take_reconcile_rx(&self) -> Option<mpsc::Receiver<Member>> {
        self.reconcile_rx.lock().unwrap().take()
    }

    pub(crate) fn put_back_reconcile_rx(&self, rx: mpsc::Receiver<Member>) {
        *self.reconcile_rx.lock().unwrap() = Some(rx);
    }

    // ---- membership views ----

    pub fn members(&self) -> Vec<Member> {
        self.gossip.members()
    }

    /// Alive peer servers in this agent's region.
    pub fn local_servers(&self) -> Vec<ServerParts> {
        self.gossip
            .members()
            .iter()
            .filter(|m| m.status == MemberStatus::Alive)
            .filter_map(is_server)
            .filter(|parts| parts.region == self.config.region)
            .collect()
    }

    pub async fn is_leader(&self) -> bool {
        match &self.raft {
            Some(raft) => raft.is_leader().await,
            None => false,
        }
    }

    /// The leader's advertised RPC address, when known.
    pub async fn leader_addr(&self) -> Option<String> {
        match &self.raft {
            Some(raft) => raft.leader_addr().await,
            None => None,
        }
    }

    /// The gossip member currently acting as leader.
    pub async fn leader_member(&self) -> Result<Member> {
        let leader = self
            .leader_addr()
            .await
            .ok_or(CronmeshError::LeaderNotFound)?;
        self.gossip
            .members()
            .into_iter()
            .find(|m| m.tags.get("rpc_addr") == Some(&leader))
            .ok_or(CronmeshError::LeaderNotFound)
    }

    /// Update this agent's tags, preserving the reserved keys.
    pub fn update_tags(&self, mut tags: HashMap<String, String>) {
        let current = self.gossip.local_member().tags;
        for reserved in RESERVED_TAGS {
            if let Some(value) = current.get(*reserved) {
                tags.insert(reserved.to_string(), value.clone());
            }
        }
        tags.insert("dc".to_string(), self.config.datacenter.clone());
        tags.insert("region".to_string(), self.config.region.clone());
        self.gossip.set_tags(tags);
    }

    /// Pick the first local server answering on its RPC port within 1s.
    pub async fn check_and_select_server(&self) -> Result<String> {
        for server in self.local_servers() {
            tracing::debug!(peer = %server.rpc_addr, "Checking peer");
            let probe = tokio::time::timeout(
                Duration::from_secs(1),
                tokio::net::TcpStream::connect(&server.rpc_addr),
            )
            .await;
            if matches!(probe, Ok(Ok(_))) {
                tracing::debug!(peer = %server.rpc_addr, "Found good peer");
                return Ok(server.rpc_addr);
            }
        }
        Err(CronmeshError::NoSuitableServer)
    }

    // ---- replicated writes ----

    /// Replicate a SetJob through the consensus log. Leader only.
    pub async fn apply_set_job(&self, job: &proto::Job) -> Result<()> {
        let raft = self.raft.as_ref().ok_or(CronmeshError::NotLeader)?;
        let cmd = fsm::encode(MessageType::SetJob, job);
        raft.apply(cmd, RAFT_TIMEOUT).await?;
        Ok(())
    }

    pub async fn raft_apply(&self, cmd: Vec<u8>) -> Result<FsmResponse> {
        let raft = self.raft.as_ref().ok_or(CronmeshError::NotLeader)?;
        Ok(raft.apply(cmd, RAFT_TIMEOUT).await?)
    }

    // ---- execution bookkeeping ----

    /// Active executions across every alive local server.
    pub async fn get_active_executions(&self) -> Result<Vec<proto::Execution>> {
        let mut executions = Vec::new();
        for server in self.local_servers() {
            let from_server = self.client.get_active_executions(&server.rpc_addr).await?;
            executions.extend(from_server);
        }
        Ok(executions)
    }

    /// Number of executions currently running on this node.
    pub fn running_jobs(&self) -> usize {
        self.running_executions.lock().unwrap().len()
    }

    // ---- trigger path ----

    /// Whether a trigger for this job may start right now.
    pub async fn is_runnable(&self, job: &Job) -> bool {
        if job.disabled {
            tracing::debug!(job = %job.name, "job: Skipping execution of disabled job");
            return false;
        }
        if let Some(expires_at) = job.expires_at {
            if Utc::now() > expires_at {
                tracing::debug!(job = %job.name, "job: Skipping execution of expired job");
                return false;
            }
        }
        if self.global_lock.load(Ordering::SeqCst) {
            tracing::warn!(job = %job.name, "job: Skipping execution because active global lock");
            return false;
        }

        if job.concurrency == job::CONCURRENCY_FORBID {
            match self.get_active_executions().await {
                Ok(executions) => {
                    if executions.iter().any(|e| e.job_name == job.name) {
                        tracing::info!(
                            job = %job.name,
                            concurrency = %job.concurrency,
                            "job: Skipping concurrent execution"
                        );
                        return false;
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "job: Error querying for running executions");
                    return false;
                }
            }
        }

        true
    }

    /// A cron fire or dependent-job fan-out: gate, then dispatch a fresh
    /// execution.
    pub async fn trigger_job(&self, job_name: &str) -> Result<Job> {
        let job = self.store.get_job(job_name)?;
        if !self.is_runnable(&job).await {
            return Ok(job);
        }

        tracing::debug!(job = %job.name, schedule = %job.schedule, "job: Running job");
        let execution = Execution::new(job_name);
        self.run_agent(job_name, execution).await
    }
}
