//! The Raft node: event loop, elections, replication and the apply path.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Mutex, RwLock};
use tokio::time::{timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::fsm::{Fsm, FsmResponse};
use crate::proto::raft_client::RaftClient;
use crate::proto::{
    AppendEntriesRequest, InstallSnapshotRequest, InstallSnapshotResponse, TimeoutNowRequest,
    TimeoutNowResponse, VoteRequest, VoteResponse,
};
use crate::raft::rpc::{
    configuration_to_proto, entry_to_proto, handle_append_entries, handle_request_vote,
    proto_to_configuration,
};
use crate::raft::state::{EntryPayload, LogEntry, Peer, RaftRole, RaftState};
use crate::raft::storage::{
    read_peers_json, remove_peers_json, LogStore, SnapshotMeta, SnapshotStore,
};
use crate::raft::timer::random_election_timeout;
use crate::raft::RaftError;

/// Snapshot and compact once this many entries have been applied since the
/// last snapshot.
const SNAPSHOT_THRESHOLD: usize = 8192;

#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// Unique server id, the agent's node name.
    pub node_id: String,
    /// Advertised address of the shared listener, `host:port`.
    pub advertise_addr: String,
    /// `{data-dir}/raft`; `None` keeps everything in memory (dev mode).
    pub raft_dir: Option<PathBuf>,
    /// Seed a new cluster with this node as the sole voter.
    pub bootstrap: bool,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
}

impl RaftConfig {
    pub fn dev(node_id: &str, advertise_addr: &str) -> Self {
        Self {
            node_id: node_id.to_string(),
            advertise_addr: advertise_addr.to_string(),
            raft_dir: None,
            bootstrap: true,
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            heartbeat_interval_ms: 50,
        }
    }
}

/// Messages for the node event loop.
#[derive(Debug)]
pub enum RaftMessage {
    /// Push replication out immediately instead of waiting for the tick.
    ReplicateNow,
    /// A leadership transfer target received TimeoutNow.
    TriggerElection,
}

/// State and log share one lock so RPC handling mutates both atomically.
pub struct Shared {
    pub state: RaftState,
    pub log: LogStore,
}

pub struct RaftNode {
    pub id: String,
    addr: String,
    config: RaftConfig,

    pub shared: Arc<RwLock<Shared>>,
    snapshots: Arc<SnapshotStore>,
    fsm: Arc<Fsm>,

    clients: Arc<Mutex<HashMap<String, RaftClient<Channel>>>>,
    blocked_peers: Arc<Mutex<HashSet<String>>>,
    tls: Option<ClientTlsConfig>,

    message_tx: mpsc::Sender<RaftMessage>,
    last_heartbeat: Arc<RwLock<Instant>>,

    pending: Arc<Mutex<HashMap<u64, oneshot::Sender<Result<FsmResponse, RaftError>>>>>,

    commit_tx: watch::Sender<u64>,
    leader_tx: watch::Sender<bool>,
}

impl RaftNode {
    /// Create a node, restoring any persisted snapshot and log state and
    /// honoring `peers.json` recovery and bootstrap rules.
    pub fn new(
        config: RaftConfig,
        fsm: Arc<Fsm>,
    ) -> Result<(Self, mpsc::Receiver<RaftMessage>), RaftError> {
        let (message_tx, message_rx) = mpsc::channel(128);

        let mut log = LogStore::open(config.raft_dir.as_deref())?;
        let snapshots = SnapshotStore::open(config.raft_dir.as_deref())?;
        let mut state = RaftState::new();
        let (term, voted_for) = log.meta();
        state.current_term = term;
        state.voted_for = voted_for;

        if let Some((meta, data)) = snapshots.latest()? {
            fsm.restore(&data)?;
            log.compact_through(meta.last_index, meta.last_term)?;
            state.configuration = meta.configuration;
            state.commit_index = meta.last_index;
            state.last_applied = meta.last_index;
            tracing::info!(index = meta.last_index, "raft: restored from snapshot");
        }

        // Pick up the configuration from the freshest config entry in the
        // replayed log.
        for entry in log.entries_from(0) {
            if let EntryPayload::Configuration(peers) = &entry.payload {
                state.configuration = peers.clone();
            }
        }

        // A peers.json file overrides whatever configuration we had; it is
        // removed only after being read successfully.
        if let Some(raft_dir) = config.raft_dir.as_deref() {
            match read_peers_json(raft_dir) {
                Ok(Some(peers)) => {
                    tracing::info!("raft: found peers.json file, recovering configuration");
                    let entry = LogEntry {
                        term: state.current_term.max(1),
                        index: log.last_index() + 1,
                        payload: EntryPayload::Configuration(peers.clone()),
                    };
                    log.append(&[entry])?;
                    state.configuration = peers;
                    remove_peers_json(raft_dir)?;
                    tracing::info!("raft: deleted peers.json file after successful recovery");
                }
                Ok(None) => {}
                Err(e) => return Err(RaftError::Storage(e)),
            }
        }

        // On a clean slate under bootstrap (or dev mode) seed the
        // configuration with the local node as the sole voter.
        if config.bootstrap && !log.has_existing_state() && state.configuration.is_empty() {
            let me = Peer {
                id: config.node_id.clone(),
                addr: config.advertise_addr.clone(),
            };
            log.set_meta(1, None)?;
            state.current_term = 1;
            log.append(&[LogEntry {
                term: 1,
                index: log.last_index() + 1,
                payload: EntryPayload::Configuration(vec![me.clone()]),
            }])?;
            state.configuration = vec![me];
            tracing::info!(node_id = %config.node_id, "raft: bootstrapped configuration");
        }

        let node = Self {
            id: config.node_id.clone(),
            addr: config.advertise_addr.clone(),
            config,
            shared: Arc::new(RwLock::new(Shared { state, log })),
            snapshots: Arc::new(snapshots),
            fsm,
            clients: Arc::new(Mutex::new(HashMap::new())),
            blocked_peers: Arc::new(Mutex::new(HashSet::new())),
            tls: None,
            message_tx,
            last_heartbeat: Arc::new(RwLock::new(Instant::now())),
            pending: Arc::new(Mutex::new(HashMap::new())),
            commit_tx: watch::channel(0).0,
            leader_tx: watch::channel(false).0,
        };

        Ok((node, message_rx))
    }

    pub fn with_tls(mut self, tls: Option<ClientTlsConfig>) -> Self {
        self.tls = tls;
        self
    }

    pub fn message_sender(&self) -> mpsc::Sender<RaftMessage> {
        self.message_tx.clone()
    }

    /// Leadership transitions: `true` when this node becomes leader.
    pub fn subscribe_leadership(&self) -> watch::Receiver<bool> {
        self.leader_tx.subscribe()
    }

    pub fn subscribe_commits(&self) -> watch::Receiver<u64> {
        self.commit_tx.subscribe()
    }

    pub async fn is_leader(&self) -> bool {
        self.shared.read().await.state.role == RaftRole::Leader
    }

    pub async fn leader_addr(&self) -> Option<String> {
        let shared = self.shared.read().await;
        if shared.state.role == RaftRole::Leader {
            Some(self.addr.clone())
        } else {
            shared.state.leader_addr.clone()
        }
    }

    pub async fn leader_id(&self) -> Option<String> {
        let shared = self.shared.read().await;
        if shared.state.role == RaftRole::Leader {
            Some(self.id.clone())
        } else {
            shared.state.leader_id.clone()
        }
    }

    /// The current voter set.
    pub async fn get_configuration(&self) -> Vec<Peer> {
        self.shared.read().await.state.configuration.clone()
    }

    // ---- apply path ----

    /// Append an opaque state-machine command, wait until it is committed
    /// and applied locally, and return the FSM response.
    pub async fn apply(&self, data: Vec<u8>, limit: Duration) -> Result<FsmResponse, RaftError> {
        self.append_payload(EntryPayload::Command(data), limit).await
    }

    /// Append a no-op entry and wait for it, ensuring the local FSM has
    /// caught up with everything committed before the call.
    pub async fn barrier(&self, limit: Duration) -> Result<(), RaftError> {
        self.append_payload(EntryPayload::Noop, limit).await.map(|_| ())
    }

    /// Add a server to the voter set.
    pub async fn add_voter(&self, id: &str, addr: &str, limit: Duration) -> Result<(), RaftError> {
        let mut peers = self.get_configuration().await;
        if peers.iter().any(|p| p.id == id && p.addr == addr) {
            return Ok(());
        }
        peers.retain(|p| p.id != id);
        peers.push(Peer {
            id: id.to_string(),
            addr: addr.to_string(),
        });
        self.append_payload(EntryPayload::Configuration(peers), limit)
            .await
            .map(|_| ())
    }

    /// Remove a server from the voter set by id.
    pub async fn remove_server(&self, id: &str, limit: Duration) -> Result<(), RaftError> {
        let mut peers = self.get_configuration().await;
        if !peers.iter().any(|p| p.id == id) {
            return Ok(());
        }
        peers.retain(|p| p.id != id);
        self.append_payload(EntryPayload::Configuration(peers), limit)
            .await
            .map(|_| ())
    }

    async fn append_payload(
        &self,
        payload: EntryPayload,
        limit: Duration,
    ) -> Result<FsmResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        let index;
        {
            let mut shared = self.shared.write().await;
            if shared.state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader(shared.state.leader_addr.clone()));
            }

            index = shared.log.last_index() + 1;
            let entry = LogEntry {
                term: shared.state.current_term,
                index,
                payload: payload.clone(),
            };
            if let EntryPayload::Configuration(peers) = &payload {
                shared.state.configuration = peers.clone();
                // Refresh follower bookkeeping for the changed member set.
                let last = shared.log.last_index();
                for peer in shared.state.other_peers(&self.id) {
                    shared
                        .state
                        .next_index
                        .entry(peer.id.clone())
                        .or_insert(last + 1);
                    shared.state.match_index.entry(peer.id).or_insert(0);
                }
            }
            shared.log.append(&[entry])?;
            self.pending.lock().await.insert(index, tx);
            advance_commit(&mut shared, &self.id, &self.commit_tx);
        }

        self.apply_committed().await;
        let _ = self.message_tx.send(RaftMessage::ReplicateNow).await;

        match timeout(limit, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => {
                self.pending.lock().await.remove(&index);
                Err(RaftError::Timeout)
            }
        }
    }

    // ---- event loop ----

    /// Run the node until cancelled.
    pub async fn run(&self, mut message_rx: mpsc::Receiver<RaftMessage>, shutdown: CancellationToken) {
        let mut election_timeout = random_election_timeout(
            self.config.election_timeout_min_ms,
            self.config.election_timeout_max_ms,
        );
        let mut commit_rx = self.subscribe_commits();

        loop {
            let role = self.shared.read().await.state.role;

            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.fail_pending(RaftError::Shutdown).await;
                    return;
                }

                Some(msg) = message_rx.recv() => {
                    match msg {
                        RaftMessage::ReplicateNow => {
                            if role == RaftRole::Leader {
                                self.send_heartbeats().await;
                            }
                        }
                        RaftMessage::TriggerElection => {
                            self.start_election().await;
                        }
                    }
                }

                _ = commit_rx.changed() => {
                    self.apply_committed().await;
                }

                _ = tokio::time::sleep(election_timeout), if role != RaftRole::Leader => {
                    let elapsed = self.last_heartbeat.read().await.elapsed();
                    if elapsed >= election_timeout {
                        self.start_election().await;
                    }
                    election_timeout = random_election_timeout(
                        self.config.election_timeout_min_ms,
                        self.config.election_timeout_max_ms,
                    );
                }

                _ = tokio::time::sleep(Duration::from_millis(self.config.heartbeat_interval_ms)), if role == RaftRole::Leader => {
                    self.send_heartbeats().await;
                }
            }
        }
    }

    async fn start_election(&self) {
        let (term, last_log_index, last_log_term, peers, majority) = {
            let mut shared = self.shared.write().await;

            // Nodes outside the voter set wait to be added by the leader's
            // reconcile pass instead of disrupting the cluster.
            if !shared.state.is_voter(&self.id) {
                return;
            }

            shared.state.become_candidate(&self.id);
            let term = shared.state.current_term;
            let voted_for = shared.state.voted_for.clone();
            if let Err(e) = shared.log.set_meta(term, voted_for) {
                tracing::error!(error = %e, "raft: failed to persist vote");
            }
            self.sync_leadership(&shared.state);

            (
                term,
                shared.log.last_index(),
                shared.log.last_term(),
                shared.state.other_peers(&self.id),
                shared.state.majority(),
            )
        };

        tracing::info!(node_id = %self.id, term, "Starting election");

        let req = VoteRequest {
            term,
            candidate_id: self.id.clone(),
            last_log_index,
            last_log_term,
        };

        let mut vote_count = 1u64;
        for peer in &peers {
            if self.is_blocked(&peer.id).await {
                continue;
            }
            let Some(mut client) = self.client(&peer.addr).await else {
                continue;
            };
            match timeout(Duration::from_millis(100), client.request_vote(req.clone())).await {
                Ok(Ok(response)) => {
                    let resp = response.into_inner();
                    if resp.term > term {
                        let mut shared = self.shared.write().await;
                        shared.state.become_follower(resp.term);
                        let meta = (shared.state.current_term, shared.state.voted_for.clone());
                        let _ = shared.log.set_meta(meta.0, meta.1);
                        self.sync_leadership(&shared.state);
                        return;
                    }
                    if resp.vote_granted {
                        vote_count += 1;
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer.id, error = %e, "Vote request failed");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer.id, "Vote request timed out");
                }
            }
        }

        let mut shared = self.shared.write().await;
        if shared.state.role == RaftRole::Candidate && shared.state.current_term == term {
            shared.state.votes_received = vote_count;
            if vote_count >= majority as u64 {
                let last = shared.log.last_index();
                shared.state.become_leader(&self.id, &self.addr, last);
                tracing::info!(node_id = %self.id, term, votes = vote_count, "Became leader");
                self.sync_leadership(&shared.state);
            } else {
                tracing::debug!(
                    node_id = %self.id,
                    term,
                    votes = vote_count,
                    needed = majority,
                    "Election failed, not enough votes"
                );
            }
        }
    }

    async fn send_heartbeats(&self) {
        let (term, commit_index, peers, next_index, snapshot_base) = {
            let shared = self.shared.read().await;
            if shared.state.role != RaftRole::Leader {
                return;
            }
            (
                shared.state.current_term,
                shared.state.commit_index,
                shared.state.other_peers(&self.id),
                shared.state.next_index.clone(),
                shared.log.snapshot_last_index,
            )
        };

        for peer in peers {
            if self.is_blocked(&peer.id).await {
                continue;
            }

            let peer_next = *next_index.get(&peer.id).unwrap_or(&1);

            if peer_next <= snapshot_base {
                self.send_snapshot(peer.clone(), term).await;
                continue;
            }

            let (prev_log_index, prev_log_term, entries) = {
                let shared = self.shared.read().await;
                let prev = peer_next.saturating_sub(1);
                let prev_term = shared.log.term_at(prev).unwrap_or(0);
                let entries: Vec<_> = shared
                    .log
                    .entries_from(peer_next)
                    .iter()
                    .map(entry_to_proto)
                    .collect();
                (prev, prev_term, entries)
            };

            let req = AppendEntriesRequest {
                term,
                leader_id: self.id.clone(),
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            let Some(mut client) = self.client(&peer.addr).await else {
                continue;
            };
            let node = self.clone_refs();
            let peer_id = peer.id.clone();
            tokio::spawn(async move {
                match timeout(Duration::from_millis(100), client.append_entries(req)).await {
                    Ok(Ok(response)) => {
                        node.handle_append_response(&peer_id, response.into_inner()).await;
                    }
                    Ok(Err(e)) => {
                        tracing::trace!(peer = %peer_id, error = %e, "AppendEntries failed");
                    }
                    Err(_) => {
                        tracing::trace!(peer = %peer_id, "AppendEntries timed out");
                    }
                }
            });
        }
    }

    async fn send_snapshot(&self, peer: Peer, term: u64) {
        let data = match self.fsm.snapshot() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "raft: failed to build snapshot for follower");
                return;
            }
        };
        let (last_included_index, last_included_term, configuration) = {
            let shared = self.shared.read().await;
            (
                shared.state.last_applied,
                shared.log.term_at(shared.state.last_applied).unwrap_or(0),
                configuration_to_proto(&shared.state.configuration),
            )
        };

        let req = InstallSnapshotRequest {
            term,
            leader_id: self.id.clone(),
            last_included_index,
            last_included_term,
            configuration: Some(configuration),
            data,
        };

        let Some(mut client) = self.client(&peer.addr).await else {
            return;
        };
        let node = self.clone_refs();
        tokio::spawn(async move {
            match timeout(Duration::from_secs(10), client.install_snapshot(req)).await {
                Ok(Ok(response)) => {
                    let resp = response.into_inner();
                    let mut shared = node.shared.write().await;
                    if resp.term > shared.state.current_term {
                        shared.state.become_follower(resp.term);
                        let _ = node.leader_tx.send(false);
                    } else if resp.success {
                        shared
                            .state
                            .next_index
                            .insert(peer.id.clone(), last_included_index + 1);
                        shared.state.match_index.insert(peer.id, last_included_index);
                    }
                }
                Ok(Err(e)) => {
                    tracing::debug!(peer = %peer.id, error = %e, "InstallSnapshot failed");
                }
                Err(_) => {
                    tracing::debug!(peer = %peer.id, "InstallSnapshot timed out");
                }
            }
        });
    }

    /// Apply committed entries to the FSM and resolve pending apply futures.
    pub async fn apply_committed(&self) {
        loop {
            let entry = {
                let mut shared = self.shared.write().await;
                if shared.state.last_applied >= shared.state.commit_index {
                    break;
                }
                let next = shared.state.last_applied + 1;
                shared.state.last_applied = next;
                shared.log.get(next)
            };

            let Some(entry) = entry else { continue };

            let result = match &entry.payload {
                EntryPayload::Command(data) => {
                    self.fsm.apply(data).map_err(RaftError::from)
                }
                EntryPayload::Configuration(_) | EntryPayload::Noop => Ok(FsmResponse::None),
            };

            if let Err(e) = &result {
                tracing::warn!(index = entry.index, error = %e, "raft: fsm apply failed");
            }

            if let Some(tx) = self.pending.lock().await.remove(&entry.index) {
                let _ = tx.send(result);
            }

            self.maybe_snapshot().await;
        }
    }

    /// Persist a snapshot and compact the log once enough entries have been
    /// applied.
    async fn maybe_snapshot(&self) {
        let (due, last_applied) = {
            let shared = self.shared.read().await;
            let applied_since_base =
                shared.state.last_applied.saturating_sub(shared.log.snapshot_last_index);
            (
                applied_since_base as usize >= SNAPSHOT_THRESHOLD,
                shared.state.last_applied,
            )
        };
        if !due {
            return;
        }

        let data = match self.fsm.snapshot() {
            Ok(data) => data,
            Err(e) => {
                tracing::error!(error = %e, "raft: snapshot failed");
                return;
            }
        };

        let mut shared = self.shared.write().await;
        let last_term = shared.log.term_at(last_applied).unwrap_or(0);
        let meta = SnapshotMeta {
            last_index: last_applied,
            last_term,
            configuration: shared.state.configuration.clone(),
        };
        if let Err(e) = self.snapshots.persist(&meta, &data) {
            tracing::error!(error = %e, "raft: failed to persist snapshot");
            return;
        }
        if let Err(e) = shared.log.compact_through(last_applied, last_term) {
            tracing::error!(error = %e, "raft: failed to compact log");
        }
        tracing::info!(index = last_applied, "raft: snapshot persisted, log compacted");
    }

    // ---- incoming RPCs ----

    pub async fn handle_vote_request(&self, req: VoteRequest) -> VoteResponse {
        let mut shared = self.shared.write().await;
        let Shared { state, log } = &mut *shared;
        let response = handle_request_vote(state, log, &req, &self.id);
        self.sync_leadership(state);
        drop(shared);

        if response.vote_granted {
            *self.last_heartbeat.write().await = Instant::now();
        }
        response
    }

    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> crate::proto::AppendEntriesResponse {
        let response = {
            let mut shared = self.shared.write().await;
            let Shared { state, log } = &mut *shared;
            let response = handle_append_entries(state, log, &req, &self.id);
            self.sync_leadership(state);
            if response.success {
                let _ = self.commit_tx.send(state.commit_index);
            }
            response
        };

        if response.success {
            *self.last_heartbeat.write().await = Instant::now();
            self.apply_committed().await;
        }
        response
    }

    pub async fn handle_timeout_now(&self, req: TimeoutNowRequest) -> TimeoutNowResponse {
        let term = self.shared.read().await.state.current_term;
        if req.term < term {
            return TimeoutNowResponse {
                term,
                success: false,
            };
        }

        tracing::info!(from = %req.leader_id, "raft: received leadership transfer request");
        let _ = self.message_tx.send(RaftMessage::TriggerElection).await;
        TimeoutNowResponse {
            term,
            success: true,
        }
    }

    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> InstallSnapshotResponse {
        let mut shared = self.shared.write().await;
        if req.term < shared.state.current_term {
            return InstallSnapshotResponse {
                term: shared.state.current_term,
                success: false,
            };
        }

        if req.term > shared.state.current_term {
            shared.state.become_follower(req.term);
            let meta = (shared.state.current_term, shared.state.voted_for.clone());
            let _ = shared.log.set_meta(meta.0, meta.1);
            self.sync_leadership(&shared.state);
        }

        if let Err(e) = self.fsm.restore(&req.data) {
            tracing::error!(error = %e, "raft: failed to restore snapshot");
            return InstallSnapshotResponse {
                term: shared.state.current_term,
                success: false,
            };
        }

        let _ = shared.log.truncate_from(1);
        if let Err(e) = shared
            .log
            .compact_through(req.last_included_index, req.last_included_term)
        {
            tracing::error!(error = %e, "raft: failed to align log with snapshot");
        }
        if let Some(config) = &req.configuration {
            shared.state.configuration = proto_to_configuration(config);
        }
        shared.state.commit_index = req.last_included_index;
        shared.state.last_applied = req.last_included_index;
        shared.state.leader_id = Some(req.leader_id.clone());

        tracing::info!(index = req.last_included_index, "raft: installed snapshot from leader");

        InstallSnapshotResponse {
            term: shared.state.current_term,
            success: true,
        }
    }

    // ---- leadership transfer ----

    /// Hand leadership to `target` (or the most caught-up follower) by
    /// asking it to start an immediate election.
    pub async fn leadership_transfer(&self, target: Option<String>) -> Result<String, RaftError> {
        let (term, target_peer) = {
            let shared = self.shared.read().await;
            if shared.state.role != RaftRole::Leader {
                return Err(RaftError::NotLeader(shared.state.leader_addr.clone()));
            }

            let peers = shared.state.other_peers(&self.id);
            let target_peer = match &target {
                Some(id) => peers.iter().find(|p| &p.id == id).cloned(),
                None => peers
                    .iter()
                    .max_by_key(|p| shared.state.match_index.get(&p.id).copied().unwrap_or(0))
                    .cloned(),
            };
            (shared.state.current_term, target_peer)
        };

        let target_peer = target_peer.ok_or(RaftError::NoTransferTarget)?;

        // Push replication out first so the target can win the election.
        self.send_heartbeats().await;

        let mut client = self
            .client(&target_peer.addr)
            .await
            .ok_or_else(|| RaftError::Internal(format!("can't dial {}", target_peer.addr)))?;
        let resp = client
            .timeout_now(TimeoutNowRequest {
                term,
                leader_id: self.id.clone(),
            })
            .await
            .map_err(|e| RaftError::Internal(e.to_string()))?
            .into_inner();

        if !resp.success {
            return Err(RaftError::Internal(
                "transfer target refused TimeoutNow".to_string(),
            ));
        }
        Ok(target_peer.id)
    }

    // ---- plumbing ----

    fn sync_leadership(&self, state: &RaftState) {
        let is_leader = state.role == RaftRole::Leader;
        if *self.leader_tx.borrow() != is_leader {
            let _ = self.leader_tx.send(is_leader);
        }
    }

    async fn fail_pending(&self, _err: RaftError) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(RaftError::Shutdown));
        }
    }

    async fn client(&self, addr: &str) -> Option<RaftClient<Channel>> {
        if let Some(client) = self.clients.lock().await.get(addr) {
            return Some(client.clone());
        }

        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let endpoint = Endpoint::from_shared(format!("{scheme}://{addr}")).ok()?;
        let endpoint = match &self.tls {
            Some(tls) => endpoint.tls_config(tls.clone()).ok()?,
            None => endpoint,
        };
        let endpoint = endpoint.connect_timeout(Duration::from_secs(1));

        match endpoint.connect().await {
            Ok(channel) => {
                let client = RaftClient::new(channel);
                self.clients
                    .lock()
                    .await
                    .insert(addr.to_string(), client.clone());
                Some(client)
            }
            Err(e) => {
                tracing::trace!(addr, error = %e, "raft: failed to dial peer");
                None
            }
        }
    }

    /// Stop talking to a peer (test hook for simulated partitions).
    pub async fn disconnect_peer(&self, id: &str) {
        self.blocked_peers.lock().await.insert(id.to_string());
    }

    pub async fn reconnect_peer(&self, id: &str) {
        self.blocked_peers.lock().await.remove(id);
    }

    async fn is_blocked(&self, id: &str) -> bool {
        self.blocked_peers.lock().await.contains(id)
    }

    fn clone_refs(&self) -> RaftNodeRefs {
        RaftNodeRefs {
            id: self.id.clone(),
            shared: self.shared.clone(),
            commit_tx: self.commit_tx.clone(),
            leader_tx: self.leader_tx.clone(),
        }
    }
}

/// Advance the leader's commit index to the highest majority-replicated
/// entry of the current term.
fn advance_commit(shared: &mut Shared, my_id: &str, commit_tx: &watch::Sender<u64>) {
    if shared.state.role != RaftRole::Leader {
        return;
    }

    let mut match_indices: Vec<u64> = shared
        .state
        .other_peers(my_id)
        .iter()
        .map(|p| *shared.state.match_index.get(&p.id).unwrap_or(&0))
        .collect();
    match_indices.push(shared.log.last_index());
    match_indices.sort_unstable();

    let candidate = match_indices[match_indices.len() - shared.state.majority()];
    if candidate > shared.state.commit_index
        && shared.log.term_at(candidate) == Some(shared.state.current_term)
    {
        shared.state.commit_index = candidate;
        let _ = commit_tx.send(candidate);
    }
}

/// The subset of node state shared with spawned response handlers.
struct RaftNodeRefs {
    id: String,
    shared: Arc<RwLock<Shared>>,
    commit_tx: watch::Sender<u64>,
    leader_tx: watch::Sender<bool>,
}

impl RaftNodeRefs {
    async fn handle_append_response(&self, peer_id: &str, resp: crate::proto::AppendEntriesResponse) {
        let mut shared = self.shared.write().await;

        if resp.term > shared.state.current_term {
            shared.state.become_follower(resp.term);
            let meta = (shared.state.current_term, shared.state.voted_for.clone());
            let _ = shared.log.set_meta(meta.0, meta.1);
            let is_leader = shared.state.role == RaftRole::Leader;
            if *self.leader_tx.borrow() != is_leader {
                let _ = self.leader_tx.send(is_leader);
            }
            return;
        }

        if shared.state.role != RaftRole::Leader {
            return;
        }

        if resp.success {
            shared
                .state
                .match_index
                .insert(peer_id.to_string(), resp.match_index);
            shared
                .state
                .next_index
                .insert(peer_id.to_string(), resp.match_index + 1);
            advance_commit(&mut shared, &self.id, &self.commit_tx);
        } else {
            // Walk back towards the follower's log, using its match hint
            // when it is more precise.
            let current = *shared.state.next_index.get(peer_id).unwrap_or(&1);
            let next = (resp.match_index + 1).min(current.saturating_sub(1)).max(1);
            shared.state.next_index.insert(peer_id.to_string(), next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;

    fn dev_node(id: &str) -> (RaftNode, mpsc::Receiver<RaftMessage>) {
        let fsm = Arc::new(Fsm::new(Arc::new(Store::new())));
        RaftNode::new(RaftConfig::dev(id, "127.0.0.1:0"), fsm).unwrap()
    }

    #[tokio::test]
    async fn test_bootstrap_seeds_single_voter() {
        let (node, _rx) = dev_node("n1");
        let config = node.get_configuration().await;
        assert_eq!(config.len(), 1);
        assert_eq!(config[0].id, "n1");
    }

    #[tokio::test]
    async fn test_single_node_becomes_leader_and_applies() {
        let (node, rx) = dev_node("n1");
        let node = Arc::new(node);
        let shutdown = CancellationToken::new();
        let run_node = node.clone();
        let run_shutdown = shutdown.clone();
        let handle = tokio::spawn(async move { run_node.run(rx, run_shutdown).await });

        let mut leadership = node.subscribe_leadership();
        timeout(Duration::from_secs(2), async {
            while !*leadership.borrow() {
                leadership.changed().await.unwrap();
            }
        })
        .await
        .expect("single node should elect itself");

        // A barrier commits immediately on a single-voter cluster.
        node.barrier(Duration::from_secs(2)).await.unwrap();

        let cmd = crate::fsm::encode(
            crate::fsm::MessageType::SetJob,
            &crate::job::Job {
                name: "job1".into(),
                schedule: "@every 1m".into(),
                ..Default::default()
            }
            .to_proto(),
        );
        node.apply(cmd, Duration::from_secs(2)).await.unwrap();

        shutdown.cancel();
        let _ = handle.await;
    }

    #[tokio::test]
    async fn test_apply_fails_on_follower() {
        let (node, _rx) = dev_node("n1");
        // Never ran, still a follower.
        let err = node.apply(vec![0], Duration::from_millis(100)).await;
        assert!(matches!(err, Err(RaftError::NotLeader(_))));
    }

    #[tokio::test]
    async fn test_persisted_state_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let raft_dir = dir.path().join("raft");
        let config = RaftConfig {
            node_id: "n1".into(),
            advertise_addr: "127.0.0.1:0".into(),
            raft_dir: Some(raft_dir.clone()),
            bootstrap: true,
            election_timeout_min_ms: 50,
            election_timeout_max_ms: 100,
            heartbeat_interval_ms: 20,
        };

        {
            let fsm = Arc::new(Fsm::new(Arc::new(Store::new())));
            let (node, rx) = RaftNode::new(config.clone(), fsm).unwrap();
            let node = Arc::new(node);
            let shutdown = CancellationToken::new();
            let run_node = node.clone();
            let run_shutdown = shutdown.clone();
            let handle = tokio::spawn(async move { run_node.run(rx, run_shutdown).await });

            let mut leadership = node.subscribe_leadership();
            timeout(Duration::from_secs(2), async {
                while !*leadership.borrow() {
                    leadership.changed().await.unwrap();
                }
            })
            .await
            .unwrap();
            node.barrier(Duration::from_secs(2)).await.unwrap();
            shutdown.cancel();
            let _ = handle.await;
        }

        let fsm = Arc::new(Fsm::new(Arc::new(Store::new())));
        let (node, _rx) = RaftNode::new(config, fsm).unwrap();
        assert_eq!(node.get_configuration().await.len(), 1);
        let shared = node.shared.try_read().unwrap();
        assert!(shared.log.has_existing_state());
        assert!(shared.state.current_term >= 1);
    }
}
