//! Leadership monitoring and the reconcile loop bridging gossip membership
//! into the consensus voter set.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::agent::server_parts::is_server;
use crate::agent::{Agent, RAFT_TIMEOUT};
use crate::gossip::{Member, MemberStatus};

/// Give the log a chance to catch up before establishing leadership.
const BARRIER_TIMEOUT: Duration = Duration::from_secs(120);

/// Watch leadership transitions and run the leader loop while this node
/// holds the role.
pub async fn monitor_leadership(agent: Arc<Agent>) {
    let raft = match &agent.raft {
        Some(raft) => raft.clone(),
        None => return,
    };
    let shutdown = agent.shutdown_token();
    let mut leadership = raft.subscribe_leadership();
    let mut leader_loop: Option<(CancellationToken, tokio::task::JoinHandle<()>)> = None;

    tracing::info!("agent: monitoring leadership");
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                if let Some((stop, handle)) = leader_loop.take() {
                    stop.cancel();
                    let _ = handle.await;
                }
                return;
            }
            changed = leadership.changed() => {
                if changed.is_err() {
                    return;
                }
                let is_leader = *leadership.borrow();
                if is_leader {
                    if leader_loop.is_some() {
                        tracing::error!("agent: attempted to start the leader loop while running");
                        continue;
                    }
                    let stop = CancellationToken::new();
                    let agent = agent.clone();
                    let loop_stop = stop.clone();
                    let handle = tokio::spawn(async move {
                        run_leader_loop(agent, loop_stop).await;
                    });
                    leader_loop = Some((stop, handle));
                    tracing::info!("agent: cluster leadership acquired");
                } else {
                    let Some((stop, handle)) = leader_loop.take() else {
                        tracing::error!("agent: attempted to stop the leader loop while not running");
                        continue;
                    };
                    tracing::debug!("agent: shutting down leader loop");
                    stop.cancel();
                    let _ = handle.await;
                    tracing::info!("agent: cluster leadership lost");
                }
            }
        }
    }
}

/// Runs while this node is the leader: establish (barrier + scheduler),
/// then reconcile the voter set periodically and on member events.
async fn run_leader_loop(agent: Arc<Agent>, stop: CancellationToken) {
    let raft = agent.raft.clone().expect("leader loop requires consensus");
    let mut reconcile_rx = agent.take_reconcile_rx();
    let mut established = false;

    'reconcile: loop {
        // Ensure the local FSM has everything committed before acting on
        // the state.
        if let Err(e) = raft.barrier(BARRIER_TIMEOUT).await {
            tracing::error!(error = %e, "agent: failed to wait for barrier");
            if wait_or_stopped(&stop, Duration::from_secs(5)).await {
                break 'reconcile;
            }
            continue 'reconcile;
        }

        if !established {
            match establish_leadership(&agent).await {
                Ok(()) => established = true,
                Err(e) => {
                    tracing::error!(error = %e, "agent: failed to establish leadership");
                    revoke_leadership(&agent).await;

                    // Try to hand leadership to a healthier peer; if nobody
                    // takes it, retry after a pause.
                    match leadership_transfer(&agent).await {
                        Ok(()) => break 'reconcile,
                        Err(e) => {
                            tracing::error!(error = %e, "agent: failed to transfer leadership");
                            if wait_or_stopped(&stop, Duration::from_secs(5)).await {
                                break 'reconcile;
                            }
                            continue 'reconcile;
                        }
                    }
                }
            }
        }

        if let Err(e) = reconcile(&agent).await {
            tracing::error!(error = %e, "agent: failed to reconcile");
        }

        let mut interval = tokio::time::interval(agent.config.reconcile_interval);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = stop.cancelled() => break 'reconcile,
                _ = interval.tick() => continue 'reconcile,
                member = recv_member(&mut reconcile_rx) => {
                    if let Some(member) = member {
                        if let Err(e) = reconcile_member(&agent, &member).await {
                            tracing::error!(member = %member.name, error = %e, "agent: failed to reconcile member");
                        }
                    }
                }
            }
        }
    }

    if established {
        revoke_leadership(&agent).await;
    }
    // Hand the event stream back for the next term of leadership.
    if let Some(rx) = reconcile_rx {
        agent.put_back_reconcile_rx(rx);
    }
}

async fn recv_member(rx: &mut Option<mpsc::Receiver<Member>>) -> Option<Member> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn wait_or_stopped(stop: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        _ = stop.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

/// Load every stored job and start the scheduler.
async fn establish_leadership(agent: &Arc<Agent>) -> crate::error::Result<()> {
    tracing::info!("agent: Starting scheduler");
    let jobs = agent.store.get_jobs(None)?;
    agent.scheduler().start(jobs)?;
    Ok(())
}

/// Stop the scheduler; running jobs proceed, no new triggers fire.
async fn revoke_leadership(agent: &Arc<Agent>) {
    agent.scheduler().stop().await;
}

async fn leadership_transfer(agent: &Arc<Agent>) -> crate::error::Result<()> {
    let raft = agent.raft.clone().expect("leader loop requires consensus");
    const RETRY_LIMIT: usize = 3;
    let mut last = None;
    for attempt in 0..RETRY_LIMIT {
        match raft.leadership_transfer(None).await {
            Ok(target) => {
                agent.scheduler().stop().await;
                tracing::info!(target = %target, "agent: successfully transferred leadership");
                return Ok(());
            }
            Err(e) => {
                tracing::error!(
                    attempt,
                    retry_limit = RETRY_LIMIT,
                    error = %e,
                    "failed to transfer leadership attempt, will retry"
                );
                last = Some(e);
            }
        }
    }
    Err(crate::error::CronmeshError::Internal(format!(
        "failed to transfer leadership in {RETRY_LIMIT} attempts: {last:?}"
    )))
}

/// Reconcile every known member against the voter set.
async fn reconcile(agent: &Arc<Agent>) -> crate::error::Result<()> {
    for member in agent.members() {
        reconcile_member(agent, &member).await?;
    }
    Ok(())
}

/// Mirror one gossip member into the consensus configuration: alive peer
/// servers in our region become voters, departed ones are removed.
async fn reconcile_member(agent: &Arc<Agent>, member: &Member) -> crate::error::Result<()> {
    let Some(parts) = is_server(member) else {
        return Ok(());
    };
    if parts.region != agent.config.region {
        return Ok(());
    }

    match member.status {
        MemberStatus::Alive => add_raft_peer(agent, member).await,
        MemberStatus::Left | MemberStatus::Reap => remove_raft_peer(agent, member).await,
        _ => Ok(()),
    }
}

async fn add_raft_peer(agent: &Arc<Agent>, member: &Member) -> crate::error::Result<()> {
    let raft = agent.raft.clone().expect("leader loop requires consensus");
    let parts = is_server(member).expect("caller checked is_server");

    // Refuse to wire up a cluster where two nodes both claim to be the
    // bootstrap seed; that is operator error.
    if parts.bootstrap {
        for other in agent.members() {
            if other.name == member.name {
                continue;
            }
            if let Some(other_parts) = is_server(&other) {
                if other_parts.bootstrap {
                    tracing::error!(
                        "agent: '{}' and '{}' are both in bootstrap mode. Only one node should be in bootstrap mode, not adding Raft peer.",
                        member.name,
                        other.name
                    );
                    return Ok(());
                }
            }
        }
    }

    let configuration = raft.get_configuration().await;

    // No-op when the server is already a voter with this address; remove a
    // stale entry sharing the address first otherwise.
    for server in &configuration {
        if server.id == parts.id || server.addr == parts.rpc_addr {
            if server.id == parts.id && server.addr == parts.rpc_addr {
                return Ok(());
            }
            if server.addr == parts.rpc_addr && server.id != parts.id {
                raft.remove_server(&server.id, RAFT_TIMEOUT).await?;
                tracing::info!(server = %server.addr, "agent: removed server with duplicate address");
            }
        }
    }

    raft.add_voter(&parts.id, &parts.rpc_addr, RAFT_TIMEOUT)
        .await?;
    tracing::info!(peer = %parts.id, addr = %parts.rpc_addr, "agent: added raft peer");
    Ok(())
}

async fn remove_raft_peer(agent: &Arc<Agent>, member: &Member) -> crate::error::Result<()> {
    // Never remove ourselves here; a follower deregisters a departing
    // leader after take-over.
    if member.name.eq_ignore_ascii_case(&agent.config.node_name) {
        tracing::warn!(name = %agent.config.node_name, "removing self should be done by follower");
        return Ok(());
    }

    let raft = agent.raft.clone().expect("leader loop requires consensus");
    let parts = is_server(member).expect("caller checked is_server");

    let configuration = raft.get_configuration().await;
    if configuration.iter().any(|s| s.id == parts.id) {
        tracing::info!(server = %parts.id, "agent: removing server by ID");
        raft.remove_server(&parts.id, RAFT_TIMEOUT).await?;
    }
    Ok(())
}
