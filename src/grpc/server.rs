//! Control-plane service implementation and the consensus transport
//! service.

use std::sync::Arc;

use tonic::{Request, Response, Status};

use crate::agent::dispatch::DoneOutcome;
use crate::agent::server_parts::is_server;
use crate::agent::Agent;
use crate::error::CronmeshError;
use crate::execution::Execution;
use crate::fsm::{self, MessageType};
use crate::proto;
use crate::proto::cronmesh_server::Cronmesh;
use crate::proto::raft_server::Raft;

pub struct CronmeshService {
    agent: Arc<Agent>,
}

impl CronmeshService {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    /// The leader's RPC address, for forwarding linearizable operations.
    async fn leader_or_fail(&self) -> Result<String, Status> {
        self.agent
            .leader_addr()
            .await
            .ok_or_else(|| Status::failed_precondition("no known leader, retry later"))
    }
}

fn to_status(e: CronmeshError) -> Status {
    match &e {
        CronmeshError::NotLeader => Status::failed_precondition(e.to_string()),
        CronmeshError::Store(crate::store::StoreError::NotFound) => {
            Status::not_found(e.to_string())
        }
        CronmeshError::Store(crate::store::StoreError::DependentJobs) => {
            Status::failed_precondition(e.to_string())
        }
        CronmeshError::Job(_) => Status::invalid_argument(e.to_string()),
        _ => Status::internal(e.to_string()),
    }
}

#[tonic::async_trait]
impl Cronmesh for CronmeshService {
    async fn set_job(
        &self,
        request: Request<proto::SetJobRequest>,
    ) -> Result<Response<proto::SetJobResponse>, Status> {
        let job = request
            .into_inner()
            .job
            .ok_or_else(|| Status::invalid_argument("missing job"))?;

        tracing::debug!(job = %job.name, "grpc: Received SetJob");

        if !self.agent.is_leader().await {
            let addr = self.leader_or_fail().await?;
            self.agent
                .client
                .set_job(&addr, &crate::job::Job::from_proto(&job))
                .await
                .map_err(to_status)?;
            return Ok(Response::new(proto::SetJobResponse { job: Some(job) }));
        }

        let stored = self.agent.set_job(&job).await.map_err(to_status)?;
        Ok(Response::new(proto::SetJobResponse {
            job: Some(stored.to_proto()),
        }))
    }

    async fn delete_job(
        &self,
        request: Request<proto::DeleteJobRequest>,
    ) -> Result<Response<proto::DeleteJobResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(job = %req.job_name, "grpc: Received DeleteJob");

        if !self.agent.is_leader().await {
            let addr = self.leader_or_fail().await?;
            let job = self
                .agent
                .client
                .delete_job(&addr, &req.job_name)
                .await
                .map_err(to_status)?;
            return Ok(Response::new(proto::DeleteJobResponse {
                job: Some(job.to_proto()),
            }));
        }

        let job = self.agent.delete_job(&req.job_name).await.map_err(to_status)?;
        Ok(Response::new(proto::DeleteJobResponse {
            job: Some(job.to_proto()),
        }))
    }

    async fn get_job(
        &self,
        request: Request<proto::GetJobRequest>,
    ) -> Result<Response<proto::GetJobResponse>, Status> {
        let req = request.into_inner();
        tracing::debug!(job = %req.job_name, "grpc: Received GetJob");

        let job = self
            .agent
            .store
            .get_job(&req.job_name)
            .map_err(|e| to_status(e.into()))?;
        Ok(Response::new(proto::GetJobResponse {
            job: Some(job.to_proto()),
        }))
    }

    async fn run_job(
        &self,
        request: Request<proto::RunJobRequest>,
    ) -> Result<Response<proto::RunJobResponse>, Status> {
        let req = request.into_inner();

        if !self.agent.is_leader().await {
            let addr = self.leader_or_fail().await?;
            let job = self
                .agent
                .client
                .run_job(&addr, &req.job_name)
                .await
                .map_err(to_status)?;
            return Ok(Response::new(proto::RunJobResponse {
                job: Some(job.to_proto()),
            }));
        }

        let execution = Execution::new(&req.job_name);
        let job = self
            .agent
            .run_agent(&req.job_name, execution)
            .await
            .map_err(to_status)?;
        Ok(Response::new(proto::RunJobResponse {
            job: Some(job.to_proto()),
        }))
    }

    async fn execution_done(
        &self,
        request: Request<proto::ExecutionDoneRequest>,
    ) -> Result<Response<proto::ExecutionDoneResponse>, Status> {
        let execution = request
            .into_inner()
            .execution
            .ok_or_else(|| Status::invalid_argument("missing execution"))?;

        let outcome = self
            .agent
            .execution_done_flow(Execution::from_proto(&execution))
            .await
            .map_err(to_status)?;

        Ok(Response::new(proto::ExecutionDoneResponse {
            from: self.agent.config.node_name.clone(),
            payload: outcome.payload().to_vec(),
        }))
    }

    async fn set_execution(
        &self,
        request: Request<proto::Execution>,
    ) -> Result<Response<()>, Status> {
        let execution = request.into_inner();
        tracing::debug!(
            execution = %Execution::from_proto(&execution).key(),
            "grpc: Received SetExecution"
        );

        if !self.agent.is_leader().await {
            let addr = self.leader_or_fail().await?;
            self.agent
                .client
                .set_execution(&addr, &execution)
                .await
                .map_err(to_status)?;
            return Ok(Response::new(()));
        }

        self.agent
            .raft_apply(fsm::encode(MessageType::SetExecution, &execution))
            .await
            .map_err(to_status)?;
        Ok(Response::new(()))
    }

    async fn leave(&self, _request: Request<()>) -> Result<Response<()>, Status> {
        let agent = self.agent.clone();
        tokio::spawn(async move {
            if let Err(e) = agent.stop().await {
                tracing::error!(error = %e, "agent: error during leave");
            }
        });
        Ok(Response::new(()))
    }

    async fn raft_get_configuration(
        &self,
        _request: Request<()>,
    ) -> Result<Response<proto::RaftGetConfigurationResponse>, Status> {
        let raft = self
            .agent
            .raft
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("not a server"))?;

        // Map voter addresses back to gossip members for their names.
        let mut server_map = std::collections::HashMap::new();
        for member in self.agent.members() {
            if let Some(parts) = is_server(&member) {
                server_map.insert(parts.rpc_addr.clone(), member.name.clone());
            }
        }

        let leader = raft.leader_addr().await;
        let servers = raft
            .get_configuration()
            .await
            .into_iter()
            .map(|peer| proto::RaftServer {
                node: server_map
                    .get(&peer.addr)
                    .cloned()
                    .unwrap_or_else(|| "(unknown)".to_string()),
                leader: Some(peer.addr.clone()) == leader,
                voter: true,
                id: peer.id,
                address: peer.addr,
            })
            .collect();

        Ok(Response::new(proto::RaftGetConfigurationResponse {
            servers,
            index: 0,
        }))
    }

    async fn raft_remove_peer_by_id(
        &self,
        request: Request<proto::RaftRemovePeerByIdRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        let raft = self
            .agent
            .raft
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("not a server"))?;

        // This is an operation for humans; an unknown id is most likely a
        // typo, so refuse it instead of silently succeeding.
        let configuration = raft.get_configuration().await;
        if !configuration.iter().any(|s| s.id == req.id) {
            return Err(Status::not_found(format!(
                "id {:?} was not found in the Raft configuration",
                req.id
            )));
        }

        raft.remove_server(&req.id, crate::agent::RAFT_TIMEOUT)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        tracing::warn!(peer = %req.id, "removed Raft peer");
        Ok(Response::new(()))
    }

    async fn get_active_executions(
        &self,
        _request: Request<()>,
    ) -> Result<Response<proto::GetActiveExecutionsResponse>, Status> {
        let executions = self
            .agent
            .active_executions
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        Ok(Response::new(proto::GetActiveExecutionsResponse {
            executions,
        }))
    }
}

/// Consensus RPCs, delegated to the raft node.
pub struct RaftService {
    agent: Arc<Agent>,
}

impl RaftService {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    fn raft(&self) -> Result<&Arc<crate::raft::RaftNode>, Status> {
        self.agent
            .raft
            .as_ref()
            .ok_or_else(|| Status::failed_precondition("not a server"))
    }
}

#[tonic::async_trait]
impl Raft for RaftService {
    async fn append_entries(
        &self,
        request: Request<proto::AppendEntriesRequest>,
    ) -> Result<Response<proto::AppendEntriesResponse>, Status> {
        let raft = self.raft()?;
        Ok(Response::new(
            raft.handle_append_entries(request.into_inner()).await,
        ))
    }

    async fn request_vote(
        &self,
        request: Request<proto::VoteRequest>,
    ) -> Result<Response<proto::VoteResponse>, Status> {
        let raft = self.raft()?;
        Ok(Response::new(
            raft.handle_vote_request(request.into_inner()).await,
        ))
    }

    async fn timeout_now(
        &self,
        request: Request<proto::TimeoutNowRequest>,
    ) -> Result<Response<proto::TimeoutNowResponse>, Status> {
        let raft = self.raft()?;
        Ok(Response::new(
            raft.handle_timeout_now(request.into_inner()).await,
        ))
    }

    async fn install_snapshot(
        &self,
        request: Request<proto::InstallSnapshotRequest>,
    ) -> Result<Response<proto::InstallSnapshotResponse>, Status> {
        let raft = self.raft()?;
        Ok(Response::new(
            raft.handle_install_snapshot(request.into_inner()).await,
        ))
    }
}

// Outcome payloads are part of the wire contract.
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_done_outcome_payloads() {
        assert_eq!(DoneOutcome::Retry.payload(), b"retry");
        assert_eq!(DoneOutcome::Deleted.payload(), b"deleted");
        assert_eq!(DoneOutcome::Saved.payload(), b"saved");
    }
}
