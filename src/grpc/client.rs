//! Typed client wrappers for the agent-to-agent control services.

use std::time::Duration;

use tonic::transport::{Channel, ClientTlsConfig, Endpoint};

use crate::error::{CronmeshError, Result};
use crate::execution::Execution;
use crate::job::Job;
use crate::proto;
use crate::proto::agent_client::AgentClient;
use crate::proto::cronmesh_client::CronmeshClient;

#[derive(Clone, Default)]
pub struct GrpcClient {
    tls: Option<ClientTlsConfig>,
}

impl GrpcClient {
    pub fn new(tls: Option<ClientTlsConfig>) -> Self {
        Self { tls }
    }

    async fn channel(&self, addr: &str) -> Result<Channel> {
        let scheme = if self.tls.is_some() { "https" } else { "http" };
        let endpoint = Endpoint::from_shared(format!("{scheme}://{addr}"))
            .map_err(CronmeshError::Transport)?
            .connect_timeout(Duration::from_secs(10));
        let endpoint = match &self.tls {
            Some(tls) => endpoint
                .tls_config(tls.clone())
                .map_err(CronmeshError::Transport)?,
            None => endpoint,
        };
        Ok(endpoint.connect().await?)
    }

    pub async fn connect(&self, addr: &str) -> Result<CronmeshClient<Channel>> {
        Ok(CronmeshClient::new(self.channel(addr).await?))
    }

    pub async fn connect_agent(&self, addr: &str) -> Result<AgentClient<Channel>> {
        Ok(AgentClient::new(self.channel(addr).await?))
    }

    pub async fn set_job(&self, addr: &str, job: &Job) -> Result<()> {
        let mut client = self.connect(addr).await?;
        client
            .set_job(proto::SetJobRequest {
                job: Some(job.to_proto()),
            })
            .await?;
        Ok(())
    }

    pub async fn delete_job(&self, addr: &str, job_name: &str) -> Result<Job> {
        let mut client = self.connect(addr).await?;
        let response = client
            .delete_job(proto::DeleteJobRequest {
                job_name: job_name.to_string(),
            })
            .await?
            .into_inner();
        let job = response
            .job
            .ok_or_else(|| CronmeshError::Internal("empty DeleteJob response".to_string()))?;
        Ok(Job::from_proto(&job))
    }

    pub async fn get_job(&self, addr: &str, job_name: &str) -> Result<Job> {
        let mut client = self.connect(addr).await?;
        let response = client
            .get_job(proto::GetJobRequest {
                job_name: job_name.to_string(),
            })
            .await?
            .into_inner();
        let job = response
            .job
            .ok_or_else(|| CronmeshError::Internal("empty GetJob response".to_string()))?;
        Ok(Job::from_proto(&job))
    }

    pub async fn run_job(&self, addr: &str, job_name: &str) -> Result<Job> {
        let mut client = self.connect(addr).await?;
        let response = client
            .run_job(proto::RunJobRequest {
                job_name: job_name.to_string(),
            })
            .await?
            .into_inner();
        let job = response
            .job
            .ok_or_else(|| CronmeshError::Internal("empty RunJob response".to_string()))?;
        Ok(Job::from_proto(&job))
    }

    /// Report a finished execution. A not-leader answer means the receiver
    /// forwarded it for us, which counts as delivered.
    pub async fn execution_done(&self, addr: &str, execution: &Execution) -> Result<()> {
        let mut client = self.connect(addr).await?;
        let result = client
            .execution_done(proto::ExecutionDoneRequest {
                execution: Some(execution.to_proto()),
            })
            .await;

        match result {
            Ok(response) => {
                let response = response.into_inner();
                tracing::debug!(
                    from = %response.from,
                    payload = %String::from_utf8_lossy(&response.payload),
                    "grpc: ExecutionDone response"
                );
                Ok(())
            }
            Err(status) if status.message().contains("not leader") => {
                tracing::info!("grpc: ExecutionDone forwarded to the leader");
                Ok(())
            }
            Err(status) => Err(status.into()),
        }
    }

    pub async fn set_execution(&self, addr: &str, execution: &proto::Execution) -> Result<()> {
        let mut client = self.connect(addr).await?;
        client.set_execution(execution.clone()).await?;
        Ok(())
    }

    pub async fn leave(&self, addr: &str) -> Result<()> {
        let mut client = self.connect(addr).await?;
        client.leave(()).await?;
        Ok(())
    }

    pub async fn raft_get_configuration(
        &self,
        addr: &str,
    ) -> Result<proto::RaftGetConfigurationResponse> {
        let mut client = self.connect(addr).await?;
        Ok(client.raft_get_configuration(()).await?.into_inner())
    }

    pub async fn raft_remove_peer_by_id(&self, addr: &str, peer_id: &str) -> Result<()> {
        let mut client = self.connect(addr).await?;
        client
            .raft_remove_peer_by_id(proto::RaftRemovePeerByIdRequest {
                id: peer_id.to_string(),
            })
            .await?;
        Ok(())
    }

    pub async fn get_active_executions(&self, addr: &str) -> Result<Vec<proto::Execution>> {
        let mut client = self.connect(addr).await?;
        Ok(client
            .get_active_executions(())
            .await?
            .into_inner()
            .executions)
    }
}
