//! The agent's RPC surface.
//!
//! One TCP listener carries every service: control-plane unary calls,
//! the worker execution stream and the consensus transport, demultiplexed
//! by gRPC service path. With TLS configured the same listener terminates
//! mTLS for all of them.

pub mod agent_server;
pub mod client;
pub mod server;

pub use client::GrpcClient;

use std::sync::Arc;

use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::agent::Agent;
use crate::error::Result;
use crate::proto::agent_server::AgentServer;
use crate::proto::cronmesh_server::CronmeshServer;
use crate::proto::raft_server::RaftServer;

/// Bind the shared listener and serve every RPC service until the agent
/// shuts down.
pub async fn serve(agent: Arc<Agent>) -> Result<()> {
    let addr = agent.config.bind_rpc_addr();
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "grpc: Starting RPC server");

    let mut builder = Server::builder();
    if agent.config.tls.is_complete() {
        let identity = crate::tls::TlsIdentity::load(&agent.config.tls).await?;
        builder = builder.tls_config(identity.server_tls_config())?;
    }

    let mut router = builder
        .add_service(CronmeshServer::new(server::CronmeshService::new(
            agent.clone(),
        )))
        .add_service(AgentServer::new(agent_server::AgentService::new(
            agent.clone(),
        )));
    if agent.raft.is_some() {
        router = router.add_service(RaftServer::new(server::RaftService::new(agent.clone())));
    }

    let shutdown = agent.shutdown_token();
    tokio::spawn(async move {
        let result = router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown.cancelled())
            .await;
        if let Err(e) = result {
            tracing::error!(error = %e, "grpc: RPC server failed");
        }
    });

    Ok(())
}
