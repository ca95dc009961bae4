//! Plugin-side serving: what a plugin binary (or the host re-invoked for
//! an embedded executor) runs to speak the plugin protocol.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::plugins::executor::{Executor, RemoteStatusHelper};
use crate::plugins::processor::Processor;
use crate::plugins::{launched_by_host, PluginError, PROTOCOL_VERSION};
use crate::proto;
use crate::proto::executor_server::{Executor as GrpcExecutor, ExecutorServer};
use crate::proto::processor_server::{Processor as GrpcProcessor, ProcessorServer};

/// Serve an executor implementation over the plugin protocol. Blocks until
/// the host disconnects or the process is killed.
pub async fn serve_executor(executor: Arc<dyn Executor>) -> Result<(), PluginError> {
    let listener = bind_and_handshake().await?;
    Server::builder()
        .add_service(ExecutorServer::new(ExecutorBridge { executor }))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await?;
    Ok(())
}

/// Serve a processor implementation over the plugin protocol.
pub async fn serve_processor(processor: Arc<dyn Processor>) -> Result<(), PluginError> {
    let listener = bind_and_handshake().await?;
    Server::builder()
        .add_service(ProcessorServer::new(ProcessorBridge { processor }))
        .serve_with_incoming(TcpListenerStream::new(listener))
        .await?;
    Ok(())
}

async fn bind_and_handshake() -> Result<TcpListener, PluginError> {
    if !launched_by_host() {
        eprintln!("This binary is a cronmesh plugin and must be launched by the cronmesh agent");
        return Err(PluginError::BadCookie);
    }

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    // The handshake line is the only thing the host reads from stdout.
    println!("1|{PROTOCOL_VERSION}|tcp|{addr}|grpc");
    Ok(listener)
}

struct ExecutorBridge {
    executor: Arc<dyn Executor>,
}

#[tonic::async_trait]
impl GrpcExecutor for ExecutorBridge {
    async fn execute(
        &self,
        request: Request<proto::ExecuteRequest>,
    ) -> Result<Response<proto::ExecuteResponse>, Status> {
        let req = request.into_inner();
        let status_helper = Arc::new(RemoteStatusHelper::new(req.status_server));
        match self.executor.execute(req, status_helper).await {
            Ok(response) => Ok(Response::new(response)),
            Err(e) => Ok(Response::new(proto::ExecuteResponse {
                output: Vec::new(),
                error: e.to_string(),
            })),
        }
    }
}

struct ProcessorBridge {
    processor: Arc<dyn Processor>,
}

#[tonic::async_trait]
impl GrpcProcessor for ProcessorBridge {
    async fn process(
        &self,
        request: Request<proto::ProcessRequest>,
    ) -> Result<Response<proto::Execution>, Status> {
        let req = request.into_inner();
        let execution = req.execution.unwrap_or_default();
        let config: HashMap<String, String> = req.config;
        match self.processor.process(execution.clone(), config).await {
            Ok(transformed) => Ok(Response::new(transformed)),
            Err(e) => {
                tracing::error!(error = %e, "plugin: processor failed, passing execution through");
                Ok(Response::new(execution))
            }
        }
    }
}
