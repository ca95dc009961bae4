//! Executor plugin contract and the host-side client.
//!
//! The host calls `Execute` on the plugin's channel; the request carries
//! the loopback port of a short-lived host-side `StatusHelper` server the
//! plugin dials back to stream partial output while it runs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

use crate::plugins::{PluginError, PluginProcess};
use crate::proto;
use crate::proto::executor_client::ExecutorClient as GrpcExecutorClient;
use crate::proto::status_helper_server::{StatusHelper as GrpcStatusHelper, StatusHelperServer};

/// Callback channel plugins use to stream progress while executing.
#[async_trait]
pub trait StatusHelper: Send + Sync {
    async fn update(&self, output: Vec<u8>, error: bool) -> Result<i64, PluginError>;
}

/// An executor performs the actual work of a job.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: proto::ExecuteRequest,
        status: Arc<dyn StatusHelper>,
    ) -> Result<proto::ExecuteResponse, PluginError>;
}

/// Host-side client talking to an out-of-process executor.
pub struct ExecutorClient {
    process: Arc<PluginProcess>,
}

impl ExecutorClient {
    pub fn new(process: Arc<PluginProcess>) -> Self {
        Self { process }
    }
}

#[async_trait]
impl Executor for ExecutorClient {
    async fn execute(
        &self,
        mut request: proto::ExecuteRequest,
        status: Arc<dyn StatusHelper>,
    ) -> Result<proto::ExecuteResponse, PluginError> {
        let channel = self.process.channel().await?;

        // Serve the status callback on an ephemeral loopback port for the
        // duration of this execution.
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let done = CancellationToken::new();
        let server_done = done.clone();
        let bridge = StatusHelperBridge { status };
        tokio::spawn(async move {
            let result = Server::builder()
                .add_service(StatusHelperServer::new(bridge))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    server_done.cancelled(),
                )
                .await;
            if let Err(e) = result {
                tracing::warn!(error = %e, "plugin: status helper server failed");
            }
        });

        request.status_server = port as u32;
        let result = GrpcExecutorClient::new(channel)
            .execute(Request::new(request))
            .await;
        done.cancel();

        Ok(result?.into_inner())
    }
}

struct StatusHelperBridge {
    status: Arc<dyn StatusHelper>,
}

#[tonic::async_trait]
impl GrpcStatusHelper for StatusHelperBridge {
    async fn update(
        &self,
        request: Request<proto::StatusUpdateRequest>,
    ) -> Result<Response<proto::StatusUpdateResponse>, Status> {
        let req = request.into_inner();
        let r = self
            .status
            .update(req.output, req.error)
            .await
            .map_err(|e| Status::internal(e.to_string()))?;
        Ok(Response::new(proto::StatusUpdateResponse { r }))
    }
}

/// Plugin-side client for the host's status helper channel.
pub struct RemoteStatusHelper {
    addr: String,
}

impl RemoteStatusHelper {
    pub fn new(port: u32) -> Self {
        Self {
            addr: format!("http://127.0.0.1:{port}"),
        }
    }
}

#[async_trait]
impl StatusHelper for RemoteStatusHelper {
    async fn update(&self, output: Vec<u8>, error: bool) -> Result<i64, PluginError> {
        let mut client =
            crate::proto::status_helper_client::StatusHelperClient::connect(self.addr.clone())
                .await?;
        let resp = client
            .update(proto::StatusUpdateRequest { output, error })
            .await?;
        Ok(resp.into_inner().r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingHelper {
        updates: Mutex<Vec<(Vec<u8>, bool)>>,
    }

    #[async_trait]
    impl StatusHelper for RecordingHelper {
        async fn update(&self, output: Vec<u8>, error: bool) -> Result<i64, PluginError> {
            self.updates.lock().unwrap().push((output, error));
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_status_helper_bridge_roundtrip() {
        let helper = Arc::new(RecordingHelper {
            updates: Mutex::new(Vec::new()),
        });
        let bridge = StatusHelperBridge {
            status: helper.clone(),
        };

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let done = CancellationToken::new();
        let server_done = done.clone();
        tokio::spawn(async move {
            let _ = Server::builder()
                .add_service(StatusHelperServer::new(bridge))
                .serve_with_incoming_shutdown(
                    TcpListenerStream::new(listener),
                    server_done.cancelled(),
                )
                .await;
        });

        let remote = RemoteStatusHelper::new(port as u32);
        remote.update(b"progress".to_vec(), false).await.unwrap();
        remote.update(b"oops".to_vec(), true).await.unwrap();
        done.cancel();

        let updates = helper.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0], (b"progress".to_vec(), false));
        assert_eq!(updates[1], (b"oops".to_vec(), true));
    }
}
