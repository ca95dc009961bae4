//! Worker-side execution service: receives AgentRun, invokes the executor
//! plugin and streams the evolving execution back to the dispatcher.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::agent::Agent;
use crate::error::BROKEN_STREAM_SENTINEL;
use crate::execution::Execution;
use crate::plugins::{PluginError, StatusHelper};
use crate::proto;
use crate::proto::agent_server::Agent as GrpcAgent;
use crate::timeutil::to_timestamp;

/// Output retained per execution; older bytes fall off the front.
const MAX_BUF_SIZE: usize = 256_000;

/// A fixed-capacity byte buffer keeping the most recent writes.
pub struct CircularBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl CircularBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::new(),
            capacity,
        }
    }

    pub fn write(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        if self.data.len() > self.capacity {
            let excess = self.data.len() - self.capacity;
            self.data.drain(..excess);
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

pub struct AgentService {
    agent: Arc<Agent>,
}

impl AgentService {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }
}

/// Forwards executor progress callbacks as partial execution frames.
struct StreamStatusHelper {
    execution: Mutex<proto::Execution>,
    tx: mpsc::Sender<Result<proto::AgentRunStream, Status>>,
}

#[async_trait]
impl StatusHelper for StreamStatusHelper {
    async fn update(&self, output: Vec<u8>, _error: bool) -> Result<i64, PluginError> {
        let execution = {
            let mut guard = self.execution.lock().unwrap();
            guard.output = output;
            guard.clone()
        };
        self.tx
            .send(Ok(proto::AgentRunStream {
                execution: Some(execution),
            }))
            .await
            .map_err(|_| PluginError::Execution("status stream closed".to_string()))?;
        Ok(0)
    }
}

#[tonic::async_trait]
impl GrpcAgent for AgentService {
    type AgentRunStream = ReceiverStream<Result<proto::AgentRunStream, Status>>;

    async fn agent_run(
        &self,
        request: Request<proto::AgentRunRequest>,
    ) -> Result<Response<Self::AgentRunStream>, Status> {
        let req = request.into_inner();
        let job = req
            .job
            .ok_or_else(|| Status::invalid_argument("missing job"))?;
        let execution = req
            .execution
            .ok_or_else(|| Status::invalid_argument("missing execution"))?;

        let (tx, rx) = mpsc::channel(16);
        let agent = self.agent.clone();
        tokio::spawn(async move {
            run_execution(agent, job, execution, tx).await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}

async fn run_execution(
    agent: Arc<Agent>,
    job: proto::Job,
    mut execution: proto::Execution,
    tx: mpsc::Sender<Result<proto::AgentRunStream, Status>>,
) {
    tracing::info!(job = %job.name, "grpc_agent: Starting job");

    let mut output = CircularBuffer::new(MAX_BUF_SIZE);

    // The initial frame seeds the replicated SetExecution on the leader.
    execution.started_at = Some(to_timestamp(Utc::now()));
    execution.node_name = agent.config.node_name.clone();
    if tx
        .send(Ok(proto::AgentRunStream {
            execution: Some(execution.clone()),
        }))
        .await
        .is_err()
    {
        return;
    }

    if job.executor.is_empty() {
        let _ = tx
            .send(Err(Status::failed_precondition(
                "grpc_agent: No executor defined, nothing to do",
            )))
            .await;
        return;
    }

    let mut success = false;
    match agent.plugins.executors.get(&job.executor) {
        Some(executor) => {
            tracing::debug!(plugin = %job.executor, "grpc_agent: calling executor plugin");

            let group_id = Execution::from_proto(&execution).group_id();
            agent
                .running_executions
                .lock()
                .unwrap()
                .insert(group_id.clone(), execution.clone());

            let helper = Arc::new(StreamStatusHelper {
                execution: Mutex::new(execution.clone()),
                tx: tx.clone(),
            });
            let request = proto::ExecuteRequest {
                job_name: job.name.clone(),
                config: job.executor_config.clone(),
                status_server: 0,
            };
            let result = executor.execute(request, helper).await;

            let flattened = match result {
                Ok(out) if !out.error.is_empty() => Err((Some(out.output), out.error)),
                Ok(out) => Ok(out.output),
                Err(e) => Err((None, e.to_string())),
            };
            match flattened {
                Ok(out) => {
                    success = true;
                    output.write(&out);
                }
                Err((out, error)) => {
                    tracing::error!(job = %job.name, error = %error, "grpc_agent: command error output");
                    output.write(error.as_bytes());
                    output.write(b"\n");
                    if let Some(out) = out {
                        output.write(&out);
                    }
                }
            }

            agent.running_executions.lock().unwrap().remove(&group_id);
        }
        None => {
            tracing::error!(executor = %job.executor, "grpc_agent: Specified executor is not present");
            output.write(b"grpc_agent: Specified executor is not present");
        }
    }

    execution.finished_at = Some(to_timestamp(Utc::now()));
    execution.success = success;
    execution.output = output.bytes().to_vec();

    // If the final frame can't be delivered the dispatcher is gone; fall
    // back to reporting straight to a server, marked so it won't retry.
    if tx
        .send(Ok(proto::AgentRunStream {
            execution: Some(execution.clone()),
        }))
        .await
        .is_err()
    {
        tracing::error!(
            job = %job.name,
            "grpc_agent: error sending the final execution, falling back to ExecutionDone"
        );

        let mut fallback = Execution::from_proto(&execution);
        let mut marked = BROKEN_STREAM_SENTINEL.as_bytes().to_vec();
        marked.extend_from_slice(b": ");
        marked.extend_from_slice(&fallback.output);
        fallback.output = marked;

        match agent.check_and_select_server().await {
            Ok(server) => {
                if let Err(e) = agent.client.execution_done(&server, &fallback).await {
                    tracing::error!(error = %e, "grpc_agent: fallback ExecutionDone failed");
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "grpc_agent: no server reachable for fallback");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_circular_buffer_keeps_tail() {
        let mut buf = CircularBuffer::new(8);
        buf.write(b"abcd");
        assert_eq!(buf.bytes(), b"abcd");
        buf.write(b"efgh");
        assert_eq!(buf.bytes(), b"abcdefgh");
        buf.write(b"XY");
        // Oldest bytes are truncated from the front.
        assert_eq!(buf.bytes(), b"cdefghXY");
    }

    #[test]
    fn test_circular_buffer_large_write() {
        let mut buf = CircularBuffer::new(4);
        buf.write(b"0123456789");
        assert_eq!(buf.bytes(), b"6789");
    }
}
