//! Processor plugin contract: transforms a finished execution before it is
//! replicated, e.g. moving bulky output into a file and leaving a path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::plugins::{PluginError, PluginProcess};
use crate::proto;
use crate::proto::processor_client::ProcessorClient as GrpcProcessorClient;

#[async_trait]
pub trait Processor: Send + Sync {
    /// Transform the execution. Implementations should return the input
    /// unchanged when they have nothing to do.
    async fn process(
        &self,
        execution: proto::Execution,
        config: HashMap<String, String>,
    ) -> Result<proto::Execution, PluginError>;
}

/// Host-side client talking to an out-of-process processor.
pub struct ProcessorClient {
    process: Arc<PluginProcess>,
}

impl ProcessorClient {
    pub fn new(process: Arc<PluginProcess>) -> Self {
        Self { process }
    }
}

#[async_trait]
impl Processor for ProcessorClient {
    async fn process(
        &self,
        execution: proto::Execution,
        config: HashMap<String, String>,
    ) -> Result<proto::Execution, PluginError> {
        let channel = self.process.channel().await?;
        let response = GrpcProcessorClient::new(channel)
            .process(proto::ProcessRequest {
                execution: Some(execution),
                config,
            })
            .await?;
        Ok(response.into_inner())
    }
}
