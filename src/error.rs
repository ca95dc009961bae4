use thiserror::Error;

#[derive(Error, Debug)]
pub enum CronmeshError {
    #[error("server is not leader, this operation should be run on the leader")]
    NotLeader,

    #[error("no member leader found in member list")]
    LeaderNotFound,

    #[error("no suitable server found to send the request, aborting")]
    NoSuitableServer,

    #[error("no target nodes found to run job {0}")]
    NoTargetNodes(String),

    #[error("retry node is gone: {node} for job {job}")]
    RetryNodeGone { node: String, job: String },

    #[error("specified executor is not present")]
    ExecutorNotPresent,

    #[error(transparent)]
    Job(#[from] crate::job::JobError),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Raft(#[from] crate::raft::RaftError),

    #[error(transparent)]
    Scheduler(#[from] crate::sched::SchedulerError),

    #[error(transparent)]
    Gossip(#[from] crate::gossip::GossipError),

    #[error(transparent)]
    Plugin(#[from] crate::plugins::PluginError),

    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),

    #[error("grpc error: {0}")]
    Grpc(#[from] tonic::Status),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

/// The sentinel prefixed to an execution's output when the worker's result
/// stream broke and the result arrived through the fallback path; the
/// leader sees it and suppresses retries.
pub const BROKEN_STREAM_SENTINEL: &str =
    "grpc: Error on execution streaming, agent connection was abruptly terminated";

pub type Result<T> = std::result::Result<T, CronmeshError>;
