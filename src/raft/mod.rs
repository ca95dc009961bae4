//! Raft consensus: leader election, replicated log, membership changes,
//! snapshot transport and leadership transfer.

pub mod node;
pub mod rpc;
pub mod state;
pub mod storage;
pub mod timer;

pub use node::{RaftConfig, RaftNode};
pub use state::{EntryPayload, LogEntry, Peer, RaftRole, RaftState};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RaftError {
    #[error("raft: node is not the leader, current leader: {0:?}")]
    NotLeader(Option<String>),

    #[error("raft: apply timed out waiting for commit")]
    Timeout,

    #[error("raft: node is shutting down")]
    Shutdown,

    #[error("raft: no leadership transfer target available")]
    NoTransferTarget,

    #[error("raft: {0}")]
    Internal(String),

    #[error("raft: storage error: {0}")]
    Storage(#[from] std::io::Error),

    #[error(transparent)]
    Fsm(#[from] crate::fsm::FsmError),
}
