//! The finite state machine applying replicated log entries to the store.
//!
//! Each entry is a single `MessageType` byte followed by the
//! protobuf-encoded payload; every replica applies entries in log order.

use std::sync::Arc;

use prost::Message;

use crate::execution::Execution;
use crate::job::Job;
use crate::proto;
use crate::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    SetJob = 0,
    DeleteJob = 1,
    SetExecution = 2,
    DeleteExecutions = 3,
    ExecutionDone = 4,
}

impl MessageType {
    fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(MessageType::SetJob),
            1 => Some(MessageType::DeleteJob),
            2 => Some(MessageType::SetExecution),
            3 => Some(MessageType::DeleteExecutions),
            4 => Some(MessageType::ExecutionDone),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum FsmError {
    #[error("fsm: empty log entry")]
    EmptyEntry,

    #[error("fsm: unknown command type {0}")]
    UnknownCommand(u8),

    #[error("fsm: malformed payload: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What an applied entry produced; the leader's apply future carries this
/// back to the caller.
#[derive(Debug)]
pub enum FsmResponse {
    None,
    Job(Box<Job>),
    ExecutionKey(String),
}

/// Encode a command with its type prefix for the replicated log.
pub fn encode(t: MessageType, msg: &impl Message) -> Vec<u8> {
    let mut buf = Vec::with_capacity(1 + msg.encoded_len());
    buf.push(t as u8);
    msg.encode(&mut buf)
        .unwrap_or_else(|_| unreachable!("encoding into a Vec cannot fail"));
    buf
}

pub struct Fsm {
    store: Arc<Store>,
}

impl Fsm {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    /// Apply one replicated log entry to the store.
    pub fn apply(&self, buf: &[u8]) -> Result<FsmResponse, FsmError> {
        let (&first, payload) = buf.split_first().ok_or(FsmError::EmptyEntry)?;
        let msg_type = MessageType::from_byte(first).ok_or(FsmError::UnknownCommand(first))?;

        tracing::debug!(command = ?msg_type, "fsm: received command");

        match msg_type {
            MessageType::SetJob => self.apply_set_job(payload),
            MessageType::DeleteJob => self.apply_delete_job(payload),
            MessageType::SetExecution => self.apply_set_execution(payload),
            MessageType::DeleteExecutions => self.apply_delete_executions(payload),
            MessageType::ExecutionDone => self.apply_execution_done(payload),
        }
    }

    fn apply_set_job(&self, payload: &[u8]) -> Result<FsmResponse, FsmError> {
        let pb = proto::Job::decode(payload)?;
        let job = Job::from_proto(&pb);
        self.store.set_job(&job, false)?;
        Ok(FsmResponse::None)
    }

    fn apply_delete_job(&self, payload: &[u8]) -> Result<FsmResponse, FsmError> {
        let req = proto::DeleteJobRequest::decode(payload)?;
        let job = self.store.delete_job(&req.job_name)?;
        Ok(FsmResponse::Job(Box::new(job)))
    }

    fn apply_set_execution(&self, payload: &[u8]) -> Result<FsmResponse, FsmError> {
        let pb = proto::Execution::decode(payload)?;
        let execution = Execution::from_proto(&pb);
        let key = self.store.set_execution(&execution)?;
        Ok(FsmResponse::ExecutionKey(key))
    }

    fn apply_delete_executions(&self, payload: &[u8]) -> Result<FsmResponse, FsmError> {
        let req = proto::DeleteJobRequest::decode(payload)?;
        self.store.delete_executions(&req.job_name)?;
        Ok(FsmResponse::None)
    }

    fn apply_execution_done(&self, payload: &[u8]) -> Result<FsmResponse, FsmError> {
        let req = proto::ExecutionDoneRequest::decode(payload)?;
        let execution = req
            .execution
            .as_ref()
            .map(Execution::from_proto)
            .unwrap_or_default();

        tracing::debug!(
            execution = %execution.key(),
            job = %execution.job_name,
            "fsm: Setting execution done"
        );

        self.store.set_execution_done(&execution)?;
        Ok(FsmResponse::None)
    }

    /// Serialize the full store for snapshot transport.
    pub fn snapshot(&self) -> Result<Vec<u8>, FsmError> {
        let mut buf = Vec::new();
        self.store.snapshot(&mut buf)?;
        Ok(buf)
    }

    /// Replace state from a snapshot produced by [`Fsm::snapshot`].
    pub fn restore(&self, data: &[u8]) -> Result<(), FsmError> {
        self.store.restore(&mut &data[..])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExecutionOptions;
    use chrono::Utc;

    fn fsm() -> Fsm {
        Fsm::new(Arc::new(Store::new()))
    }

    fn job(name: &str) -> Job {
        Job {
            name: name.into(),
            schedule: "@every 1m".into(),
            executor: "shell".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_apply_set_and_delete_job() {
        let fsm = fsm();
        let entry = encode(MessageType::SetJob, &job("job1").to_proto());
        fsm.apply(&entry).unwrap();
        assert!(fsm.store().get_job("job1").is_ok());

        let entry = encode(
            MessageType::DeleteJob,
            &proto::DeleteJobRequest {
                job_name: "job1".into(),
            },
        );
        match fsm.apply(&entry).unwrap() {
            FsmResponse::Job(deleted) => assert_eq!(deleted.name, "job1"),
            other => panic!("expected deleted job, got {other:?}"),
        }
        assert!(fsm.store().get_job("job1").is_err());
    }

    #[test]
    fn test_apply_execution_lifecycle() {
        let fsm = fsm();
        fsm.apply(&encode(MessageType::SetJob, &job("job1").to_proto()))
            .unwrap();

        let now = Utc::now();
        let execution = Execution {
            started_at: Some(now),
            finished_at: Some(now),
            node_name: "n1".into(),
            success: true,
            ..Execution::new("job1")
        };

        match fsm
            .apply(&encode(MessageType::SetExecution, &execution.to_proto()))
            .unwrap()
        {
            FsmResponse::ExecutionKey(key) => assert!(key.starts_with("executions:job1:")),
            other => panic!("expected execution key, got {other:?}"),
        }

        fsm.apply(&encode(
            MessageType::ExecutionDone,
            &proto::ExecutionDoneRequest {
                execution: Some(execution.to_proto()),
            },
        ))
        .unwrap();

        let loaded = fsm.store().get_job("job1").unwrap();
        assert_eq!(loaded.success_count, 1);
        assert_eq!(loaded.status, crate::job::STATUS_SUCCESS);

        fsm.apply(&encode(
            MessageType::DeleteExecutions,
            &proto::DeleteJobRequest {
                job_name: "job1".into(),
            },
        ))
        .unwrap();
        assert!(fsm
            .store()
            .get_executions("job1", &ExecutionOptions::default())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_apply_rejects_malformed_entries() {
        let fsm = fsm();
        assert!(matches!(fsm.apply(&[]), Err(FsmError::EmptyEntry)));
        assert!(matches!(
            fsm.apply(&[99, 1, 2, 3]),
            Err(FsmError::UnknownCommand(99))
        ));
    }

    #[test]
    fn test_snapshot_restore_roundtrip() {
        let fsm = fsm();
        fsm.apply(&encode(MessageType::SetJob, &job("job1").to_proto()))
            .unwrap();
        let snapshot = fsm.snapshot().unwrap();

        let other = Fsm::new(Arc::new(Store::new()));
        other.restore(&snapshot).unwrap();
        assert_eq!(
            other.store().get_job("job1").unwrap().name,
            fsm.store().get_job("job1").unwrap().name
        );
    }
}
