//! Execution domain type: one run of a job on one node.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::proto;
use crate::timeutil::{opt_from_timestamp, opt_to_timestamp};

/// Base delay unit between retry attempts.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    /// Name of the job this execution refers to.
    pub job_name: String,

    /// Start time of the execution.
    pub started_at: Option<DateTime<Utc>>,

    /// When the execution finished running.
    pub finished_at: Option<DateTime<Utc>>,

    /// Whether this execution finished successfully.
    pub success: bool,

    /// Partial output of the execution, capped by the stream buffer.
    #[serde(with = "serde_bytes_base64")]
    pub output: Vec<u8>,

    /// Name of the node that ran this execution.
    pub node_name: String,

    /// Execution group this execution belongs to: the trigger timestamp in
    /// nanoseconds, shared by every node dispatched for one fire.
    pub group: i64,

    /// Retry attempt, starting at 1.
    pub attempt: u32,
}

impl Execution {
    /// A fresh execution for a new trigger of `job_name`.
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            group: Utc::now().timestamp_nanos_opt().unwrap_or_default(),
            attempt: 1,
            ..Default::default()
        }
    }

    /// Storage key for this execution within its job.
    pub fn key(&self) -> String {
        let nanos = self
            .started_at
            .and_then(|t| t.timestamp_nanos_opt())
            .unwrap_or_default();
        format!("{}-{}", nanos, self.node_name)
    }

    pub fn group_id(&self) -> String {
        self.group.to_string()
    }

    /// Retry delay between this attempt and the next:
    /// `⌊log₂(elapsed / 500ms) + attempt⌋ × 500ms`, never negative, and at
    /// least one interval while the run is younger than the base interval.
    pub fn calculate_exponential_backoff(&self) -> Duration {
        let started_at = match self.started_at {
            Some(t) => t,
            None => return Duration::ZERO,
        };
        let now = Utc::now();
        if now < started_at {
            return Duration::ZERO;
        }

        let elapsed = (now - started_at).to_std().unwrap_or_default();
        let intervals = elapsed.as_nanos() / DEFAULT_RETRY_INTERVAL.as_nanos();
        let units = if intervals == 0 {
            self.attempt as f64
        } else {
            ((intervals as f64).log2() + self.attempt as f64).floor()
        };
        if units <= 0.0 {
            return Duration::ZERO;
        }

        DEFAULT_RETRY_INTERVAL * units as u32
    }

    pub fn from_proto(e: &proto::Execution) -> Self {
        Self {
            job_name: e.job_name.clone(),
            started_at: opt_from_timestamp(e.started_at.as_ref()),
            finished_at: opt_from_timestamp(e.finished_at.as_ref()),
            success: e.success,
            output: e.output.clone(),
            node_name: e.node_name.clone(),
            group: e.group,
            attempt: e.attempt,
        }
    }

    pub fn to_proto(&self) -> proto::Execution {
        proto::Execution {
            job_name: self.job_name.clone(),
            started_at: opt_to_timestamp(self.started_at),
            finished_at: opt_to_timestamp(self.finished_at),
            success: self.success,
            output: self.output.clone(),
            node_name: self.node_name.clone(),
            group: self.group,
            attempt: self.attempt,
        }
    }
}

// Execution output is arbitrary bytes; keep the JSON form compact and valid.
mod serde_bytes_base64 {
    use base64::prelude::{Engine, BASE64_STANDARD};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&BASE64_STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(de)?;
        BASE64_STANDARD
            .decode(s.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    #[test]
    fn test_new_execution_defaults() {
        let ex = Execution::new("job1");
        assert_eq!(ex.job_name, "job1");
        assert_eq!(ex.attempt, 1);
        assert!(ex.group > 0);
        assert!(ex.started_at.is_none());
    }

    #[test]
    fn test_key_format() {
        let started = Utc::now();
        let ex = Execution {
            job_name: "job1".into(),
            started_at: Some(started),
            node_name: "node-a".into(),
            ..Execution::new("job1")
        };
        assert_eq!(
            ex.key(),
            format!("{}-node-a", started.timestamp_nanos_opt().unwrap())
        );
    }

    #[test]
    fn test_backoff_future_start_is_zero() {
        let ex = Execution {
            started_at: Some(Utc::now() + ChronoDuration::seconds(30)),
            attempt: 1,
            ..Execution::new("j")
        };
        assert_eq!(ex.calculate_exponential_backoff(), Duration::ZERO);
    }

    #[test]
    fn test_backoff_young_execution_waits_one_interval() {
        let ex = Execution {
            started_at: Some(Utc::now()),
            attempt: 1,
            ..Execution::new("j")
        };
        assert_eq!(ex.calculate_exponential_backoff(), Duration::from_millis(500));
    }

    #[test]
    fn test_backoff_follows_log_law() {
        // elapsed ≈ 4s → 8 intervals → log2(8) = 3; attempt 2 → 5 units.
        let ex = Execution {
            started_at: Some(Utc::now() - ChronoDuration::seconds(4)),
            attempt: 2,
            ..Execution::new("j")
        };
        assert_eq!(ex.calculate_exponential_backoff(), Duration::from_millis(2500));
    }

    #[test]
    fn test_proto_roundtrip_preserves_fields() {
        let ex = Execution {
            job_name: "job1".into(),
            started_at: Some(Utc::now()),
            finished_at: Some(Utc::now()),
            success: true,
            output: b"hello".to_vec(),
            node_name: "node-a".into(),
            group: 42,
            attempt: 3,
        };
        assert_eq!(Execution::from_proto(&ex.to_proto()), ex);
    }
}
