//! Job domain type: validation, schedule expansion and proto mapping.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::extcron::{self, ScheduleError};
use crate::proto;
use crate::timeutil::{opt_from_timestamp, opt_to_timestamp};

/// Initial job status, before any run.
pub const STATUS_NOT_SET: &str = "";
/// Last run succeeded on every node.
pub const STATUS_SUCCESS: &str = "success";
/// Last run has not finished.
pub const STATUS_RUNNING: &str = "running";
/// Last run failed on every node.
pub const STATUS_FAILED: &str = "failed";
/// Last run succeeded on some nodes only.
pub const STATUS_PARTIALLY_FAILED: &str = "partially_failed";

pub const CONCURRENCY_ALLOW: &str = "allow";
pub const CONCURRENCY_FORBID: &str = "forbid";

/// The character in a schedule replaced by a value derived from the job name.
const HASH_SYMBOL: char = '~';

#[derive(Debug, Error)]
pub enum JobError {
    #[error("name cannot be empty")]
    EmptyName,

    #[error("name contains illegal character {0:?}")]
    IllegalName(char),

    #[error("the job can not have itself as parent")]
    SameParent,

    #[error("specified parent job not found")]
    ParentNotFound,

    #[error("cycle detected in the parent job chain")]
    ParentCycle,

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error("invalid concurrency policy value, use \"allow\" or \"forbid\"")]
    WrongConcurrency,

    #[error("invalid job timeout value {0:?}")]
    InvalidTimeout(String),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Job name. Unique, acts as the id.
    pub name: String,

    /// Displayed instead of the name when present.
    #[serde(default)]
    pub displayname: String,

    /// IANA timezone the cron expression is evaluated in. Empty means local.
    #[serde(default)]
    pub timezone: String,

    /// Cron expression for the job.
    #[serde(default)]
    pub schedule: String,

    /// Arbitrary string indicating the owner of the job.
    #[serde(default)]
    pub owner: String,

    #[serde(default)]
    pub owner_email: String,

    /// Number of successful executions of this job.
    #[serde(default)]
    pub success_count: i64,

    /// Number of errors running this job.
    #[serde(default)]
    pub error_count: i64,

    /// Last time this job executed successfully.
    #[serde(default)]
    pub last_success: Option<DateTime<Utc>>,

    /// Last time this job failed.
    #[serde(default)]
    pub last_error: Option<DateTime<Utc>>,

    #[serde(default)]
    pub disabled: bool,

    /// Tags of the target servers to run this job against. Values may carry
    /// a `:N` cardinality suffix.
    #[serde(default)]
    pub tags: HashMap<String, String>,

    /// Free-form metadata, filterable from the API.
    #[serde(default)]
    pub metadata: HashMap<String, String>,

    /// Number of times to retry an execution that failed.
    #[serde(default)]
    pub retries: u32,

    /// Jobs that run after this one succeeds. Maintained automatically as
    /// the inverse of `parent_job`.
    #[serde(default)]
    pub dependent_jobs: Vec<String>,

    /// Name of the job this job depends on, empty for top-level jobs.
    #[serde(default)]
    pub parent_job: String,

    /// Processor plugins applied to finished executions, by name.
    #[serde(default)]
    pub processors: BTreeMap<String, HashMap<String, String>>,

    /// Concurrency policy: `allow` (default) or `forbid`.
    #[serde(default)]
    pub concurrency: String,

    /// Executor plugin used to run this job.
    #[serde(default)]
    pub executor: String,

    /// Configuration arguments for the executor.
    #[serde(default)]
    pub executor_config: HashMap<String, String>,

    /// Computed job status.
    #[serde(default)]
    pub status: String,

    /// Computed next execution time.
    #[serde(default)]
    pub next: Option<DateTime<Utc>>,

    /// Delete the job after the first successful execution.
    #[serde(default)]
    pub ephemeral: bool,

    /// The job will not be executed after this time.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Sum of the code points of the job name; stable across nodes so every
    /// replica agrees on hash-expanded schedules.
    fn name_hash(&self) -> u32 {
        self.name.chars().map(|c| c as u32).sum()
    }

    /// Replace `~` in the cron spec by a value derived from the job name,
    /// reduced to each field's natural range.
    pub fn schedule_hash(&self) -> String {
        let spec = &self.schedule;
        if !spec.contains(HASH_SYMBOL) {
            return spec.clone();
        }

        let hash = self.name_hash();
        let mut parts: Vec<String> = Vec::new();
        let mut field_index = 0usize;
        for part in spec.split_whitespace() {
            if part.starts_with('@') {
                // Descriptors carry no fields to expand.
                return spec.clone();
            }
            if part.starts_with("TZ=") || part.starts_with("CRON_TZ=") {
                parts.push(part.to_string());
                continue;
            }

            if part.contains(HASH_SYMBOL) {
                let expanded = match field_index {
                    2 => hash % 24,
                    3 => (hash % 28) + 1,
                    4 => (hash % 12) + 1,
                    5 => hash % 7,
                    _ => hash % 60,
                };
                parts.push(part.replace(HASH_SYMBOL, &expanded.to_string()));
            } else {
                parts.push(part.to_string());
            }
            field_index += 1;
        }

        parts.join(" ")
    }

    /// The job's next fire time from now, `None` when the job has no
    /// schedule of its own or the schedule never fires again.
    pub fn get_next(&self) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        if self.schedule.is_empty() {
            return Ok(None);
        }
        let sched = extcron::parse(&self.schedule_hash())?;
        Ok(sched.next_after(Utc::now()))
    }

    /// The job's timezone, `None` for the empty (local) value or an
    /// unresolvable name.
    pub fn time_location(&self) -> Option<chrono_tz::Tz> {
        self.timezone.parse().ok()
    }

    /// Validate all values in the job.
    pub fn validate(&self) -> Result<(), JobError> {
        if self.name.is_empty() {
            return Err(JobError::EmptyName);
        }
        if let Some(c) = self
            .name
            .chars()
            .find(|c| !(c.is_lowercase() || c.is_ascii_digit() || *c == '_' || *c == '-'))
        {
            return Err(JobError::IllegalName(c));
        }

        if self.parent_job == self.name {
            return Err(JobError::SameParent);
        }

        // Child jobs inherit their trigger, everything else needs a parse-
        // able schedule.
        if !self.schedule.is_empty() || self.parent_job.is_empty() {
            extcron::validate(&self.schedule_hash())?;
        }

        match self.concurrency.as_str() {
            "" | CONCURRENCY_ALLOW | CONCURRENCY_FORBID => {}
            _ => return Err(JobError::WrongConcurrency),
        }

        if !self.timezone.is_empty() && self.timezone.parse::<chrono_tz::Tz>().is_err() {
            return Err(JobError::Schedule(ScheduleError::UnknownTimezone(
                self.timezone.clone(),
            )));
        }

        if self.executor == "shell" {
            if let Some(timeout) = self.executor_config.get("timeout") {
                if !timeout.is_empty() && extcron::parse_go_duration(timeout).is_err() {
                    return Err(JobError::InvalidTimeout(timeout.clone()));
                }
            }
        }

        Ok(())
    }

    pub fn from_proto(j: &proto::Job) -> Self {
        Self {
            name: j.name.clone(),
            displayname: j.displayname.clone(),
            timezone: j.timezone.clone(),
            schedule: j.schedule.clone(),
            owner: j.owner.clone(),
            owner_email: j.owner_email.clone(),
            success_count: j.success_count,
            error_count: j.error_count,
            last_success: opt_from_timestamp(j.last_success.as_ref()),
            last_error: opt_from_timestamp(j.last_error.as_ref()),
            disabled: j.disabled,
            tags: j.tags.clone(),
            metadata: j.metadata.clone(),
            retries: j.retries,
            dependent_jobs: j.dependent_jobs.clone(),
            parent_job: j.parent_job.clone(),
            processors: j
                .processors
                .iter()
                .map(|(k, v)| (k.clone(), v.config.clone()))
                .collect(),
            concurrency: j.concurrency.clone(),
            executor: j.executor.clone(),
            executor_config: j.executor_config.clone(),
            status: j.status.clone(),
            next: opt_from_timestamp(j.next.as_ref()),
            ephemeral: j.ephemeral,
            expires_at: opt_from_timestamp(j.expires_at.as_ref()),
        }
    }

    pub fn to_proto(&self) -> proto::Job {
        proto::Job {
            name: self.name.clone(),
            displayname: self.displayname.clone(),
            timezone: self.timezone.clone(),
            schedule: self.schedule.clone(),
            owner: self.owner.clone(),
            owner_email: self.owner_email.clone(),
            success_count: self.success_count,
            error_count: self.error_count,
            last_success: opt_to_timestamp(self.last_success),
            last_error: opt_to_timestamp(self.last_error),
            disabled: self.disabled,
            tags: self.tags.clone(),
            metadata: self.metadata.clone(),
            retries: self.retries,
            dependent_jobs: self.dependent_jobs.clone(),
            parent_job: self.parent_job.clone(),
            processors: self
                .processors
                .iter()
                .map(|(k, v)| (k.clone(), proto::PluginConfig { config: v.clone() }))
                .collect(),
            concurrency: self.concurrency.clone(),
            executor: self.executor.clone(),
            executor_config: self.executor_config.clone(),
            status: self.status.clone(),
            next: opt_to_timestamp(self.next),
            ephemeral: self.ephemeral,
            expires_at: opt_to_timestamp(self.expires_at),
        }
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "\"Job: {}, scheduled at: {}, tags: {:?}\"",
            self.name, self.schedule, self.tags
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_job(name: &str) -> Job {
        Job {
            name: name.into(),
            schedule: "@every 1m".into(),
            executor: "shell".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_accepts_minimal_job() {
        assert!(base_job("job1").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_names() {
        assert!(matches!(base_job("").validate(), Err(JobError::EmptyName)));
        assert!(matches!(
            base_job("Job1").validate(),
            Err(JobError::IllegalName('J'))
        ));
        assert!(matches!(
            base_job("job one").validate(),
            Err(JobError::IllegalName(' '))
        ));
        assert!(base_job("job_1-a").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_self_parent() {
        let mut job = base_job("job1");
        job.parent_job = "job1".into();
        assert!(matches!(job.validate(), Err(JobError::SameParent)));
    }

    #[test]
    fn test_validate_child_without_schedule() {
        let mut job = base_job("child");
        job.schedule = String::new();
        job.parent_job = "parent".into();
        assert!(job.validate().is_ok());

        // A top-level job must have a parseable schedule.
        let mut top = base_job("top");
        top.schedule = String::new();
        assert!(top.validate().is_err());
    }

    #[test]
    fn test_validate_concurrency_values() {
        let mut job = base_job("job1");
        job.concurrency = CONCURRENCY_FORBID.into();
        assert!(job.validate().is_ok());
        job.concurrency = "maybe".into();
        assert!(matches!(job.validate(), Err(JobError::WrongConcurrency)));
    }

    #[test]
    fn test_validate_timezone_and_timeout() {
        let mut job = base_job("job1");
        job.timezone = "Europe/Madrid".into();
        assert!(job.validate().is_ok());
        job.timezone = "Mars/Olympus".into();
        assert!(job.validate().is_err());

        let mut job = base_job("job1");
        job.executor_config.insert("timeout".into(), "30s".into());
        assert!(job.validate().is_ok());
        job.executor_config.insert("timeout".into(), "soon".into());
        assert!(matches!(job.validate(), Err(JobError::InvalidTimeout(_))));
    }

    #[test]
    fn test_schedule_hash_is_deterministic() {
        let mut job = base_job("alpha");
        job.schedule = "0 0 ~ * * *".into();
        // sum of code points of "alpha" = 97+108+112+104+97 = 518; 518 % 24 = 14
        assert_eq!(job.schedule_hash(), "0 0 14 * * *");
        // Same input, same expansion, every time.
        assert_eq!(job.schedule_hash(), job.schedule_hash());
    }

    #[test]
    fn test_schedule_hash_field_moduli() {
        let mut job = base_job("alpha"); // hash = 518
        job.schedule = "~ ~ ~ ~ ~ ~".into();
        assert_eq!(job.schedule_hash(), "38 38 14 15 3 0");
    }

    #[test]
    fn test_schedule_hash_skips_descriptors_and_tz() {
        let mut job = base_job("alpha");
        job.schedule = "@hourly".into();
        assert_eq!(job.schedule_hash(), "@hourly");

        job.schedule = "TZ=UTC 0 0 ~ * * *".into();
        assert_eq!(job.schedule_hash(), "TZ=UTC 0 0 14 * * *");
    }

    #[test]
    fn test_get_next_for_scheduled_job() {
        let job = base_job("job1");
        let next = job.get_next().unwrap().unwrap();
        assert!(next > Utc::now());

        let mut child = base_job("child");
        child.schedule = String::new();
        assert!(child.get_next().unwrap().is_none());
    }

    #[test]
    fn test_proto_roundtrip() {
        let mut job = base_job("job1");
        job.tags.insert("role".into(), "web:2".into());
        job.processors
            .insert("files".into(), HashMap::from([("forward".into(), "true".into())]));
        job.last_success = Some(Utc::now());
        job.retries = 3;
        assert_eq!(Job::from_proto(&job.to_proto()), job);
    }
}
