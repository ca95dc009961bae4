//! Embedded ordered key/value store for jobs and executions.
//!
//! Keys are `jobs:{name}` and `executions:{job}:{key}`. Values are JSON
//! encoded domain objects; a legacy protobuf encoding is still accepted on
//! read. Named secondary indexes extract JSON fields and drive ordered
//! scans. A single mutex serializes writers, readers work on consistent
//! snapshots taken under the same lock.

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::sync::Mutex;

use base64::prelude::{Engine, BASE64_STANDARD};
use prost::Message;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::execution::Execution;
use crate::job::{self, Job, JobError};
use crate::proto;

/// Executions to retain per job; older ones are evicted by `started_at`.
pub const MAX_EXECUTIONS: usize = 100;

/// Parent chains longer than this are treated as cycles.
const MAX_PARENT_DEPTH: usize = 100;

const JOBS_PREFIX: &str = "jobs";
const EXECUTIONS_PREFIX: &str = "executions";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store: key not found")]
    NotFound,

    #[error("store: could not delete job with dependent jobs, delete childs first")]
    DependentJobs,

    #[error("store: received execution done for a deleted job")]
    ExecutionDoneForDeletedJob,

    #[error(transparent)]
    Job(#[from] JobError),

    #[error("store: serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store: snapshot io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Filtering and ordering options for job listings.
#[derive(Debug, Clone, Default)]
pub struct JobOptions {
    pub metadata: std::collections::HashMap<String, String>,
    pub query: String,
    /// "true"/"false" filters on the disabled flag, empty matches all.
    pub disabled: String,
    /// Job status to match; "untriggered" matches jobs that never ran.
    pub status: String,
    /// Index name to sort by, defaults to `name`.
    pub sort: String,
    /// "ASC" (default) or "DESC".
    pub order: String,
}

/// Ordering options for execution listings.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    pub sort: String,
    pub order: String,
    pub timezone: Option<chrono_tz::Tz>,
}

#[derive(Serialize, Deserialize)]
struct SnapshotRecord {
    key: String,
    value: String,
}

pub struct Store {
    data: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Store {
    pub fn new() -> Self {
        Self {
            data: Mutex::new(BTreeMap::new()),
        }
    }

    // ---- jobs ----

    /// Store a job, merging run-state fields with any stored version.
    ///
    /// When the job already exists the stored counters, last run times and
    /// status win over the incoming values; `dependent_jobs` is preserved
    /// when `copy_dependent_jobs` is set. A changed schedule recomputes
    /// `next`, otherwise the later of the stored and provided values is
    /// kept. Parent links are maintained as part of the same application.
    pub fn set_job(&self, job: &Job, copy_dependent_jobs: bool) -> Result<(), StoreError> {
        job.validate()?;

        let mut job = job.clone();

        let mut data = self.data.lock().unwrap();

        if !job.parent_job.is_empty() {
            if get_job_locked(&data, &job.parent_job).is_err() {
                return Err(JobError::ParentNotFound.into());
            }
            check_parent_cycle(&data, &job)?;
        }

        let existing = get_job_locked(&data, &job.name).ok();

        if let Some(ej) = &existing {
            // When the job runs these fields are updated through the
            // execution path; keep whichever side is further along.
            if ej.last_error > job.last_error {
                job.last_error = ej.last_error;
            }
            if ej.last_success > job.last_success {
                job.last_success = ej.last_success;
            }
            if ej.success_count > job.success_count {
                job.success_count = ej.success_count;
            }
            if ej.error_count > job.error_count {
                job.error_count = ej.error_count;
            }
            if !ej.dependent_jobs.is_empty() && copy_dependent_jobs {
                job.dependent_jobs = ej.dependent_jobs.clone();
            }
            if !ej.status.is_empty() {
                job.status = ej.status.clone();
            }
        }

        let existing_schedule = existing.as_ref().map(|j| j.schedule.as_str()).unwrap_or("");
        if job.schedule != existing_schedule {
            job.next = job.get_next().map_err(JobError::from)?;
        } else if let Some(ej) = &existing {
            // Never move the next fire backwards with stale data.
            if job.next < ej.next {
                job.next = ej.next;
            }
        }

        put_job_locked(&mut data, &job)?;

        // If the parent changed, detach from the old parent and attach to
        // the new one within the same application.
        let old_parent = existing
            .as_ref()
            .map(|j| j.parent_job.clone())
            .unwrap_or_default();
        if job.parent_job != old_parent {
            if !old_parent.is_empty() {
                detach_from_parent_locked(&mut data, &old_parent, &job.name)?;
            }
            if !job.parent_job.is_empty() {
                attach_to_parent_locked(&mut data, &job.parent_job, &job.name)?;
            }
        }

        Ok(())
    }

    pub fn get_job(&self, name: &str) -> Result<Job, StoreError> {
        let data = self.data.lock().unwrap();
        get_job_locked(&data, name)
    }

    /// Return jobs matching the given options, sorted by the named index.
    pub fn get_jobs(&self, options: Option<&JobOptions>) -> Result<Vec<Job>, StoreError> {
        let default_options = JobOptions::default();
        let options = options.unwrap_or(&default_options);

        let data = self.data.lock().unwrap();
        let mut jobs: Vec<Job> = Vec::new();
        for value in scan_prefix(&data, &format!("{JOBS_PREFIX}:")) {
            let job = decode_job(value)?;
            let matches = (options.metadata.is_empty() || job_has_metadata(&job, &options.metadata))
                && (options.query.is_empty()
                    || job.name.contains(&options.query)
                    || job.displayname.contains(&options.query))
                && (options.disabled.is_empty()
                    || job.disabled.to_string() == options.disabled)
                && ((options.status == "untriggered" && job.status.is_empty())
                    || options.status.is_empty()
                    || job.status == options.status);
            if matches {
                jobs.push(job);
            }
        }

        let sort = if options.sort.is_empty() { "name" } else { &options.sort };
        sort_by_index(&mut jobs, sort, options.order == "DESC", job_index_value);
        Ok(jobs)
    }

    /// Delete a job, all its executions and the reference in its parent.
    /// Refused while the job still has dependent jobs.
    pub fn delete_job(&self, name: &str) -> Result<Job, StoreError> {
        let mut data = self.data.lock().unwrap();
        let job = get_job_locked(&data, name)?;

        if !job.dependent_jobs.is_empty() {
            return Err(StoreError::DependentJobs);
        }

        let exec_prefix = format!("{EXECUTIONS_PREFIX}:{name}:");
        let exec_keys: Vec<String> = data
            .range(exec_prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&exec_prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for key in exec_keys {
            data.remove(&key);
        }

        data.remove(&format!("{JOBS_PREFIX}:{name}"));

        if !job.parent_job.is_empty() {
            detach_from_parent_locked(&mut data, &job.parent_job, &job.name)?;
        }

        Ok(job)
    }

    // ---- executions ----

    /// Save an execution, keeping the stored record when it is more recent,
    /// and evict the oldest entries beyond the retention limit.
    pub fn set_execution(&self, execution: &Execution) -> Result<String, StoreError> {
        let key = format!(
            "{EXECUTIONS_PREFIX}:{}:{}",
            execution.job_name,
            execution.key()
        );

        let mut data = self.data.lock().unwrap();
        put_execution_locked(&mut data, &key, execution)?;
        prune_executions_locked(&mut data, &execution.job_name)?;

        Ok(key)
    }

    /// Save a finished execution and update the owning job: run counters,
    /// last success/error and the status derived from the execution group.
    pub fn set_execution_done(&self, execution: &Execution) -> Result<bool, StoreError> {
        let mut data = self.data.lock().unwrap();

        let mut job = match get_job_locked(&data, &execution.job_name) {
            Ok(job) => job,
            Err(StoreError::NotFound) => {
                tracing::warn!(
                    job = %execution.job_name,
                    "store: received execution done for a deleted job"
                );
                return Err(StoreError::ExecutionDoneForDeletedJob);
            }
            Err(e) => return Err(e),
        };

        let key = format!(
            "{EXECUTIONS_PREFIX}:{}:{}",
            execution.job_name,
            execution.key()
        );
        put_execution_locked(&mut data, &key, execution)?;

        if execution.success {
            job.last_success = execution.finished_at;
            job.success_count += 1;
        } else {
            job.last_error = execution.finished_at;
            job.error_count += 1;
        }

        job.status = compute_status_locked(&data, &execution.job_name, execution.group)?;
        put_job_locked(&mut data, &job)?;
        prune_executions_locked(&mut data, &execution.job_name)?;

        Ok(true)
    }

    /// Remove every stored execution of a job. Returns how many were
    /// deleted.
    pub fn delete_executions(&self, job_name: &str) -> Result<usize, StoreError> {
        let mut data = self.data.lock().unwrap();
        let prefix = format!("{EXECUTIONS_PREFIX}:{job_name}:");
        let keys: Vec<String> = data
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        let count = keys.len();
        for key in keys {
            data.remove(&key);
        }
        Ok(count)
    }

    /// All stored executions of a job, sorted by the given index.
    pub fn get_executions(
        &self,
        job_name: &str,
        options: &ExecutionOptions,
    ) -> Result<Vec<Execution>, StoreError> {
        let data = self.data.lock().unwrap();
        let mut executions = executions_locked(&data, job_name)?;

        let sort = if options.sort.is_empty() { "started_at" } else { &options.sort };
        sort_by_index(&mut executions, sort, options.order == "DESC", execution_index_value);
        Ok(executions)
    }

    /// All executions in the same group as the given one.
    pub fn get_execution_group(
        &self,
        execution: &Execution,
        options: &ExecutionOptions,
    ) -> Result<Vec<Execution>, StoreError> {
        Ok(self
            .get_executions(&execution.job_name, options)?
            .into_iter()
            .filter(|e| e.group == execution.group)
            .collect())
    }

    /// Executions of a job grouped by trigger, with groups ordered newest
    /// first.
    pub fn get_grouped_executions(
        &self,
        job_name: &str,
    ) -> Result<(BTreeMap<i64, Vec<Execution>>, Vec<i64>), StoreError> {
        let executions = self.get_executions(job_name, &ExecutionOptions::default())?;
        let mut groups: BTreeMap<i64, Vec<Execution>> = BTreeMap::new();
        for execution in executions {
            groups.entry(execution.group).or_default().push(execution);
        }
        let mut by_group: Vec<i64> = groups.keys().copied().collect();
        by_group.sort_unstable_by(|a, b| b.cmp(a));
        Ok((groups, by_group))
    }

    // ---- snapshot / restore ----

    /// Stream the full keyspace to `w` as JSON lines.
    pub fn snapshot(&self, w: &mut dyn Write) -> Result<(), StoreError> {
        let data = self.data.lock().unwrap();
        for (key, value) in data.iter() {
            let record = SnapshotRecord {
                key: key.clone(),
                value: BASE64_STANDARD.encode(value),
            };
            serde_json::to_writer(&mut *w, &record)?;
            w.write_all(b"\n")?;
        }
        w.flush()?;
        Ok(())
    }

    /// Replace the store contents from a snapshot stream.
    pub fn restore(&self, r: &mut dyn Read) -> Result<(), StoreError> {
        let mut restored = BTreeMap::new();
        for line in BufReader::new(r).lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let record: SnapshotRecord = serde_json::from_str(&line)?;
            let value = BASE64_STANDARD
                .decode(record.value.as_bytes())
                .map_err(|e| {
                    StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
            restored.insert(record.key, value);
        }

        *self.data.lock().unwrap() = restored;
        Ok(())
    }
}

// ---- locked helpers; all take the map guarded by the store mutex ----

fn get_job_locked(data: &BTreeMap<String, Vec<u8>>, name: &str) -> Result<Job, StoreError> {
    let value = data
        .get(&format!("{JOBS_PREFIX}:{name}"))
        .ok_or(StoreError::NotFound)?;
    decode_job(value)
}

fn put_job_locked(data: &mut BTreeMap<String, Vec<u8>>, job: &Job) -> Result<(), StoreError> {
    tracing::debug!(job = %job.name, "store: Setting job");
    let value = serde_json::to_vec(job)?;
    data.insert(format!("{JOBS_PREFIX}:{}", job.name), value);
    Ok(())
}

fn put_execution_locked(
    data: &mut BTreeMap<String, Vec<u8>>,
    key: &str,
    execution: &Execution,
) -> Result<(), StoreError> {
    // Keep the stored record when it finished later, so an out of order
    // retry can never overwrite fresher data.
    if let Some(existing) = data.get(key) {
        let previous = decode_execution(existing)?;
        if previous.finished_at > execution.finished_at {
            return Ok(());
        }
    }

    data.insert(key.to_string(), serde_json::to_vec(execution)?);
    Ok(())
}

fn executions_locked(
    data: &BTreeMap<String, Vec<u8>>,
    job_name: &str,
) -> Result<Vec<Execution>, StoreError> {
    scan_prefix(data, &format!("{EXECUTIONS_PREFIX}:{job_name}:"))
        .map(|value| decode_execution(value))
        .collect()
}

fn prune_executions_locked(
    data: &mut BTreeMap<String, Vec<u8>>,
    job_name: &str,
) -> Result<(), StoreError> {
    let mut executions = executions_locked(data, job_name)?;
    if executions.len() <= MAX_EXECUTIONS {
        return Ok(());
    }

    executions.sort_by_key(|e| e.started_at);
    for execution in &executions[..executions.len() - MAX_EXECUTIONS] {
        let key = format!("{EXECUTIONS_PREFIX}:{job_name}:{}", execution.key());
        tracing::debug!(execution = %key, "store: evicting overflowed execution");
        data.remove(&key);
    }
    Ok(())
}

fn compute_status_locked(
    data: &BTreeMap<String, Vec<u8>>,
    job_name: &str,
    group: i64,
) -> Result<String, StoreError> {
    let executions = executions_locked(data, job_name)?;

    let mut success = 0;
    let mut failed = 0;
    for execution in executions.iter().filter(|e| e.group == group) {
        if execution.success {
            success += 1;
        } else {
            failed += 1;
        }
    }

    let status = if failed == 0 {
        job::STATUS_SUCCESS
    } else if success == 0 {
        job::STATUS_FAILED
    } else {
        job::STATUS_PARTIALLY_FAILED
    };
    Ok(status.to_string())
}

fn detach_from_parent_locked(
    data: &mut BTreeMap<String, Vec<u8>>,
    parent_name: &str,
    child_name: &str,
) -> Result<(), StoreError> {
    let mut parent = match get_job_locked(data, parent_name) {
        Ok(parent) => parent,
        // The parent may already be gone; nothing to detach from.
        Err(StoreError::NotFound) => return Ok(()),
        Err(e) => return Err(e),
    };
    // Remove every occurrence, duplicates from old data included.
    parent.dependent_jobs.retain(|name| name != child_name);
    put_job_locked(data, &parent)
}

fn attach_to_parent_locked(
    data: &mut BTreeMap<String, Vec<u8>>,
    parent_name: &str,
    child_name: &str,
) -> Result<(), StoreError> {
    let mut parent = get_job_locked(data, parent_name)?;
    if !parent.dependent_jobs.iter().any(|name| name == child_name) {
        parent.dependent_jobs.push(child_name.to_string());
    }
    put_job_locked(data, &parent)
}

fn check_parent_cycle(data: &BTreeMap<String, Vec<u8>>, job: &Job) -> Result<(), StoreError> {
    let mut current = job.parent_job.clone();
    for _ in 0..MAX_PARENT_DEPTH {
        if current.is_empty() {
            return Ok(());
        }
        if current == job.name {
            return Err(JobError::ParentCycle.into());
        }
        current = match get_job_locked(data, &current) {
            Ok(parent) => parent.parent_job,
            Err(StoreError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };
    }
    Err(JobError::ParentCycle.into())
}

fn scan_prefix<'a>(
    data: &'a BTreeMap<String, Vec<u8>>,
    prefix: &'a str,
) -> impl Iterator<Item = &'a Vec<u8>> {
    data.range(prefix.to_string()..)
        .take_while(move |(k, _)| k.starts_with(prefix))
        .map(|(_, v)| v)
}

// Values are JSON; the legacy protobuf encoding is still accepted on read.
fn decode_job(value: &[u8]) -> Result<Job, StoreError> {
    match serde_json::from_slice::<Job>(value) {
        Ok(job) => Ok(job),
        Err(json_err) => match proto::Job::decode(value) {
            Ok(pb) => Ok(Job::from_proto(&pb)),
            Err(_) => Err(StoreError::Serialization(json_err)),
        },
    }
}

fn decode_execution(value: &[u8]) -> Result<Execution, StoreError> {
    match serde_json::from_slice::<Execution>(value) {
        Ok(execution) => Ok(execution),
        Err(json_err) => match proto::Execution::decode(value) {
            Ok(pb) => Ok(Execution::from_proto(&pb)),
            Err(_) => Err(StoreError::Serialization(json_err)),
        },
    }
}

fn job_has_metadata(job: &Job, metadata: &std::collections::HashMap<String, String>) -> bool {
    !job.metadata.is_empty()
        && metadata
            .iter()
            .all(|(k, v)| job.metadata.get(k) == Some(v))
}

fn job_index_value(job: &Job, index: &str) -> Value {
    match serde_json::to_value(job) {
        Ok(Value::Object(map)) => map.get(index).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn execution_index_value(execution: &Execution, index: &str) -> Value {
    match serde_json::to_value(execution) {
        Ok(Value::Object(map)) => map.get(index).cloned().unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

fn sort_by_index<T>(items: &mut [T], index: &str, descending: bool, value: fn(&T, &str) -> Value) {
    items.sort_by(|a, b| {
        let ord = compare_json(&value(a, index), &value(b, index));
        if descending {
            ord.reverse()
        } else {
            ord
        }
    });
}

// Index ordering over JSON values: null < number < string < everything else.
fn compare_json(a: &Value, b: &Value) -> std::cmp::Ordering {
    use std::cmp::Ordering;
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Null, _) => Ordering::Less,
        (_, Value::Null) => Ordering::Greater,
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .partial_cmp(&y.as_f64())
            .unwrap_or(Ordering::Equal),
        (Value::Number(_), _) => Ordering::Less,
        (_, Value::Number(_)) => Ordering::Greater,
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => Ordering::Equal,
    }
}
