//! Leader-side dispatch: target selection, the outbound execution stream
//! and the completion path with retries, notifications and dependent jobs.

use std::collections::HashMap;

use chrono::Utc;
use rand::Rng;

use crate::agent::Agent;
use crate::error::{CronmeshError, Result, BROKEN_STREAM_SENTINEL};
use crate::execution::Execution;
use crate::fsm::{self, FsmResponse, MessageType};
use crate::gossip::{Member, MemberStatus};
use crate::job::{self, Job};
use crate::proto;

/// What the completion path decided to do with a finished execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DoneOutcome {
    Retry,
    Deleted,
    Saved,
}

impl DoneOutcome {
    pub fn payload(self) -> &'static [u8] {
        match self {
            DoneOutcome::Retry => b"retry",
            DoneOutcome::Deleted => b"deleted",
            DoneOutcome::Saved => b"saved",
        }
    }
}

impl Agent {
    /// Dispatch an execution of `job_name` to its target nodes and wait for
    /// every stream to finish. Returns the job with its refreshed next run.
    pub async fn run_agent(&self, job_name: &str, execution: Execution) -> Result<Job> {
        let mut job = self.store.get_job(job_name).map_err(|e| {
            CronmeshError::Internal(format!(
                "agent: Run error retrieving job: {job_name} from store: {e}"
            ))
        })?;

        // For top-level jobs, persist the next fire time before dispatch so
        // replicas agree on it even if this trigger crashes mid-way.
        if job.parent_job.is_empty() {
            match self.scheduler().get_cron_entry_job(job_name) {
                Some((_, next)) => {
                    job.next = next;
                    self.apply_set_job(&job.to_proto()).await.map_err(|e| {
                        CronmeshError::Internal(format!(
                            "agent: Run error storing job {job_name} before running: {e}"
                        ))
                    })?;
                }
                None => {
                    return Err(CronmeshError::Internal(format!(
                        "agent: Run error retrieving job: {job_name} from scheduler"
                    )));
                }
            }
        }

        // First attempt fans out by tag; retries stick to the original node.
        let target_nodes = if execution.attempt <= 1 {
            self.get_target_nodes(&job.tags)
        } else {
            let member = self
                .gossip
                .members()
                .into_iter()
                .find(|m| m.name == execution.node_name);
            match member {
                Some(m) if m.status == MemberStatus::Alive => vec![m],
                _ => {
                    return Err(CronmeshError::RetryNodeGone {
                        node: execution.node_name.clone(),
                        job: execution.job_name.clone(),
                    });
                }
            }
        };

        if target_nodes.is_empty() {
            return Err(CronmeshError::NoTargetNodes(execution.job_name.clone()));
        }
        tracing::debug!(nodes = ?target_nodes.iter().map(|n| &n.name).collect::<Vec<_>>(), "agent: Filtered nodes to run");

        let mut calls = Vec::new();
        for node in target_nodes {
            let addr = node
                .tags
                .get("rpc_addr")
                .cloned()
                .unwrap_or_else(|| format!("{}:{}", node.addr, node.port));

            tracing::info!(job = %job.name, node = %addr, "agent: Calling AgentRun");
            let job_name = job.name.clone();
            let job_pb = job.to_proto();
            let execution_pb = execution.to_proto();
            calls.push(async move {
                if let Err(e) = self.call_agent_run(&addr, job_pb, execution_pb).await {
                    tracing::error!(job = %job_name, node = %addr, error = %e, "agent: Error calling AgentRun");
                }
            });
        }
        futures::future::join_all(calls).await;

        Ok(job)
    }

    /// Nodes that are alive, in our region and match every job tag, capped
    /// at the lowest cardinality given in the tag values.
    fn get_target_nodes(&self, tags: &HashMap<String, String>) -> Vec<Member> {
        let (bare_tags, cardinality) = clean_tags(tags);
        let qualifiers: Vec<Member> = self
            .gossip
            .members()
            .into_iter()
            .filter(|m| {
                m.status == MemberStatus::Alive
                    && m.tags.get("region") == Some(&self.config.region)
                    && node_matches_tags(m, &bare_tags)
            })
            .collect();
        select_nodes(qualifiers, cardinality)
    }

    /// Open the execution stream to one worker and pump frames until it
    /// finishes, replicating the first frame and reporting the result.
    async fn call_agent_run(
        &self,
        addr: &str,
        job: proto::Job,
        execution: proto::Execution,
    ) -> Result<()> {
        let mut client = self.client.connect_agent(addr).await?;
        let mut stream = client
            .agent_run(proto::AgentRunRequest {
                job: Some(job.clone()),
                execution: Some(execution.clone()),
            })
            .await?
            .into_inner();

        let mut last = execution;
        let mut first = false;
        let mut registered: Vec<String> = Vec::new();

        let result = loop {
            match stream.message().await {
                Ok(Some(frame)) => {
                    let Some(frame_execution) = frame.execution else {
                        continue;
                    };
                    let key = Execution::from_proto(&frame_execution).key();
                    tracing::debug!(key = %key, "grpc: received execution stream");

                    self.active_executions
                        .lock()
                        .unwrap()
                        .insert(key.clone(), frame_execution.clone());
                    registered.push(key);
                    last = frame_execution;

                    if !first {
                        first = true;
                        self.replicate_set_execution(&last).await?;
                        let domain = Execution::from_proto(&last);
                        if let Err(e) = self
                            .notifier
                            .send_pre_notifications(&Job::from_proto(&job), &domain)
                            .await
                        {
                            tracing::error!(
                                job = %job.name,
                                node = %self.config.node_name,
                                error = %e,
                                "agent: Error sending start notification"
                            );
                        }
                    }
                }
                Ok(None) => {
                    // Stream ended cleanly; the worker's final frame is the
                    // result.
                    let done = Execution::from_proto(&last);
                    break self.send_execution_done(done).await;
                }
                Err(status) => {
                    // The worker vanished mid-run. Close the execution with
                    // the broken-stream marker so the leader won't retry.
                    tracing::error!(error = %status, "{BROKEN_STREAM_SENTINEL}");
                    let mut done = Execution::from_proto(&last);
                    done.finished_at = Some(Utc::now());
                    done.output = format!("{BROKEN_STREAM_SENTINEL}: {status}").into_bytes();
                    let send = self.send_execution_done(done).await;
                    break send.and(Err(status.into()));
                }
            }
        };

        let mut active = self.active_executions.lock().unwrap();
        for key in registered {
            active.remove(&key);
        }
        drop(active);

        result
    }

    /// Replicate a SetExecution, applying locally on the leader and
    /// forwarding otherwise.
    async fn replicate_set_execution(&self, execution: &proto::Execution) -> Result<()> {
        if self.is_leader().await {
            self.raft_apply(fsm::encode(MessageType::SetExecution, execution))
                .await?;
            return Ok(());
        }
        let addr = self
            .leader_addr()
            .await
            .ok_or(CronmeshError::NotLeader)?;
        self.client.set_execution(&addr, execution).await
    }

    /// Route a finished execution to the completion path, on this node when
    /// it is the leader, over RPC otherwise.
    pub async fn send_execution_done(&self, execution: Execution) -> Result<()> {
        if self.is_leader().await {
            self.execution_done_flow(execution).await.map(|_| ())
        } else {
            let addr = match self.leader_addr().await {
                Some(addr) => addr,
                None => self.check_and_select_server().await?,
            };
            self.client.execution_done(&addr, &execution).await
        }
    }

    /// The leader-side completion path: processors, replication, retry
    /// decision, notifications, dependent jobs and ephemeral cleanup.
    pub async fn execution_done_flow(&self, execution: Execution) -> Result<DoneOutcome> {
        tracing::debug!(
            group = execution.group,
            job = %execution.job_name,
            from = %execution.node_name,
            "grpc: Received execution done"
        );

        if !self.is_leader().await {
            // Forward to the leader and tell the caller we did.
            if let Some(addr) = self.leader_addr().await {
                let _ = self.client.execution_done(&addr, &execution).await;
            }
            return Err(CronmeshError::NotLeader);
        }

        let job = self.store.get_job(&execution.job_name)?;

        // Run the execution through the configured processor chain before
        // replicating the result.
        let mut pbex = execution.to_proto();
        for (name, config) in &job.processors {
            tracing::info!(plugin = %name, "grpc: Processing execution with plugin");
            match self.plugins.processors.get(name) {
                Some(processor) => {
                    let mut config = config.clone();
                    config.insert(
                        "reporting_node".to_string(),
                        self.config.node_name.clone(),
                    );
                    match processor.process(pbex.clone(), config).await {
                        Ok(transformed) => pbex = transformed,
                        Err(e) => {
                            tracing::error!(plugin = %name, error = %e, "grpc: Processor failed");
                        }
                    }
                }
                None => {
                    tracing::error!(plugin = %name, "grpc: Specified plugin not found");
                }
            }
        }

        self.raft_apply(fsm::encode(
            MessageType::ExecutionDone,
            &proto::ExecutionDoneRequest {
                execution: Some(pbex.clone()),
            },
        ))
        .await?;

        // Work on stored values from here on.
        let job = self.store.get_job(&execution.job_name)?;
        let mut execution = Execution::from_proto(&pbex);

        // Only execution failures attributable to the job are retried; a
        // broken stream means the result is unknown and must stand.
        let output_str = String::from_utf8_lossy(&execution.output);
        if !execution.success
            && execution.attempt < job.retries + 1
            && !output_str.starts_with(BROKEN_STREAM_SENTINEL)
        {
            execution.attempt += 1;
            execution.output.clear();

            let backoff = execution.calculate_exponential_backoff();
            tracing::debug!(
                attempt = execution.attempt,
                job = %execution.job_name,
                backoff = ?backoff,
                "grpc: Retrying execution"
            );
            tokio::time::sleep(backoff).await;

            let job_name = execution.job_name.clone();
            Box::pin(self.run_agent(&job_name, execution)).await?;
            return Ok(DoneOutcome::Retry);
        }

        let group = self.store.get_execution_group(
            &execution,
            &crate::store::ExecutionOptions {
                timezone: job.time_location(),
                ..Default::default()
            },
        )?;

        if let Err(e) = self
            .notifier
            .send_post_notifications(&job, &execution, &group)
            .await
        {
            tracing::error!(error = %e, "grpc: Error sending notification");
        }

        // Dependent jobs run once the whole group succeeded.
        if !job.dependent_jobs.is_empty() && job.status == job::STATUS_SUCCESS {
            for dependent in &job.dependent_jobs {
                tracing::debug!(job = %dependent, "grpc: Running dependent job");
                if let Err(e) = Box::pin(self.trigger_job(dependent)).await {
                    tracing::error!(job = %dependent, error = %e, "grpc: Error running dependent job");
                }
            }
        }

        if job.ephemeral && job.status == job::STATUS_SUCCESS {
            self.delete_job(&job.name).await?;
            tracing::info!(job = %job.name, "grpc: Done deleting ephemeral job");
            return Ok(DoneOutcome::Deleted);
        }

        Ok(DoneOutcome::Saved)
    }

    /// Replicate a DeleteJob and drop the scheduler entry. Leader only.
    pub async fn delete_job(&self, job_name: &str) -> Result<Job> {
        let response = self
            .raft_apply(fsm::encode(
                MessageType::DeleteJob,
                &proto::DeleteJobRequest {
                    job_name: job_name.to_string(),
                },
            ))
            .await?;

        let job = match response {
            FsmResponse::Job(job) => *job,
            other => {
                return Err(CronmeshError::Internal(format!(
                    "grpc: Error wrong response from apply in DeleteJob: {other:?}"
                )));
            }
        };

        self.scheduler().remove_job(&job.name);
        Ok(job)
    }

    /// Validate, replicate and schedule a job. Leader only.
    pub async fn set_job(&self, job_pb: &proto::Job) -> Result<Job> {
        let job = Job::from_proto(job_pb);
        job.validate()?;

        self.apply_set_job(job_pb).await?;

        // The stored copy carries merged counters and the computed next.
        let stored = self.store.get_job(&job.name)?;
        self.scheduler().add_job(&stored)?;
        Ok(stored)
    }
}

// A tag value may carry a `:N` cardinality suffix; the effective
// cardinality is the minimum across all tags.
fn clean_tags(tags: &HashMap<String, String>) -> (HashMap<String, String>, usize) {
    let mut cardinality = usize::MAX;
    let mut bare = HashMap::with_capacity(tags.len());

    for (key, value) in tags {
        match value.split_once(':') {
            Some((bare_value, card)) => {
                bare.insert(key.clone(), bare_value.to_string());
                let card = card.parse().unwrap_or_else(|_| {
                    tracing::error!(tag = %key, value = %card, "improper cardinality specified for tag");
                    0
                });
                cardinality = cardinality.min(card);
            }
            None => {
                bare.insert(key.clone(), value.clone());
            }
        }
    }

    (bare, cardinality)
}

fn node_matches_tags(node: &Member, tags: &HashMap<String, String>) -> bool {
    tags.iter()
        .all(|(key, value)| node.tags.get(key) == Some(value))
}

/// Choose up to `cardinality` nodes uniformly at random without
/// replacement.
fn select_nodes(mut nodes: Vec<Member>, cardinality: usize) -> Vec<Member> {
    let mut num_nodes = nodes.len();
    if num_nodes <= cardinality {
        return nodes;
    }

    let mut rng = rand::thread_rng();
    for _ in 0..cardinality {
        let chosen = rng.gen_range(0..num_nodes);
        nodes.swap(chosen, num_nodes - 1);
        num_nodes -= 1;
    }
    nodes.split_off(num_nodes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, tags: &[(&str, &str)]) -> Member {
        Member {
            name: name.into(),
            addr: "127.0.0.1".parse().unwrap(),
            port: 8946,
            status: MemberStatus::Alive,
            tags: tags
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_clean_tags_strips_cardinality() {
        let tags = HashMap::from([
            ("role".to_string(), "web:2".to_string()),
            ("zone".to_string(), "a".to_string()),
        ]);
        let (bare, cardinality) = clean_tags(&tags);
        assert_eq!(bare["role"], "web");
        assert_eq!(bare["zone"], "a");
        assert_eq!(cardinality, 2);
    }

    #[test]
    fn test_clean_tags_takes_minimum_cardinality() {
        let tags = HashMap::from([
            ("a".to_string(), "x:5".to_string()),
            ("b".to_string(), "y:2".to_string()),
        ]);
        let (_, cardinality) = clean_tags(&tags);
        assert_eq!(cardinality, 2);
    }

    #[test]
    fn test_clean_tags_malformed_cardinality_is_zero() {
        let tags = HashMap::from([("a".to_string(), "x:lots".to_string())]);
        let (_, cardinality) = clean_tags(&tags);
        assert_eq!(cardinality, 0);
    }

    #[test]
    fn test_node_matches_tags() {
        let node = member("n1", &[("role", "web"), ("zone", "a")]);
        assert!(node_matches_tags(
            &node,
            &HashMap::from([("role".to_string(), "web".to_string())])
        ));
        assert!(!node_matches_tags(
            &node,
            &HashMap::from([("role".to_string(), "db".to_string())])
        ));
        assert!(!node_matches_tags(
            &node,
            &HashMap::from([("missing".to_string(), "x".to_string())])
        ));
    }

    #[test]
    fn test_select_nodes_caps_at_cardinality() {
        let nodes: Vec<Member> = (0..10).map(|i| member(&format!("n{i}"), &[])).collect();

        let all = select_nodes(nodes.clone(), 20);
        assert_eq!(all.len(), 10);

        let selected = select_nodes(nodes.clone(), 3);
        assert_eq!(selected.len(), 3);
        // No duplicates.
        let mut names: Vec<_> = selected.iter().map(|n| n.name.clone()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 3);

        let none = select_nodes(nodes, 0);
        assert!(none.is_empty());
    }

    #[test]
    fn test_select_nodes_is_roughly_uniform() {
        let nodes: Vec<Member> = (0..4).map(|i| member(&format!("n{i}"), &[])).collect();
        let mut counts: HashMap<String, usize> = HashMap::new();
        for _ in 0..2000 {
            for node in select_nodes(nodes.clone(), 1) {
                *counts.entry(node.name).or_default() += 1;
            }
        }
        for count in counts.values() {
            // Each of the 4 nodes should land near 500 picks.
            assert!(*count > 300, "selection looks skewed: {counts:?}");
        }
    }
}
