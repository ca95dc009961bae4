//! The cron scheduler: one timer task per scheduled job, firing triggers
//! into the agent's run path.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::task::JoinHandle;
use tokio_util::task::TaskTracker;

use crate::extcron::{self, ExtSchedule, ScheduleError};
use crate::job::Job;

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("scheduler: cron already started, should be stopped first")]
    AlreadyStarted,

    #[error(transparent)]
    Schedule(#[from] ScheduleError),
}

/// What the scheduler fires into when a cron entry is due.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run_job(&self, job_name: String);
}

struct Entry {
    job: Job,
    schedule: ExtSchedule,
    /// Present while the scheduler is started.
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    started: bool,
    entries: HashMap<String, Entry>,
    /// Tracks in-flight triggers so `stop` can wait for them to drain.
    tracker: TaskTracker,
}

pub struct Scheduler {
    runner: Arc<dyn JobRunner>,
    inner: Mutex<Inner>,
}

impl Scheduler {
    pub fn new(runner: Arc<dyn JobRunner>) -> Self {
        Self {
            runner,
            inner: Mutex::new(Inner {
                started: false,
                entries: HashMap::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    /// Install the given jobs and start firing. Only valid while stopped;
    /// entries added while stopped are discarded.
    pub fn start(&self, jobs: Vec<Job>) -> Result<(), SchedulerError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.started {
                return Err(SchedulerError::AlreadyStarted);
            }
            inner.entries.clear();
            inner.started = true;
        }

        for job in jobs {
            self.add_job(&job)?;
        }

        let inner = self.inner.lock().unwrap();
        tracing::debug!(entries = inner.entries.len(), "scheduler: started");
        Ok(())
    }

    /// Stop firing new triggers. The returned future resolves once every
    /// in-flight trigger has finished. Idempotent.
    pub fn stop(&self) -> impl std::future::Future<Output = ()> {
        let tracker = {
            let mut inner = self.inner.lock().unwrap();
            for (_, entry) in inner.entries.drain() {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
            }
            if inner.started {
                tracing::debug!("scheduler: Stopping scheduler");
                inner.started = false;
            }
            let tracker = std::mem::replace(&mut inner.tracker, TaskTracker::new());
            tracker.close();
            tracker
        };
        async move { tracker.wait().await }
    }

    /// Stop, wait for in-flight triggers, then start with a fresh job set.
    pub async fn restart(&self, jobs: Vec<Job>) -> Result<(), SchedulerError> {
        self.stop().await;
        self.start(jobs)
    }

    pub fn started(&self) -> bool {
        self.inner.lock().unwrap().started
    }

    /// Add a job to the scheduler, replacing any existing entry with the
    /// same name. Disabled jobs and child jobs are not scheduled.
    pub fn add_job(&self, job: &Job) -> Result<(), SchedulerError> {
        self.remove_job(&job.name);

        if job.disabled || !job.parent_job.is_empty() {
            return Ok(());
        }

        let spec = schedule_spec(job);
        let schedule = extcron::parse(&spec)?;

        tracing::debug!(job = %job.name, schedule = %spec, "scheduler: Adding job to cron");

        let started = self.inner.lock().unwrap().started;
        let timer = started.then(|| self.spawn_timer(job.name.clone(), schedule.clone()));
        let mut inner = self.inner.lock().unwrap();
        inner.entries.insert(
            job.name.clone(),
            Entry {
                job: job.clone(),
                schedule,
                timer,
            },
        );
        Ok(())
    }

    /// Remove a job from the scheduler if present.
    pub fn remove_job(&self, job_name: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(job_name) {
            tracing::debug!(job = %job_name, "scheduler: Removing job from cron");
            if let Some(timer) = entry.timer {
                timer.abort();
            }
        }
    }

    /// Snapshot lookup of a scheduled entry with its computed next fire.
    pub fn get_cron_entry_job(&self, job_name: &str) -> Option<(Job, Option<DateTime<Utc>>)> {
        let inner = self.inner.lock().unwrap();
        inner.entries.get(job_name).map(|entry| {
            let next = entry.schedule.next_after(Utc::now());
            (entry.job.clone(), next)
        })
    }

    fn spawn_timer(&self, job_name: String, schedule: ExtSchedule) -> JoinHandle<()> {
        let runner = self.runner.clone();
        let tracker = self.inner.lock().unwrap().tracker.clone();

        tokio::spawn(async move {
            loop {
                let now = Utc::now();
                // A schedule with no next fire (e.g. on demand only) parks
                // this entry forever.
                let Some(next) = schedule.next_after(now) else {
                    return;
                };
                let delay = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(delay).await;

                let runner = runner.clone();
                let name = job_name.clone();
                tracker.spawn(async move {
                    runner.run_job(name).await;
                });
            }
        })
    }
}

/// The cron spec actually registered: the hash-expanded schedule, with the
/// job's timezone injected unless the spec is a descriptor or already
/// carries one.
fn schedule_spec(job: &Job) -> String {
    let spec = job.schedule_hash();
    if !job.timezone.is_empty()
        && !spec.starts_with('@')
        && !spec.starts_with("TZ=")
        && !spec.starts_with("CRON_TZ=")
    {
        format!("CRON_TZ={} {}", job.timezone, spec)
    } else {
        spec
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run_job(&self, _job_name: String) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn scheduler() -> (Arc<CountingRunner>, Scheduler) {
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
        });
        let sched = Scheduler::new(runner.clone());
        (runner, sched)
    }

    fn job(name: &str, schedule: &str) -> Job {
        Job {
            name: name.into(),
            schedule: schedule.into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let (_, sched) = scheduler();
        sched.start(vec![]).unwrap();
        assert!(sched.started());
        assert!(matches!(
            sched.start(vec![]),
            Err(SchedulerError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (_, sched) = scheduler();
        sched.stop().await;
        sched.start(vec![]).unwrap();
        sched.stop().await;
        assert!(!sched.started());
        sched.stop().await;
    }

    #[tokio::test]
    async fn test_interval_job_fires() {
        let (runner, sched) = scheduler();
        sched
            .start(vec![job("tick", "@every 50ms")])
            .unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        sched.stop().await;

        let runs = runner.runs.load(Ordering::SeqCst);
        assert!(runs >= 2, "expected repeated fires, got {runs}");

        // Nothing fires after stop.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let after = runner.runs.load(Ordering::SeqCst);
        assert!(after <= runs + 1);
    }

    #[tokio::test]
    async fn test_disabled_and_child_jobs_are_not_scheduled() {
        let (_, sched) = scheduler();

        let mut disabled = job("off", "@every 1s");
        disabled.disabled = true;
        let mut child = job("child", "");
        child.parent_job = "parent".into();

        sched.start(vec![disabled, child]).unwrap();
        assert!(sched.get_cron_entry_job("off").is_none());
        assert!(sched.get_cron_entry_job("child").is_none());
    }

    #[tokio::test]
    async fn test_add_job_replaces_entry() {
        let (_, sched) = scheduler();
        sched.start(vec![job("j", "@every 1h")]).unwrap();

        let (_, next1) = sched.get_cron_entry_job("j").unwrap();
        assert!(next1.is_some());

        sched.add_job(&job("j", "@every 10h")).unwrap();
        let (stored, next2) = sched.get_cron_entry_job("j").unwrap();
        assert_eq!(stored.schedule, "@every 10h");
        assert!(next2.unwrap() > next1.unwrap() + chrono::Duration::hours(8));
    }

    #[tokio::test]
    async fn test_restart_replaces_job_set() {
        let (_, sched) = scheduler();
        sched.start(vec![job("old", "@every 1h")]).unwrap();

        sched.restart(vec![job("new", "@every 1h")]).await.unwrap();
        assert!(sched.started());
        assert!(sched.get_cron_entry_job("old").is_none());
        assert!(sched.get_cron_entry_job("new").is_some());
    }

    #[tokio::test]
    async fn test_remove_job_is_idempotent() {
        let (_, sched) = scheduler();
        sched.start(vec![job("j", "@every 1h")]).unwrap();
        sched.remove_job("j");
        assert!(sched.get_cron_entry_job("j").is_none());
        sched.remove_job("j");
    }

    #[test]
    fn test_schedule_spec_timezone_rewrite() {
        let mut j = job("j", "0 30 9 * * *");
        j.timezone = "Europe/Madrid".into();
        assert_eq!(schedule_spec(&j), "CRON_TZ=Europe/Madrid 0 30 9 * * *");

        // Descriptors and explicit prefixes are left alone.
        j.schedule = "@hourly".into();
        assert_eq!(schedule_spec(&j), "@hourly");
        j.schedule = "TZ=UTC 0 30 9 * * *".into();
        assert_eq!(schedule_spec(&j), "TZ=UTC 0 30 9 * * *");
    }
}
