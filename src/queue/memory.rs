//! In-memory queue backend mirroring the Postgres semantics, for tests.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::Result;
use crate::models::JobPayload;

use super::{Job, JobState, Queue, QueueCounts, RetryPolicy, STALL_REASON};

pub struct MemoryQueue {
    jobs: Mutex<HashMap<String, Job>>,
    policy: RetryPolicy,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::with_policy(RetryPolicy::default())
    }

    pub fn with_policy(policy: RetryPolicy) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            policy,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().expect("memory queue poisoned")
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Queue for MemoryQueue {
    async fn enqueue(&self, queue: &str, job_id: &str, payload: JobPayload) -> Result<bool> {
        let mut jobs = self.lock();
        if jobs.contains_key(job_id) {
            return Ok(false);
        }
        jobs.insert(
            job_id.to_string(),
            Job {
                job_id: job_id.to_string(),
                queue: queue.to_string(),
                payload,
                state: JobState::Pending,
                attempts: 0,
                max_attempts: self.policy.max_attempts,
                run_at: Utc::now(),
                heartbeat_at: None,
                error: None,
                created_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn enqueue_batch(
        &self,
        queue: &str,
        batch: Vec<(String, JobPayload)>,
    ) -> Result<u64> {
        let mut inserted = 0u64;
        for (job_id, payload) in batch {
            if self.enqueue(queue, &job_id, payload).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Job>> {
        let mut jobs = self.lock();
        let now = Utc::now();
        let next_id = jobs
            .values()
            .filter(|j| j.queue == queue && j.state == JobState::Pending && j.run_at <= now)
            .min_by_key(|j| (j.run_at, j.created_at, j.job_id.clone()))
            .map(|j| j.job_id.clone());

        Ok(next_id.map(|id| {
            let job = jobs.get_mut(&id).expect("job exists");
            job.state = JobState::Active;
            job.attempts += 1;
            job.heartbeat_at = Some(now);
            job.clone()
        }))
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        if let Some(job) = self.lock().get_mut(job_id) {
            job.state = JobState::Completed;
            job.error = None;
        }
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        if let Some(job) = self.lock().get_mut(job_id) {
            if job.state != JobState::Active {
                return Ok(());
            }
            job.error = Some(error.to_string());
            if job.attempts >= job.max_attempts {
                job.state = JobState::Failed;
            } else {
                job.state = JobState::Pending;
                let backoff = self.policy.backoff_after(job.attempts);
                job.run_at = Utc::now()
                    + ChronoDuration::milliseconds(backoff.as_millis() as i64);
            }
        }
        Ok(())
    }

    async fn heartbeat(&self, job_id: &str) -> Result<()> {
        if let Some(job) = self.lock().get_mut(job_id) {
            if job.state == JobState::Active {
                job.heartbeat_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let jobs = self.lock();
        let mut counts = QueueCounts::default();
        for job in jobs.values().filter(|j| j.queue == queue) {
            match job.state {
                JobState::Pending => counts.pending += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list_jobs(&self, queue: &str, state: Option<JobState>) -> Result<Vec<Job>> {
        let jobs = self.lock();
        let mut out: Vec<_> = jobs
            .values()
            .filter(|j| j.queue == queue && state.map_or(true, |s| j.state == s))
            .cloned()
            .collect();
        out.sort_by_key(|j| j.created_at);
        Ok(out)
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        Ok(self.lock().remove(job_id).is_some())
    }

    async fn purge(&self, queue: &str) -> Result<u64> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, j| j.queue != queue);
        Ok((before - jobs.len()) as u64)
    }

    async fn recover_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let mut jobs = self.lock();
        let mut stalled = Vec::new();
        for job in jobs.values_mut() {
            let last_beat = job.heartbeat_at.unwrap_or(job.created_at);
            if job.state == JobState::Active && last_beat < cutoff {
                job.state = JobState::Failed;
                job.error = Some(STALL_REASON.to_string());
                stalled.push(job.clone());
            }
        }
        Ok(stalled)
    }

    async fn prune(
        &self,
        completed_older_than: DateTime<Utc>,
        failed_older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, j| match j.state {
            JobState::Completed => j.created_at >= completed_older_than,
            JobState::Failed => j.created_at >= failed_older_than,
            _ => true,
        });
        Ok((before - jobs.len()) as u64)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
