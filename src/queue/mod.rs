//! Durable job queue abstraction.
//!
//! Two logical queues exist: `folders` and `images` (see
//! [`crate::models::FOLDER_QUEUE`] / [`crate::models::IMAGE_QUEUE`]). Every
//! job carries a client-supplied `job_id` — the idempotency key — and a typed
//! [`JobPayload`]; a second enqueue under the same key is a no-op.
//!
//! # Lifecycle
//!
//! ```text
//! enqueue → pending ──dequeue──▶ active ──complete──▶ completed
//!              ▲                   │
//!              └──(attempts left)──┤ fail
//!                                  └──(exhausted)──▶ failed
//! ```
//!
//! Retry policy: three attempts by default, exponential backoff starting at
//! 2 s. Active jobs heartbeat; any job active for longer than the stall
//! threshold without one is declared stalled and moved to `failed` with
//! reason "worker restart recovery" by [`Queue::recover_stalled`].
//!
//! Retention is bounded: completed jobs are pruned aggressively, failed jobs
//! kept longer for inspection.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::Result;
use crate::models::JobPayload;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Active,
    Completed,
    Failed,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Job {
    pub job_id: String,
    pub queue: String,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    pub run_at: DateTime<Utc>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Per-queue job counts for the health surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// Retry policy shared by the queue backends.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the given (1-based) attempt is retried: doubles each
    /// time, so 2 s, 4 s, 8 s under the defaults.
    pub fn backoff_after(&self, attempt: u32) -> Duration {
        self.initial_backoff * 2u32.pow(attempt.saturating_sub(1).min(10))
    }
}

/// Durable FIFO with idempotency keys and stalled-job recovery.
#[async_trait]
pub trait Queue: Send + Sync {
    /// Enqueues a job. Returns `false` when `job_id` already exists
    /// (idempotent no-op).
    async fn enqueue(&self, queue: &str, job_id: &str, payload: JobPayload) -> Result<bool>;

    /// Enqueues many jobs; returns how many were new.
    async fn enqueue_batch(
        &self,
        queue: &str,
        jobs: Vec<(String, JobPayload)>,
    ) -> Result<u64>;

    /// Claims the next due pending job, marking it active and recording a
    /// heartbeat. Returns `None` when the queue is drained.
    async fn dequeue(&self, queue: &str) -> Result<Option<Job>>;

    async fn complete(&self, job_id: &str) -> Result<()>;

    /// Records a failure: re-schedules with backoff while attempts remain,
    /// otherwise moves the job to `failed`.
    async fn fail(&self, job_id: &str, error: &str) -> Result<()>;

    async fn heartbeat(&self, job_id: &str) -> Result<()>;

    async fn counts(&self, queue: &str) -> Result<QueueCounts>;

    async fn list_jobs(&self, queue: &str, state: Option<JobState>) -> Result<Vec<Job>>;

    /// Removes a job outright. Returns `false` when it did not exist.
    async fn remove(&self, job_id: &str) -> Result<bool>;

    /// Drops every job in the queue; returns how many were removed.
    async fn purge(&self, queue: &str) -> Result<u64>;

    /// Declares active jobs without a heartbeat since `cutoff` stalled,
    /// moving them to `failed` with reason "worker restart recovery".
    /// Returns the affected jobs.
    async fn recover_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>>;

    /// Applies the retention policy; returns how many jobs were pruned.
    async fn prune(
        &self,
        completed_older_than: DateTime<Utc>,
        failed_older_than: DateTime<Utc>,
    ) -> Result<u64>;

    /// Broker connectivity probe.
    async fn ping(&self) -> Result<()>;
}

/// Stall reason recorded by [`Queue::recover_stalled`].
pub const STALL_REASON: &str = "worker restart recovery";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff_after(1), Duration::from_secs(2));
        assert_eq!(policy.backoff_after(2), Duration::from_secs(4));
        assert_eq!(policy.backoff_after(3), Duration::from_secs(8));
        // Capped exponent keeps the arithmetic sane on absurd attempt counts.
        assert_eq!(policy.backoff_after(40), policy.backoff_after(11));
    }

    #[test]
    fn job_state_roundtrip() {
        for s in [
            JobState::Pending,
            JobState::Active,
            JobState::Completed,
            JobState::Failed,
        ] {
            assert_eq!(s.to_string().parse::<JobState>().unwrap(), s);
        }
    }
}
