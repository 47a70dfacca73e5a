//! Postgres-backed durable queue.
//!
//! Jobs live in a single `jobs` table keyed by the idempotency `job_id`;
//! `ON CONFLICT DO NOTHING` implements enqueue dedup and
//! `FOR UPDATE SKIP LOCKED` lets concurrent workers claim without
//! contention. The broker URL may equal the store URL, but the queue keeps
//! its own pool so broker traffic never starves store transactions; sqlx
//! re-establishes dropped connections with bounded backoff on its own.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;

use crate::error::{Error, Result};
use crate::models::JobPayload;

use super::{Job, JobState, Queue, QueueCounts, RetryPolicy, STALL_REASON};

const JOB_COLS: &str =
    "job_id, queue, payload, state, attempts, max_attempts, run_at, heartbeat_at, error, created_at";

pub struct PgQueue {
    pool: PgPool,
    policy: RetryPolicy,
}

impl PgQueue {
    pub fn new(pool: PgPool, policy: RetryPolicy) -> Self {
        Self { pool, policy }
    }

    pub async fn connect(url: &str, policy: RetryPolicy) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| Error::QueueUnavailable(e.to_string()))?;
        Ok(Self::new(pool, policy))
    }

    /// Creates the jobs table and its claim index. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                payload JSONB NOT NULL,
                state TEXT NOT NULL DEFAULT 'pending',
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 3,
                run_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                heartbeat_at TIMESTAMPTZ,
                error TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_jobs_claim ON jobs(queue, state, run_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;

        Ok(())
    }
}

fn queue_err(e: sqlx::Error) -> Error {
    Error::QueueUnavailable(e.to_string())
}

fn job_from_row(row: &PgRow) -> Result<Job> {
    let state: String = row.get("state");
    let payload: serde_json::Value = row.get("payload");
    Ok(Job {
        job_id: row.get("job_id"),
        queue: row.get("queue"),
        payload: serde_json::from_value::<JobPayload>(payload)
            .map_err(|e| Error::QueueUnavailable(format!("undecodable job payload: {e}")))?,
        state: state
            .parse()
            .map_err(|e: String| Error::QueueUnavailable(e))?,
        attempts: row.get::<i32, _>("attempts") as u32,
        max_attempts: row.get::<i32, _>("max_attempts") as u32,
        run_at: row.get("run_at"),
        heartbeat_at: row.get("heartbeat_at"),
        error: row.get("error"),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl Queue for PgQueue {
    async fn enqueue(&self, queue: &str, job_id: &str, payload: JobPayload) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (job_id, queue, payload, max_attempts)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job_id) DO NOTHING
            "#,
        )
        .bind(job_id)
        .bind(queue)
        .bind(
            serde_json::to_value(&payload)
                .map_err(|e| Error::QueueUnavailable(format!("unserializable payload: {e}")))?,
        )
        .bind(self.policy.max_attempts as i32)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn enqueue_batch(
        &self,
        queue: &str,
        jobs: Vec<(String, JobPayload)>,
    ) -> Result<u64> {
        let mut inserted = 0u64;
        for (job_id, payload) in jobs {
            if self.enqueue(queue, &job_id, payload).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn dequeue(&self, queue: &str) -> Result<Option<Job>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET
                state = 'active',
                attempts = attempts + 1,
                heartbeat_at = NOW(),
                updated_at = NOW()
            WHERE job_id = (
                SELECT job_id FROM jobs
                WHERE queue = $1 AND state = 'pending' AND run_at <= NOW()
                ORDER BY run_at, created_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {JOB_COLS}
            "#
        ))
        .bind(queue)
        .fetch_optional(&self.pool)
        .await
        .map_err(queue_err)?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn complete(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET state = 'completed', error = NULL, updated_at = NOW() \
             WHERE job_id = $1",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(())
    }

    async fn fail(&self, job_id: &str, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET
                state = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                run_at = CASE WHEN attempts >= max_attempts THEN run_at
                              ELSE NOW() + ($2::bigint * POWER(2, GREATEST(attempts - 1, 0)))::bigint
                                   * interval '1 millisecond' END,
                error = $3,
                updated_at = NOW()
            WHERE job_id = $1 AND state = 'active'
            "#,
        )
        .bind(job_id)
        .bind(self.policy.initial_backoff.as_millis() as i64)
        .bind(error)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(())
    }

    async fn heartbeat(&self, job_id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET heartbeat_at = NOW(), updated_at = NOW() \
             WHERE job_id = $1 AND state = 'active'",
        )
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(())
    }

    async fn counts(&self, queue: &str) -> Result<QueueCounts> {
        let row = sqlx::query(
            "SELECT COUNT(*) FILTER (WHERE state = 'pending') AS pending, \
                    COUNT(*) FILTER (WHERE state = 'active') AS active, \
                    COUNT(*) FILTER (WHERE state = 'completed') AS completed, \
                    COUNT(*) FILTER (WHERE state = 'failed') AS failed \
             FROM jobs WHERE queue = $1",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await
        .map_err(queue_err)?;

        Ok(QueueCounts {
            pending: row.get("pending"),
            active: row.get("active"),
            completed: row.get("completed"),
            failed: row.get("failed"),
        })
    }

    async fn list_jobs(&self, queue: &str, state: Option<JobState>) -> Result<Vec<Job>> {
        let rows = match state {
            Some(s) => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLS} FROM jobs WHERE queue = $1 AND state = $2 \
                     ORDER BY created_at"
                ))
                .bind(queue)
                .bind(s.to_string())
                .fetch_all(&self.pool)
                .await
                .map_err(queue_err)?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {JOB_COLS} FROM jobs WHERE queue = $1 ORDER BY created_at"
                ))
                .bind(queue)
                .fetch_all(&self.pool)
                .await
                .map_err(queue_err)?
            }
        };
        rows.iter().map(job_from_row).collect()
    }

    async fn remove(&self, job_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        Ok(result.rows_affected() == 1)
    }

    async fn purge(&self, queue: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM jobs WHERE queue = $1")
            .bind(queue)
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        Ok(result.rows_affected())
    }

    async fn recover_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Job>> {
        let rows = sqlx::query(&format!(
            r#"
            UPDATE jobs SET state = 'failed', error = $2, updated_at = NOW()
            WHERE state = 'active' AND COALESCE(heartbeat_at, created_at) < $1
            RETURNING {JOB_COLS}
            "#
        ))
        .bind(cutoff)
        .bind(STALL_REASON)
        .fetch_all(&self.pool)
        .await
        .map_err(queue_err)?;

        rows.iter().map(job_from_row).collect()
    }

    async fn prune(
        &self,
        completed_older_than: DateTime<Utc>,
        failed_older_than: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE \
             (state = 'completed' AND updated_at < $1) OR \
             (state = 'failed' AND updated_at < $2)",
        )
        .bind(completed_older_than)
        .bind(failed_older_than)
        .execute(&self.pool)
        .await
        .map_err(queue_err)?;
        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(queue_err)?;
        Ok(())
    }
}
