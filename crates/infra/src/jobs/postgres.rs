//! Postgres-backed job store.
//!
//! Each job is one row. The full [`Job`] record lives in a JSONB document; the
//! columns the queue orders and filters on (`status`, `priority`, `sequence`,
//! `run_at`, `batch_id`) are kept alongside it so claiming stays an index scan.
//!
//! ## Claiming
//!
//! `dequeue_next` selects the best ready row with `FOR UPDATE SKIP LOCKED` inside a
//! transaction, so concurrent workers (in this or another process) skip rows that
//! are already being claimed instead of blocking on them.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database / PoolClosed / other | `Storage` |
//! | Document decode failure | `Storage` |
//! | Missing row | `NotFound` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use renderq_core::JobId;

use super::store::{JobStore, JobStoreError};
use super::types::{
    CancelOutcome, InvalidTransition, Job, JobFailure, JobFilter, JobStats, JobStatus, NewJob,
    Progress,
};

const SCHEMA: &str = r#"
CREATE SEQUENCE IF NOT EXISTS render_job_sequence;

CREATE TABLE IF NOT EXISTS render_jobs (
    id          UUID PRIMARY KEY,
    sequence    BIGINT NOT NULL,
    status      TEXT NOT NULL,
    priority    SMALLINT NOT NULL,
    run_at      TIMESTAMPTZ NULL,
    batch_id    UUID NULL,
    kind        TEXT NOT NULL,
    doc         JSONB NOT NULL,
    updated_at  TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS render_jobs_ready_idx
    ON render_jobs (priority, sequence)
    WHERE status IN ('pending', 'delayed');

CREATE INDEX IF NOT EXISTS render_jobs_batch_idx
    ON render_jobs (batch_id)
    WHERE batch_id IS NOT NULL;
"#;

/// Postgres-backed [`JobStore`].
///
/// `Send + Sync`; all access goes through the sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str) -> Result<Self, JobStoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        let store = Self::new(pool);
        store.ensure_schema().await?;
        Ok(store)
    }

    /// Create the table, sequence and indexes if missing.
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        Ok(())
    }

    async fn begin(&self) -> Result<Transaction<'static, Postgres>, JobStoreError> {
        self.pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))
    }

    /// Lock one row, apply a transition, write it back.
    async fn update<F>(&self, operation: &str, id: JobId, apply: F) -> Result<Job, JobStoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), JobStoreError> + Send,
    {
        let mut tx = self.begin().await?;
        let mut job = load_for_update(&mut tx, operation, id).await?;
        apply(&mut job)?;
        save(&mut tx, operation, &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }
}

async fn load_for_update(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    id: JobId,
) -> Result<Job, JobStoreError> {
    let row = sqlx::query("SELECT doc FROM render_jobs WHERE id = $1 FOR UPDATE")
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await
        .map_err(|e| map_sqlx_error(operation, e))?
        .ok_or(JobStoreError::NotFound(id))?;
    decode(operation, &row)
}

async fn save(
    tx: &mut Transaction<'static, Postgres>,
    operation: &str,
    job: &Job,
) -> Result<(), JobStoreError> {
    sqlx::query(
        r#"
        UPDATE render_jobs
        SET status = $2, priority = $3, run_at = $4, doc = $5, updated_at = $6
        WHERE id = $1
        "#,
    )
    .bind(job.id.as_uuid())
    .bind(job.status.as_str())
    .bind(i16::from(job.priority.value()))
    .bind(job.run_at)
    .bind(Json(job))
    .bind(job.updated_at)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(())
}

fn decode(operation: &str, row: &sqlx::postgres::PgRow) -> Result<Job, JobStoreError> {
    let Json(job): Json<Job> = row
        .try_get("doc")
        .map_err(|e| map_sqlx_error(operation, e))?;
    Ok(job)
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(kind = %job.kind, priority = %job.priority), err)]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, JobStoreError> {
        let mut tx = self.begin().await?;

        let sequence: i64 = sqlx::query_scalar("SELECT nextval('render_job_sequence')")
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("next_sequence", e))?;
        let job = Job::from_new(job, sequence as u64, Utc::now());

        sqlx::query(
            r#"
            INSERT INTO render_jobs (id, sequence, status, priority, run_at, batch_id, kind, doc, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(job.id.as_uuid())
        .bind(sequence)
        .bind(job.status.as_str())
        .bind(i16::from(job.priority.value()))
        .bind(job.run_at)
        .bind(job.batch_id.map(uuid::Uuid::from))
        .bind(job.kind.as_str())
        .bind(Json(&job))
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job.id)
    }

    async fn dequeue_next(&self) -> Result<Option<Job>, JobStoreError> {
        let mut tx = self.begin().await?;
        let now = Utc::now();

        let row = sqlx::query(
            r#"
            SELECT doc FROM render_jobs
            WHERE status = 'pending' OR (status = 'delayed' AND (run_at IS NULL OR run_at <= $1))
            ORDER BY priority ASC, sequence ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(now)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("dequeue_next", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut job = decode("dequeue_next", &row)?;
        job.mark_processing(now)?;
        save(&mut tx, "dequeue_next", &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Some(job))
    }

    async fn mark_completed(&self, id: JobId, result: Value) -> Result<Job, JobStoreError> {
        self.update("mark_completed", id, |job| {
            Ok(job.mark_completed(result, Utc::now())?)
        })
        .await
    }

    async fn mark_failed(&self, id: JobId, failure: JobFailure) -> Result<Job, JobStoreError> {
        self.update("mark_failed", id, |job| {
            Ok(job.mark_failed(failure, Utc::now())?)
        })
        .await
    }

    async fn schedule_retry(
        &self,
        id: JobId,
        failure: JobFailure,
        run_at: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.update("schedule_retry", id, |job| {
            Ok(job.schedule_retry(failure, run_at, Utc::now())?)
        })
        .await
    }

    async fn mark_cancelled(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.update("mark_cancelled", id, |job| Ok(job.mark_cancelled(Utc::now())?))
            .await
    }

    async fn update_progress(&self, id: JobId, progress: Progress) -> Result<(), JobStoreError> {
        self.update("update_progress", id, |job| {
            if job.status != JobStatus::Processing {
                return Err(InvalidTransition {
                    job_id: id,
                    from: job.status,
                    to: JobStatus::Processing,
                }
                .into());
            }
            job.progress = progress;
            job.updated_at = Utc::now();
            Ok(())
        })
        .await
        .map(|_| ())
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query("SELECT doc FROM render_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?;
        row.map(|row| decode("get", &row)).transpose()
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let limit = filter.limit.map(|l| l as i64).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            r#"
            SELECT doc FROM render_jobs
            WHERE ($1::TEXT IS NULL OR status = $1)
              AND ($2::TEXT IS NULL OR kind = $2)
              AND ($3::UUID IS NULL OR batch_id = $3)
            ORDER BY sequence ASC
            LIMIT $4
            "#,
        )
        .bind(filter.status.map(|s| s.as_str()))
        .bind(filter.kind.map(|k| k.as_str()))
        .bind(filter.batch_id.map(uuid::Uuid::from))
        .bind(limit)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("list", e))?;

        rows.iter().map(|row| decode("list", row)).collect()
    }

    async fn remove(&self, id: JobId) -> Result<Job, JobStoreError> {
        let mut tx = self.begin().await?;
        let job = load_for_update(&mut tx, "remove", id).await?;
        if job.status == JobStatus::Processing {
            return Err(InvalidTransition {
                job_id: id,
                from: job.status,
                to: JobStatus::Cancelled,
            }
            .into());
        }
        sqlx::query("DELETE FROM render_jobs WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("remove", e))?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    async fn cancel(&self, id: JobId) -> Result<CancelOutcome, JobStoreError> {
        let mut tx = self.begin().await?;
        let mut job = load_for_update(&mut tx, "cancel", id).await?;
        let now = Utc::now();

        let outcome = match job.status {
            JobStatus::Pending | JobStatus::Delayed => {
                job.mark_cancelled(now)?;
                CancelOutcome::Cancelled
            }
            JobStatus::Processing => {
                job.cancel_requested = true;
                job.updated_at = now;
                CancelOutcome::Requested
            }
            status => return Ok(CancelOutcome::AlreadyFinished { status }),
        };

        save(&mut tx, "cancel", &job).await?;
        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(outcome)
    }

    async fn retry(&self, id: JobId) -> Result<Job, JobStoreError> {
        self.update("retry", id, |job| Ok(job.reset_for_retry(Utc::now())?))
            .await
    }

    async fn clear(&self) -> Result<usize, JobStoreError> {
        let result = sqlx::query("DELETE FROM render_jobs")
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("clear", e))?;
        Ok(result.rows_affected() as usize)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM render_jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("stats", e))?;

        let mut stats = JobStats::default();
        for row in rows {
            let status: String = row.try_get("status").map_err(|e| map_sqlx_error("stats", e))?;
            let n: i64 = row.try_get("n").map_err(|e| map_sqlx_error("stats", e))?;
            let status: JobStatus = status
                .parse()
                .map_err(|e| JobStoreError::Storage(format!("stats: {e}")))?;
            for _ in 0..n {
                stats.record(status);
            }
        }
        Ok(stats)
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}
