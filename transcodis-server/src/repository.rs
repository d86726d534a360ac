//! The job repository: the only component with direct Postgres access.
//! Every mutation is transactional and `apply_event` is idempotent by
//! `event_id`, mirroring the event ordering guarantee in the system spec.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgPoolOptions};
use thiserror::Error;
use transcodis_core::job::{Job, JobStatus, TaskEvent};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// Filter/pagination for [`JobRepository::list`] (spec.md §4.1:
/// `list(filter)`).
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub offset: i64,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self { status: None, limit: 100, offset: 0 }
    }
}

#[derive(Clone)]
pub struct JobRepository {
    pool: PgPool,
}

impl JobRepository {
    pub async fn connect(dsn: &str) -> RepositoryResult<Self> {
        let pool = PgPoolOptions::new().max_connections(20).connect(dsn).await?;
        Ok(Self { pool })
    }

    /// Wraps an already-migrated pool, for integration tests driven by
    /// `#[sqlx::test]`'s own pool fixture rather than [`Self::connect`].
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> RepositoryResult<()> {
        crate::MIGRATOR.run(&self.pool).await.map_err(|e| {
            RepositoryError::Database(sqlx::Error::Migrate(Box::new(e)))
        })
    }

    /// Idempotent by `(source_path, destination_path)` (§4.1): a
    /// resubmission of a job already on file returns the existing row
    /// untouched rather than creating a duplicate.
    pub async fn add_job(&self, source_path: &str, destination_path: &str, priority: i32) -> RepositoryResult<Job> {
        let job = Job::new(Uuid::new_v4(), source_path.to_string(), destination_path.to_string(), priority);

        let row = sqlx::query(
            r#"
            INSERT INTO jobs (id, source_path, destination_path, priority, status, event_id, scheduled_at, last_event_at, worker_name, last_message)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (source_path, destination_path) DO NOTHING
            RETURNING id, source_path, destination_path, priority, status, event_id, scheduled_at, last_event_at, worker_name, last_message
            "#,
        )
        .bind(job.id)
        .bind(&job.source_path)
        .bind(&job.destination_path)
        .bind(job.priority)
        .bind(job.status)
        .bind(job.event_id)
        .bind(job.scheduled_at)
        .bind(job.last_event_at)
        .bind(&job.worker_name)
        .bind(&job.last_message)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row_to_job(&row)),
            None => self.get_by_source_destination(source_path, destination_path).await,
        }
    }

    async fn get_by_source_destination(&self, source_path: &str, destination_path: &str) -> RepositoryResult<Job> {
        let row = sqlx::query(
            r#"SELECT id, source_path, destination_path, priority, status, event_id, scheduled_at, last_event_at, worker_name, last_message FROM jobs WHERE source_path = $1 AND destination_path = $2"#,
        )
        .bind(source_path)
        .bind(destination_path)
        .fetch_one(&self.pool)
        .await?;

        Ok(row_to_job(&row))
    }

    pub async fn get(&self, id: Uuid) -> RepositoryResult<Job> {
        let row = sqlx::query(
            r#"SELECT id, source_path, destination_path, priority, status, event_id, scheduled_at, last_event_at, worker_name, last_message FROM jobs WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::NotFound(id))?;

        Ok(row_to_job(&row))
    }

    pub async fn list(&self, filter: &JobFilter) -> RepositoryResult<Vec<Job>> {
        let rows = sqlx::query(
            r#"
            SELECT id, source_path, destination_path, priority, status, event_id, scheduled_at, last_event_at, worker_name, last_message
            FROM jobs
            WHERE ($1::text IS NULL OR status = $1)
            ORDER BY scheduled_at ASC
            LIMIT $2 OFFSET $3
            "#,
        )
        .bind(filter.status)
        .bind(filter.limit)
        .bind(filter.offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_job).collect())
    }

    /// Jobs eligible for dispatch: freshly queued, or stuck past
    /// `job_timeout` in an active stage (reclaim candidates), ordered by
    /// priority then submission time, capped at `limit` rows. The
    /// candidate rows are locked with `FOR UPDATE SKIP LOCKED` and
    /// transitioned to `added` in the same transaction (spec.md §4.1),
    /// so a concurrent tick can neither double-select them nor observe
    /// them half-updated; this folds stuck-job reclamation into the same
    /// atomic step regardless of whether the stuck job still carries a
    /// `worker_name`.
    pub async fn select_schedulable(&self, limit: i64, job_timeout_seconds: i64) -> RepositoryResult<Vec<Job>> {
        let mut tx = self.pool.begin().await?;

        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id
            FROM jobs
            WHERE status = 'queued'
               OR (status IN ('added', 'downloading', 'encoding', 'uploading')
                   AND last_event_at < now() - make_interval(secs => $1))
            ORDER BY priority DESC, scheduled_at ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(job_timeout_seconds as f64)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'added', event_id = event_id + 1, scheduled_at = now(), last_event_at = now(), worker_name = NULL
            WHERE id = ANY($1)
            RETURNING id, source_path, destination_path, priority, status, event_id, scheduled_at, last_event_at, worker_name, last_message
            "#,
        )
        .bind(&ids)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        let position: HashMap<Uuid, usize> = ids.iter().enumerate().map(|(i, id)| (*id, i)).collect();
        let mut jobs: Vec<Job> = rows.iter().map(row_to_job).collect();
        jobs.sort_by_key(|job| position[&job.id]);
        Ok(jobs)
    }

    /// Marks a job dispatched onto the broker, moving it to `added` and
    /// bumping `event_id`. Not called from the scheduler's own dispatch
    /// path anymore (`select_schedulable` already performs this
    /// transition atomically); kept as a standalone operation for
    /// tests and any caller that needs to force a job into `added`
    /// directly.
    pub async fn mark_dispatched(&self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query(
            r#"UPDATE jobs SET status = 'added', event_id = event_id + 1, last_event_at = now() WHERE id = $1"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Resets a stuck job back to `queued` for redispatch (§8 Testable
    /// Property 8 — reclaim). A no-op if the job has moved on since the
    /// scheduler observed it as stuck.
    pub async fn reclaim(&self, id: Uuid, observed_event_id: i64) -> RepositoryResult<bool> {
        let result = sqlx::query(
            r#"UPDATE jobs SET status = 'queued', worker_name = NULL WHERE id = $1 AND event_id = $2 AND status <> 'completed' AND status <> 'canceled'"#,
        )
        .bind(id)
        .bind(observed_event_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn cancel(&self, id: Uuid) -> RepositoryResult<()> {
        sqlx::query(
            r#"UPDATE jobs SET status = 'canceled', event_id = event_id + 1, last_event_at = now() WHERE id = $1 AND status <> 'completed' AND status <> 'canceled'"#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Applies a worker's `TaskEvent` inside one transaction: the job row
    /// is locked with `FOR UPDATE` so a concurrent applier can't race the
    /// read-modify-write, a `job_events` audit row is recorded whether
    /// the event is accepted or discarded as stale, and the `jobs`
    /// projection is only updated on acceptance.
    pub async fn apply_event(&self, event: &TaskEvent) -> RepositoryResult<bool> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"SELECT id, source_path, destination_path, priority, status, event_id, scheduled_at, last_event_at, worker_name, last_message FROM jobs WHERE id = $1 FOR UPDATE"#,
        )
        .bind(event.job_id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(RepositoryError::NotFound(event.job_id))?;

        let mut job = row_to_job(&row);
        let accepted = job.apply_event(event);

        sqlx::query(
            r#"
            INSERT INTO job_events (job_id, event_id, worker_name, event_time, notification_type, status, message, accepted)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(event.job_id)
        .bind(event.event_id)
        .bind(&event.worker_name)
        .bind(event.event_time)
        .bind(event.notification_type)
        .bind(event.status)
        .bind(&event.message)
        .bind(accepted)
        .execute(&mut *tx)
        .await?;

        if accepted {
            sqlx::query(
                r#"UPDATE jobs SET status = $2, event_id = $3, last_event_at = $4, worker_name = $5, last_message = $6 WHERE id = $1"#,
            )
            .bind(job.id)
            .bind(job.status)
            .bind(job.event_id)
            .bind(job.last_event_at)
            .bind(&job.worker_name)
            .bind(&job.last_message)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(accepted)
    }
}

fn row_to_job(row: &sqlx::postgres::PgRow) -> Job {
    Job {
        id: row.get("id"),
        source_path: row.get("source_path"),
        destination_path: row.get("destination_path"),
        priority: row.get("priority"),
        status: row.get::<JobStatus, _>("status"),
        event_id: row.get("event_id"),
        scheduled_at: row.get::<DateTime<Utc>, _>("scheduled_at"),
        last_event_at: row.get::<DateTime<Utc>, _>("last_event_at"),
        worker_name: row.get("worker_name"),
        last_message: row.get("last_message"),
    }
}
