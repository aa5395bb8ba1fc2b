//! SQLite store for the taskmill job queue.
//!
//! One center node plus any number of worker processes share a single
//! database file; that file is the whole coordination layer. The claim
//! protocol and both sweeps are single conditional `UPDATE` statements whose
//! affected-row count decides the outcome, so there is no read-then-write
//! race anywhere in the store.
//!
//! Schema migrations are embedded and run by [`SqliteStore::from_pool`].

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use taskmill::executor::ExecutionError;
use taskmill::job::JobId;
use taskmill::store::{Job, JobStore, NewJob, StoreError};

mod plans;
mod types;

use types::{millis, JobRow};

pub(crate) const JOB_COLUMNS: &str = "id, kind, payload, status, progress, attempts, \
     max_attempts, locked_by, locked_at, error_message, result, created_at, scheduled_at, \
     started_at, completed_at, updated_at";

#[derive(Clone, Debug)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Wrap an existing pool, running any pending migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(StoreError::database)?;
        tracing::debug!("taskmill sqlite schema up to date");
        Ok(Self { pool })
    }

    /// Open (and create if missing) a database at `url`, e.g.
    /// `sqlite://data/taskmill.db`.
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(db)?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .connect_with(options)
            .await
            .map_err(db)?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database, for tests and scratch queues.
    ///
    /// Pinned to a single pooled connection: an in-memory SQLite database
    /// lives and dies with its connection.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(db)?;
        Self::from_pool(pool).await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

pub(crate) fn db(error: sqlx::Error) -> StoreError {
    StoreError::database(error)
}

#[async_trait]
impl JobStore for SqliteStore {
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let now = millis(Utc::now());
        let id = sqlx::query_scalar::<_, i64>(
            r"INSERT INTO taskmill_jobs (kind, payload, max_attempts, created_at, scheduled_at, updated_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?4)
              RETURNING id",
        )
        .bind(&job.kind)
        .bind(serde_json::to_string(&job.payload)?)
        .bind(i64::from(job.max_attempts))
        .bind(now)
        .bind(millis(job.scheduled_at))
        .fetch_one(&self.pool)
        .await
        .map_err(db)?;
        Ok(id.into())
    }

    async fn job(&self, id: JobId) -> Result<Job, StoreError> {
        sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {JOB_COLUMNS} FROM taskmill_jobs WHERE id = ?1"
        ))
        .bind(i64::from(id))
        .fetch_optional(&self.pool)
        .await
        .map_err(db)?
        .ok_or(StoreError::JobNotFound(id))?
        .try_into()
    }

    async fn update_job(&self, job: Job) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_jobs SET
                kind = ?2,
                payload = ?3,
                status = ?4,
                progress = ?5,
                attempts = ?6,
                max_attempts = ?7,
                locked_by = ?8,
                locked_at = ?9,
                error_message = ?10,
                result = ?11,
                created_at = ?12,
                scheduled_at = ?13,
                started_at = ?14,
                completed_at = ?15,
                updated_at = ?16
              WHERE id = ?1",
        )
        .bind(i64::from(job.id))
        .bind(&job.kind)
        .bind(serde_json::to_string(&job.payload)?)
        .bind(job.status.as_str())
        .bind(i64::from(job.progress))
        .bind(i64::from(job.attempts))
        .bind(i64::from(job.max_attempts))
        .bind(&job.locked_by)
        .bind(types::opt_millis(job.locked_at))
        .bind(&job.error_message)
        .bind(job.result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(millis(job.created_at))
        .bind(millis(job.scheduled_at))
        .bind(types::opt_millis(job.started_at))
        .bind(types::opt_millis(job.completed_at))
        .bind(millis(job.updated_at))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::JobNotFound(job.id));
        }
        Ok(())
    }

    async fn list_due(
        &self,
        kind: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        sqlx::query_as::<_, JobRow>(&format!(
            r"SELECT {JOB_COLUMNS} FROM taskmill_jobs
              WHERE kind = ?1
                AND status = 'pending'
                AND scheduled_at <= ?2
                AND attempts < max_attempts
              ORDER BY id
              LIMIT ?3"
        ))
        .bind(kind)
        .bind(millis(now))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db)?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn claim(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
        stale_timeout: TimeDelta,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_jobs
              SET status = 'running',
                  locked_by = ?2,
                  locked_at = ?3,
                  attempts = attempts + 1,
                  started_at = ?3,
                  updated_at = ?3
              WHERE id = ?1
                AND status = 'pending'
                AND attempts < max_attempts
                AND (locked_at IS NULL OR locked_at < ?4)",
        )
        .bind(i64::from(id))
        .bind(worker)
        .bind(millis(now))
        .bind(millis(now - stale_timeout))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_stale(
        &self,
        kind: &str,
        now: DateTime<Utc>,
        stale_timeout: TimeDelta,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_jobs
              SET status = 'pending', updated_at = ?2
              WHERE kind = ?1
                AND status = 'running'
                AND locked_at < ?3",
        )
        .bind(kind)
        .bind(millis(now))
        .bind(millis(now - stale_timeout))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn fail_exhausted(&self, kind: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_jobs
              SET status = 'fail',
                  error_message = COALESCE(error_message, 'retry attempts exhausted'),
                  locked_by = NULL,
                  locked_at = NULL,
                  completed_at = ?2,
                  updated_at = ?2
              WHERE kind = ?1
                AND status = 'pending'
                AND attempts >= max_attempts",
        )
        .bind(kind)
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected())
    }

    async fn set_progress(
        &self,
        id: JobId,
        worker: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r"UPDATE taskmill_jobs
              SET progress = ?3, updated_at = ?4
              WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
        )
        .bind(i64::from(id))
        .bind(worker)
        .bind(i64::from(progress.min(100)))
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(())
    }

    async fn mark_success(
        &self,
        id: JobId,
        worker: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_jobs
              SET status = 'success',
                  progress = 100,
                  result = ?3,
                  locked_by = NULL,
                  locked_at = NULL,
                  completed_at = ?4,
                  updated_at = ?4
              WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
        )
        .bind(i64::from(id))
        .bind(worker)
        .bind(result.as_ref().map(serde_json::to_string).transpose()?)
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_fail(
        &self,
        id: JobId,
        worker: &str,
        error: &ExecutionError,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_jobs
              SET status = 'fail',
                  error_message = ?3,
                  attempts = CASE WHEN ?4 THEN attempts ELSE max_attempts END,
                  locked_by = NULL,
                  locked_at = NULL,
                  completed_at = ?5,
                  updated_at = ?5
              WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
        )
        .bind(i64::from(id))
        .bind(worker)
        .bind(&error.message)
        .bind(error.retryable)
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_stopped(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_jobs
              SET status = 'stopped',
                  locked_by = NULL,
                  locked_at = NULL,
                  completed_at = ?3,
                  updated_at = ?3
              WHERE id = ?1 AND status = 'running' AND locked_by = ?2",
        )
        .bind(i64::from(id))
        .bind(worker)
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_for_retry(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_jobs
              SET status = 'pending',
                  error_message = NULL,
                  progress = 0,
                  completed_at = NULL,
                  locked_by = NULL,
                  locked_at = NULL,
                  updated_at = ?2
              WHERE id = ?1 AND status = 'fail' AND attempts < max_attempts",
        )
        .bind(i64::from(id))
        .bind(millis(now))
        .execute(&self.pool)
        .await
        .map_err(db)?;
        Ok(result.rows_affected() == 1)
    }
}

#[cfg(test)]
mod test {
    use taskmill::store_test_suite;

    use super::*;

    store_test_suite!(attr: tokio::test, store: SqliteStore::in_memory().await.unwrap());

    #[tokio::test]
    async fn clones_share_the_same_queue() {
        let store = SqliteStore::in_memory().await.unwrap();
        let other = store.clone();

        let id = store
            .insert(taskmill::store::NewJob {
                kind: "video-publish".to_owned(),
                payload: serde_json::json!({"material_id": 1}),
                max_attempts: 3,
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap();

        let job = other.job(id).await.unwrap();
        assert_eq!(job.kind, "video-publish");
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let store = SqliteStore::in_memory().await.unwrap();
        SqliteStore::from_pool(store.pool().clone()).await.unwrap();
    }
}
