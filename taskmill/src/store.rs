//! The store contract: relational tables acting as queues.
//!
//! Every operation is a single-row, single-statement affair; the one
//! exception is plan counter recomputation, which reads many rows and writes
//! one and stays safe under interleaving by being recomputed from scratch.
//!
//! Two implementations exist: [`memory::MemoryStore`] in this crate and the
//! SQLite store in `taskmill-sqlx`. Both must pass the
//! [`store_test_suite!`](crate::store_test_suite) checks in [`testing`].
//!
//! All time-dependent operations take `now` as a parameter rather than
//! reading the clock, so the scheduler evaluates one instant per tick and
//! tests can move time freely.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

use crate::executor::ExecutionError;
use crate::job::{JobId, JobStatus};
use crate::plan::{Account, AccountId, NewAccount, NewPlan, NewPlanItem, Plan, PlanId, PlanItem, PlanItemId};

pub mod memory;
pub mod testing;

/// A job row as stored, with the payload still raw.
///
/// Executors receive the typed view [`crate::job::Job`] instead.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub progress: u8,
    pub attempts: u32,
    pub max_attempts: u32,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub scheduled_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn is_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// A job as handed to [`JobStore::insert`] by a producer.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: String,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("plan {0} not found")]
    PlanNotFound(PlanId),
    #[error("plan item {0} not found")]
    ItemNotFound(PlanItemId),
    #[error("store in bad state")]
    BadState,
    #[error("error encoding or decoding data")]
    Encode(#[from] serde_json::Error),
    #[error("database error: {0}")]
    Database(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl StoreError {
    /// Wrap a driver-level error. Used by database-backed implementations.
    pub fn database(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Database(Box::new(error))
    }
}

/// The queue table contract.
///
/// Claiming and the terminal callbacks are conditional updates whose outcome
/// is decided by the affected-row count, never by read-then-write.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `pending` row and return its id.
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError>;

    async fn job(&self, id: JobId) -> Result<Job, StoreError>;

    /// Full-row write. Administrative; the scheduler itself only uses the
    /// targeted operations below.
    async fn update_job(&self, job: Job) -> Result<(), StoreError>;

    /// Pending jobs of `kind` whose scheduled time has arrived and whose
    /// attempt budget is not exhausted, in insertion order.
    async fn list_due(
        &self,
        kind: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError>;

    /// Take exclusive ownership of one pending row.
    ///
    /// Equivalent to:
    ///
    /// ```sql
    /// UPDATE jobs SET status='running', locked_by=:worker, locked_at=:now,
    ///                 attempts=attempts+1, started_at=:now, updated_at=:now
    /// WHERE id=:id
    ///   AND status='pending'
    ///   AND attempts < max_attempts
    ///   AND (locked_at IS NULL OR locked_at < :now - :stale_timeout)
    /// ```
    ///
    /// Returns true iff exactly one row was affected. False means another
    /// worker won, or the row is no longer eligible; the caller abandons
    /// silently either way.
    async fn claim(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
        stale_timeout: TimeDelta,
    ) -> Result<bool, StoreError>;

    /// Return abandoned `running` rows of `kind` to `pending`, preserving
    /// `attempts`. Returns the number of rows recovered.
    async fn reset_stale(
        &self,
        kind: &str,
        now: DateTime<Utc>,
        stale_timeout: TimeDelta,
    ) -> Result<u64, StoreError>;

    /// Surface pending rows whose attempt budget ran out as terminal `fail`.
    /// Without this check an exhausted row would sit `pending` forever,
    /// invisible to both dispatch and the caller.
    async fn fail_exhausted(&self, kind: &str, now: DateTime<Utc>) -> Result<u64, StoreError>;

    /// Advisory progress write, fenced on `status='running' AND
    /// locked_by=:worker`. A stale writer's update is dropped silently.
    async fn set_progress(
        &self,
        id: JobId,
        worker: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Terminal success, fenced on the claimant identity. Returns false when
    /// the fence rejected the write (the claim was superseded).
    async fn mark_success(
        &self,
        id: JobId,
        worker: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Terminal failure, fenced like [`JobStore::mark_success`]. A
    /// non-retryable error additionally pins `attempts` to `max_attempts` so
    /// the row can never be claimed again.
    async fn mark_fail(
        &self,
        id: JobId,
        worker: &str,
        error: &ExecutionError,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Terminal stop, fenced like [`JobStore::mark_success`].
    async fn mark_stopped(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Policy-driven reset of a terminal `fail` row back to `pending`,
    /// conditional on `attempts < max_attempts`. This is the only sanctioned
    /// way back out of a terminal state.
    async fn reset_for_retry(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError>;
}

/// The batch-producer tables: plans, their items, and the accounts that
/// items are assigned to round-robin.
#[async_trait]
pub trait PlanStore: Send + Sync {
    async fn create_plan(&self, plan: NewPlan) -> Result<PlanId, StoreError>;

    async fn add_item(&self, item: NewPlanItem) -> Result<PlanItemId, StoreError>;

    async fn plan(&self, id: PlanId) -> Result<Plan, StoreError>;

    /// Full-row write, used by counter recomputation.
    async fn update_plan(&self, plan: Plan) -> Result<(), StoreError>;

    /// Plans whose trigger time has arrived and which still have work to do
    /// (`pending` or `publishing`).
    async fn due_plans(&self, now: DateTime<Utc>) -> Result<Vec<Plan>, StoreError>;

    /// All items of a plan in insertion order.
    async fn items(&self, plan: PlanId) -> Result<Vec<PlanItem>, StoreError>;

    async fn update_item(&self, item: PlanItem) -> Result<(), StoreError>;

    async fn add_account(&self, account: NewAccount) -> Result<AccountId, StoreError>;

    /// Eligible accounts in insertion order; the round-robin cursor indexes
    /// into this list.
    async fn accounts(&self) -> Result<Vec<Account>, StoreError>;
}

/// Convenience bound for everything the scheduler needs from a store.
pub trait Store: JobStore + PlanStore {}

impl<S> Store for S where S: JobStore + PlanStore {}
