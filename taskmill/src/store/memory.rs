//! An in-memory implementation of the store contract.
//!
//! Correct rather than fast: every operation takes the one big lock and
//! applies the same predicates the SQL store expresses in `WHERE` clauses.
//! Used by the scheduler tests and anywhere a throwaway queue is handy.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};

use crate::executor::ExecutionError;
use crate::job::{JobId, JobStatus};
use crate::plan::{
    Account, AccountId, NewAccount, NewPlan, NewPlanItem, Plan, PlanId, PlanItem, PlanItemId,
    PlanStatus, PlanItemStatus,
};
use crate::store::{Job, JobStore, NewJob, PlanStore, StoreError};

#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    jobs: Vec<Job>,
    plans: Vec<Plan>,
    items: Vec<PlanItem>,
    accounts: Vec<Account>,
    next_job_id: i64,
    next_plan_id: i64,
    next_item_id: i64,
    next_account_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, StoreError> {
        self.inner.read().map_err(|_| StoreError::BadState)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, StoreError> {
        self.inner.write().map_err(|_| StoreError::BadState)
    }
}

impl Inner {
    fn job_mut(&mut self, id: JobId) -> Result<&mut Job, StoreError> {
        self.jobs
            .iter_mut()
            .find(|job| job.id == id)
            .ok_or(StoreError::JobNotFound(id))
    }
}

fn clear_lock(job: &mut Job) {
    job.locked_by = None;
    job.locked_at = None;
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn insert(&self, job: NewJob) -> Result<JobId, StoreError> {
        let mut inner = self.write()?;
        inner.next_job_id += 1;
        let id = JobId::from(inner.next_job_id);
        let now = Utc::now();
        inner.jobs.push(Job {
            id,
            kind: job.kind,
            payload: job.payload,
            status: JobStatus::Pending,
            progress: 0,
            attempts: 0,
            max_attempts: job.max_attempts,
            locked_by: None,
            locked_at: None,
            error_message: None,
            result: None,
            created_at: now,
            scheduled_at: job.scheduled_at,
            started_at: None,
            completed_at: None,
            updated_at: now,
        });
        Ok(id)
    }

    async fn job(&self, id: JobId) -> Result<Job, StoreError> {
        self.read()?
            .jobs
            .iter()
            .find(|job| job.id == id)
            .cloned()
            .ok_or(StoreError::JobNotFound(id))
    }

    async fn update_job(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let slot = inner.job_mut(job.id)?;
        *slot = job;
        Ok(())
    }

    async fn list_due(
        &self,
        kind: &str,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StoreError> {
        let inner = self.read()?;
        let mut due: Vec<Job> = inner
            .jobs
            .iter()
            .filter(|job| {
                job.kind == kind
                    && job.status == JobStatus::Pending
                    && job.scheduled_at <= now
                    && job.attempts < job.max_attempts
            })
            .cloned()
            .collect();
        due.sort_by_key(|job| job.id);
        due.truncate(limit);
        Ok(due)
    }

    async fn claim(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
        stale_timeout: TimeDelta,
    ) -> Result<bool, StoreError> {
        let stale_before = now - stale_timeout;
        let mut inner = self.write()?;
        let Some(job) = inner.jobs.iter_mut().find(|job| job.id == id) else {
            return Ok(false);
        };
        let eligible = job.status == JobStatus::Pending
            && job.attempts < job.max_attempts
            && job.locked_at.map_or(true, |locked_at| locked_at < stale_before);
        if !eligible {
            return Ok(false);
        }
        job.status = JobStatus::Running;
        job.locked_by = Some(worker.to_owned());
        job.locked_at = Some(now);
        job.attempts += 1;
        job.started_at = Some(now);
        job.updated_at = now;
        Ok(true)
    }

    async fn reset_stale(
        &self,
        kind: &str,
        now: DateTime<Utc>,
        stale_timeout: TimeDelta,
    ) -> Result<u64, StoreError> {
        let stale_before = now - stale_timeout;
        let mut count = 0;
        let mut inner = self.write()?;
        for job in inner.jobs.iter_mut() {
            if job.kind == kind
                && job.status == JobStatus::Running
                && job.locked_at.is_some_and(|locked_at| locked_at < stale_before)
            {
                job.status = JobStatus::Pending;
                job.updated_at = now;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn fail_exhausted(&self, kind: &str, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut count = 0;
        let mut inner = self.write()?;
        for job in inner.jobs.iter_mut() {
            if job.kind == kind
                && job.status == JobStatus::Pending
                && job.attempts >= job.max_attempts
            {
                job.status = JobStatus::Fail;
                job.error_message
                    .get_or_insert_with(|| "retry attempts exhausted".to_owned());
                job.completed_at = Some(now);
                job.updated_at = now;
                clear_lock(job);
                count += 1;
            }
        }
        Ok(count)
    }

    async fn set_progress(
        &self,
        id: JobId,
        worker: &str,
        progress: u8,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        if let Some(job) = inner.jobs.iter_mut().find(|job| {
            job.id == id
                && job.status == JobStatus::Running
                && job.locked_by.as_deref() == Some(worker)
        }) {
            job.progress = progress.min(100);
            job.updated_at = now;
        }
        Ok(())
    }

    async fn mark_success(
        &self,
        id: JobId,
        worker: &str,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let Some(job) = inner.jobs.iter_mut().find(|job| {
            job.id == id
                && job.status == JobStatus::Running
                && job.locked_by.as_deref() == Some(worker)
        }) else {
            return Ok(false);
        };
        job.status = JobStatus::Success;
        job.progress = 100;
        job.result = result;
        job.completed_at = Some(now);
        job.updated_at = now;
        clear_lock(job);
        Ok(true)
    }

    async fn mark_fail(
        &self,
        id: JobId,
        worker: &str,
        error: &ExecutionError,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let Some(job) = inner.jobs.iter_mut().find(|job| {
            job.id == id
                && job.status == JobStatus::Running
                && job.locked_by.as_deref() == Some(worker)
        }) else {
            return Ok(false);
        };
        job.status = JobStatus::Fail;
        job.error_message = Some(error.message.clone());
        if !error.retryable {
            job.attempts = job.max_attempts;
        }
        job.completed_at = Some(now);
        job.updated_at = now;
        clear_lock(job);
        Ok(true)
    }

    async fn mark_stopped(
        &self,
        id: JobId,
        worker: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let Some(job) = inner.jobs.iter_mut().find(|job| {
            job.id == id
                && job.status == JobStatus::Running
                && job.locked_by.as_deref() == Some(worker)
        }) else {
            return Ok(false);
        };
        job.status = JobStatus::Stopped;
        job.completed_at = Some(now);
        job.updated_at = now;
        clear_lock(job);
        Ok(true)
    }

    async fn reset_for_retry(&self, id: JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let mut inner = self.write()?;
        let Some(job) = inner.jobs.iter_mut().find(|job| {
            job.id == id && job.status == JobStatus::Fail && job.attempts < job.max_attempts
        }) else {
            return Ok(false);
        };
        job.status = JobStatus::Pending;
        job.error_message = None;
        job.progress = 0;
        job.completed_at = None;
        job.updated_at = now;
        clear_lock(job);
        Ok(true)
    }
}

#[async_trait]
impl PlanStore for MemoryStore {
    async fn create_plan(&self, plan: NewPlan) -> Result<PlanId, StoreError> {
        let mut inner = self.write()?;
        inner.next_plan_id += 1;
        let id = PlanId::from(inner.next_plan_id);
        let now = Utc::now();
        inner.plans.push(Plan {
            id,
            name: plan.name,
            kind: plan.kind,
            trigger_at: plan.trigger_at,
            status: PlanStatus::Pending,
            total_items: 0,
            pending_items: 0,
            published_items: 0,
            failed_items: 0,
            assigned_accounts: 0,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn add_item(&self, item: NewPlanItem) -> Result<PlanItemId, StoreError> {
        let mut inner = self.write()?;
        if !inner.plans.iter().any(|plan| plan.id == item.plan_id) {
            return Err(StoreError::PlanNotFound(item.plan_id));
        }
        inner.next_item_id += 1;
        let id = PlanItemId::from(inner.next_item_id);
        let now = Utc::now();
        inner.items.push(PlanItem {
            id,
            plan_id: item.plan_id,
            source: item.source,
            title: item.title,
            status: PlanItemStatus::Pending,
            account_id: None,
            job_id: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn plan(&self, id: PlanId) -> Result<Plan, StoreError> {
        self.read()?
            .plans
            .iter()
            .find(|plan| plan.id == id)
            .cloned()
            .ok_or(StoreError::PlanNotFound(id))
    }

    async fn update_plan(&self, plan: Plan) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let slot = inner
            .plans
            .iter_mut()
            .find(|slot| slot.id == plan.id)
            .ok_or(StoreError::PlanNotFound(plan.id))?;
        *slot = plan;
        Ok(())
    }

    async fn due_plans(&self, now: DateTime<Utc>) -> Result<Vec<Plan>, StoreError> {
        let inner = self.read()?;
        let mut due: Vec<Plan> = inner
            .plans
            .iter()
            .filter(|plan| {
                matches!(plan.status, PlanStatus::Pending | PlanStatus::Publishing)
                    && plan.trigger_at.is_some_and(|trigger_at| trigger_at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|plan| plan.id);
        Ok(due)
    }

    async fn items(&self, plan: PlanId) -> Result<Vec<PlanItem>, StoreError> {
        let inner = self.read()?;
        let mut items: Vec<PlanItem> = inner
            .items
            .iter()
            .filter(|item| item.plan_id == plan)
            .cloned()
            .collect();
        items.sort_by_key(|item| item.id);
        Ok(items)
    }

    async fn update_item(&self, item: PlanItem) -> Result<(), StoreError> {
        let mut inner = self.write()?;
        let slot = inner
            .items
            .iter_mut()
            .find(|slot| slot.id == item.id)
            .ok_or(StoreError::ItemNotFound(item.id))?;
        *slot = item;
        Ok(())
    }

    async fn add_account(&self, account: NewAccount) -> Result<AccountId, StoreError> {
        let mut inner = self.write()?;
        inner.next_account_id += 1;
        let id = AccountId::from(inner.next_account_id);
        inner.accounts.push(Account {
            id,
            name: account.name,
            eligible: account.eligible,
        });
        Ok(id)
    }

    async fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        let inner = self.read()?;
        let mut accounts: Vec<Account> = inner
            .accounts
            .iter()
            .filter(|account| account.eligible)
            .cloned()
            .collect();
        accounts.sort_by_key(|account| account.id);
        Ok(accounts)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::store::testing;
    use crate::store_test_suite;

    store_test_suite!(for: MemoryStore::new());

    #[tokio::test]
    async fn poisoned_lock_reports_bad_state() {
        let store = MemoryStore::new();
        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.inner.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            store.insert(testing::mock_job()).await,
            Err(StoreError::BadState)
        );
    }
}
