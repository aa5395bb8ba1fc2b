//! Plan, item, and account queries.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use taskmill::plan::{
    Account, AccountId, NewAccount, NewPlan, NewPlanItem, Plan, PlanId, PlanItem, PlanItemId,
};
use taskmill::store::{PlanStore, StoreError};

use crate::types::{millis, opt_millis, AccountRow, PlanItemRow, PlanRow};
use crate::{db, SqliteStore};

const PLAN_COLUMNS: &str = "id, name, kind, trigger_at, status, total_items, pending_items, \
     published_items, failed_items, assigned_accounts, created_at, updated_at";

const ITEM_COLUMNS: &str = "id, plan_id, source, title, status, account_id, job_id, \
     error_message, created_at, updated_at";

#[async_trait]
impl PlanStore for SqliteStore {
    async fn create_plan(&self, plan: NewPlan) -> Result<PlanId, StoreError> {
        let now = millis(Utc::now());
        let id = sqlx::query_scalar::<_, i64>(
            r"INSERT INTO taskmill_plans (name, kind, trigger_at, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?4, ?4)
              RETURNING id",
        )
        .bind(&plan.name)
        .bind(&plan.kind)
        .bind(opt_millis(plan.trigger_at))
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(db)?;
        Ok(id.into())
    }

    async fn add_item(&self, item: NewPlanItem) -> Result<PlanItemId, StoreError> {
        let exists = sqlx::query_scalar::<_, i64>("SELECT 1 FROM taskmill_plans WHERE id = ?1")
            .bind(i64::from(item.plan_id))
            .fetch_optional(self.pool())
            .await
            .map_err(db)?;
        if exists.is_none() {
            return Err(StoreError::PlanNotFound(item.plan_id));
        }
        let now = millis(Utc::now());
        let id = sqlx::query_scalar::<_, i64>(
            r"INSERT INTO taskmill_plan_items (plan_id, source, title, created_at, updated_at)
              VALUES (?1, ?2, ?3, ?4, ?4)
              RETURNING id",
        )
        .bind(i64::from(item.plan_id))
        .bind(&item.source)
        .bind(&item.title)
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(db)?;
        Ok(id.into())
    }

    async fn plan(&self, id: PlanId) -> Result<Plan, StoreError> {
        sqlx::query_as::<_, PlanRow>(&format!(
            "SELECT {PLAN_COLUMNS} FROM taskmill_plans WHERE id = ?1"
        ))
        .bind(i64::from(id))
        .fetch_optional(self.pool())
        .await
        .map_err(db)?
        .ok_or(StoreError::PlanNotFound(id))?
        .try_into()
    }

    async fn update_plan(&self, plan: Plan) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_plans SET
                name = ?2,
                kind = ?3,
                trigger_at = ?4,
                status = ?5,
                total_items = ?6,
                pending_items = ?7,
                published_items = ?8,
                failed_items = ?9,
                assigned_accounts = ?10,
                created_at = ?11,
                updated_at = ?12
              WHERE id = ?1",
        )
        .bind(i64::from(plan.id))
        .bind(&plan.name)
        .bind(&plan.kind)
        .bind(opt_millis(plan.trigger_at))
        .bind(plan.status.as_str())
        .bind(i64::from(plan.total_items))
        .bind(i64::from(plan.pending_items))
        .bind(i64::from(plan.published_items))
        .bind(i64::from(plan.failed_items))
        .bind(i64::from(plan.assigned_accounts))
        .bind(millis(plan.created_at))
        .bind(millis(plan.updated_at))
        .execute(self.pool())
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::PlanNotFound(plan.id));
        }
        Ok(())
    }

    async fn due_plans(&self, now: DateTime<Utc>) -> Result<Vec<Plan>, StoreError> {
        sqlx::query_as::<_, PlanRow>(&format!(
            r"SELECT {PLAN_COLUMNS} FROM taskmill_plans
              WHERE status IN ('pending', 'publishing')
                AND trigger_at IS NOT NULL
                AND trigger_at <= ?1
              ORDER BY id"
        ))
        .bind(millis(now))
        .fetch_all(self.pool())
        .await
        .map_err(db)?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn items(&self, plan: PlanId) -> Result<Vec<PlanItem>, StoreError> {
        sqlx::query_as::<_, PlanItemRow>(&format!(
            r"SELECT {ITEM_COLUMNS} FROM taskmill_plan_items
              WHERE plan_id = ?1
              ORDER BY id"
        ))
        .bind(i64::from(plan))
        .fetch_all(self.pool())
        .await
        .map_err(db)?
        .into_iter()
        .map(TryInto::try_into)
        .collect()
    }

    async fn update_item(&self, item: PlanItem) -> Result<(), StoreError> {
        let result = sqlx::query(
            r"UPDATE taskmill_plan_items SET
                plan_id = ?2,
                source = ?3,
                title = ?4,
                status = ?5,
                account_id = ?6,
                job_id = ?7,
                error_message = ?8,
                created_at = ?9,
                updated_at = ?10
              WHERE id = ?1",
        )
        .bind(i64::from(item.id))
        .bind(i64::from(item.plan_id))
        .bind(&item.source)
        .bind(&item.title)
        .bind(item.status.as_str())
        .bind(item.account_id.map(i64::from))
        .bind(item.job_id.map(i64::from))
        .bind(&item.error_message)
        .bind(millis(item.created_at))
        .bind(millis(item.updated_at))
        .execute(self.pool())
        .await
        .map_err(db)?;
        if result.rows_affected() == 0 {
            return Err(StoreError::ItemNotFound(item.id));
        }
        Ok(())
    }

    async fn add_account(&self, account: NewAccount) -> Result<AccountId, StoreError> {
        let id = sqlx::query_scalar::<_, i64>(
            r"INSERT INTO taskmill_accounts (name, eligible)
              VALUES (?1, ?2)
              RETURNING id",
        )
        .bind(&account.name)
        .bind(account.eligible)
        .fetch_one(self.pool())
        .await
        .map_err(db)?;
        Ok(id.into())
    }

    async fn accounts(&self) -> Result<Vec<Account>, StoreError> {
        Ok(sqlx::query_as::<_, AccountRow>(
            r"SELECT id, name, eligible FROM taskmill_accounts
              WHERE eligible <> 0
              ORDER BY id",
        )
        .fetch_all(self.pool())
        .await
        .map_err(db)?
        .into_iter()
        .map(Into::into)
        .collect())
    }
}

#[cfg(test)]
mod test {
    use chrono::TimeDelta;
    use taskmill::executor::ExecutionError;
    use taskmill::job::JobStatus;
    use taskmill::plan::{PlanItemStatus, PlanStatus};
    use taskmill::store::JobStore;

    use super::*;

    // The expansion pass itself is covered in the core crate against the
    // in-memory store; this exercises the same flow against real SQL.
    #[tokio::test]
    async fn expansion_flow_against_sqlite() {
        let store = crate::SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();

        let plan_id = store
            .create_plan(NewPlan {
                name: "launch".to_owned(),
                kind: "video-publish".to_owned(),
                trigger_at: Some(now - TimeDelta::minutes(5)),
            })
            .await
            .unwrap();
        for source in ["a.mp4", "b.mp4"] {
            store
                .add_item(NewPlanItem {
                    plan_id,
                    source: source.to_owned(),
                    title: None,
                })
                .await
                .unwrap();
        }
        store
            .add_account(NewAccount { name: "alpha".to_owned(), eligible: true })
            .await
            .unwrap();

        let due = store.due_plans(now).await.unwrap();
        assert_eq!(due.len(), 1);

        // Wire one item to a job the way the expansion pass does.
        let items = store.items(plan_id).await.unwrap();
        let job_id = store
            .insert(taskmill::store::NewJob {
                kind: "video-publish".to_owned(),
                payload: serde_json::json!({"item_id": i64::from(items[0].id)}),
                max_attempts: 3,
                scheduled_at: now,
            })
            .await
            .unwrap();
        let mut item = items.into_iter().next().unwrap();
        item.status = PlanItemStatus::Dispatched;
        item.job_id = Some(job_id);
        item.updated_at = now;
        store.update_item(item).await.unwrap();

        assert!(store.claim(job_id, "w1", now, TimeDelta::minutes(30)).await.unwrap());
        assert!(store
            .mark_fail(job_id, "w1", &ExecutionError::transient("flake"), now)
            .await
            .unwrap());
        assert!(store.reset_for_retry(job_id, now).await.unwrap());
        assert_eq!(store.job(job_id).await.unwrap().status, JobStatus::Pending);

        let mut plan = store.plan(plan_id).await.unwrap();
        plan.status = PlanStatus::Publishing;
        plan.total_items = 2;
        plan.pending_items = 2;
        plan.updated_at = now;
        store.update_plan(plan).await.unwrap();
        assert_eq!(store.plan(plan_id).await.unwrap().status, PlanStatus::Publishing);
    }
}
