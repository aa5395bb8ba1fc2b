//! Publish plans: batch producers that expand into individual jobs.
//!
//! A plan owns a set of items (one target video each). When the plan's
//! trigger time arrives the expansion pass assigns eligible accounts to
//! pending items round-robin and creates one dispatchable job per item.
//! Expansion is idempotent: re-running it never creates a second job for an
//! item that already has one, which is the guard against publishing the same
//! video twice.

use std::collections::HashSet;
use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde_json::json;

use crate::job::{JobId, JobStatus, UnknownStatus};
use crate::store::{JobStore, NewJob, PlanStore, StoreError};

/// Attempt ceiling for jobs created by plan expansion.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

macro_rules! id_newtype {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord)]
        pub struct $name(pub(crate) i64);

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }
    };
}

id_newtype!(
    /// Identifier of a plan row.
    PlanId
);
id_newtype!(
    /// Identifier of a plan item row.
    PlanItemId
);
id_newtype!(
    /// Identifier of an account row.
    AccountId
);

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PlanStatus {
    /// Created, expansion has not produced any job yet.
    Pending,
    /// At least one item has been expanded into a job.
    Publishing,
    /// All items terminal, none failed.
    Completed,
    /// All items terminal, at least one failed.
    Failed,
}

impl PlanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Display for PlanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "publishing" => Ok(Self::Publishing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum PlanItemStatus {
    /// Not yet expanded into a job.
    Pending,
    /// Has a job; the job has not reached a terminal state.
    Dispatched,
    /// The job succeeded.
    Published,
    /// The job failed or was stopped, or the item was rejected before
    /// dispatch (missing source file).
    Failed,
}

impl PlanItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Dispatched => "dispatched",
            Self::Published => "published",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Published | Self::Failed)
    }
}

impl Display for PlanItemStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PlanItemStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "dispatched" => Ok(Self::Dispatched),
            "published" => Ok(Self::Published),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// A batch producer row.
///
/// The counters always equal the count of items in the corresponding state:
/// they are recomputed from the children after every expansion pass, never
/// incremented in place.
#[derive(Debug, Clone)]
pub struct Plan {
    pub id: PlanId,
    pub name: String,
    /// Job kind the items expand into.
    pub kind: String,
    pub trigger_at: Option<DateTime<Utc>>,
    pub status: PlanStatus,
    pub total_items: u32,
    pub pending_items: u32,
    pub published_items: u32,
    pub failed_items: u32,
    pub assigned_accounts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPlan {
    pub name: String,
    pub kind: String,
    pub trigger_at: Option<DateTime<Utc>>,
}

/// One target video of a plan, mapped 1:1 to a job once expanded.
#[derive(Debug, Clone)]
pub struct PlanItem {
    pub id: PlanItemId,
    pub plan_id: PlanId,
    /// Path of the media file to publish, checked before dispatch.
    pub source: String,
    pub title: Option<String>,
    pub status: PlanItemStatus,
    pub account_id: Option<AccountId>,
    pub job_id: Option<JobId>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPlanItem {
    pub plan_id: PlanId,
    pub source: String,
    pub title: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Account {
    pub id: AccountId,
    pub name: String,
    pub eligible: bool,
}

#[derive(Debug, Clone)]
pub struct NewAccount {
    pub name: String,
    pub eligible: bool,
}

/// What one expansion pass did, for the scheduler's logs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionOutcome {
    pub jobs_created: u64,
    pub jobs_reset: u64,
    pub items_failed: u64,
}

/// Predicate deciding whether an item's source file exists.
///
/// Injected so tests can expand plans without touching a filesystem; the
/// scheduler defaults to [`std::path::Path::exists`].
pub type SourceCheck = dyn Fn(&str) -> bool + Send + Sync;

/// Expand every due plan, then recompute its counters.
pub(crate) async fn expand_due<S>(
    store: &S,
    source_ok: &SourceCheck,
    now: DateTime<Utc>,
) -> Result<ExpansionOutcome, StoreError>
where
    S: JobStore + PlanStore + ?Sized,
{
    let mut outcome = ExpansionOutcome::default();
    for plan in store.due_plans(now).await? {
        expand_plan(store, source_ok, &plan, now, &mut outcome).await?;
        recount_plan(store, plan.id, now).await?;
    }
    Ok(outcome)
}

/// Expand one plan's pending items into jobs.
///
/// Account assignment continues the round-robin from however many items are
/// already assigned, so items added to a live plan keep rotating through the
/// same account sequence.
async fn expand_plan<S>(
    store: &S,
    source_ok: &SourceCheck,
    plan: &Plan,
    now: DateTime<Utc>,
    outcome: &mut ExpansionOutcome,
) -> Result<(), StoreError>
where
    S: JobStore + PlanStore + ?Sized,
{
    let items = store.items(plan.id).await?;
    let accounts = store.accounts().await?;
    let mut cursor = items.iter().filter(|item| item.account_id.is_some()).count();

    for mut item in items {
        if let Some(job_id) = item.job_id {
            let job = store.job(job_id).await?;
            // A non-terminal job means this target is already in flight:
            // creating another job here is exactly the double-publish the
            // expansion guard exists to prevent.
            if job.status == JobStatus::Fail && store.reset_for_retry(job_id, now).await? {
                tracing::debug!(%job_id, item_id = %item.id, "reset failed plan job for another attempt");
                item.status = PlanItemStatus::Dispatched;
                item.error_message = None;
                item.updated_at = now;
                store.update_item(item).await?;
                outcome.jobs_reset += 1;
            }
            continue;
        }

        if item.status != PlanItemStatus::Pending {
            continue;
        }

        if !source_ok(&item.source) {
            tracing::warn!(item_id = %item.id, source = %item.source, "plan item source missing, marking failed");
            item.status = PlanItemStatus::Failed;
            item.error_message = Some(format!("source file missing: {}", item.source));
            item.updated_at = now;
            store.update_item(item).await?;
            outcome.items_failed += 1;
            continue;
        }

        if accounts.is_empty() {
            tracing::warn!(plan_id = %plan.id, "no eligible accounts, leaving plan items pending");
            break;
        }

        let account = &accounts[cursor % accounts.len()];
        cursor += 1;

        let job_id = store
            .insert(NewJob {
                kind: plan.kind.clone(),
                payload: json!({
                    "plan_id": i64::from(plan.id),
                    "item_id": i64::from(item.id),
                    "account_id": i64::from(account.id),
                    "source": item.source.clone(),
                    "title": item.title.clone(),
                }),
                max_attempts: DEFAULT_MAX_ATTEMPTS,
                scheduled_at: now,
            })
            .await?;
        tracing::debug!(%job_id, item_id = %item.id, account_id = %account.id, "expanded plan item into job");

        item.status = PlanItemStatus::Dispatched;
        item.account_id = Some(account.id);
        item.job_id = Some(job_id);
        item.updated_at = now;
        store.update_item(item).await?;
        outcome.jobs_created += 1;
    }

    Ok(())
}

/// Pull item states forward from their jobs, then recompute the plan's
/// counters and status from scratch.
///
/// Safe to rerun at any time: it only ever derives state, so an interleaved
/// run settles on the same answer.
pub(crate) async fn recount_plan<S>(
    store: &S,
    plan_id: PlanId,
    now: DateTime<Utc>,
) -> Result<Plan, StoreError>
where
    S: JobStore + PlanStore + ?Sized,
{
    let mut plan = store.plan(plan_id).await?;
    let mut items = store.items(plan_id).await?;

    for item in items.iter_mut() {
        if item.status != PlanItemStatus::Dispatched {
            continue;
        }
        let Some(job_id) = item.job_id else { continue };
        let job = store.job(job_id).await?;
        let update = match job.status {
            JobStatus::Success => Some((PlanItemStatus::Published, None)),
            JobStatus::Fail => Some((PlanItemStatus::Failed, job.error_message.clone())),
            JobStatus::Stopped => Some((PlanItemStatus::Failed, Some("stopped".to_owned()))),
            JobStatus::Pending | JobStatus::Running => None,
        };
        if let Some((status, error_message)) = update {
            item.status = status;
            item.error_message = error_message;
            item.updated_at = now;
            store.update_item(item.clone()).await?;
        }
    }

    plan.total_items = items.len() as u32;
    plan.pending_items = items.iter().filter(|item| !item.status.is_terminal()).count() as u32;
    plan.published_items = items
        .iter()
        .filter(|item| item.status == PlanItemStatus::Published)
        .count() as u32;
    plan.failed_items = items
        .iter()
        .filter(|item| item.status == PlanItemStatus::Failed)
        .count() as u32;
    plan.assigned_accounts = items
        .iter()
        .filter_map(|item| item.account_id)
        .collect::<HashSet<_>>()
        .len() as u32;

    if plan.status == PlanStatus::Pending && items.iter().any(|item| item.job_id.is_some()) {
        plan.status = PlanStatus::Publishing;
    }
    if matches!(plan.status, PlanStatus::Pending | PlanStatus::Publishing)
        && plan.total_items > 0
        && plan.pending_items == 0
    {
        plan.status = if plan.failed_items > 0 {
            PlanStatus::Failed
        } else {
            PlanStatus::Completed
        };
        tracing::debug!(%plan_id, status = %plan.status, "plan finished");
    }

    plan.updated_at = now;
    store.update_plan(plan.clone()).await?;
    Ok(plan)
}
