//! Conformance suite for store implementations.
//!
//! The claim protocol and the recovery sweeps are only as good as the store
//! that implements their predicates, so every implementation runs the same
//! checks. Include the suite in an implementation's tests via
//! [`store_test_suite!`](crate::store_test_suite).

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use futures::future::join_all;

use crate::executor::ExecutionError;
use crate::job::JobStatus;
use crate::plan::{NewAccount, NewPlan, NewPlanItem, PlanItemStatus, PlanStatus};
use crate::store::{JobStore, NewJob, PlanStore, StoreError};

pub const DEFAULT_KIND: &str = "video-publish";

/// The stale-lock threshold used throughout the suite.
pub fn stale() -> TimeDelta {
    TimeDelta::minutes(30)
}

/// A fixed instant so the suite controls time instead of sleeping through it.
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap()
}

pub fn mock_job() -> NewJob {
    NewJob {
        kind: DEFAULT_KIND.to_owned(),
        payload: serde_json::json!({"material_id": 7}),
        max_attempts: 3,
        scheduled_at: t0(),
    }
}

pub fn mock_job_for(kind: &str) -> NewJob {
    NewJob {
        kind: kind.to_owned(),
        ..mock_job()
    }
}

/// Create test suite for a taskmill store.
///
/// # Example
///
/// ```
/// use taskmill::store_test_suite;
/// use taskmill::store::memory::MemoryStore;
/// store_test_suite!(for: MemoryStore::new());
/// ```
///
/// A different async test attribute can be configured with the long form:
///
/// ```ignore
/// store_test_suite!(attr: tokio::test, store: SqliteStore::in_memory().await.unwrap());
/// ```
#[macro_export]
macro_rules! store_test_suite {
    (for: $store:expr) => {
        $crate::store_test_suite!(attr: tokio::test, store: $store);
    };
    (attr: $attr:meta, store: $store:expr) => {
        #[$attr]
        async fn insert_and_fetch_job() {
            $crate::store::testing::insert_and_fetch_job($store).await;
        }
        #[$attr]
        async fn list_due_returns_only_eligible_jobs() {
            $crate::store::testing::list_due_returns_only_eligible_jobs($store).await;
        }
        #[$attr]
        async fn claim_marks_job_running() {
            $crate::store::testing::claim_marks_job_running($store).await;
        }
        #[$attr]
        async fn claim_is_mutually_exclusive() {
            $crate::store::testing::claim_is_mutually_exclusive($store).await;
        }
        #[$attr]
        async fn claim_rejects_already_running_job() {
            $crate::store::testing::claim_rejects_already_running_job($store).await;
        }
        #[$attr]
        async fn claim_rejects_terminal_job() {
            $crate::store::testing::claim_rejects_terminal_job($store).await;
        }
        #[$attr]
        async fn claim_rejects_exhausted_job() {
            $crate::store::testing::claim_rejects_exhausted_job($store).await;
        }
        #[$attr]
        async fn claim_respects_recent_lock() {
            $crate::store::testing::claim_respects_recent_lock($store).await;
        }
        #[$attr]
        async fn reset_stale_recovers_only_stale_jobs() {
            $crate::store::testing::reset_stale_recovers_only_stale_jobs($store).await;
        }
        #[$attr]
        async fn stale_job_can_be_reclaimed() {
            $crate::store::testing::stale_job_can_be_reclaimed($store).await;
        }
        #[$attr]
        async fn fail_exhausted_surfaces_spent_jobs() {
            $crate::store::testing::fail_exhausted_surfaces_spent_jobs($store).await;
        }
        #[$attr]
        async fn mark_success_records_result() {
            $crate::store::testing::mark_success_records_result($store).await;
        }
        #[$attr]
        async fn terminal_writes_are_fenced() {
            $crate::store::testing::terminal_writes_are_fenced($store).await;
        }
        #[$attr]
        async fn mark_fail_permanent_pins_attempts() {
            $crate::store::testing::mark_fail_permanent_pins_attempts($store).await;
        }
        #[$attr]
        async fn failed_job_can_be_reset_for_retry() {
            $crate::store::testing::failed_job_can_be_reset_for_retry($store).await;
        }
        #[$attr]
        async fn mark_stopped_is_terminal() {
            $crate::store::testing::mark_stopped_is_terminal($store).await;
        }
        #[$attr]
        async fn progress_updates_are_fenced() {
            $crate::store::testing::progress_updates_are_fenced($store).await;
        }
        #[$attr]
        async fn plan_and_items_round_trip() {
            $crate::store::testing::plan_and_items_round_trip($store).await;
        }
    };
}

pub async fn insert_and_fetch_job<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();

    let job = store.job(id).await.unwrap();
    assert_eq!(job.id, id);
    assert_eq!(job.kind, DEFAULT_KIND);
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.progress, 0);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_attempts, 3);
    assert_eq!(job.payload, serde_json::json!({"material_id": 7}));
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
    assert!(job.completed_at.is_none());

    assert!(matches!(
        store.job(9999.into()).await,
        Err(StoreError::JobNotFound(_))
    ));
}

pub async fn list_due_returns_only_eligible_jobs<S: JobStore>(store: S) {
    let due_early = store
        .insert(NewJob {
            scheduled_at: t0() - TimeDelta::minutes(1),
            ..mock_job()
        })
        .await
        .unwrap();
    let _future = store
        .insert(NewJob {
            scheduled_at: t0() + TimeDelta::hours(1),
            ..mock_job()
        })
        .await
        .unwrap();
    let _other_kind = store.insert(mock_job_for("media-transcode")).await.unwrap();
    let due_late = store.insert(mock_job()).await.unwrap();

    let due = store.list_due(DEFAULT_KIND, t0(), 10).await.unwrap();
    assert_eq!(
        due.iter().map(|job| job.id).collect::<Vec<_>>(),
        vec![due_early, due_late]
    );

    let due = store.list_due(DEFAULT_KIND, t0(), 1).await.unwrap();
    assert_eq!(due.len(), 1);
    assert_eq!(due[0].id, due_early);

    assert!(store.claim(due_early, "w1", t0(), stale()).await.unwrap());
    let due = store.list_due(DEFAULT_KIND, t0(), 10).await.unwrap();
    assert_eq!(due.iter().map(|job| job.id).collect::<Vec<_>>(), vec![due_late]);
}

pub async fn claim_marks_job_running<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();

    assert!(store.claim(id, "center:401:1", t0(), stale()).await.unwrap());

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some("center:401:1"));
    assert_eq!(job.locked_at, Some(t0()));
    assert_eq!(job.attempts, 1);
    assert_eq!(job.started_at, Some(t0()));
}

pub async fn claim_is_mutually_exclusive<S>(store: S)
where
    S: JobStore + Clone + 'static,
{
    let id = store.insert(mock_job()).await.unwrap();

    let attempts = (0..16).map(|i| {
        let store = store.clone();
        tokio::spawn(async move {
            store
                .claim(id, &format!("worker:{i}"), t0(), stale())
                .await
                .unwrap()
        })
    });
    let won: usize = join_all(attempts)
        .await
        .into_iter()
        .map(|result| result.unwrap() as usize)
        .sum();

    assert_eq!(won, 1);
    let job = store.job(id).await.unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.status, JobStatus::Running);
}

pub async fn claim_rejects_already_running_job<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());

    assert!(!store
        .claim(id, "w2", t0() + TimeDelta::minutes(1), stale())
        .await
        .unwrap());

    let job = store.job(id).await.unwrap();
    assert_eq!(job.attempts, 1);
    assert_eq!(job.locked_by.as_deref(), Some("w1"));
}

pub async fn claim_rejects_terminal_job<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());
    assert!(store.mark_success(id, "w1", None, t0()).await.unwrap());

    assert!(!store
        .claim(id, "w2", t0() + TimeDelta::hours(2), stale())
        .await
        .unwrap());

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.attempts, 1);
}

pub async fn claim_rejects_exhausted_job<S: JobStore>(store: S) {
    let id = store
        .insert(NewJob {
            max_attempts: 1,
            ..mock_job()
        })
        .await
        .unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());
    let later = t0() + TimeDelta::minutes(31);
    assert_eq!(store.reset_stale(DEFAULT_KIND, later, stale()).await.unwrap(), 1);

    assert!(!store.claim(id, "w2", later, stale()).await.unwrap());

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);
}

pub async fn claim_respects_recent_lock<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    let mut job = store.job(id).await.unwrap();
    job.locked_at = Some(t0());
    store.update_job(job).await.unwrap();

    assert!(!store
        .claim(id, "w1", t0() + TimeDelta::minutes(10), stale())
        .await
        .unwrap());
    assert!(store
        .claim(id, "w1", t0() + TimeDelta::minutes(31), stale())
        .await
        .unwrap());
}

pub async fn reset_stale_recovers_only_stale_jobs<S: JobStore>(store: S) {
    let stale_id = store.insert(mock_job()).await.unwrap();
    let fresh_id = store.insert(mock_job()).await.unwrap();
    let other_id = store.insert(mock_job_for("media-transcode")).await.unwrap();
    assert!(store.claim(stale_id, "w1", t0(), stale()).await.unwrap());
    assert!(store
        .claim(fresh_id, "w2", t0() + TimeDelta::minutes(20), stale())
        .await
        .unwrap());
    assert!(store.claim(other_id, "w3", t0(), stale()).await.unwrap());

    let recovered = store
        .reset_stale(DEFAULT_KIND, t0() + TimeDelta::minutes(35), stale())
        .await
        .unwrap();

    assert_eq!(recovered, 1);
    assert_eq!(store.job(stale_id).await.unwrap().status, JobStatus::Pending);
    assert_eq!(store.job(fresh_id).await.unwrap().status, JobStatus::Running);
    assert_eq!(store.job(other_id).await.unwrap().status, JobStatus::Running);
}

pub async fn stale_job_can_be_reclaimed<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());
    // No terminal write: the worker is gone.

    let later = t0() + TimeDelta::minutes(31);
    assert_eq!(store.reset_stale(DEFAULT_KIND, later, stale()).await.unwrap(), 1);

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert_eq!(job.attempts, 1);

    assert!(store.claim(id, "w2", later, stale()).await.unwrap());
    let job = store.job(id).await.unwrap();
    assert_eq!(job.attempts, 2);
    assert_eq!(job.locked_by.as_deref(), Some("w2"));
    assert_eq!(job.started_at, Some(later));
}

pub async fn fail_exhausted_surfaces_spent_jobs<S: JobStore>(store: S) {
    let id = store
        .insert(NewJob {
            max_attempts: 1,
            ..mock_job()
        })
        .await
        .unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());
    let later = t0() + TimeDelta::minutes(31);
    assert_eq!(store.reset_stale(DEFAULT_KIND, later, stale()).await.unwrap(), 1);

    assert_eq!(store.fail_exhausted(DEFAULT_KIND, later).await.unwrap(), 1);

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Fail);
    assert_eq!(job.error_message.as_deref(), Some("retry attempts exhausted"));
    assert!(job.completed_at.is_some());

    assert_eq!(store.fail_exhausted(DEFAULT_KIND, later).await.unwrap(), 0);
}

pub async fn mark_success_records_result<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());

    let result = serde_json::json!({"remote_id": "v-123"});
    assert!(store
        .mark_success(id, "w1", Some(result.clone()), t0() + TimeDelta::minutes(2))
        .await
        .unwrap());

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Success);
    assert_eq!(job.progress, 100);
    assert_eq!(job.result, Some(result));
    assert!(job.locked_by.is_none());
    assert!(job.locked_at.is_none());
    assert_eq!(job.completed_at, Some(t0() + TimeDelta::minutes(2)));
}

pub async fn terminal_writes_are_fenced<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());

    // A writer that never held the claim is rejected outright.
    assert!(!store.mark_success(id, "w2", None, t0()).await.unwrap());
    assert_eq!(store.job(id).await.unwrap().status, JobStatus::Running);

    // w1 goes quiet, the sweep recovers the row, and w2 claims it.
    let later = t0() + TimeDelta::minutes(31);
    assert_eq!(store.reset_stale(DEFAULT_KIND, later, stale()).await.unwrap(), 1);
    assert!(store.claim(id, "w2", later, stale()).await.unwrap());

    // w1 was merely slow, not dead: its late terminal write must lose.
    assert!(!store
        .mark_fail(id, "w1", &ExecutionError::transient("late write"), later)
        .await
        .unwrap());
    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(job.locked_by.as_deref(), Some("w2"));

    assert!(store.mark_success(id, "w2", None, later).await.unwrap());
    assert_eq!(store.job(id).await.unwrap().status, JobStatus::Success);
}

pub async fn mark_fail_permanent_pins_attempts<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());

    assert!(store
        .mark_fail(id, "w1", &ExecutionError::permanent("source file missing"), t0())
        .await
        .unwrap());

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Fail);
    assert_eq!(job.attempts, job.max_attempts);
    assert_eq!(job.error_message.as_deref(), Some("source file missing"));

    assert!(!store.reset_for_retry(id, t0()).await.unwrap());
    assert_eq!(store.job(id).await.unwrap().status, JobStatus::Fail);
}

pub async fn failed_job_can_be_reset_for_retry<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());
    assert!(store
        .mark_fail(id, "w1", &ExecutionError::transient("network blip"), t0())
        .await
        .unwrap());

    assert!(store.reset_for_retry(id, t0()).await.unwrap());

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.error_message.is_none());
    assert_eq!(job.progress, 0);
    assert_eq!(job.attempts, 1);

    assert!(store.claim(id, "w2", t0(), stale()).await.unwrap());
    assert_eq!(store.job(id).await.unwrap().attempts, 2);
}

pub async fn mark_stopped_is_terminal<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());

    assert!(store.mark_stopped(id, "w1", t0()).await.unwrap());

    let job = store.job(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Stopped);
    assert!(job.completed_at.is_some());
    assert!(!store
        .claim(id, "w2", t0() + TimeDelta::hours(2), stale())
        .await
        .unwrap());
}

pub async fn progress_updates_are_fenced<S: JobStore>(store: S) {
    let id = store.insert(mock_job()).await.unwrap();
    assert!(store.claim(id, "w1", t0(), stale()).await.unwrap());

    store.set_progress(id, "w1", 42, t0()).await.unwrap();
    assert_eq!(store.job(id).await.unwrap().progress, 42);

    store.set_progress(id, "w2", 99, t0()).await.unwrap();
    assert_eq!(store.job(id).await.unwrap().progress, 42);

    store.set_progress(id, "w1", 150, t0()).await.unwrap();
    assert_eq!(store.job(id).await.unwrap().progress, 100);

    assert!(store.mark_success(id, "w1", None, t0()).await.unwrap());
    store.set_progress(id, "w1", 10, t0()).await.unwrap();
    assert_eq!(store.job(id).await.unwrap().progress, 100);
}

pub async fn plan_and_items_round_trip<S: JobStore + PlanStore>(store: S) {
    let plan_id = store
        .create_plan(NewPlan {
            name: "spring launch".to_owned(),
            kind: DEFAULT_KIND.to_owned(),
            trigger_at: Some(t0() - TimeDelta::minutes(1)),
        })
        .await
        .unwrap();

    let plan = store.plan(plan_id).await.unwrap();
    assert_eq!(plan.name, "spring launch");
    assert_eq!(plan.status, PlanStatus::Pending);
    assert_eq!(plan.total_items, 0);

    let first = store
        .add_item(NewPlanItem {
            plan_id,
            source: "videos/a.mp4".to_owned(),
            title: Some("first".to_owned()),
        })
        .await
        .unwrap();
    let second = store
        .add_item(NewPlanItem {
            plan_id,
            source: "videos/b.mp4".to_owned(),
            title: None,
        })
        .await
        .unwrap();

    let items = store.items(plan_id).await.unwrap();
    assert_eq!(items.iter().map(|item| item.id).collect::<Vec<_>>(), vec![first, second]);
    assert!(items
        .iter()
        .all(|item| item.status == PlanItemStatus::Pending && item.job_id.is_none()));

    let account = store
        .add_account(NewAccount { name: "alpha".to_owned(), eligible: true })
        .await
        .unwrap();
    store
        .add_account(NewAccount { name: "logged-out".to_owned(), eligible: false })
        .await
        .unwrap();
    let accounts = store.accounts().await.unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].id, account);

    let mut item = items.into_iter().next().unwrap();
    item.status = PlanItemStatus::Failed;
    item.error_message = Some("source file missing".to_owned());
    store.update_item(item.clone()).await.unwrap();
    assert_eq!(store.items(plan_id).await.unwrap()[0].status, PlanItemStatus::Failed);

    let due = store.due_plans(t0()).await.unwrap();
    assert_eq!(due.iter().map(|plan| plan.id).collect::<Vec<_>>(), vec![plan_id]);

    let mut plan = store.plan(plan_id).await.unwrap();
    plan.status = PlanStatus::Completed;
    plan.total_items = 2;
    plan.failed_items = 1;
    store.update_plan(plan).await.unwrap();
    assert!(store.due_plans(t0()).await.unwrap().is_empty());

    let plan = store.plan(plan_id).await.unwrap();
    assert_eq!(plan.status, PlanStatus::Completed);
    assert_eq!(plan.failed_items, 1);

    let _unscheduled = store
        .create_plan(NewPlan {
            name: "manual batch".to_owned(),
            kind: DEFAULT_KIND.to_owned(),
            trigger_at: None,
        })
        .await
        .unwrap();
    let future = store
        .create_plan(NewPlan {
            name: "next week".to_owned(),
            kind: DEFAULT_KIND.to_owned(),
            trigger_at: Some(t0() + TimeDelta::days(7)),
        })
        .await
        .unwrap();
    assert!(store.due_plans(t0()).await.unwrap().is_empty());
    let due = store.due_plans(t0() + TimeDelta::days(8)).await.unwrap();
    assert_eq!(due.iter().map(|plan| plan.id).collect::<Vec<_>>(), vec![future]);
}
