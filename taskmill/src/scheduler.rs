//! The tick loop: sweep, expand, dispatch.
//!
//! The scheduler task is the only place that decides *when* work happens. It
//! never blocks on an executor: every phase is a handful of short store
//! calls, and claimed jobs run on their own tasks. Two things wake it: the
//! fixed poll interval (with jitter, so several scheduler processes sharing
//! one store do not tick in lockstep) and an on-demand [`Trigger`] fired by
//! producers that just created work which is already due.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::executor::{ErasedExecutor, ExecutionResult, Progress};
use crate::governor::ConcurrencyGovernor;
use crate::plan::{self, ExpansionOutcome, SourceCheck};
use crate::registry::ActiveJobs;
use crate::store::{self, JobStore, Store};
use crate::TaskmillError;

/// Knobs for the tick loop. All of them have environment overrides, read by
/// [`SchedulerConfig::from_env`].
#[derive(Clone)]
pub struct SchedulerConfig {
    /// Fixed tick period.
    pub poll_interval: Duration,
    /// Maximum random addition to each sleep between ticks.
    pub jitter: Duration,
    /// Age after which a `running` row's lock is presumed abandoned.
    pub stale_timeout: TimeDelta,
    /// How many due jobs one tick will consider per kind.
    pub dispatch_batch: usize,
    /// Node name, the stable part of worker identities (`node:pid:seq`).
    pub node: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            jitter: Duration::from_millis(100),
            stale_timeout: TimeDelta::minutes(30),
            dispatch_batch: 10,
            node: "taskmill".to_owned(),
        }
    }
}

impl SchedulerConfig {
    /// Read overrides from `TASKMILL_POLL_INTERVAL_SECS`,
    /// `TASKMILL_STALE_TIMEOUT_SECS`, `TASKMILL_DISPATCH_BATCH`, and
    /// `TASKMILL_NODE`. Absent or unparseable values keep their defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            poll_interval: env_parse("TASKMILL_POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.poll_interval),
            jitter: defaults.jitter,
            stale_timeout: env_parse("TASKMILL_STALE_TIMEOUT_SECS")
                .map(|secs: i64| TimeDelta::seconds(secs))
                .unwrap_or(defaults.stale_timeout),
            dispatch_batch: env_parse("TASKMILL_DISPATCH_BATCH").unwrap_or(defaults.dispatch_batch),
            node: std::env::var("TASKMILL_NODE").unwrap_or(defaults.node),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok()?.trim().parse().ok()
}

enum Message {
    Wake,
    Terminate,
}

/// On-demand tick trigger.
///
/// Cheap to clone and hand to producers; firing it after an operation likely
/// to have created due work (a video added to a plan whose trigger time has
/// passed) cuts latency without tightening the poll interval.
#[derive(Clone)]
pub struct Trigger {
    sender: mpsc::UnboundedSender<Message>,
}

impl Trigger {
    pub fn wake(&self) {
        let _ = self.sender.send(Message::Wake);
    }
}

/// Handle to the running tick loop.
pub struct SchedulerHandle {
    sender: mpsc::UnboundedSender<Message>,
    handle: Option<JoinHandle<()>>,
    trigger: Trigger,
}

impl SchedulerHandle {
    pub fn trigger(&self) -> Trigger {
        self.trigger.clone()
    }

    /// Stop ticking. Jobs already dispatched run to completion on their own
    /// tasks; anything not yet claimed stays pending for the next start.
    pub async fn graceful_shutdown(&mut self) -> Result<(), TaskmillError> {
        self.sender
            .send(Message::Terminate)
            .map_err(|_| TaskmillError::GracefulShutdownFailed)?;
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| TaskmillError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

pub(crate) struct Scheduler<S> {
    pub(crate) store: S,
    pub(crate) executors: Arc<HashMap<&'static str, Arc<dyn ErasedExecutor>>>,
    pub(crate) governor: Arc<ConcurrencyGovernor>,
    pub(crate) registry: ActiveJobs,
    pub(crate) config: SchedulerConfig,
    pub(crate) source_check: Arc<SourceCheck>,
    pub(crate) seq: AtomicU64,
}

impl<S> Scheduler<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    pub(crate) fn spawn(self) -> SchedulerHandle {
        let (sender, mut rx) = mpsc::unbounded_channel();
        let trigger = Trigger {
            sender: sender.clone(),
        };
        let handle = tokio::spawn(async move {
            loop {
                self.tick().await;
                let delay = self.sleep_duration_with_jitter();
                tokio::select! {
                    message = rx.recv() => match message {
                        Some(Message::Wake) => {}
                        Some(Message::Terminate) | None => break,
                    },
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            tracing::debug!("shutting down scheduler tick loop");
        });
        SchedulerHandle {
            sender,
            handle: Some(handle),
            trigger,
        }
    }

    fn sleep_duration_with_jitter(&self) -> Duration {
        if self.config.jitter.is_zero() {
            return self.config.poll_interval;
        }
        let jitter_millis = u64::try_from(self.config.jitter.as_millis()).unwrap_or(u64::MAX);
        let random_jitter = rand::thread_rng().gen_range(0..=jitter_millis);
        self.config.poll_interval + Duration::from_millis(random_jitter)
    }

    async fn tick(&self) {
        self.tick_at(Utc::now()).await;
    }

    /// One full pass over the queue at instant `now`. Phases run in a fixed
    /// order so recovered and freshly expanded jobs are dispatchable within
    /// the same tick.
    pub(crate) async fn tick_at(&self, now: DateTime<Utc>) {
        self.sweep(now).await;
        self.expand(now).await;
        self.dispatch(now).await;
    }

    /// Phase 1: stale-lock recovery, then surfacing of exhausted rows.
    ///
    /// The scheduler runs unattended, so nothing is raised: outcomes land in
    /// the rows and the log.
    pub(crate) async fn sweep(&self, now: DateTime<Utc>) -> (u64, u64) {
        let mut recovered = 0;
        let mut exhausted = 0;
        for &kind in self.executors.keys() {
            match self
                .store
                .reset_stale(kind, now, self.config.stale_timeout)
                .await
            {
                Ok(0) => {}
                Ok(count) => {
                    tracing::warn!(kind, count, "returned stale running jobs to pending");
                    recovered += count;
                }
                Err(err) => tracing::error!(?err, kind, "stale sweep failed"),
            }
            match self.store.fail_exhausted(kind, now).await {
                Ok(0) => {}
                Ok(count) => {
                    tracing::warn!(kind, count, "marked jobs with exhausted attempts as failed");
                    exhausted += count;
                }
                Err(err) => tracing::error!(?err, kind, "exhaustion check failed"),
            }
        }
        (recovered, exhausted)
    }

    /// Phase 2: expand due plans into dispatchable jobs.
    pub(crate) async fn expand(&self, now: DateTime<Utc>) -> ExpansionOutcome {
        match plan::expand_due(&self.store, self.source_check.as_ref(), now).await {
            Ok(outcome) => {
                if outcome != ExpansionOutcome::default() {
                    tracing::debug!(
                        jobs_created = outcome.jobs_created,
                        jobs_reset = outcome.jobs_reset,
                        items_failed = outcome.items_failed,
                        "plan expansion pass finished"
                    );
                }
                outcome
            }
            Err(err) => {
                tracing::error!(?err, "plan expansion failed");
                ExpansionOutcome::default()
            }
        }
    }

    /// Phase 3: admit, claim, and start due jobs. Returns how many were
    /// handed to executors.
    pub(crate) async fn dispatch(&self, now: DateTime<Utc>) -> usize {
        let mut started = 0;
        for (&kind, executor) in self.executors.iter() {
            match self.dispatch_kind(kind, executor, now).await {
                Ok(count) => started += count,
                Err(err) => tracing::error!(?err, kind, "dispatch failed"),
            }
        }
        started
    }

    async fn dispatch_kind(
        &self,
        kind: &'static str,
        executor: &Arc<dyn ErasedExecutor>,
        now: DateTime<Utc>,
    ) -> Result<usize, crate::store::StoreError> {
        let due = self
            .store
            .list_due(kind, now, self.config.dispatch_batch)
            .await?;
        let mut started = 0;
        for job in due {
            let job_id = job.id;
            if self.registry.is_active(job_id) {
                // The original claimant is still alive in this process (a
                // slow executor whose lock was swept); starting a second
                // copy here would be a guaranteed duplicate execution.
                tracing::debug!(%job_id, "job already active in this process, skipping");
                continue;
            }
            let Some(permit) = self.governor.try_admit(kind) else {
                tracing::debug!(kind, "concurrency cap reached, deferring remaining jobs");
                break;
            };
            let worker = self.worker_id();
            if !self
                .store
                .claim(job_id, &worker, now, self.config.stale_timeout)
                .await?
            {
                // Another worker won, or the row became ineligible. Abandon
                // without side effects.
                continue;
            }
            let job = self.store.job(job_id).await?;
            let guard = self.registry.register(job_id, kind, &worker);
            let store: Arc<dyn JobStore> = Arc::new(self.store.clone());
            tracing::debug!(%job_id, %worker, "claimed job {job_id}");
            tokio::spawn(run_claimed(store, executor.clone(), job, worker, permit, guard));
            started += 1;
        }
        Ok(started)
    }

    fn worker_id(&self) -> String {
        format!(
            "{}:{}:{}",
            self.config.node,
            std::process::id(),
            self.seq.fetch_add(1, Ordering::Relaxed) + 1
        )
    }
}

/// Run one claimed job to its terminal state.
///
/// Owns the admission permit and the registry guard for exactly as long as
/// the job is in flight; both are released on every exit path, including a
/// panicking executor.
async fn run_claimed(
    store: Arc<dyn JobStore>,
    executor: Arc<dyn ErasedExecutor>,
    job: store::Job,
    worker: String,
    permit: crate::governor::AdmitPermit,
    guard: crate::registry::ActiveGuard,
) {
    let _permit = permit;
    let _guard = guard;
    let job_id = job.id;
    let progress = Progress::new(store.clone(), job_id, worker.clone());

    let result = executor.run(job, progress).await;

    let now = Utc::now();
    let applied = match result {
        ExecutionResult::Success(payload) => {
            tracing::debug!(%job_id, "job {job_id} succeeded");
            store.mark_success(job_id, &worker, payload, now).await
        }
        ExecutionResult::Fail(error) => {
            tracing::warn!(%job_id, %error, retryable = error.retryable, "job {job_id} failed: {error}");
            store.mark_fail(job_id, &worker, &error, now).await
        }
        ExecutionResult::Stopped => {
            tracing::debug!(%job_id, "job {job_id} stopped");
            store.mark_stopped(job_id, &worker, now).await
        }
    };
    match applied {
        Ok(true) => {}
        Ok(false) => {
            // The claim was superseded while this executor was running; the
            // fence dropped the late write and the newer attempt owns the row.
            tracing::warn!(%job_id, %worker, "terminal write for job {job_id} rejected, claim superseded");
        }
        Err(err) => {
            tracing::error!(?err, %job_id, "failed to record terminal state for job {job_id}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::sync::OnceLock;

    use async_trait::async_trait;
    use chrono::TimeDelta;
    use tokio::sync::Semaphore;

    use super::*;
    use crate::executor::test::{ScriptedExecutor, ScriptedOutcome};
    use crate::executor::{ExecutionResult, Executor, ExecutorAdapter, Progress};
    use crate::governor;
    use crate::job::{Job, JobId, JobStatus};
    use crate::plan::{NewAccount, NewPlan, NewPlanItem, PlanStatus};
    use crate::store::memory::MemoryStore;
    use crate::store::{NewJob, PlanStore};

    struct PublishExecutor;

    #[async_trait]
    impl Executor for PublishExecutor {
        type Payload = serde_json::Value;
        const NAME: &'static str = "video-publish";
        async fn execute(_job: Job<Self::Payload>, progress: Progress) -> ExecutionResult {
            progress.set(100).await;
            ExecutionResult::Success(None)
        }
    }

    fn edit_gate() -> &'static Semaphore {
        static GATE: OnceLock<Semaphore> = OnceLock::new();
        GATE.get_or_init(|| Semaphore::new(0))
    }

    struct GatedEditExecutor;

    #[async_trait]
    impl Executor for GatedEditExecutor {
        type Payload = ();
        const NAME: &'static str = "video-edit";
        const MAX_CONCURRENCY: Option<usize> = Some(2);
        async fn execute(_job: Job<Self::Payload>, _progress: Progress) -> ExecutionResult {
            match edit_gate().acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return ExecutionResult::Stopped,
            }
            ExecutionResult::Success(None)
        }
    }

    fn listen_gate() -> &'static Semaphore {
        static GATE: OnceLock<Semaphore> = OnceLock::new();
        GATE.get_or_init(|| Semaphore::new(0))
    }

    struct HangingListenExecutor;

    #[async_trait]
    impl Executor for HangingListenExecutor {
        type Payload = ();
        const NAME: &'static str = "listen-start";
        async fn execute(_job: Job<Self::Payload>, _progress: Progress) -> ExecutionResult {
            match listen_gate().acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return ExecutionResult::Stopped,
            }
            ExecutionResult::Success(None)
        }
    }

    struct PanicEditExecutor;

    #[async_trait]
    impl Executor for PanicEditExecutor {
        type Payload = ();
        const NAME: &'static str = "panic-edit";
        const MAX_CONCURRENCY: Option<usize> = Some(1);
        async fn execute(_job: Job<Self::Payload>, _progress: Progress) -> ExecutionResult {
            panic!("render crashed");
        }
    }

    fn scheduler_with(
        store: MemoryStore,
        executors: Vec<Arc<dyn ErasedExecutor>>,
    ) -> Scheduler<MemoryStore> {
        let executors: HashMap<&'static str, Arc<dyn ErasedExecutor>> = executors
            .into_iter()
            .map(|executor| (executor.name(), executor))
            .collect();
        let governor = Arc::new(governor::for_executors(&executors));
        Scheduler {
            store,
            executors: Arc::new(executors),
            governor,
            registry: ActiveJobs::new(),
            config: SchedulerConfig::default(),
            source_check: Arc::new(|_: &str| true),
            seq: AtomicU64::new(0),
        }
    }

    fn adapter<E>() -> Arc<dyn ErasedExecutor>
    where
        E: Executor + 'static,
        E::Payload: Send + serde::de::DeserializeOwned + 'static,
    {
        Arc::new(ExecutorAdapter::<E>::new())
    }

    async fn eventually<F, Fut>(mut condition: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        for _ in 0..400 {
            if condition().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met within timeout");
    }

    fn unit_job(kind: &str) -> NewJob {
        NewJob {
            kind: kind.to_owned(),
            payload: serde_json::Value::Null,
            max_attempts: 3,
            scheduled_at: Utc::now(),
        }
    }

    async fn running_count(store: &MemoryStore, ids: &[JobId]) -> usize {
        let mut count = 0;
        for id in ids {
            if store.job(*id).await.unwrap().status == JobStatus::Running {
                count += 1;
            }
        }
        count
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plan_flows_through_expansion_dispatch_and_completion() {
        let store = MemoryStore::new();
        let a1 = store
            .add_account(NewAccount { name: "alpha".to_owned(), eligible: true })
            .await
            .unwrap();
        let a2 = store
            .add_account(NewAccount { name: "beta".to_owned(), eligible: true })
            .await
            .unwrap();
        let now = Utc::now();
        let plan_id = store
            .create_plan(NewPlan {
                name: "launch".to_owned(),
                kind: "video-publish".to_owned(),
                trigger_at: Some(now - TimeDelta::minutes(1)),
            })
            .await
            .unwrap();
        for source in ["a.mp4", "b.mp4", "c.mp4"] {
            store
                .add_item(NewPlanItem {
                    plan_id,
                    source: source.to_owned(),
                    title: None,
                })
                .await
                .unwrap();
        }
        let scheduler = scheduler_with(store.clone(), vec![adapter::<PublishExecutor>()]);

        scheduler.tick_at(now).await;

        let plan = store.plan(plan_id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Publishing);
        assert_eq!(plan.pending_items, 3);
        let items = store.items(plan_id).await.unwrap();
        let assigned: Vec<_> = items.iter().map(|item| item.account_id.unwrap()).collect();
        assert_eq!(assigned, vec![a1, a2, a1]);

        let job_ids: Vec<_> = items.iter().map(|item| item.job_id.unwrap()).collect();
        eventually(|| {
            let store = store.clone();
            let job_ids = job_ids.clone();
            async move {
                for id in job_ids {
                    if store.job(id).await.unwrap().status != JobStatus::Success {
                        return false;
                    }
                }
                true
            }
        })
        .await;

        scheduler.tick_at(now + TimeDelta::minutes(1)).await;
        let plan = store.plan(plan_id).await.unwrap();
        assert_eq!(plan.status, PlanStatus::Completed);
        assert_eq!(plan.pending_items, 0);
        assert_eq!(plan.published_items, 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sweep_recovers_a_crashed_worker_and_redispatches() {
        let store = MemoryStore::new();
        let job_id = store
            .insert(NewJob {
                kind: "scripted".to_owned(),
                payload: serde_json::to_value(ScriptedOutcome::Succeed).unwrap(),
                max_attempts: 3,
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap();
        let scheduler = scheduler_with(store.clone(), vec![adapter::<ScriptedExecutor>()]);

        // A worker claims the job and dies without a terminal write.
        let crashed_at = Utc::now();
        assert!(store
            .claim(job_id, "dead-node:1:1", crashed_at, TimeDelta::minutes(30))
            .await
            .unwrap());

        let later = crashed_at + TimeDelta::minutes(31);
        let (recovered, _) = scheduler.sweep(later).await;
        assert_eq!(recovered, 1);
        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);

        assert_eq!(scheduler.dispatch(later).await, 1);
        eventually(|| {
            let store = store.clone();
            async move { store.job(job_id).await.unwrap().status == JobStatus::Success }
        })
        .await;
        assert_eq!(store.job(job_id).await.unwrap().attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn capacity_limited_jobs_wait_for_a_free_slot() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for _ in 0..3 {
            ids.push(store.insert(unit_job("video-edit")).await.unwrap());
        }
        let scheduler = scheduler_with(store.clone(), vec![adapter::<GatedEditExecutor>()]);
        let now = Utc::now();

        assert_eq!(scheduler.dispatch(now).await, 2);
        assert_eq!(running_count(&store, &ids).await, 2);
        let third = ids[2];
        assert_eq!(store.job(third).await.unwrap().status, JobStatus::Pending);
        assert_eq!(store.job(third).await.unwrap().attempts, 0);

        // Re-dispatching while both slots are held must not admit the third.
        assert_eq!(scheduler.dispatch(now).await, 0);
        assert!(running_count(&store, &ids).await <= 2);

        edit_gate().add_permits(1);
        eventually(|| {
            let store = store.clone();
            let ids = ids.clone();
            async move {
                let mut done = 0;
                for id in &ids {
                    if store.job(*id).await.unwrap().status == JobStatus::Success {
                        done += 1;
                    }
                }
                done == 1
            }
        })
        .await;

        // The finished job's permit frees one slot; keep dispatching until
        // the third job is admitted through it.
        let mut started = 0;
        for _ in 0..400 {
            started = scheduler.dispatch(now).await;
            if started == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(started, 1);
        assert!(running_count(&store, &ids).await <= 2);
        assert_eq!(store.job(third).await.unwrap().status, JobStatus::Running);

        edit_gate().add_permits(2);
        eventually(|| {
            let store = store.clone();
            let ids = ids.clone();
            async move {
                for id in &ids {
                    if store.job(*id).await.unwrap().status != JobStatus::Success {
                        return false;
                    }
                }
                true
            }
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn governor_slot_survives_an_executor_panic() {
        let store = MemoryStore::new();
        let first = store.insert(unit_job("panic-edit")).await.unwrap();
        let second = store.insert(unit_job("panic-edit")).await.unwrap();
        let scheduler = scheduler_with(store.clone(), vec![adapter::<PanicEditExecutor>()]);
        let now = Utc::now();

        assert_eq!(scheduler.dispatch(now).await, 1);
        eventually(|| {
            let store = store.clone();
            async move { store.job(first).await.unwrap().status == JobStatus::Fail }
        })
        .await;

        // The slot freed by the panicking executor admits the second job.
        let mut started = 0;
        for _ in 0..400 {
            started = scheduler.dispatch(now).await;
            if started == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(started, 1);
        eventually(|| {
            let store = store.clone();
            async move { store.job(second).await.unwrap().status == JobStatus::Fail }
        })
        .await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn registry_blocks_same_process_duplicate_after_stale_recovery() {
        let store = MemoryStore::new();
        let job_id = store.insert(unit_job("listen-start")).await.unwrap();
        let scheduler = scheduler_with(store.clone(), vec![adapter::<HangingListenExecutor>()]);
        let now = Utc::now();

        assert_eq!(scheduler.dispatch(now).await, 1);
        eventually(|| {
            let registry = scheduler.registry.clone();
            async move { registry.is_active(job_id) }
        })
        .await;

        // The executor is slow, not dead: the sweep recovers the row, but
        // this process must not start a second copy while the first lives.
        let later = now + TimeDelta::minutes(31);
        let (recovered, _) = scheduler.sweep(later).await;
        assert_eq!(recovered, 1);
        assert_eq!(scheduler.dispatch(later).await, 0);
        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);

        // Let the slow executor finish: its late terminal write is fenced
        // out and the row stays claimable.
        listen_gate().add_permits(1);
        eventually(|| {
            let registry = scheduler.registry.clone();
            async move { !registry.is_active(job_id) }
        })
        .await;
        assert_eq!(store.job(job_id).await.unwrap().status, JobStatus::Pending);

        assert_eq!(scheduler.dispatch(later).await, 1);
        listen_gate().add_permits(1);
        eventually(|| {
            let store = store.clone();
            async move { store.job(job_id).await.unwrap().status == JobStatus::Success }
        })
        .await;
        assert_eq!(store.job(job_id).await.unwrap().attempts, 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stopped_result_is_terminal_and_releases_the_lock() {
        let store = MemoryStore::new();
        let job_id = store
            .insert(NewJob {
                kind: "scripted".to_owned(),
                payload: serde_json::to_value(ScriptedOutcome::Stop).unwrap(),
                max_attempts: 3,
                scheduled_at: Utc::now(),
            })
            .await
            .unwrap();
        let scheduler = scheduler_with(store.clone(), vec![adapter::<ScriptedExecutor>()]);

        assert_eq!(scheduler.dispatch(Utc::now()).await, 1);
        eventually(|| {
            let store = store.clone();
            async move { store.job(job_id).await.unwrap().status == JobStatus::Stopped }
        })
        .await;

        let job = store.job(job_id).await.unwrap();
        assert!(job.locked_by.is_none());
        assert!(job.completed_at.is_some());
        eventually(|| {
            let registry = scheduler.registry.clone();
            async move { !registry.is_active(job_id) }
        })
        .await;
    }

    #[tokio::test]
    async fn dispatch_leaves_future_jobs_alone() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let job_id = store
            .insert(NewJob {
                scheduled_at: now + TimeDelta::hours(1),
                ..unit_job("video-publish")
            })
            .await
            .unwrap();
        let scheduler = scheduler_with(store.clone(), vec![adapter::<PublishExecutor>()]);

        assert_eq!(scheduler.dispatch(now).await, 0);
        assert_eq!(store.job(job_id).await.unwrap().status, JobStatus::Pending);
    }

    #[test]
    fn config_reads_environment_overrides() {
        std::env::set_var("TASKMILL_POLL_INTERVAL_SECS", "60");
        std::env::set_var("TASKMILL_STALE_TIMEOUT_SECS", "600");
        std::env::set_var("TASKMILL_DISPATCH_BATCH", "25");
        std::env::set_var("TASKMILL_NODE", "center-a");

        let config = SchedulerConfig::from_env();
        assert_eq!(config.poll_interval, Duration::from_secs(60));
        assert_eq!(config.stale_timeout, TimeDelta::seconds(600));
        assert_eq!(config.dispatch_batch, 25);
        assert_eq!(config.node, "center-a");

        std::env::remove_var("TASKMILL_POLL_INTERVAL_SECS");
        std::env::remove_var("TASKMILL_STALE_TIMEOUT_SECS");
        std::env::remove_var("TASKMILL_DISPATCH_BATCH");
        std::env::remove_var("TASKMILL_NODE");

        let config = SchedulerConfig::from_env();
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert_eq!(config.node, "taskmill");
    }
}
