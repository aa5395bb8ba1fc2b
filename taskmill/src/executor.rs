//! The boundary between the scheduler and the code that does the work.
//!
//! An [`Executor`] is the opaque, kind-specific function that performs the
//! actual side effect: driving a browser session, invoking `ffmpeg`, calling
//! a TTS service. The scheduler starts it after a successful claim and relies
//! on exactly one terminal store write happening when it finishes; it never
//! inspects or controls the steps in between. Cookie files, browser contexts,
//! and other session state are entirely the executor's business.
//!
//! There is no cancellation channel into a running executor. A "stop"
//! action (for instance stopping a message listener) is a brand-new job of a
//! complementary kind whose executor consults the
//! [`ActiveJobs`](crate::registry::ActiveJobs) registry.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use tokio::task::JoinError;

use crate::job::builder::JobBuilder;
use crate::job::{Job, JobId};
use crate::store::{self, JobStore};

/// An executable job kind.
#[async_trait]
pub trait Executor {
    /// The type of the job payload.
    ///
    /// Payloads carry references to the entities being acted on (account id,
    /// material id, file path); set to unit `()` when nothing is needed.
    type Payload;

    /// The kind tag associating queue rows with this executor.
    ///
    /// A static string rather than the type name, so the Rust type can be
    /// renamed without orphaning rows already in the store.
    const NAME: &'static str;

    /// The attempt ceiling for jobs of this kind, unless overridden per job
    /// via [`JobBuilder::with_max_attempts`](crate::job::builder::JobBuilder::with_max_attempts).
    const MAX_ATTEMPTS: u32 = 3;

    /// Cap on simultaneously running jobs of this kind. [`None`] means
    /// unlimited. The environment variable `MAX_<NAME>_CONCURRENCY` takes
    /// precedence when set.
    const MAX_CONCURRENCY: Option<usize> = None;

    /// Set to true for computationally expensive executors (`ffmpeg`
    /// renders). The job then runs via [`tokio::task::spawn_blocking`] so it
    /// cannot lock up the runtime.
    const BLOCKING: bool = false;

    /// Run the job to a terminal result.
    ///
    /// The executor owns `progress` while the job is running; nothing else
    /// writes it.
    async fn execute(job: Job<Self::Payload>, progress: Progress) -> ExecutionResult;

    fn builder() -> JobBuilder<Self>
    where
        Self: Sized,
        Self::Payload: serde::Serialize,
    {
        Default::default()
    }
}

/// The terminal result an executor reports back.
pub enum ExecutionResult {
    /// The side effect happened; an optional result payload (output path,
    /// remote id) is recorded on the row.
    Success(Option<serde_json::Value>),
    /// The side effect did not happen, or cannot be confirmed.
    Fail(ExecutionError),
    /// The work was stopped before producing a result.
    Stopped,
}

/// A terminal execution failure.
#[derive(Debug, Clone)]
pub struct ExecutionError {
    pub message: String,
    /// Whether a later attempt could plausibly succeed. Network blips and
    /// automation flakes are retryable; a missing source file or revoked
    /// credential is not, and a non-retryable failure pins the row's
    /// attempt counter so it is never re-admitted.
    pub retryable: bool,
}

impl ExecutionError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            retryable: false,
        }
    }
}

impl std::fmt::Display for ExecutionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<JoinError> for ExecutionError {
    fn from(value: JoinError) -> Self {
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            message,
            retryable: false,
        }
    }
}

/// Handle through which a running executor reports progress.
///
/// Writes are fenced on the claimant identity in the store, so a progress
/// update from a superseded attempt is dropped rather than clobbering the
/// current attempt's value.
#[derive(Clone)]
pub struct Progress {
    store: Arc<dyn JobStore>,
    job_id: JobId,
    worker: String,
}

impl Progress {
    pub(crate) fn new(store: Arc<dyn JobStore>, job_id: JobId, worker: String) -> Self {
        Self {
            store,
            job_id,
            worker,
        }
    }

    /// Record progress as a percentage; values above 100 are clamped.
    pub async fn set(&self, percent: u8) {
        let percent = percent.min(100);
        let job_id = self.job_id;
        let _ = self
            .store
            .set_progress(job_id, &self.worker, percent, Utc::now())
            .await
            .inspect_err(|err| {
                tracing::warn!(?err, %job_id, "failed to record progress for job {job_id}");
            });
    }
}

/// Object-safe wrapper around an [`Executor`], keyed by kind in the
/// scheduler's handler table.
#[async_trait]
pub(crate) trait ErasedExecutor: Send + Sync {
    fn name(&self) -> &'static str;
    fn max_concurrency(&self) -> Option<usize>;
    async fn run(&self, job: store::Job, progress: Progress) -> ExecutionResult;
}

pub(crate) struct ExecutorAdapter<E> {
    _executor: PhantomData<fn() -> E>,
}

impl<E> ExecutorAdapter<E> {
    pub(crate) fn new() -> Self {
        Self {
            _executor: PhantomData,
        }
    }
}

#[async_trait]
impl<E> ErasedExecutor for ExecutorAdapter<E>
where
    E: Executor + 'static,
    E::Payload: Send + DeserializeOwned + 'static,
{
    fn name(&self) -> &'static str {
        E::NAME
    }

    fn max_concurrency(&self) -> Option<usize> {
        E::MAX_CONCURRENCY
    }

    async fn run(&self, job: store::Job, progress: Progress) -> ExecutionResult {
        let job_id = job.id;
        let job: Job<E::Payload> = match job.try_into() {
            Ok(job) => job,
            Err(error) => {
                tracing::error!(?error, %job_id, "failed to decode payload for job {job_id}");
                return ExecutionResult::Fail(ExecutionError::permanent(format!(
                    "payload decode error: {error}"
                )));
            }
        };

        // Run inside a fresh task so a panicking executor is converted into
        // a terminal failure instead of taking the dispatch task down.
        let fut = E::execute(job, progress);
        let handle = if E::BLOCKING {
            tracing::debug!(%job_id, "executing blocking job {job_id}");
            tokio::task::spawn_blocking(move || futures::executor::block_on(fut))
        } else {
            tracing::debug!(%job_id, "executing job {job_id}");
            tokio::spawn(fut)
        };

        match handle.await {
            Ok(result) => result,
            Err(error) => ExecutionResult::Fail(error.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use async_trait::async_trait;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::store::memory::MemoryStore;

    pub(crate) struct ChatSendExecutor;

    #[async_trait]
    impl Executor for ChatSendExecutor {
        type Payload = String;
        const NAME: &'static str = "chat-send";
        const MAX_ATTEMPTS: u32 = 2;
        async fn execute(_job: Job<Self::Payload>, _progress: Progress) -> ExecutionResult {
            ExecutionResult::Success(None)
        }
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) enum ScriptedOutcome {
        Succeed,
        FailTransient { message: String },
        FailPermanent { message: String },
        Stop,
        Panic,
    }

    /// Executor whose payload scripts its terminal result.
    pub(crate) struct ScriptedExecutor;

    #[async_trait]
    impl Executor for ScriptedExecutor {
        type Payload = ScriptedOutcome;
        const NAME: &'static str = "scripted";
        const MAX_ATTEMPTS: u32 = 2;
        async fn execute(job: Job<Self::Payload>, progress: Progress) -> ExecutionResult {
            progress.set(50).await;
            match job.payload {
                ScriptedOutcome::Succeed => {
                    ExecutionResult::Success(Some(serde_json::json!({"output": "done"})))
                }
                ScriptedOutcome::FailTransient { message } => {
                    ExecutionResult::Fail(ExecutionError::transient(message))
                }
                ScriptedOutcome::FailPermanent { message } => {
                    ExecutionResult::Fail(ExecutionError::permanent(message))
                }
                ScriptedOutcome::Stop => ExecutionResult::Stopped,
                ScriptedOutcome::Panic => panic!("executor panicked"),
            }
        }
    }

    fn raw_job(kind: &str, payload: serde_json::Value) -> store::Job {
        let now = Utc::now();
        store::Job {
            id: 1.into(),
            kind: kind.to_owned(),
            payload,
            status: crate::job::JobStatus::Running,
            progress: 0,
            attempts: 1,
            max_attempts: 3,
            locked_by: Some("w1".to_owned()),
            locked_at: Some(now),
            error_message: None,
            result: None,
            created_at: now,
            scheduled_at: now,
            started_at: Some(now),
            completed_at: None,
            updated_at: now,
        }
    }

    fn progress_for(job: &store::Job) -> Progress {
        Progress::new(Arc::new(MemoryStore::new()), job.id, "w1".to_owned())
    }

    #[tokio::test]
    async fn adapter_converts_panics_into_permanent_failures() {
        let adapter = ExecutorAdapter::<ScriptedExecutor>::new();
        let job = raw_job(
            "scripted",
            serde_json::to_value(ScriptedOutcome::Panic).unwrap(),
        );
        let progress = progress_for(&job);

        match adapter.run(job, progress).await {
            ExecutionResult::Fail(error) => {
                assert!(!error.retryable);
                assert!(error.message.contains("executor panicked"));
            }
            _ => panic!("expected failure"),
        }
    }

    #[tokio::test]
    async fn adapter_rejects_undecodable_payloads() {
        let adapter = ExecutorAdapter::<ScriptedExecutor>::new();
        let job = raw_job("scripted", serde_json::json!({"not": "a scripted outcome"}));
        let progress = progress_for(&job);

        match adapter.run(job, progress).await {
            ExecutionResult::Fail(error) => assert!(!error.retryable),
            _ => panic!("expected failure"),
        }
    }
}
