//! Job queue and scheduling core for the device-automation platform.
//!
//! A central service accepts jobs (publish a video, send a chat reply, start
//! or stop a message listener, transcode a media file, render an edit) and
//! dispatches them to kind-specific executors driving browser automation or
//! `ffmpeg`. This crate is the coordination layer underneath: heterogeneous
//! jobs are created in a shared relational store, claimed by exactly one
//! worker through an atomic conditional update, executed with bounded
//! per-kind concurrency, and recovered after worker crashes by a stale-lock
//! sweep. There is no external broker; the store is the only shared state,
//! so workers can be in-process tasks or separate OS processes alike.
//!
//! Semantics are at-least-once with idempotency guards, not exactly-once: a
//! claimed row whose worker goes quiet returns to the queue with its attempt
//! counter preserved, and terminal writes are fenced on the claimant
//! identity so a superseded attempt cannot overwrite the newer one.
//!
//! ```no_run
//! # use taskmill::prelude::*;
//! # use taskmill::store::memory::MemoryStore;
//! # #[async_trait::async_trait]
//! # impl Executor for TranscodeExecutor {
//! #     type Payload = String;
//! #     const NAME: &'static str = "media-transcode";
//! #     const MAX_CONCURRENCY: Option<usize> = Some(2);
//! #     const BLOCKING: bool = true;
//! #     async fn execute(_job: Job<Self::Payload>, _progress: Progress) -> ExecutionResult {
//! #         ExecutionResult::Success(None)
//! #     }
//! # }
//! # struct TranscodeExecutor;
//! # #[tokio::main]
//! # async fn main() -> Result<(), TaskmillError> {
//! let store = MemoryStore::new();
//! let handle = Taskmill::new(store.clone())
//!     .with_executor::<TranscodeExecutor>()
//!     .with_config(SchedulerConfig::from_env())
//!     .start();
//!
//! TranscodeExecutor::builder()
//!     .with_payload("materials/42.mov".to_owned())
//!     .enqueue_to_store(&store)
//!     .await?;
//! handle.trigger().wake();
//! # handle.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use thiserror::Error;

pub mod executor;
pub mod governor;
pub mod job;
pub mod plan;
pub mod prelude;
pub mod registry;
pub mod scheduler;
pub mod store;

use executor::{ErasedExecutor, Executor, ExecutorAdapter};
use plan::SourceCheck;
use registry::ActiveJobs;
use scheduler::{Scheduler, SchedulerConfig, SchedulerHandle, Trigger};
use store::{Store, StoreError};

/// The assembled subsystem: a store, a set of executors, and the scheduler
/// configuration, started as one tick loop.
pub struct Taskmill<S> {
    store: S,
    executors: HashMap<&'static str, Arc<dyn ErasedExecutor>>,
    config: SchedulerConfig,
    source_check: Arc<SourceCheck>,
    registry: ActiveJobs,
}

impl<S> Default for Taskmill<S>
where
    S: Store + Clone + Send + Sync + Default + 'static,
{
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<S> Taskmill<S>
where
    S: Store + Clone + Send + Sync + 'static,
{
    pub fn new(store: S) -> Self {
        Self {
            store,
            executors: Default::default(),
            config: SchedulerConfig::default(),
            source_check: Arc::new(|path: &str| std::path::Path::new(path).exists()),
            registry: ActiveJobs::new(),
        }
    }

    /// Register an executor. Jobs whose `kind` equals `E::NAME` are handed
    /// to it; kinds without a registered executor are never dispatched.
    pub fn with_executor<E>(mut self) -> Self
    where
        E: Executor + 'static,
        E::Payload: Send + DeserializeOwned + 'static,
    {
        self.executors
            .insert(E::NAME, Arc::new(ExecutorAdapter::<E>::new()));
        self
    }

    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Replace the plan-expansion source-file check (the default asks the
    /// local filesystem).
    pub fn with_source_check<F>(mut self, check: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.source_check = Arc::new(check);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// The in-process registry of running jobs. Complementary stop-kind
    /// executors hold a clone of this to find the work they stop.
    pub fn registry(&self) -> ActiveJobs {
        self.registry.clone()
    }

    /// Start the tick loop and return its handle.
    pub fn start(self) -> TaskmillHandle {
        let executors = Arc::new(self.executors);
        let governor = Arc::new(governor::for_executors(&executors));
        tracing::debug!(kinds = ?executors.keys().collect::<Vec<_>>(), "starting taskmill scheduler");
        let scheduler = Scheduler {
            store: self.store,
            executors,
            governor,
            registry: self.registry.clone(),
            config: self.config,
            source_check: self.source_check,
            seq: AtomicU64::new(0),
        };
        TaskmillHandle {
            registry: self.registry,
            scheduler: scheduler.spawn(),
        }
    }
}

/// Handle to a running [`Taskmill`].
pub struct TaskmillHandle {
    scheduler: SchedulerHandle,
    registry: ActiveJobs,
}

impl TaskmillHandle {
    /// An on-demand tick trigger, cheap to clone into producers.
    pub fn trigger(&self) -> Trigger {
        self.scheduler.trigger()
    }

    pub fn registry(&self) -> ActiveJobs {
        self.registry.clone()
    }

    /// Stop ticking and wait for the loop to exit. In-flight executors run
    /// to completion on their own tasks.
    pub async fn graceful_shutdown(mut self) -> Result<(), TaskmillError> {
        tracing::debug!("shutting down taskmill");
        self.scheduler.graceful_shutdown().await
    }
}

#[derive(Debug, Error)]
pub enum TaskmillError {
    #[error("failed to gracefully shut down")]
    GracefulShutdownFailed,
    #[error("error communicating with the store")]
    Store(#[from] StoreError),
    #[error("error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
}
