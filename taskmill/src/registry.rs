//! Registry of jobs currently executing in this process.
//!
//! Keyed by job id, guarded by a mutex, with registration tied to an RAII
//! guard so every exit path (terminal result, panic, abandonment) deregisters.
//! Complementary stop-kind executors consult it to find the work they are
//! stopping, and dispatch uses it to avoid re-claiming a row whose original
//! executor is still alive in this very process after a stale recovery.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{DateTime, Utc};

use crate::job::JobId;

/// What is known about one in-flight job.
#[derive(Debug, Clone)]
pub struct ActiveJob {
    pub kind: String,
    pub worker: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct ActiveJobs {
    inner: Arc<Mutex<HashMap<JobId, ActiveJob>>>,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a job as in flight. Dropping the returned guard deregisters it.
    pub(crate) fn register(&self, job_id: JobId, kind: &str, worker: &str) -> ActiveGuard {
        self.lock().insert(
            job_id,
            ActiveJob {
                kind: kind.to_owned(),
                worker: worker.to_owned(),
                started_at: Utc::now(),
            },
        );
        ActiveGuard {
            registry: self.clone(),
            job_id,
        }
    }

    pub fn get(&self, job_id: JobId) -> Option<ActiveJob> {
        self.lock().get(&job_id).cloned()
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        self.lock().contains_key(&job_id)
    }

    pub fn count_for(&self, kind: &str) -> usize {
        self.lock().values().filter(|job| job.kind == kind).count()
    }

    pub fn active_ids(&self) -> Vec<JobId> {
        let mut ids: Vec<JobId> = self.lock().keys().copied().collect();
        ids.sort();
        ids
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<JobId, ActiveJob>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Deregisters its job on drop, whichever way the worker task ends.
pub struct ActiveGuard {
    registry: ActiveJobs,
    job_id: JobId,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.job_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_deregisters_on_drop() {
        let registry = ActiveJobs::new();
        let guard = registry.register(1.into(), "listen-start", "w1");

        assert!(registry.is_active(1.into()));
        assert_eq!(registry.count_for("listen-start"), 1);
        assert_eq!(registry.get(1.into()).unwrap().worker, "w1");

        drop(guard);
        assert!(!registry.is_active(1.into()));
        assert_eq!(registry.count_for("listen-start"), 0);
    }

    #[test]
    fn guard_deregisters_on_panic() {
        let registry = ActiveJobs::new();
        let result = std::panic::catch_unwind({
            let registry = registry.clone();
            move || {
                let _guard = registry.register(2.into(), "video-edit", "w1");
                panic!("executor blew up");
            }
        });

        assert!(result.is_err());
        assert!(!registry.is_active(2.into()));
    }

    #[test]
    fn tracks_multiple_kinds_independently() {
        let registry = ActiveJobs::new();
        let _a = registry.register(1.into(), "video-publish", "w1");
        let _b = registry.register(2.into(), "video-publish", "w2");
        let _c = registry.register(3.into(), "chat-send", "w3");

        assert_eq!(registry.count_for("video-publish"), 2);
        assert_eq!(registry.count_for("chat-send"), 1);
        assert_eq!(registry.active_ids(), vec![1.into(), 2.into(), 3.into()]);
    }
}
