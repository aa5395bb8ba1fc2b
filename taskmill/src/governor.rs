//! Per-kind admission control.
//!
//! The governor caps how many jobs of one kind run simultaneously in this
//! process. Its bookkeeping is deliberately independent of the job rows: a
//! permit is an RAII guard tied to the worker task, so it is released on
//! success, failure, panic, and abandonment alike, and a process restart
//! starts from a full set of permits (in-flight rows from the previous
//! incarnation come back through the stale sweep instead).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::executor::ErasedExecutor;

pub struct ConcurrencyGovernor {
    limits: HashMap<&'static str, Arc<Semaphore>>,
}

impl ConcurrencyGovernor {
    /// Build the governor for a set of `(kind, cap)` pairs. A kind with no
    /// cap is admitted unconditionally.
    pub(crate) fn new(limits: impl IntoIterator<Item = (&'static str, Option<usize>)>) -> Self {
        Self {
            limits: limits
                .into_iter()
                .filter_map(|(kind, cap)| Some((kind, Arc::new(Semaphore::new(cap?)))))
                .collect(),
        }
    }

    /// Ask to run one job of `kind` right now.
    ///
    /// `None` means the kind is at capacity; the caller leaves the job
    /// pending for a later tick rather than queueing. This is backpressure,
    /// not an error.
    pub fn try_admit(&self, kind: &str) -> Option<AdmitPermit> {
        match self.limits.get(kind) {
            None => Some(AdmitPermit { _permit: None }),
            Some(semaphore) => semaphore
                .clone()
                .try_acquire_owned()
                .ok()
                .map(|permit| AdmitPermit {
                    _permit: Some(permit),
                }),
        }
    }
}

/// Proof of admission. Dropping it releases the slot.
pub struct AdmitPermit {
    _permit: Option<OwnedSemaphorePermit>,
}

/// Build the governor for a set of registered executors, letting the
/// environment override each executor's built-in cap.
pub(crate) fn for_executors(
    executors: &HashMap<&'static str, Arc<dyn ErasedExecutor>>,
) -> ConcurrencyGovernor {
    ConcurrencyGovernor::new(executors.iter().map(|(&kind, executor)| {
        let cap = limit_from_env(kind).unwrap_or(executor.max_concurrency());
        (kind, cap)
    }))
}

/// Cap override from the environment, e.g. `MAX_VIDEO_EDIT_CONCURRENCY=2`
/// for the `video-edit` kind. A value of `0` lifts the cap entirely.
///
/// Outer `None` means the variable is absent or unparseable and the
/// executor's built-in cap applies.
pub(crate) fn limit_from_env(kind: &str) -> Option<Option<usize>> {
    let var = format!("MAX_{}_CONCURRENCY", kind.to_uppercase().replace('-', "_"));
    let raw = std::env::var(var).ok()?;
    let value: usize = raw.trim().parse().ok()?;
    Some((value > 0).then_some(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_the_cap() {
        let governor = ConcurrencyGovernor::new([("video-edit", Some(2))]);

        let first = governor.try_admit("video-edit");
        let second = governor.try_admit("video-edit");
        assert!(first.is_some());
        assert!(second.is_some());
        assert!(governor.try_admit("video-edit").is_none());

        drop(first);
        assert!(governor.try_admit("video-edit").is_some());
    }

    #[test]
    fn unlimited_kinds_always_admit() {
        let governor = ConcurrencyGovernor::new([("video-edit", None)]);

        let permits: Vec<_> = (0..100)
            .map(|_| governor.try_admit("video-edit"))
            .collect();
        assert!(permits.iter().all(Option::is_some));
    }

    #[test]
    fn unknown_kinds_are_not_capped() {
        let governor = ConcurrencyGovernor::new([]);
        assert!(governor.try_admit("chat-send").is_some());
    }

    #[test]
    fn env_override_beats_the_built_in_cap() {
        std::env::set_var("MAX_GOVERNOR_TEST_KIND_CONCURRENCY", "7");
        assert_eq!(limit_from_env("governor-test-kind"), Some(Some(7)));

        std::env::set_var("MAX_GOVERNOR_TEST_KIND_CONCURRENCY", "0");
        assert_eq!(limit_from_env("governor-test-kind"), Some(None));

        std::env::set_var("MAX_GOVERNOR_TEST_KIND_CONCURRENCY", "lots");
        assert_eq!(limit_from_env("governor-test-kind"), None);

        std::env::remove_var("MAX_GOVERNOR_TEST_KIND_CONCURRENCY");
        assert_eq!(limit_from_env("governor-test-kind"), None);
    }
}
