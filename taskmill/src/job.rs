//! The job model shared by every queue kind.
//!
//! A job row has the same state-machine shape whether it publishes a video,
//! sends a chat reply, starts or stops a listener, transcodes a media file,
//! or renders an edit. The scheduler only ever looks at the fields defined
//! here; the `payload` stays opaque until the executor deserializes it.

use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use crate::store;

pub mod builder;

/// Identifier of a single job row.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) i64);

impl From<i64> for JobId {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<JobId> for i64 {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Status of a job row.
///
/// `Success`, `Fail`, and `Stopped` are terminal: once one of them is
/// committed no automatic transition ever leaves it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum JobStatus {
    /// Waiting to be claimed, or returned to the queue by the stale sweep.
    Pending,
    /// Claimed by exactly one worker identified by `locked_by`.
    Running,
    /// Terminal: the executor finished and recorded its result.
    Success,
    /// Terminal: the executor failed, or the attempt budget ran out.
    Fail,
    /// Terminal: the work was stopped before producing a result.
    Stopped,
}

impl JobStatus {
    /// The textual form stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Stopped => "stopped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail | Self::Stopped)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a status string read from the store is unknown.
#[derive(Debug, thiserror::Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            "stopped" => Ok(Self::Stopped),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// A job with its payload deserialized for a specific executor.
///
/// The store works with [`store::Job`] where the payload is raw JSON; this is
/// the typed view handed to [`crate::executor::Executor::execute`].
pub struct Job<P> {
    pub id: JobId,
    pub kind: String,
    pub payload: P,
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

impl<P> Job<P> {
    /// Whether the attempt budget is spent after this attempt.
    pub fn is_final_attempt(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

impl<P> TryFrom<store::Job> for Job<P>
where
    P: DeserializeOwned,
{
    type Error = serde_json::Error;

    fn try_from(value: store::Job) -> Result<Self, Self::Error> {
        let payload = serde_json::from_value(value.payload)?;
        Ok(Self {
            id: value.id,
            kind: value.kind,
            payload,
            status: value.status,
            progress: value.progress,
            attempts: value.attempts,
            max_attempts: value.max_attempts,
            locked_by: value.locked_by,
            locked_at: value.locked_at,
            error_message: value.error_message,
            result: value.result,
            created_at: value.created_at,
            scheduled_at: value.scheduled_at,
            started_at: value.started_at,
            completed_at: value.completed_at,
            updated_at: value.updated_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Success,
            JobStatus::Fail,
            JobStatus::Stopped,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("uploading".parse::<JobStatus>().is_err());
    }

    #[test]
    fn terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Success.is_terminal());
        assert!(JobStatus::Fail.is_terminal());
        assert!(JobStatus::Stopped.is_terminal());
    }
}
