//! Builder producers use to enqueue a job for a given executor.

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;

use crate::executor::Executor;
use crate::job::JobId;
use crate::store::{JobStore, NewJob};
use crate::TaskmillError;

pub struct JobBuilder<E>
where
    E: Executor,
{
    payload: Option<E::Payload>,
    max_attempts: Option<u32>,
    scheduled_at: DateTime<Utc>,
}

impl<E> Default for JobBuilder<E>
where
    E: Executor,
{
    fn default() -> Self {
        Self {
            payload: None,
            max_attempts: None,
            scheduled_at: Utc::now(),
        }
    }
}

impl<E> JobBuilder<E>
where
    E: Executor,
    E::Payload: Serialize,
{
    pub fn with_payload(self, payload: E::Payload) -> Self {
        Self {
            payload: Some(payload),
            ..self
        }
    }

    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..self
        }
    }

    pub fn schedule_at(self, scheduled_at: DateTime<Utc>) -> Self {
        Self {
            scheduled_at,
            ..self
        }
    }

    pub fn schedule_in(self, delay: TimeDelta) -> Self {
        Self {
            scheduled_at: Utc::now() + delay,
            ..self
        }
    }

    pub async fn enqueue_to_store<S>(self, store: &S) -> Result<JobId, TaskmillError>
    where
        S: JobStore + ?Sized,
    {
        let job_id = store
            .insert(NewJob {
                kind: E::NAME.to_owned(),
                payload: serde_json::to_value(self.payload)?,
                max_attempts: self.max_attempts.unwrap_or(E::MAX_ATTEMPTS),
                scheduled_at: self.scheduled_at,
            })
            .await?;

        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::test::ChatSendExecutor;
    use crate::job::JobStatus;
    use crate::store::memory::MemoryStore;

    #[tokio::test]
    async fn enqueue_uses_executor_defaults() {
        let store = MemoryStore::new();

        let job_id = ChatSendExecutor::builder()
            .with_payload("hello there".to_owned())
            .enqueue_to_store(&store)
            .await
            .unwrap();

        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.kind, "chat-send");
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.max_attempts, ChatSendExecutor::MAX_ATTEMPTS);
        assert_eq!(job.payload, serde_json::json!("hello there"));
    }

    #[tokio::test]
    async fn enqueue_with_overrides() {
        let store = MemoryStore::new();
        let when = Utc::now() + TimeDelta::hours(2);

        let job_id = ChatSendExecutor::builder()
            .with_payload("later".to_owned())
            .with_max_attempts(1)
            .schedule_at(when)
            .enqueue_to_store(&store)
            .await
            .unwrap();

        let job = store.job(job_id).await.unwrap();
        assert_eq!(job.max_attempts, 1);
        assert_eq!(job.scheduled_at, when);
    }
}
