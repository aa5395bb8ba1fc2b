//! Row types and their conversions to the taskmill model.
//!
//! Timestamps live in the database as unix epoch milliseconds; statuses as
//! their canonical text forms.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use taskmill::job::JobStatus;
use taskmill::plan::{Account, Plan, PlanItem, PlanItemStatus, PlanStatus};
use taskmill::store::{Job, StoreError};

pub(crate) fn millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn opt_millis(ts: Option<DateTime<Utc>>) -> Option<i64> {
    ts.map(millis)
}

pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_millis(ms).ok_or(StoreError::BadState)
}

pub(crate) fn from_opt_millis(ms: Option<i64>) -> Result<Option<DateTime<Utc>>, StoreError> {
    ms.map(from_millis).transpose()
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: i64,
    pub kind: String,
    pub payload: String,
    pub status: String,
    pub progress: i64,
    pub attempts: i64,
    pub max_attempts: i64,
    pub locked_by: Option<String>,
    pub locked_at: Option<i64>,
    pub error_message: Option<String>,
    pub result: Option<String>,
    pub created_at: i64,
    pub scheduled_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub updated_at: i64,
}

impl TryFrom<JobRow> for Job {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            kind: row.kind,
            payload: serde_json::from_str(&row.payload)?,
            status: row.status.parse::<JobStatus>().map_err(StoreError::database)?,
            progress: row.progress.clamp(0, 100) as u8,
            attempts: u32::try_from(row.attempts).map_err(|_| StoreError::BadState)?,
            max_attempts: u32::try_from(row.max_attempts).map_err(|_| StoreError::BadState)?,
            locked_by: row.locked_by,
            locked_at: from_opt_millis(row.locked_at)?,
            error_message: row.error_message,
            result: row.result.as_deref().map(serde_json::from_str).transpose()?,
            created_at: from_millis(row.created_at)?,
            scheduled_at: from_millis(row.scheduled_at)?,
            started_at: from_opt_millis(row.started_at)?,
            completed_at: from_opt_millis(row.completed_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PlanRow {
    pub id: i64,
    pub name: String,
    pub kind: String,
    pub trigger_at: Option<i64>,
    pub status: String,
    pub total_items: i64,
    pub pending_items: i64,
    pub published_items: i64,
    pub failed_items: i64,
    pub assigned_accounts: i64,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<PlanRow> for Plan {
    type Error = StoreError;

    fn try_from(row: PlanRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            name: row.name,
            kind: row.kind,
            trigger_at: from_opt_millis(row.trigger_at)?,
            status: row.status.parse::<PlanStatus>().map_err(StoreError::database)?,
            total_items: u32::try_from(row.total_items).map_err(|_| StoreError::BadState)?,
            pending_items: u32::try_from(row.pending_items).map_err(|_| StoreError::BadState)?,
            published_items: u32::try_from(row.published_items)
                .map_err(|_| StoreError::BadState)?,
            failed_items: u32::try_from(row.failed_items).map_err(|_| StoreError::BadState)?,
            assigned_accounts: u32::try_from(row.assigned_accounts)
                .map_err(|_| StoreError::BadState)?,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct PlanItemRow {
    pub id: i64,
    pub plan_id: i64,
    pub source: String,
    pub title: Option<String>,
    pub status: String,
    pub account_id: Option<i64>,
    pub job_id: Option<i64>,
    pub error_message: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl TryFrom<PlanItemRow> for PlanItem {
    type Error = StoreError;

    fn try_from(row: PlanItemRow) -> Result<Self, Self::Error> {
        Ok(Self {
            id: row.id.into(),
            plan_id: row.plan_id.into(),
            source: row.source,
            title: row.title,
            status: row
                .status
                .parse::<PlanItemStatus>()
                .map_err(StoreError::database)?,
            account_id: row.account_id.map(Into::into),
            job_id: row.job_id.map(Into::into),
            error_message: row.error_message,
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct AccountRow {
    pub id: i64,
    pub name: String,
    pub eligible: bool,
}

impl From<AccountRow> for Account {
    fn from(row: AccountRow) -> Self {
        Self {
            id: row.id.into(),
            name: row.name,
            eligible: row.eligible,
        }
    }
}
