//! Convenience re-exports for the common surface of the crate.

pub use crate::executor::{ExecutionError, ExecutionResult, Executor, Progress};
pub use crate::job::builder::JobBuilder;
pub use crate::job::{Job, JobId, JobStatus};
pub use crate::plan::{
    Account, AccountId, NewAccount, NewPlan, NewPlanItem, Plan, PlanId, PlanItem, PlanItemId,
    PlanItemStatus, PlanStatus,
};
pub use crate::registry::{ActiveJob, ActiveJobs};
pub use crate::scheduler::{SchedulerConfig, Trigger};
pub use crate::store::{JobStore, NewJob, PlanStore, Store, StoreError};
pub use crate::{Taskmill, TaskmillError, TaskmillHandle};
