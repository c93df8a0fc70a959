// Background Jobs
//
// Periodic work scheduled with tokio-cron-scheduler: the resumer that wakes
// executions whose delay has elapsed, and the optional purge of old finished
// executions.

pub mod resumer;

pub use resumer::{JobConfig, JobError, JobExecutionLog, JobResult, JobStatus, WorkflowResumer};
