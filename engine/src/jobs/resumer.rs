// Workflow Resumer - wakes suspended executions on a fixed interval

use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::workflows::ExecutionScheduler;

const MAX_EXECUTION_LOGS: usize = 100;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Engine error: {0}")]
    EngineError(#[from] EngineError),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Scan interval for due executions
    pub resume_interval: Duration,

    // Maintenance
    /// Finished executions older than this many days are purged; 0 disables the job
    pub retention_days: u32,
    pub purge_cron: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            resume_interval: Duration::from_secs(60),
            retention_days: 0,
            // Daily at 3 AM
            purge_cron: "0 0 3 * * *".to_string(),
        }
    }
}

impl From<&EngineConfig> for JobConfig {
    fn from(config: &EngineConfig) -> Self {
        Self {
            resume_interval: config.resume_interval,
            retention_days: config.retention_days,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: chrono::DateTime<Utc>,
    pub completed_at: Option<chrono::DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: usize,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
}

pub struct WorkflowResumer {
    scheduler: JobScheduler,
    executions: Arc<ExecutionScheduler>,
    config: JobConfig,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl WorkflowResumer {
    pub async fn new(executions: Arc<ExecutionScheduler>, config: JobConfig) -> JobResult<Self> {
        if config.resume_interval.is_zero() {
            return Err(JobError::ConfigError("resume interval must be positive".to_string()));
        }

        let scheduler = JobScheduler::new().await?;

        Ok(Self {
            scheduler,
            executions,
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting workflow resumer");

        self.schedule_resumer().await?;
        self.schedule_purge().await?;

        self.scheduler.start().await?;

        info!("Workflow resumer started");
        Ok(())
    }

    pub async fn shutdown(&self) -> JobResult<()> {
        info!("Shutting down workflow resumer");
        let mut scheduler = self.scheduler.clone();
        scheduler.shutdown().await?;
        Ok(())
    }

    /// Run one resume scan now, outside the schedule.
    pub async fn run_once(&self) -> JobExecutionLog {
        let log = run_resumer_once(&self.executions).await;
        push_log(&self.execution_logs, log.clone()).await;
        log
    }

    pub async fn recent_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    async fn schedule_resumer(&self) -> JobResult<()> {
        let interval = self.config.resume_interval;
        let executions = self.executions.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
            let executions = executions.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log = run_resumer_once(&executions).await;
                push_log(&logs, log).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled resumer to run every {} seconds", interval.as_secs_f64());

        Ok(())
    }

    async fn schedule_purge(&self) -> JobResult<()> {
        if self.config.retention_days == 0 {
            info!("Execution retention is unlimited, skipping purge job");
            return Ok(());
        }

        let retention = ChronoDuration::days(i64::from(self.config.retention_days));
        let executions = self.executions.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(self.config.purge_cron.as_str(), move |_uuid, _lock| {
            let executions = executions.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log = run_purge_once(&executions, retention).await;
                push_log(&logs, log).await;
            })
        })?;

        self.scheduler.add(job).await?;
        info!(
            "Scheduled purge of executions older than {} days ({})",
            self.config.retention_days, self.config.purge_cron
        );

        Ok(())
    }
}

/// One resumer tick: resume everything that is due.
pub async fn run_resumer_once(executions: &ExecutionScheduler) -> JobExecutionLog {
    let started_at = Utc::now();
    let resumed = executions.resume_due().await;
    let completed_at = Utc::now();

    if !resumed.is_empty() {
        info!("Resumer completed: {} executions resumed", resumed.len());
    }

    JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: "Workflow Resumer".to_string(),
        started_at,
        completed_at: Some(completed_at),
        status: JobStatus::Completed,
        items_processed: resumed.len(),
        errors: Vec::new(),
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    }
}

async fn run_purge_once(executions: &ExecutionScheduler, retention: ChronoDuration) -> JobExecutionLog {
    let started_at = Utc::now();
    let (status, items_processed, errors) = match executions.purge_finished(retention).await {
        Ok(purged) => (JobStatus::Completed, purged, Vec::new()),
        Err(e) => {
            error!("Execution purge failed: {}", e);
            (JobStatus::Failed, 0, vec![e.to_string()])
        }
    };
    let completed_at = Utc::now();

    JobExecutionLog {
        id: Uuid::new_v4(),
        job_name: "Execution Purge".to_string(),
        started_at,
        completed_at: Some(completed_at),
        status,
        items_processed,
        errors,
        duration_ms: Some((completed_at - started_at).num_milliseconds()),
    }
}

async fn push_log(logs: &RwLock<Vec<JobExecutionLog>>, log: JobExecutionLog) {
    let mut logs = logs.write().await;
    logs.push(log);
    // Keep only the most recent logs
    if logs.len() > MAX_EXECUTION_LOGS {
        let excess = logs.len() - MAX_EXECUTION_LOGS;
        logs.drain(..excess);
    }
}
