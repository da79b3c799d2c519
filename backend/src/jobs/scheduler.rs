// Job Scheduler - Central scheduler for all background jobs

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_cron_scheduler::{Job, JobScheduler as TokioScheduler, JobSchedulerError};
use tracing::{error, info};
use uuid::Uuid;

use super::ExpirySweeperJob;
use crate::automations::ExecutionEngine;
use crate::config::AutomationConfig;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Scheduler error: {0}")]
    SchedulerError(#[from] JobSchedulerError),
    #[error("Job execution error: {0}")]
    ExecutionError(String),
    #[error("Configuration error: {0}")]
    ConfigError(String),
}

pub type JobResult<T> = Result<T, JobError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecutionLog {
    pub id: Uuid,
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub items_processed: i32,
    pub errors: Vec<String>,
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum JobStatus {
    Running,
    Completed,
    Failed,
    PartialFailure,
}

pub struct JobScheduler {
    scheduler: TokioScheduler,
    engine: Arc<ExecutionEngine>,
    config: AutomationConfig,
    execution_logs: Arc<RwLock<Vec<JobExecutionLog>>>,
}

impl JobScheduler {
    pub async fn new(engine: Arc<ExecutionEngine>, config: AutomationConfig) -> JobResult<Self> {
        let scheduler = TokioScheduler::new().await?;

        Ok(Self {
            scheduler,
            engine,
            config,
            execution_logs: Arc::new(RwLock::new(Vec::new())),
        })
    }

    pub async fn start(&self) -> JobResult<()> {
        info!("Starting background job scheduler");

        self.schedule_expiry_sweeper().await?;

        self.scheduler.start().await?;

        info!("Background job scheduler started successfully");
        Ok(())
    }

    pub async fn shutdown(&mut self) -> JobResult<()> {
        info!("Shutting down background job scheduler");
        self.scheduler.shutdown().await?;
        Ok(())
    }

    async fn schedule_expiry_sweeper(&self) -> JobResult<()> {
        let interval = self.config.sweep_interval_minutes.max(1);
        let cron_expr = format!("0 */{} * * * *", interval); // Every N minutes

        let engine = self.engine.clone();
        let logs = self.execution_logs.clone();

        let job = Job::new_async(cron_expr.as_str(), move |_uuid, _lock| {
            let engine = engine.clone();
            let logs = logs.clone();

            Box::pin(async move {
                let log_id = Uuid::new_v4();
                let started_at = Utc::now();

                info!("Running execution expiry sweeper");

                let sweeper = ExpirySweeperJob::new(engine);
                let report = sweeper.run().await;

                let completed_at = Utc::now();
                let duration = (completed_at - started_at).num_milliseconds();

                let log = JobExecutionLog {
                    id: log_id,
                    job_name: "Expiry Sweeper".to_string(),
                    started_at,
                    completed_at: Some(completed_at),
                    status: if report.errors.is_empty() {
                        JobStatus::Completed
                    } else {
                        JobStatus::PartialFailure
                    },
                    items_processed: report.scanned as i32,
                    errors: report.errors.clone(),
                    duration_ms: Some(duration),
                };

                let mut logs = logs.write().await;
                logs.push(log);
                // Keep only last 100 logs
                if logs.len() > 100 {
                    logs.remove(0);
                }

                if !report.errors.is_empty() {
                    error!(
                        "Expiry sweeper finished with errors: {} expired, {} errors",
                        report.expired,
                        report.errors.len()
                    );
                } else {
                    info!(
                        "Expiry sweeper completed: {} scanned, {} expired",
                        report.scanned, report.expired
                    );
                }
            })
        })?;

        self.scheduler.add(job).await?;
        info!("Scheduled expiry sweeper to run every {} minutes", interval);

        Ok(())
    }

    pub async fn get_execution_logs(&self) -> Vec<JobExecutionLog> {
        self.execution_logs.read().await.clone()
    }

    pub async fn run_job_now(&self, job_name: &str) -> JobResult<()> {
        match job_name {
            "expiry_sweeper" => {
                let sweeper = ExpirySweeperJob::new(self.engine.clone());
                let report = sweeper.run().await;
                if !report.errors.is_empty() {
                    return Err(JobError::ExecutionError(report.errors.join("; ")));
                }
            }
            _ => return Err(JobError::ConfigError(format!("Unknown job: {}", job_name))),
        }

        Ok(())
    }
}
