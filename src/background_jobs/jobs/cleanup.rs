//! Jobs table cleanup.
//!
//! Deletes finished jobs older than `jobs.cleanup_jobs_threshold_days`, once
//! a day at `jobs.cleanup_jobs_time`.

use crate::background_jobs::{DailyScheduler, JobContext, JobError, JobExecutor, JobServer};
use crate::config::ConfigService;
use crate::job_store::JobType;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::info;

pub const DELETED_KEY: &str = "deleted";

/// Daily scheduler enabled only while a retention threshold is configured.
pub fn jobs_cleanup_scheduler(job_server: Arc<JobServer>) -> DailyScheduler {
    let default_time = crate::config::JobsSettings::default().cleanup_jobs_time;
    DailyScheduler::new(job_server, JobType::JOBS_CLEANUP, default_time)
        .with_enabled(|config| config.jobs.cleanup_jobs_threshold_days > 0)
        .with_start_time(|config| config.jobs.cleanup_jobs_time)
}

pub struct JobsCleanupExecutor {
    config_service: Arc<dyn ConfigService>,
}

impl JobsCleanupExecutor {
    pub fn new(config_service: Arc<dyn ConfigService>) -> Self {
        Self { config_service }
    }
}

impl JobExecutor for JobsCleanupExecutor {
    fn execute(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let config = self.config_service.config();
        let threshold_days = config.jobs.cleanup_jobs_threshold_days;
        if threshold_days == 0 {
            info!("Jobs cleanup is disabled, nothing to do");
            return Ok(());
        }

        let batch_size = config.jobs.cleanup_batch_size.max(1);
        let cutoff = i64::try_from(threshold_days)
            .ok()
            .and_then(ChronoDuration::try_days)
            .and_then(|threshold| Utc::now().checked_sub_signed(threshold))
            .ok_or_else(|| {
                JobError::Failed(format!(
                    "cleanup threshold of {} days is out of range",
                    threshold_days
                ))
            })?;
        info!(
            "Deleting finished jobs created before {} (older than {} days)",
            cutoff, threshold_days
        );

        let mut total = 0;
        loop {
            ctx.checkpoint()?;
            let deleted = ctx
                .job_server()
                .delete_finished_jobs(cutoff, batch_size)
                .map_err(|e| JobError::Failed(e.to_string()))?;
            total += deleted;
            if deleted < batch_size {
                break;
            }
            ctx.update_data(DELETED_KEY, total.to_string())?;
        }

        ctx.update_data(DELETED_KEY, total.to_string())?;
        info!("Deleted {} finished jobs", total);
        Ok(())
    }
}
