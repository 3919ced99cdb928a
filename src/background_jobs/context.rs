use super::job::JobError;
use super::server::JobServer;
use crate::job_store::Job;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Context provided to a job body during execution.
///
/// Owns the worker's copy of the claimed job, so progress and data written
/// through it keep the local copy and the store in sync.
pub struct JobContext {
    job: Job,
    job_server: Arc<JobServer>,

    /// Fired by the cancellation watcher when the job is cancelled.
    cancellation_token: CancellationToken,

    /// Fired when the worker running the job is stopping.
    stop_token: CancellationToken,
}

impl JobContext {
    pub fn new(
        job: Job,
        job_server: Arc<JobServer>,
        cancellation_token: CancellationToken,
        stop_token: CancellationToken,
    ) -> Self {
        Self {
            job,
            job_server,
            cancellation_token,
            stop_token,
        }
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn job_server(&self) -> &Arc<JobServer> {
        &self.job_server
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Returns the error a job body should stop with, if any.
    pub fn checkpoint(&self) -> Result<(), JobError> {
        if self.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        if self.is_stopping() {
            return Err(JobError::Stopped);
        }
        Ok(())
    }

    pub fn set_progress(&mut self, progress: i64) -> Result<(), JobError> {
        let updated = self
            .job_server
            .set_job_progress(&mut self.job, progress)
            .map_err(|e| JobError::Failed(e.to_string()))?;
        self.ensure_still_in_progress(updated)
    }

    /// Stores `value` under `key` in the job data and persists it, which also
    /// refreshes the job's last activity.
    pub fn update_data(&mut self, key: &str, value: impl Into<String>) -> Result<(), JobError> {
        self.job.data.insert(key.to_string(), value.into());
        self.heartbeat()
    }

    /// Persists the job data as is, refreshing the job's last activity.
    pub fn heartbeat(&mut self) -> Result<(), JobError> {
        let updated = self
            .job_server
            .update_in_progress_job_data(&mut self.job)
            .map_err(|e| JobError::Failed(e.to_string()))?;
        self.ensure_still_in_progress(updated)
    }

    /// A lost CAS means someone else moved the job out of `InProgress`,
    /// which only happens on cancellation or wedged job recovery.
    fn ensure_still_in_progress(&self, updated: bool) -> Result<(), JobError> {
        if updated {
            Ok(())
        } else {
            Err(JobError::Cancelled)
        }
    }

    pub(crate) fn into_job(self) -> Job {
        self.job
    }
}
