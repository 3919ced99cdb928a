use super::error::JobServerError;
use crate::job_store::{
    truncate_to_millis, Job, JobFilter, JobStatus, JobStore, JobType, JOB_DATA_ERROR_KEY,
};
use crate::metrics::MetricsSink;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_CANCELLATION_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub type Result<T> = std::result::Result<T, JobServerError>;

/// Lifecycle operations on jobs.
///
/// Every status change is a compare-and-swap on the previous status, so
/// concurrent callers (in this process or in others sharing the store) can
/// never both win the same transition. Losing a race is reported as `false`,
/// never as an error.
pub struct JobServer {
    store: Arc<dyn JobStore>,
    metrics: Arc<dyn MetricsSink>,
    /// Ids of the jobs claimed by this server and not finished yet.
    claimed: Mutex<HashSet<String>>,
    pub(super) cancellation_poll_interval: Duration,
}

impl JobServer {
    pub fn new(store: Arc<dyn JobStore>, metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            store,
            metrics,
            claimed: Mutex::new(HashSet::new()),
            cancellation_poll_interval: DEFAULT_CANCELLATION_POLL_INTERVAL,
        }
    }

    pub fn with_cancellation_poll_interval(mut self, interval: Duration) -> Self {
        self.cancellation_poll_interval = interval;
        self
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn create_job(&self, job_type: JobType, data: HashMap<String, String>) -> Result<Job> {
        let job = Job::new(job_type, data);
        job.validate().map_err(JobServerError::Validation)?;

        let job = self
            .store
            .save(&job)
            .map_err(JobServerError::persistence("create_job"))?;
        debug!("Created job {} of type {}", job.id, job.job_type);
        Ok(job)
    }

    pub fn get_job(&self, id: &str) -> Result<Job> {
        self.store
            .get(id)
            .map_err(JobServerError::persistence("get_job"))?
            .ok_or_else(|| JobServerError::NotFound(id.to_string()))
    }

    /// Moves `job` from `Pending` to `InProgress`. Returns false when another
    /// worker claimed it first.
    pub fn claim_job(&self, job: &mut Job) -> Result<bool> {
        let claimed = self
            .store
            .update_status_optimistically(&job.id, JobStatus::Pending, JobStatus::InProgress)
            .map_err(JobServerError::persistence("claim_job"))?;
        if !claimed {
            return Ok(false);
        }

        let now = Self::now();
        job.status = JobStatus::InProgress;
        job.start_at = Some(now);
        job.last_activity_at = now;
        self.claimed.lock().unwrap().insert(job.id.clone());
        self.metrics.increment_job_active(&job.job_type);
        Ok(true)
    }

    pub fn set_job_progress(&self, job: &mut Job, progress: i64) -> Result<bool> {
        let mut updated = job.clone();
        updated.progress = progress;
        self.write_in_progress(job, updated, "set_job_progress")
    }

    /// Persists the data of an in progress job and refreshes its last
    /// activity, so long running jobs are not considered wedged.
    pub fn update_in_progress_job_data(&self, job: &mut Job) -> Result<bool> {
        let updated = job.clone();
        self.write_in_progress(job, updated, "update_in_progress_job_data")
    }

    fn write_in_progress(
        &self,
        job: &mut Job,
        mut updated: Job,
        operation: &'static str,
    ) -> Result<bool> {
        updated.status = JobStatus::InProgress;
        let written = self
            .store
            .update_optimistically(&updated, JobStatus::InProgress)
            .map_err(JobServerError::persistence(operation))?;
        if written {
            updated.last_activity_at = Self::now();
            *job = updated;
        }
        Ok(written)
    }

    pub fn set_job_success(&self, job: &mut Job) -> Result<bool> {
        self.finish_job(job, JobStatus::Success, Some(100), "set_job_success")
    }

    pub fn set_job_warning(&self, job: &mut Job) -> Result<bool> {
        self.finish_job(job, JobStatus::Warning, None, "set_job_warning")
    }

    /// Terminal write from `InProgress`, retried from `CancelRequested` when
    /// the cancellation arrived after the work was already done.
    fn finish_job(
        &self,
        job: &mut Job,
        status: JobStatus,
        progress: Option<i64>,
        operation: &'static str,
    ) -> Result<bool> {
        let mut updated = job.clone();
        updated.status = status;
        if let Some(progress) = progress {
            updated.progress = progress;
        }

        for expected in [JobStatus::InProgress, JobStatus::CancelRequested] {
            let written = self
                .store
                .update_optimistically(&updated, expected)
                .map_err(JobServerError::persistence(operation))?;
            if written {
                updated.last_activity_at = Self::now();
                *job = updated;
                self.job_finished(job);
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Records `job` as failed.
    ///
    /// Without a message the status is written unconditionally, which is how
    /// wedged jobs owned by a dead worker are retired. The active gauge only
    /// moves when that worker belonged to this server. With a message the
    /// write is a CAS from `InProgress`, retried from `CancelRequested` since
    /// a failure can race with a cancellation request.
    pub fn set_job_error(&self, job: &mut Job, message: Option<&str>) -> Result<()> {
        let Some(message) = message else {
            self.store
                .update_status(&job.id, JobStatus::Error)
                .map_err(JobServerError::persistence("set_job_error"))?;
            job.status = JobStatus::Error;
            job.last_activity_at = Self::now();
            if self.claimed.lock().unwrap().remove(&job.id) {
                self.metrics.decrement_job_active(&job.job_type);
            }
            self.metrics
                .record_job_finished(&job.job_type, JobStatus::Error);
            return Ok(());
        };

        let mut updated = job.clone();
        updated.status = JobStatus::Error;
        updated.progress = -1;
        updated
            .data
            .insert(JOB_DATA_ERROR_KEY.to_string(), message.to_string());

        for expected in [JobStatus::InProgress, JobStatus::CancelRequested] {
            let written = self
                .store
                .update_optimistically(&updated, expected)
                .map_err(JobServerError::persistence("set_job_error"))?;
            if written {
                updated.last_activity_at = Self::now();
                *job = updated;
                self.job_finished(job);
                return Ok(());
            }
        }

        Err(JobServerError::CouldNotRecordError(job.id.clone()))
    }

    pub fn set_job_canceled(&self, job: &mut Job) -> Result<bool> {
        let mut updated = job.clone();
        updated.status = JobStatus::Canceled;

        let written = self
            .store
            .update_optimistically(&updated, JobStatus::CancelRequested)
            .map_err(JobServerError::persistence("set_job_canceled"))?;
        if written {
            updated.last_activity_at = Self::now();
            *job = updated;
            self.job_finished(job);
        }
        Ok(written)
    }

    /// Cancels a pending job right away, or asks the worker running it to stop.
    /// Asking again while the request is pending is not an error.
    pub fn request_cancellation(&self, id: &str) -> Result<()> {
        // Read first: the job type is needed for the finished counter
        let job = self.get_job(id)?;

        let canceled = self
            .store
            .update_status_optimistically(id, JobStatus::Pending, JobStatus::Canceled)
            .map_err(JobServerError::persistence("request_cancellation"))?;
        if canceled {
            info!("Pending job {} canceled", id);
            self.metrics
                .record_job_finished(&job.job_type, JobStatus::Canceled);
            return Ok(());
        }

        let requested = self
            .store
            .update_status_optimistically(id, JobStatus::InProgress, JobStatus::CancelRequested)
            .map_err(JobServerError::persistence("request_cancellation"))?;
        if requested {
            info!("Cancellation requested for running job {}", id);
            return Ok(());
        }

        let current = self.get_job(id)?;
        if current.status == JobStatus::CancelRequested {
            return Ok(());
        }
        Err(JobServerError::NotCancellable {
            id: id.to_string(),
            status: current.status,
        })
    }

    /// Records a job whose body panicked as failed.
    pub fn handle_job_panic(&self, job: &mut Job, detail: &str) {
        error!(
            "Job {} of type {} panicked: {}",
            job.id, job.job_type, detail
        );
        let message = format!("job panicked: {}", detail);
        if let Err(e) = self.set_job_error(job, Some(&message)) {
            error!("Failed to record panic of job {}: {}", job.id, e);
        }
    }

    pub fn check_for_pending_jobs_by_type(&self, job_type: &JobType) -> Result<bool> {
        let count = self
            .store
            .count(&JobFilter::by_status_and_type(JobStatus::Pending, job_type))
            .map_err(JobServerError::persistence("check_for_pending_jobs_by_type"))?;
        Ok(count > 0)
    }

    pub fn get_last_successful_job_by_type(&self, job_type: &JobType) -> Result<Option<Job>> {
        self.store
            .find_newest_by_status_and_type(&[JobStatus::Success], job_type)
            .map_err(JobServerError::persistence("get_last_successful_job_by_type"))
    }

    /// Pending jobs of every type, oldest first.
    pub fn get_pending_jobs(&self) -> Result<Vec<Job>> {
        self.store
            .get_all_by_status(JobStatus::Pending)
            .map_err(JobServerError::persistence("get_pending_jobs"))
    }

    /// Jobs of `job_type`, newest first.
    pub fn get_jobs_by_type(&self, job_type: &JobType) -> Result<Vec<Job>> {
        self.store
            .get_all_by_type(job_type)
            .map_err(JobServerError::persistence("get_jobs_by_type"))
    }

    /// Deletes at most `batch_size` terminal jobs created before `created_before`.
    pub fn delete_finished_jobs(
        &self,
        created_before: DateTime<Utc>,
        batch_size: usize,
    ) -> Result<usize> {
        self.store
            .cleanup(created_before, batch_size)
            .map_err(JobServerError::persistence("delete_finished_jobs"))
    }

    fn job_finished(&self, job: &Job) {
        self.claimed.lock().unwrap().remove(&job.id);
        self.metrics.decrement_job_active(&job.job_type);
        self.metrics.record_job_finished(&job.job_type, job.status);
        if job.status == JobStatus::Error {
            warn!(
                "Job {} of type {} failed: {}",
                job.id,
                job.job_type,
                job.error_message().unwrap_or("unknown error")
            );
        } else {
            info!("Job {} of type {} finished: {}", job.id, job.job_type, job.status);
        }
    }

    fn now() -> DateTime<Utc> {
        truncate_to_millis(Utc::now())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::job_store::{JobStatus, JobType};
    use crate::metrics::MetricsSink;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Counts gauge movements per job type.
    #[derive(Default)]
    pub struct CountingMetrics {
        pub active: Mutex<HashMap<JobType, i64>>,
        pub finished: Mutex<Vec<(JobType, JobStatus)>>,
    }

    impl CountingMetrics {
        pub fn active(&self, job_type: &JobType) -> i64 {
            *self.active.lock().unwrap().get(job_type).unwrap_or(&0)
        }
    }

    impl MetricsSink for CountingMetrics {
        fn increment_job_active(&self, job_type: &JobType) {
            *self
                .active
                .lock()
                .unwrap()
                .entry(job_type.clone())
                .or_default() += 1;
        }

        fn decrement_job_active(&self, job_type: &JobType) {
            *self
                .active
                .lock()
                .unwrap()
                .entry(job_type.clone())
                .or_default() -= 1;
        }

        fn record_job_finished(&self, job_type: &JobType, status: JobStatus) {
            self.finished
                .lock()
                .unwrap()
                .push((job_type.clone(), status));
        }
    }
}
