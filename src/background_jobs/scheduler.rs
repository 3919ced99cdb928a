use super::error::JobServerError;
use super::server::JobServer;
use crate::config::Config;
use crate::job_store::{Job, JobType};
use chrono::{DateTime, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Decides when a job of one type should be created.
pub trait Scheduler: Send + Sync {
    fn enabled(&self, config: &Config) -> bool;

    /// Next time [`Scheduler::schedule_job`] should be called, `None` when
    /// nothing needs to be scheduled.
    fn next_schedule_time(
        &self,
        config: &Config,
        now: DateTime<Utc>,
        pending_jobs: bool,
        last_successful_job: Option<&Job>,
    ) -> Option<DateTime<Utc>>;

    /// Creates the next job, or returns `Ok(None)` when there is nothing to
    /// create this time.
    fn schedule_job(
        &self,
        config: &Config,
        pending_jobs: bool,
        last_successful_job: Option<&Job>,
    ) -> Result<Option<Job>, JobServerError>;
}

type EnabledFn = Box<dyn Fn(&Config) -> bool + Send + Sync>;
type StartTimeFn = Box<dyn Fn(&Config) -> NaiveTime + Send + Sync>;

/// Creates a job every `interval`, unless one is already pending.
pub struct PeriodicScheduler {
    job_server: Arc<JobServer>,
    job_type: JobType,
    default_interval: Duration,
}

impl PeriodicScheduler {
    pub fn new(job_server: Arc<JobServer>, job_type: JobType, default_interval: Duration) -> Self {
        Self {
            job_server,
            job_type,
            default_interval,
        }
    }

    fn interval(&self, config: &Config) -> Duration {
        config
            .job_type_settings(&self.job_type)
            .interval
            .unwrap_or(self.default_interval)
    }
}

impl Scheduler for PeriodicScheduler {
    fn enabled(&self, config: &Config) -> bool {
        config.job_type_settings(&self.job_type).enabled
    }

    fn next_schedule_time(
        &self,
        config: &Config,
        now: DateTime<Utc>,
        _pending_jobs: bool,
        _last_successful_job: Option<&Job>,
    ) -> Option<DateTime<Utc>> {
        let interval = chrono::Duration::from_std(self.interval(config)).ok()?;
        now.checked_add_signed(interval)
    }

    fn schedule_job(
        &self,
        _config: &Config,
        pending_jobs: bool,
        _last_successful_job: Option<&Job>,
    ) -> Result<Option<Job>, JobServerError> {
        create_unless_pending(&self.job_server, &self.job_type, pending_jobs)
    }
}

/// Creates a job once a day at a wall clock time, unless one is already pending.
pub struct DailyScheduler {
    job_server: Arc<JobServer>,
    job_type: JobType,
    enabled: EnabledFn,
    start_time: StartTimeFn,
}

impl DailyScheduler {
    /// Runs at the `daily_time` of the job type settings, or `default_time`.
    pub fn new(job_server: Arc<JobServer>, job_type: JobType, default_time: NaiveTime) -> Self {
        let enabled_type = job_type.clone();
        let time_type = job_type.clone();
        Self {
            job_server,
            job_type,
            enabled: Box::new(move |config| config.job_type_settings(&enabled_type).enabled),
            start_time: Box::new(move |config| {
                config
                    .job_type_settings(&time_type)
                    .daily_time
                    .unwrap_or(default_time)
            }),
        }
    }

    pub fn with_enabled(mut self, enabled: impl Fn(&Config) -> bool + Send + Sync + 'static) -> Self {
        self.enabled = Box::new(enabled);
        self
    }

    pub fn with_start_time(
        mut self,
        start_time: impl Fn(&Config) -> NaiveTime + Send + Sync + 'static,
    ) -> Self {
        self.start_time = Box::new(start_time);
        self
    }
}

impl Scheduler for DailyScheduler {
    fn enabled(&self, config: &Config) -> bool {
        (self.enabled)(config)
    }

    fn next_schedule_time(
        &self,
        config: &Config,
        now: DateTime<Utc>,
        _pending_jobs: bool,
        _last_successful_job: Option<&Job>,
    ) -> Option<DateTime<Utc>> {
        let start_time = (self.start_time)(config);
        let next = next_daily_occurrence(&now.with_timezone(&Local), start_time);
        Some(next.with_timezone(&Utc))
    }

    fn schedule_job(
        &self,
        _config: &Config,
        pending_jobs: bool,
        _last_successful_job: Option<&Job>,
    ) -> Result<Option<Job>, JobServerError> {
        create_unless_pending(&self.job_server, &self.job_type, pending_jobs)
    }
}

fn create_unless_pending(
    job_server: &JobServer,
    job_type: &JobType,
    pending_jobs: bool,
) -> Result<Option<Job>, JobServerError> {
    if pending_jobs {
        debug!("A {} job is already pending, not scheduling another", job_type);
        return Ok(None);
    }
    job_server
        .create_job(job_type.clone(), HashMap::new())
        .map(Some)
}

/// First time at `time` strictly after `now`, in the time zone of `now`.
///
/// A time skipped by a DST gap resolves to the same wall time one hour later,
/// an ambiguous one to its earliest instant.
pub fn next_daily_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, time: NaiveTime) -> DateTime<Tz> {
    let tz = now.timezone();
    let mut date = now.date_naive();
    for _ in 0..3 {
        if let Some(candidate) = resolve_local(&tz, date.and_time(time)) {
            if candidate > *now {
                return candidate;
            }
        }
        match date.succ_opt() {
            Some(next) => date = next,
            None => break,
        }
    }
    now.clone() + chrono::Duration::days(1)
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> Option<DateTime<Tz>> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => tz
            .from_local_datetime(&(naive + chrono::Duration::hours(1)))
            .earliest(),
    }
}
