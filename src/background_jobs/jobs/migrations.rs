//! Resumable data migrations.
//!
//! Migrations run one at a time, in registration order. Each one advances in
//! steps and records the last completed step in its job, so a migration
//! interrupted by a shutdown or a crash resumes where it stopped.

use crate::background_jobs::{
    JobContext, JobError, JobExecutor, JobServer, JobServerError, Scheduler,
};
use crate::config::Config;
use crate::job_store::{Job, JobStatus, JobType};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const MIGRATION_KEY: &str = "migration_key";
pub const LAST_DONE_KEY: &str = "last_done";

/// In progress migration jobs idle for longer than this are considered dead.
pub const DEFAULT_WEDGED_TIMEOUT: Duration = Duration::from_secs(60 * 60);

pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(60);

pub enum MigrationStep {
    Done,
    Continue { last_done: String },
}

pub trait Migration: Send + Sync {
    /// Stable identifier, recorded in the jobs running this migration.
    fn key(&self) -> &str;

    /// Runs the step after `last_done`, or the first step when `None`.
    fn run_step(&self, last_done: Option<&str>) -> Result<MigrationStep, String>;
}

#[derive(Debug)]
enum MigrationState {
    Completed,
    Running,
    Wedged(Job),
    Unscheduled,
}

pub struct MigrationsScheduler {
    job_server: Arc<JobServer>,
    migrations: Vec<Arc<dyn Migration>>,
    wedged_timeout: Duration,
    check_interval: Duration,
    all_completed: AtomicBool,
}

impl MigrationsScheduler {
    pub fn new(job_server: Arc<JobServer>, migrations: Vec<Arc<dyn Migration>>) -> Self {
        Self {
            job_server,
            migrations,
            wedged_timeout: DEFAULT_WEDGED_TIMEOUT,
            check_interval: DEFAULT_CHECK_INTERVAL,
            all_completed: AtomicBool::new(false),
        }
    }

    pub fn with_wedged_timeout(mut self, wedged_timeout: Duration) -> Self {
        self.wedged_timeout = wedged_timeout;
        self
    }

    /// How often migration jobs are looked at while some are incomplete.
    pub fn with_check_interval(mut self, check_interval: Duration) -> Self {
        self.check_interval = check_interval;
        self
    }

    /// `jobs` are the migration jobs, newest first.
    fn migration_state(&self, key: &str, jobs: &[Job], now: DateTime<Utc>) -> MigrationState {
        let mut jobs = jobs
            .iter()
            .filter(|job| job.data.get(MIGRATION_KEY).map(String::as_str) == Some(key));

        let mut running = None;
        for job in jobs.by_ref() {
            match job.status {
                JobStatus::Success => return MigrationState::Completed,
                JobStatus::Pending => running = running.or(Some(MigrationState::Running)),
                JobStatus::InProgress | JobStatus::CancelRequested => {
                    if running.is_some() {
                        continue;
                    }
                    let idle = (now - job.last_activity_at).to_std().unwrap_or_default();
                    running = Some(if idle > self.wedged_timeout {
                        MigrationState::Wedged(job.clone())
                    } else {
                        MigrationState::Running
                    });
                }
                JobStatus::Warning | JobStatus::Error | JobStatus::Canceled => {}
            }
        }
        running.unwrap_or(MigrationState::Unscheduled)
    }

    fn all_migrations_completed(&self) -> Result<bool, JobServerError> {
        if self.all_completed.load(Ordering::SeqCst) {
            return Ok(true);
        }
        let jobs = self.job_server.get_jobs_by_type(&JobType::MIGRATIONS)?;
        let now = Utc::now();
        let completed = self.migrations.iter().all(|migration| {
            matches!(
                self.migration_state(migration.key(), &jobs, now),
                MigrationState::Completed
            )
        });
        if completed {
            self.all_completed.store(true, Ordering::SeqCst);
        }
        Ok(completed)
    }

    fn create_migration_job(&self, key: &str, jobs: &[Job]) -> Result<Job, JobServerError> {
        let mut data = HashMap::new();
        data.insert(MIGRATION_KEY.to_string(), key.to_string());

        let last_done = jobs
            .iter()
            .filter(|job| job.data.get(MIGRATION_KEY).map(String::as_str) == Some(key))
            .find_map(|job| job.data.get(LAST_DONE_KEY));
        if let Some(last_done) = last_done {
            info!("Migration {} resumes after {}", key, last_done);
            data.insert(LAST_DONE_KEY.to_string(), last_done.clone());
        }

        self.job_server.create_job(JobType::MIGRATIONS, data)
    }
}

impl Scheduler for MigrationsScheduler {
    fn enabled(&self, config: &Config) -> bool {
        config.job_type_settings(&JobType::MIGRATIONS).enabled
    }

    fn next_schedule_time(
        &self,
        _config: &Config,
        now: DateTime<Utc>,
        _pending_jobs: bool,
        _last_successful_job: Option<&Job>,
    ) -> Option<DateTime<Utc>> {
        match self.all_migrations_completed() {
            Ok(true) => {
                debug!("All migrations completed");
                return None;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to check migrations state: {}", e),
        }
        now.checked_add_signed(chrono::Duration::from_std(self.check_interval).ok()?)
    }

    fn schedule_job(
        &self,
        _config: &Config,
        _pending_jobs: bool,
        _last_successful_job: Option<&Job>,
    ) -> Result<Option<Job>, JobServerError> {
        let jobs = self.job_server.get_jobs_by_type(&JobType::MIGRATIONS)?;
        let now = Utc::now();

        for migration in &self.migrations {
            let key = migration.key();
            match self.migration_state(key, &jobs, now) {
                MigrationState::Completed => continue,
                MigrationState::Running => {
                    debug!("Migration {} is running, waiting for it", key);
                    return Ok(None);
                }
                MigrationState::Wedged(mut job) => {
                    warn!(
                        "Migration {} job {} has been idle since {}, rescheduling it",
                        key, job.id, job.last_activity_at
                    );
                    self.job_server.set_job_error(&mut job, None)?;
                    return self.create_migration_job(key, &jobs).map(Some);
                }
                MigrationState::Unscheduled => {
                    info!("Scheduling migration {}", key);
                    return self.create_migration_job(key, &jobs).map(Some);
                }
            }
        }

        self.all_completed.store(true, Ordering::SeqCst);
        Ok(None)
    }
}

pub struct MigrationsExecutor {
    migrations: HashMap<String, Arc<dyn Migration>>,
}

impl MigrationsExecutor {
    pub fn new(migrations: Vec<Arc<dyn Migration>>) -> Self {
        Self {
            migrations: migrations
                .into_iter()
                .map(|migration| (migration.key().to_string(), migration))
                .collect(),
        }
    }
}

impl JobExecutor for MigrationsExecutor {
    fn execute(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        let key = ctx
            .job()
            .data
            .get(MIGRATION_KEY)
            .cloned()
            .ok_or_else(|| JobError::Failed(format!("missing {} in job data", MIGRATION_KEY)))?;
        let migration = self
            .migrations
            .get(&key)
            .cloned()
            .ok_or_else(|| JobError::Failed(format!("unknown migration {}", key)))?;

        let mut last_done = ctx.job().data.get(LAST_DONE_KEY).cloned();
        loop {
            ctx.checkpoint()?;
            match migration
                .run_step(last_done.as_deref())
                .map_err(JobError::Failed)?
            {
                MigrationStep::Done => {
                    info!("Migration {} completed", key);
                    return Ok(());
                }
                MigrationStep::Continue { last_done: step } => {
                    debug!("Migration {} step {} done", key, step);
                    ctx.update_data(LAST_DONE_KEY, step.clone())?;
                    last_done = Some(step);
                }
            }
        }
    }
}
