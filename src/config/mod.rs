mod file_config;
mod service;

pub use file_config::{FileConfig, JobTypeConfig, JobsConfig};
pub use service::{ConfigListener, ConfigService, LiveConfigService};

use crate::job_store::JobType;
use anyhow::{bail, Context, Result};
use chrono::NaiveTime;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Upper bound of `jobs.cleanup_jobs_threshold_days`, one hundred years.
pub const MAX_CLEANUP_THRESHOLD_DAYS: u64 = 36500;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone, Default)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub metrics_port: u16,
    pub is_leader: bool,
    pub run_jobs: bool,
    pub run_scheduler: bool,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub metrics_port: u16,

    /// The part of the configuration that can change at runtime.
    pub config: Config,
}

/// Runtime configuration, published through a [`ConfigService`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Whether this process is allowed to create scheduled jobs.
    pub is_leader: bool,
    pub jobs: JobsSettings,
    pub job_types: HashMap<JobType, JobTypeSettings>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobsSettings {
    pub run_jobs: bool,
    pub run_scheduler: bool,
    /// Terminal jobs older than this are deleted by the cleanup job, 0 disables it.
    pub cleanup_jobs_threshold_days: u64,
    pub cleanup_jobs_time: NaiveTime,
    pub cleanup_batch_size: usize,
    pub watcher_poll_interval: Duration,
    pub scheduler_tick: Duration,
    pub cancellation_poll_interval: Duration,
}

impl Default for JobsSettings {
    fn default() -> Self {
        Self {
            run_jobs: true,
            run_scheduler: true,
            cleanup_jobs_threshold_days: 0,
            cleanup_jobs_time: NaiveTime::from_hms_opt(1, 0, 0).unwrap_or(NaiveTime::MIN),
            cleanup_batch_size: 1000,
            watcher_poll_interval: Duration::from_secs(15),
            scheduler_tick: Duration::from_secs(60),
            cancellation_poll_interval: Duration::from_secs(5),
        }
    }
}

/// Settings of a single job type. Unset values fall back to the defaults
/// of the scheduler handling the type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct JobTypeSettings {
    pub enabled: bool,
    pub interval: Option<Duration>,
    pub daily_time: Option<NaiveTime>,
}

impl Default for JobTypeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: None,
            daily_time: None,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            is_leader: true,
            jobs: JobsSettings::default(),
            job_types: HashMap::new(),
        }
    }
}

impl Config {
    pub fn job_type_settings(&self, job_type: &JobType) -> JobTypeSettings {
        self.job_types.get(job_type).copied().unwrap_or_default()
    }

    /// Builds the runtime configuration, TOML values override CLI values.
    pub fn resolve(cli: &CliConfig, file: &FileConfig) -> Result<Self> {
        let defaults = JobsSettings::default();
        let jobs_file = file.jobs.clone().unwrap_or_default();

        let cleanup_jobs_time = match jobs_file.cleanup_jobs_time {
            Some(s) => parse_daily_time(&s).context("Invalid jobs.cleanup_jobs_time")?,
            None => defaults.cleanup_jobs_time,
        };

        let jobs = JobsSettings {
            run_jobs: jobs_file.run_jobs.unwrap_or(cli.run_jobs),
            run_scheduler: jobs_file.run_scheduler.unwrap_or(cli.run_scheduler),
            cleanup_jobs_threshold_days: jobs_file
                .cleanup_jobs_threshold_days
                .unwrap_or(defaults.cleanup_jobs_threshold_days),
            cleanup_jobs_time,
            cleanup_batch_size: jobs_file
                .cleanup_batch_size
                .unwrap_or(defaults.cleanup_batch_size),
            watcher_poll_interval: jobs_file
                .watcher_poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.watcher_poll_interval),
            scheduler_tick: jobs_file
                .scheduler_tick_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.scheduler_tick),
            cancellation_poll_interval: jobs_file
                .cancellation_poll_interval_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.cancellation_poll_interval),
        };

        if jobs.cleanup_batch_size == 0 {
            bail!("jobs.cleanup_batch_size must be greater than 0");
        }
        if jobs.cleanup_jobs_threshold_days > MAX_CLEANUP_THRESHOLD_DAYS {
            bail!(
                "jobs.cleanup_jobs_threshold_days must be at most {}",
                MAX_CLEANUP_THRESHOLD_DAYS
            );
        }
        for (name, interval) in [
            ("jobs.watcher_poll_interval_secs", jobs.watcher_poll_interval),
            ("jobs.scheduler_tick_secs", jobs.scheduler_tick),
            (
                "jobs.cancellation_poll_interval_secs",
                jobs.cancellation_poll_interval,
            ),
        ] {
            if interval.is_zero() {
                bail!("{} must be greater than 0", name);
            }
        }

        let mut job_types = HashMap::new();
        for (name, type_file) in &file.job_types {
            let job_type = JobType::new(name.as_str());
            if !job_type.is_valid() {
                bail!("Invalid job type name in config: {:?}", name);
            }
            let daily_time = match &type_file.daily_time {
                Some(s) => Some(
                    parse_daily_time(s)
                        .with_context(|| format!("Invalid daily_time for job type {}", name))?,
                ),
                None => None,
            };
            if type_file.interval_secs == Some(0) {
                bail!("interval_secs for job type {} must be greater than 0", name);
            }
            job_types.insert(
                job_type,
                JobTypeSettings {
                    enabled: type_file.enabled.unwrap_or(true),
                    interval: type_file.interval_secs.map(Duration::from_secs),
                    daily_time,
                },
            );
        }

        Ok(Self {
            is_leader: file.is_leader.unwrap_or(cli.is_leader),
            jobs,
            job_types,
        })
    }
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .clone()
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;

        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let metrics_port = file.metrics_port.unwrap_or(cli.metrics_port);
        let config = Config::resolve(cli, &file)?;

        Ok(Self {
            db_dir,
            metrics_port,
            config,
        })
    }

    pub fn jobs_db_path(&self) -> PathBuf {
        self.db_dir.join("jobs.db")
    }
}

/// Parses a "HH:MM" wall clock time.
pub fn parse_daily_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("Expected HH:MM, got {:?}", s))
}
