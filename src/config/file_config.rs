use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub metrics_port: Option<u16>,
    pub is_leader: Option<bool>,

    pub jobs: Option<JobsConfig>,
    /// Per job type settings, keyed by job type name.
    pub job_types: HashMap<String, JobTypeConfig>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobsConfig {
    pub run_jobs: Option<bool>,
    pub run_scheduler: Option<bool>,
    pub cleanup_jobs_threshold_days: Option<u64>,
    /// "HH:MM", local time
    pub cleanup_jobs_time: Option<String>,
    pub cleanup_batch_size: Option<usize>,
    pub watcher_poll_interval_secs: Option<u64>,
    pub scheduler_tick_secs: Option<u64>,
    pub cancellation_poll_interval_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct JobTypeConfig {
    pub enabled: Option<bool>,
    pub interval_secs: Option<u64>,
    /// "HH:MM", local time
    pub daily_time: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
