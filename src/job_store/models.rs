use chrono::{DateTime, Utc};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;

/// Maximum size of a job's serialized `data` payload.
pub const JOB_DATA_MAX_SIZE: usize = 64 * 1024;

/// Key under which the failure message of an errored job is stored.
pub const JOB_DATA_ERROR_KEY: &str = "error";

/// Identifies which scheduler/worker pair owns a job.
///
/// This is an open set: the well-known types are provided as constants, any
/// other valid name can be built with [`JobType::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobType(Cow<'static, str>);

impl JobType {
    pub const MIGRATIONS: JobType = JobType(Cow::Borrowed("migrations"));
    pub const JOBS_CLEANUP: JobType = JobType(Cow::Borrowed("jobs_cleanup"));
    pub const DATA_RETENTION: JobType = JobType(Cow::Borrowed("data_retention"));
    pub const MESSAGE_EXPORT: JobType = JobType(Cow::Borrowed("message_export"));
    pub const SEARCH_INDEXING: JobType = JobType(Cow::Borrowed("search_indexing"));
    pub const LDAP_SYNC: JobType = JobType(Cow::Borrowed("ldap_sync"));
    pub const IMPORT_PROCESS: JobType = JobType(Cow::Borrowed("import_process"));
    pub const EXPORT_PROCESS: JobType = JobType(Cow::Borrowed("export_process"));

    pub fn new(name: impl Into<String>) -> Self {
        JobType(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Type names are 1 to 64 characters of `[a-z0-9_]`.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty()
            && self.0.len() <= 64
            && self
                .0
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobType {
    fn from(name: &str) -> Self {
        JobType::new(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    Warning,
    Error,
    CancelRequested,
    Canceled,
}

impl JobStatus {
    pub const TERMINAL: [JobStatus; 4] = [
        JobStatus::Success,
        JobStatus::Warning,
        JobStatus::Error,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Success => "success",
            JobStatus::Warning => "warning",
            JobStatus::Error => "error",
            JobStatus::CancelRequested => "cancel_requested",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "in_progress" => Some(JobStatus::InProgress),
            "success" => Some(JobStatus::Success),
            "warning" => Some(JobStatus::Warning),
            "error" => Some(JobStatus::Error),
            "cancel_requested" => Some(JobStatus::CancelRequested),
            "canceled" => Some(JobStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        Self::TERMINAL.contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted unit of background work.
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: String,
    pub job_type: JobType,
    pub status: JobStatus,
    pub data: HashMap<String, String>,
    /// Percentage of completion, `-1` once the job failed.
    pub progress: i64,
    pub created_at: DateTime<Utc>,
    /// Set by the store when the job is claimed.
    pub start_at: Option<DateTime<Utc>>,
    pub last_activity_at: DateTime<Utc>,
}

impl Job {
    pub fn new(job_type: JobType, data: HashMap<String, String>) -> Self {
        let now = truncate_to_millis(Utc::now());
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            job_type,
            status: JobStatus::Pending,
            data,
            progress: 0,
            created_at: now,
            start_at: None,
            last_activity_at: now,
        }
    }

    /// Checks the record before it is written, returning the reason it is not valid.
    pub fn validate(&self) -> Result<(), String> {
        if self.id.len() != 32
            || !self
                .id
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(format!("invalid job id '{}'", self.id));
        }
        if !self.job_type.is_valid() {
            return Err(format!("invalid job type '{}'", self.job_type));
        }
        let data_size = serde_json::to_string(&self.data)
            .map(|s| s.len())
            .unwrap_or(usize::MAX);
        if data_size > JOB_DATA_MAX_SIZE {
            return Err(format!(
                "job data is {} bytes, at most {} allowed",
                data_size, JOB_DATA_MAX_SIZE
            ));
        }
        Ok(())
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.get(JOB_DATA_ERROR_KEY).map(String::as_str)
    }
}

/// Criteria for [`super::JobStore::count`]. Empty criteria match every job.
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub statuses: Vec<JobStatus>,
    pub job_type: Option<JobType>,
}

impl JobFilter {
    pub fn by_status_and_type(status: JobStatus, job_type: &JobType) -> Self {
        Self {
            statuses: vec![status],
            job_type: Some(job_type.clone()),
        }
    }
}

/// Timestamps are stored as unix milliseconds, so in-memory copies are kept
/// at the same precision to compare equal after a round trip.
pub fn truncate_to_millis(dt: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(dt.timestamp_millis()).unwrap_or(dt)
}
