//! Persistence of job records.
//!
//! The [`JobStore`] trait is the narrow contract the job server is built on.
//! Every status change goes through one of the optimistic methods, which only
//! write when the stored status still matches the expected one.

mod models;
mod schema;
mod sqlite_job_store;

pub use models::*;
pub use schema::JOBS_VERSIONED_SCHEMAS;
pub use sqlite_job_store::SqliteJobStore;

use anyhow::Result;
use chrono::{DateTime, Utc};

pub trait JobStore: Send + Sync {
    fn save(&self, job: &Job) -> Result<Job>;
    fn get(&self, id: &str) -> Result<Option<Job>>;

    /// Unconditionally writes `status`.
    fn update_status(&self, id: &str, status: JobStatus) -> Result<()>;

    /// Writes `new_status` only if the job is currently in `expected_status`.
    /// Returns false when another writer changed the status first.
    fn update_status_optimistically(
        &self,
        id: &str,
        expected_status: JobStatus,
        new_status: JobStatus,
    ) -> Result<bool>;

    /// Writes status, progress and data of `job` only if the stored status is
    /// `expected_status`. Returns false when another writer changed the status first.
    fn update_optimistically(&self, job: &Job, expected_status: JobStatus) -> Result<bool>;

    fn count(&self, filter: &JobFilter) -> Result<i64>;
    fn find_newest_by_status_and_type(
        &self,
        statuses: &[JobStatus],
        job_type: &JobType,
    ) -> Result<Option<Job>>;

    /// Jobs in `status`, oldest first.
    fn get_all_by_status(&self, status: JobStatus) -> Result<Vec<Job>>;
    /// Jobs of `job_type`, newest first.
    fn get_all_by_type(&self, job_type: &JobType) -> Result<Vec<Job>>;

    /// Deletes at most `batch_size` jobs in a terminal status created before
    /// `created_before`. Returns the number of deleted jobs.
    fn cleanup(&self, created_before: DateTime<Utc>, batch_size: usize) -> Result<usize>;
}
