use super::models::{Job, JobFilter, JobStatus, JobType};
use super::schema::JOBS_VERSIONED_SCHEMAS;
use super::JobStore;
use crate::sqlite_persistence::open_versioned;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, types::Type, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

const JOB_COLUMNS: &str =
    "id, job_type, status, data, progress, created_at, start_at, last_activity_at";

/// How long a writer waits for another process holding the database lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite-backed [`JobStore`].
///
/// Several processes may open the same file: every compare-and-swap is a
/// single `UPDATE ... WHERE status = ?` statement, so SQLite's write lock is
/// what serializes competing claims.
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteJobStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let path = db_path.as_ref();
        if !path.exists() {
            info!("Creating new jobs database at {:?}", path);
        }

        let mut conn = Connection::open(path).context("Failed to open jobs database")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.query_row("PRAGMA journal_mode = WAL;", [], |_| Ok(()))?;
        open_versioned(&mut conn, JOBS_VERSIONED_SCHEMAS, "jobs")?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("Jobs database connection mutex poisoned"))
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn from_millis(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
        DateTime::from_timestamp_millis(millis).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                idx,
                Type::Integer,
                format!("timestamp {} out of range", millis).into(),
            )
        })
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status_str: String = row.get("status")?;
        let status = JobStatus::parse(&status_str).ok_or_else(|| {
            rusqlite::Error::FromSqlConversionFailure(
                2,
                Type::Text,
                format!("unknown job status '{}'", status_str).into(),
            )
        })?;

        let data_str: String = row.get("data")?;
        let data: HashMap<String, String> = serde_json::from_str(&data_str)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(3, Type::Text, Box::new(e)))?;

        let start_at = match row.get::<_, Option<i64>>("start_at")? {
            Some(millis) => Some(Self::from_millis(6, millis)?),
            None => None,
        };

        Ok(Job {
            id: row.get("id")?,
            job_type: JobType::new(row.get::<_, String>("job_type")?),
            status,
            data,
            progress: row.get("progress")?,
            created_at: Self::from_millis(5, row.get("created_at")?)?,
            start_at,
            last_activity_at: Self::from_millis(7, row.get("last_activity_at")?)?,
        })
    }

    fn placeholders(count: usize) -> String {
        vec!["?"; count].join(", ")
    }
}

impl JobStore for SqliteJobStore {
    fn save(&self, job: &Job) -> Result<Job> {
        let conn = self.conn()?;
        let data = serde_json::to_string(&job.data)?;

        conn.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                JOB_COLUMNS
            ),
            params![
                job.id,
                job.job_type.as_str(),
                job.status.as_str(),
                data,
                job.progress,
                job.created_at.timestamp_millis(),
                job.start_at.map(|dt| dt.timestamp_millis()),
                job.last_activity_at.timestamp_millis(),
            ],
        )
        .with_context(|| format!("Failed to insert job {}", job.id))?;

        Ok(job.clone())
    }

    fn get(&self, id: &str) -> Result<Option<Job>> {
        let conn = self.conn()?;
        let job = conn
            .query_row(
                &format!("SELECT {} FROM jobs WHERE id = ?1", JOB_COLUMNS),
                params![id],
                Self::row_to_job,
            )
            .optional()?;
        Ok(job)
    }

    fn update_status(&self, id: &str, status: JobStatus) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE jobs SET status = ?1, last_activity_at = ?2 WHERE id = ?3",
            params![status.as_str(), Self::now_millis(), id],
        )?;
        Ok(())
    }

    fn update_status_optimistically(
        &self,
        id: &str,
        expected_status: JobStatus,
        new_status: JobStatus,
    ) -> Result<bool> {
        let conn = self.conn()?;
        let now = Self::now_millis();
        let start_at = (new_status == JobStatus::InProgress).then_some(now);

        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, last_activity_at = ?2, start_at = COALESCE(?3, start_at)
             WHERE id = ?4 AND status = ?5",
            params![
                new_status.as_str(),
                now,
                start_at,
                id,
                expected_status.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    fn update_optimistically(&self, job: &Job, expected_status: JobStatus) -> Result<bool> {
        let conn = self.conn()?;
        let data = serde_json::to_string(&job.data)?;

        let changed = conn.execute(
            "UPDATE jobs SET status = ?1, progress = ?2, data = ?3, last_activity_at = ?4
             WHERE id = ?5 AND status = ?6",
            params![
                job.status.as_str(),
                job.progress,
                data,
                Self::now_millis(),
                job.id,
                expected_status.as_str()
            ],
        )?;
        Ok(changed == 1)
    }

    fn count(&self, filter: &JobFilter) -> Result<i64> {
        let conn = self.conn()?;
        let mut sql = String::from("SELECT COUNT(*) FROM jobs WHERE 1 = 1");
        let mut values: Vec<String> = Vec::new();

        if !filter.statuses.is_empty() {
            sql.push_str(&format!(
                " AND status IN ({})",
                Self::placeholders(filter.statuses.len())
            ));
            values.extend(filter.statuses.iter().map(|s| s.as_str().to_string()));
        }
        if let Some(job_type) = &filter.job_type {
            sql.push_str(" AND job_type = ?");
            values.push(job_type.as_str().to_string());
        }

        let count = conn.query_row(&sql, params_from_iter(values.iter()), |row| row.get(0))?;
        Ok(count)
    }

    fn find_newest_by_status_and_type(
        &self,
        statuses: &[JobStatus],
        job_type: &JobType,
    ) -> Result<Option<Job>> {
        if statuses.is_empty() {
            return Ok(None);
        }
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM jobs WHERE job_type = ? AND status IN ({})
             ORDER BY created_at DESC LIMIT 1",
            JOB_COLUMNS,
            Self::placeholders(statuses.len())
        );
        let values = std::iter::once(job_type.as_str().to_string())
            .chain(statuses.iter().map(|s| s.as_str().to_string()))
            .collect::<Vec<_>>();

        let job = conn
            .query_row(&sql, params_from_iter(values.iter()), Self::row_to_job)
            .optional()?;
        Ok(job)
    }

    fn get_all_by_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE status = ?1 ORDER BY created_at ASC",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![status.as_str()], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn get_all_by_type(&self, job_type: &JobType) -> Result<Vec<Job>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM jobs WHERE job_type = ?1 ORDER BY created_at DESC",
            JOB_COLUMNS
        ))?;
        let jobs = stmt
            .query_map(params![job_type.as_str()], Self::row_to_job)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(jobs)
    }

    fn cleanup(&self, created_before: DateTime<Utc>, batch_size: usize) -> Result<usize> {
        let conn = self.conn()?;
        let terminal = JobStatus::TERMINAL.map(|s| s.as_str().to_string());
        let sql = format!(
            "DELETE FROM jobs WHERE id IN (
                SELECT id FROM jobs WHERE status IN ({}) AND created_at < ? LIMIT ?
             )",
            Self::placeholders(terminal.len())
        );
        let mut values: Vec<rusqlite::types::Value> = terminal
            .into_iter()
            .map(rusqlite::types::Value::Text)
            .collect();
        values.push(rusqlite::types::Value::Integer(
            created_before.timestamp_millis(),
        ));
        values.push(rusqlite::types::Value::Integer(batch_size as i64));

        let deleted = conn.execute(&sql, params_from_iter(values))?;
        Ok(deleted)
    }
}
