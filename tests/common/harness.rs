use super::constants::{FAST_POLL, FAST_TICK, WAIT_TIMEOUT};
use pezzottify_job_server::background_jobs::{
    JobContext, JobError, JobServer, JobWorker, SchedulerRegistry, WorkerRegistry,
};
use pezzottify_job_server::config::{Config, ConfigService, LiveConfigService};
use pezzottify_job_server::job_store::{Job, JobStatus, JobType};
use pezzottify_job_server::metrics::NoopMetrics;
use pezzottify_job_server::{PrometheusMetrics, SqliteJobStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

/// A job server on a temporary database, with intervals short enough for tests.
pub struct TestJobServer {
    pub job_server: Arc<JobServer>,
    pub metrics: Arc<PrometheusMetrics>,
    pub config_service: Arc<LiveConfigService>,
    pub db_path: PathBuf,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestJobServer {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("jobs.db");
        let store = Arc::new(SqliteJobStore::new(&db_path).expect("Failed to open job store"));
        let metrics = Arc::new(PrometheusMetrics::new().expect("Failed to create metrics"));
        let job_server = Arc::new(
            JobServer::new(store, metrics.clone()).with_cancellation_poll_interval(FAST_POLL),
        );

        Self {
            job_server,
            metrics,
            config_service: Arc::new(LiveConfigService::new(config)),
            db_path,
            _temp_dir: temp_dir,
        }
    }

    /// A second job server on the same database, like another process would have.
    pub fn peer(&self) -> Arc<JobServer> {
        let store =
            Arc::new(SqliteJobStore::new(&self.db_path).expect("Failed to open job store"));
        Arc::new(
            JobServer::new(store, Arc::new(NoopMetrics))
                .with_cancellation_poll_interval(FAST_POLL),
        )
    }

    pub fn config_service(&self) -> Arc<dyn ConfigService> {
        self.config_service.clone()
    }

    pub fn create(&self, job_type: JobType) -> Job {
        self.job_server
            .create_job(job_type, HashMap::new())
            .expect("Failed to create job")
    }

    pub fn status(&self, id: &str) -> JobStatus {
        self.job_server.get_job(id).expect("Job not found").status
    }

    pub fn worker_registry(&self) -> Arc<WorkerRegistry> {
        Arc::new(
            WorkerRegistry::new(self.job_server.clone(), self.config_service())
                .with_watcher_poll_interval(FAST_POLL),
        )
    }

    pub fn scheduler_registry(&self, is_leader: bool) -> Arc<SchedulerRegistry> {
        Arc::new(
            SchedulerRegistry::new(self.job_server.clone(), self.config_service(), is_leader)
                .with_tick_interval(FAST_TICK),
        )
    }

    pub fn worker<F>(&self, name: &str, job_type: JobType, body: F) -> Arc<JobWorker>
    where
        F: Fn(&mut JobContext) -> Result<(), JobError> + Send + Sync + 'static,
    {
        Arc::new(JobWorker::new(
            name,
            job_type,
            self.job_server.clone(),
            Arc::new(body),
        ))
    }

    /// Waits until job `id` reaches `status`, panicking after [`WAIT_TIMEOUT`].
    pub async fn wait_for_status(&self, id: &str, status: JobStatus) -> Job {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let job = self.job_server.get_job(id).expect("Job not found");
            if job.status == status {
                return job;
            }
            if tokio::time::Instant::now() > deadline {
                panic!(
                    "Job {} still {} after {:?}, expected {}",
                    id, job.status, WAIT_TIMEOUT, status
                );
            }
            tokio::time::sleep(FAST_POLL).await;
        }
    }

    /// Waits until `condition` holds, panicking after [`WAIT_TIMEOUT`].
    pub async fn wait_until(&self, what: &str, condition: impl Fn() -> bool) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        while !condition() {
            if tokio::time::Instant::now() > deadline {
                panic!("Timed out waiting for {}", what);
            }
            tokio::time::sleep(FAST_POLL).await;
        }
    }
}
