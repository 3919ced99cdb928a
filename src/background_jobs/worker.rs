use super::context::JobContext;
use super::handoff::{self, JobReceiver, JobSender};
use super::job::{JobError, JobExecutor};
use super::server::JobServer;
use crate::config::Config;
use crate::job_store::{Job, JobType};
use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Executes the jobs of one type.
#[async_trait]
pub trait Worker: Send + Sync {
    fn name(&self) -> &str;

    fn job_type(&self) -> &JobType;

    /// Runs the execution loop until `stop` fires.
    async fn run(&self, stop: CancellationToken);

    fn is_enabled(&self, config: &Config) -> bool;

    /// Endpoint through which pending jobs are delivered to this worker.
    fn job_sender(&self) -> JobSender;
}

type EnabledFn = Box<dyn Fn(&Config) -> bool + Send + Sync>;

/// [`Worker`] running a [`JobExecutor`] on the blocking pool, one job at a time.
pub struct JobWorker {
    name: String,
    job_type: JobType,
    job_server: Arc<JobServer>,
    executor: Arc<dyn JobExecutor>,
    sender: JobSender,
    receiver: tokio::sync::Mutex<JobReceiver>,
    enabled: EnabledFn,
}

impl JobWorker {
    /// Enabled while jobs run on this process and the job type is not disabled.
    pub fn new(
        name: impl Into<String>,
        job_type: JobType,
        job_server: Arc<JobServer>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let (sender, receiver) = handoff::channel();
        let enabled_type = job_type.clone();
        Self {
            name: name.into(),
            job_type,
            job_server,
            executor,
            sender,
            receiver: tokio::sync::Mutex::new(receiver),
            enabled: Box::new(move |config| {
                config.jobs.run_jobs && config.job_type_settings(&enabled_type).enabled
            }),
        }
    }

    pub fn with_enabled(mut self, enabled: impl Fn(&Config) -> bool + Send + Sync + 'static) -> Self {
        self.enabled = Box::new(enabled);
        self
    }

    async fn process_job(&self, mut job: Job, stop: &CancellationToken) {
        match self.job_server.claim_job(&mut job) {
            Ok(true) => {}
            Ok(false) => {
                debug!("Worker {}: job {} already claimed", self.name, job.id);
                return;
            }
            Err(e) => {
                error!("Worker {}: failed to claim job {}: {}", self.name, job.id, e);
                return;
            }
        }
        info!("Worker {}: running job {}", self.name, job.id);

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let watcher = {
            let job_server = self.job_server.clone();
            let (job_id, cancel, finished) = (job.id.clone(), cancel.clone(), finished.clone());
            tokio::spawn(async move {
                job_server
                    .cancellation_watcher(job_id, cancel, finished)
                    .await
            })
        };

        let ctx = JobContext::new(
            job.clone(),
            self.job_server.clone(),
            cancel,
            stop.child_token(),
        );
        let executor = self.executor.clone();
        let start_time = Instant::now();
        let result = tokio::task::spawn_blocking(move || {
            let mut ctx = ctx;
            let outcome = executor.execute(&mut ctx);
            (ctx.into_job(), outcome)
        })
        .await;
        let elapsed = start_time.elapsed();

        finished.cancel();
        if let Err(e) = watcher.await {
            error!("Cancellation watcher of job {} failed: {}", job.id, e);
        }

        match result {
            Ok((mut job, outcome)) => {
                debug!("Worker {}: job {} returned after {:?}", self.name, job.id, elapsed);
                self.finalize(&mut job, outcome);
            }
            Err(e) => {
                // The body's copy of the job is lost, the stored one has its latest data
                let mut job = self.job_server.get_job(&job.id).unwrap_or(job);
                self.job_server.handle_job_panic(&mut job, &panic_detail(e));
            }
        }
    }

    fn finalize(&self, job: &mut Job, outcome: Result<(), JobError>) {
        match outcome {
            Ok(()) => match self.job_server.set_job_success(job) {
                Ok(true) => {}
                Ok(false) => warn!(
                    "Worker {}: job {} changed status before it could be marked successful",
                    self.name, job.id
                ),
                Err(e) => error!(
                    "Worker {}: failed to mark job {} successful: {}",
                    self.name, job.id, e
                ),
            },
            Err(JobError::Cancelled) => match self.job_server.set_job_canceled(job) {
                Ok(true) => info!("Worker {}: job {} canceled", self.name, job.id),
                Ok(false) => warn!(
                    "Worker {}: job {} stopped for cancellation but is no longer cancelable",
                    self.name, job.id
                ),
                Err(e) => error!(
                    "Worker {}: failed to mark job {} canceled: {}",
                    self.name, job.id, e
                ),
            },
            Err(e) => {
                if let Err(err) = self.job_server.set_job_error(job, Some(&e.to_string())) {
                    error!(
                        "Worker {}: failed to record error of job {}: {}",
                        self.name, job.id, err
                    );
                }
            }
        }
    }
}

fn panic_detail(err: JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Worker for JobWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn job_type(&self) -> &JobType {
        &self.job_type
    }

    async fn run(&self, stop: CancellationToken) {
        let mut receiver = self.receiver.lock().await;
        info!("Worker {} started", self.name);

        loop {
            // A job already handed over is processed even if stop fired meanwhile
            let job = tokio::select! {
                biased;
                job = receiver.recv() => job,
                _ = stop.cancelled() => break,
            };
            self.process_job(job, &stop).await;
        }

        info!("Worker {} stopped", self.name);
    }

    fn is_enabled(&self, config: &Config) -> bool {
        (self.enabled)(config)
    }

    fn job_sender(&self) -> JobSender {
        self.sender.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::server::test_support::CountingMetrics;
    use crate::job_store::{JobStatus, SqliteJobStore};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::task::JoinHandle;

    fn create_server() -> (Arc<JobServer>, Arc<CountingMetrics>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let metrics = Arc::new(CountingMetrics::default());
        let server = JobServer::new(store, metrics.clone())
            .with_cancellation_poll_interval(Duration::from_millis(10));
        (Arc::new(server), metrics, temp_dir)
    }

    fn spawn_worker(
        server: &Arc<JobServer>,
        executor: Arc<dyn JobExecutor>,
    ) -> (Arc<JobWorker>, CancellationToken, JoinHandle<()>) {
        let worker = Arc::new(JobWorker::new(
            "test",
            JobType::EXPORT_PROCESS,
            server.clone(),
            executor,
        ));
        let stop = CancellationToken::new();
        let handle = {
            let (worker, stop) = (worker.clone(), stop.clone());
            tokio::spawn(async move { worker.run(stop).await })
        };
        (worker, stop, handle)
    }

    async fn deliver(worker: &JobWorker, job: Job) {
        let sender = worker.job_sender();
        for _ in 0..500 {
            if sender.has_waiting_receiver() {
                sender.try_deliver(job).unwrap();
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("worker never waited for a job");
    }

    async fn wait_for_status(server: &JobServer, id: &str, status: JobStatus) -> Job {
        for _ in 0..500 {
            let job = server.get_job(id).unwrap();
            if job.status == status {
                return job;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!(
            "job {} never reached {}, still {}",
            id,
            status,
            server.get_job(id).unwrap().status
        );
    }

    fn new_job(server: &JobServer) -> Job {
        server
            .create_job(JobType::EXPORT_PROCESS, HashMap::new())
            .unwrap()
    }

    #[tokio::test]
    async fn test_successful_job() {
        let (server, metrics, _temp_dir) = create_server();
        let executor = Arc::new(|ctx: &mut JobContext| -> Result<(), JobError> {
            ctx.set_progress(50)?;
            ctx.update_data("exported", "12")
        });
        let (worker, stop, handle) = spawn_worker(&server, executor);
        let job = new_job(&server);

        deliver(&worker, job.clone()).await;
        let done = wait_for_status(&server, &job.id, JobStatus::Success).await;

        assert_eq!(done.progress, 100);
        assert_eq!(done.data.get("exported").map(String::as_str), Some("12"));
        assert_eq!(metrics.active(&JobType::EXPORT_PROCESS), 0);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_job_records_error() {
        let (server, _metrics, _temp_dir) = create_server();
        let executor = Arc::new(|_ctx: &mut JobContext| -> Result<(), JobError> {
            Err(JobError::Failed("remote refused".to_string()))
        });
        let (worker, stop, handle) = spawn_worker(&server, executor);
        let job = new_job(&server);

        deliver(&worker, job.clone()).await;
        let done = wait_for_status(&server, &job.id, JobStatus::Error).await;

        assert!(done.error_message().unwrap().contains("remote refused"));
        assert_eq!(done.progress, -1);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_panicking_job_records_error_and_worker_survives() {
        let (server, _metrics, _temp_dir) = create_server();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let executor = Arc::new(move |_ctx: &mut JobContext| -> Result<(), JobError> {
            if runs_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("boom");
            }
            Ok(())
        });
        let (worker, stop, handle) = spawn_worker(&server, executor);

        let first = new_job(&server);
        deliver(&worker, first.clone()).await;
        let failed = wait_for_status(&server, &first.id, JobStatus::Error).await;
        assert!(failed.error_message().unwrap().contains("boom"));

        let second = new_job(&server);
        deliver(&worker, second.clone()).await;
        wait_for_status(&server, &second.id, JobStatus::Success).await;

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_cancelled_job_ends_canceled() {
        let (server, metrics, _temp_dir) = create_server();
        let executor = Arc::new(|ctx: &mut JobContext| -> Result<(), JobError> {
            loop {
                ctx.checkpoint()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        let (worker, stop, handle) = spawn_worker(&server, executor);
        let job = new_job(&server);

        deliver(&worker, job.clone()).await;
        wait_for_status(&server, &job.id, JobStatus::InProgress).await;
        server.request_cancellation(&job.id).unwrap();
        wait_for_status(&server, &job.id, JobStatus::Canceled).await;
        assert_eq!(metrics.active(&JobType::EXPORT_PROCESS), 0);

        stop.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_interrupts_running_job() {
        let (server, _metrics, _temp_dir) = create_server();
        let executor = Arc::new(|ctx: &mut JobContext| -> Result<(), JobError> {
            loop {
                ctx.checkpoint()?;
                std::thread::sleep(Duration::from_millis(5));
            }
        });
        let (worker, stop, handle) = spawn_worker(&server, executor);
        let job = new_job(&server);

        deliver(&worker, job.clone()).await;
        wait_for_status(&server, &job.id, JobStatus::InProgress).await;
        stop.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let stopped = server.get_job(&job.id).unwrap();
        assert_eq!(stopped.status, JobStatus::Error);
        assert!(stopped.error_message().unwrap().contains("shutdown"));
    }

    #[tokio::test]
    async fn test_already_claimed_job_is_not_executed() {
        let (server, _metrics, _temp_dir) = create_server();
        let runs = Arc::new(AtomicUsize::new(0));
        let runs_clone = runs.clone();
        let executor = Arc::new(move |_ctx: &mut JobContext| -> Result<(), JobError> {
            runs_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let (worker, stop, handle) = spawn_worker(&server, executor);

        let job = new_job(&server);
        assert!(server.claim_job(&mut job.clone()).unwrap());
        deliver(&worker, job.clone()).await;

        // The worker parks again once it has dropped the job
        deliver(&worker, new_job(&server)).await;
        stop.cancel();
        handle.await.unwrap();

        assert_eq!(
            server.get_job(&job.id).unwrap().status,
            JobStatus::InProgress
        );
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_enabled_follows_run_jobs_and_type_settings() {
        let (server, _metrics, _temp_dir) = create_server();
        let worker = JobWorker::new(
            "test",
            JobType::EXPORT_PROCESS,
            server,
            Arc::new(|_ctx: &mut JobContext| -> Result<(), JobError> { Ok(()) }),
        );
        let mut config = Config::default();
        assert!(worker.is_enabled(&config));

        config.jobs.run_jobs = false;
        assert!(!worker.is_enabled(&config));
    }
}
