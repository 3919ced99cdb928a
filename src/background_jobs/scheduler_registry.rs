use super::error::{JobServerError, RegistryError};
use super::scheduler::Scheduler;
use super::server::JobServer;
use crate::config::{Config, ConfigService};
use crate::job_store::JobType;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SCHEDULER_TICK: Duration = Duration::from_secs(60);

struct RunningLoop {
    stop: CancellationToken,
    handle: JoinHandle<()>,
    listener_id: String,
}

/// Asks every registered [`Scheduler`] when its next job is due and creates
/// it through the [`JobServer`] when that time comes.
///
/// Only the cluster leader creates jobs, and only for enabled schedulers:
/// otherwise the cached next run time of a type is `None`.
pub struct SchedulerRegistry {
    job_server: Arc<JobServer>,
    config_service: Arc<dyn ConfigService>,
    schedulers: RwLock<HashMap<JobType, Arc<dyn Scheduler>>>,
    next_run_times: Mutex<HashMap<JobType, Option<DateTime<Utc>>>>,
    is_leader: AtomicBool,
    tick_interval: Duration,
    config_changed: Notify,
    leader_changed: Notify,
    lifecycle: tokio::sync::Mutex<Option<RunningLoop>>,
}

impl SchedulerRegistry {
    pub fn new(
        job_server: Arc<JobServer>,
        config_service: Arc<dyn ConfigService>,
        is_leader: bool,
    ) -> Self {
        Self {
            job_server,
            config_service,
            schedulers: RwLock::new(HashMap::new()),
            next_run_times: Mutex::new(HashMap::new()),
            is_leader: AtomicBool::new(is_leader),
            tick_interval: DEFAULT_SCHEDULER_TICK,
            config_changed: Notify::new(),
            leader_changed: Notify::new(),
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn register(&self, job_type: JobType, scheduler: Arc<dyn Scheduler>) {
        info!("Registering scheduler for job type {}", job_type);
        self.next_run_times
            .lock()
            .unwrap()
            .insert(job_type.clone(), None);
        self.schedulers.write().unwrap().insert(job_type, scheduler);
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Cached next run time of `job_type`.
    pub fn next_run_time(&self, job_type: &JobType) -> Option<DateTime<Utc>> {
        self.next_run_times
            .lock()
            .unwrap()
            .get(job_type)
            .copied()
            .flatten()
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), RegistryError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(RegistryError::AlreadyRunning);
        }

        let weak = Arc::downgrade(self);
        let listener_id = self
            .config_service
            .add_config_listener(Box::new(move |_old, _new| {
                if let Some(registry) = weak.upgrade() {
                    registry.config_changed.notify_one();
                }
            }));

        let stop = CancellationToken::new();
        let registry = self.clone();
        let loop_stop = stop.clone();
        let handle = tokio::spawn(async move { registry.run(loop_stop).await });

        *lifecycle = Some(RunningLoop {
            stop,
            handle,
            listener_id,
        });
        Ok(())
    }

    pub async fn stop(&self) -> Result<(), RegistryError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let running = lifecycle.take().ok_or(RegistryError::NotRunning)?;

        self.config_service
            .remove_config_listener(&running.listener_id);
        running.stop.cancel();
        if let Err(e) = running.handle.await {
            error!("Scheduler registry loop ended abnormally: {}", e);
        }
        Ok(())
    }

    pub fn handle_cluster_leader_change(&self, is_leader: bool) {
        if self.is_leader.swap(is_leader, Ordering::SeqCst) != is_leader {
            info!("Cluster leadership changed, is_leader={}", is_leader);
            self.leader_changed.notify_one();
        }
    }

    async fn run(self: Arc<Self>, stop: CancellationToken) {
        info!(
            "Starting scheduler registry with {} schedulers",
            self.schedulers.read().unwrap().len()
        );
        self.set_next_run_times();

        let mut ticker =
            tokio::time::interval_at(Instant::now() + self.tick_interval, self.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => self.schedule_due_jobs(),
                _ = self.config_changed.notified() => {
                    debug!("Config changed, recomputing next run times");
                    self.set_next_run_times();
                }
                _ = self.leader_changed.notified() => {
                    debug!("Leadership changed, recomputing next run times");
                    self.set_next_run_times();
                }
            }
        }

        info!("Scheduler registry stopped");
    }

    fn schedulers_snapshot(&self) -> Vec<(JobType, Arc<dyn Scheduler>)> {
        self.schedulers
            .read()
            .unwrap()
            .iter()
            .map(|(job_type, scheduler)| (job_type.clone(), scheduler.clone()))
            .collect()
    }

    /// Recomputes the next run time of every type. A type whose state cannot
    /// be read keeps its previous time.
    fn set_next_run_times(&self) {
        let config = self.config_service.config();
        let now = Utc::now();

        for (job_type, scheduler) in self.schedulers_snapshot() {
            match self.compute_next_run_time(&config, &job_type, scheduler.as_ref(), now) {
                Ok(next) => {
                    debug!("Next run of {} jobs: {:?}", job_type, next);
                    self.next_run_times.lock().unwrap().insert(job_type, next);
                }
                Err(e) => {
                    error!("Failed to compute next run time of {} jobs: {}", job_type, e);
                }
            }
        }
    }

    fn compute_next_run_time(
        &self,
        config: &Config,
        job_type: &JobType,
        scheduler: &dyn Scheduler,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, JobServerError> {
        if !self.is_leader() || !scheduler.enabled(config) {
            return Ok(None);
        }
        let pending_jobs = self.job_server.check_for_pending_jobs_by_type(job_type)?;
        let last_successful_job = self.job_server.get_last_successful_job_by_type(job_type)?;
        Ok(scheduler.next_schedule_time(config, now, pending_jobs, last_successful_job.as_ref()))
    }

    /// Runs every scheduler whose next run time has passed.
    ///
    /// A type whose state cannot be read, or whose job cannot be created,
    /// is left due so it is retried on the next tick.
    pub(crate) fn schedule_due_jobs(&self) {
        let config = self.config_service.config();
        let now = Utc::now();

        let due: Vec<JobType> = self
            .next_run_times
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, next)| next.is_some_and(|next| next <= now))
            .map(|(job_type, _)| job_type.clone())
            .collect();

        for job_type in due {
            let Some(scheduler) = self.schedulers.read().unwrap().get(&job_type).cloned() else {
                continue;
            };

            if !self.is_leader() || !scheduler.enabled(&config) {
                self.next_run_times.lock().unwrap().insert(job_type, None);
                continue;
            }

            let state = self
                .job_server
                .check_for_pending_jobs_by_type(&job_type)
                .and_then(|pending| {
                    self.job_server
                        .get_last_successful_job_by_type(&job_type)
                        .map(|last| (pending, last))
                });
            let (pending_jobs, last_successful_job) = match state {
                Ok(state) => state,
                Err(e) => {
                    error!("Failed to read state of {} jobs: {}", job_type, e);
                    continue;
                }
            };

            match scheduler.schedule_job(&config, pending_jobs, last_successful_job.as_ref()) {
                Ok(Some(job)) => info!("Scheduled {} job {}", job_type, job.id),
                Ok(None) => debug!("No {} job scheduled this time", job_type),
                Err(e) => {
                    warn!("Failed to schedule {} job: {}", job_type, e);
                    continue;
                }
            }

            let next = scheduler.next_schedule_time(
                &config,
                now,
                pending_jobs,
                last_successful_job.as_ref(),
            );
            debug!("Next run of {} jobs: {:?}", job_type, next);
            self.next_run_times.lock().unwrap().insert(job_type, next);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::background_jobs::server::test_support::CountingMetrics;
    use crate::background_jobs::PeriodicScheduler;
    use crate::config::{JobTypeSettings, LiveConfigService};
    use crate::job_store::{Job, SqliteJobStore};
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Always due, fails the first `failures` times it is asked to schedule.
    struct DueScheduler {
        job_server: Arc<JobServer>,
        failures: AtomicUsize,
        calls: AtomicUsize,
    }

    impl Scheduler for DueScheduler {
        fn enabled(&self, _config: &Config) -> bool {
            true
        }

        fn next_schedule_time(
            &self,
            _config: &Config,
            now: DateTime<Utc>,
            _pending_jobs: bool,
            _last_successful_job: Option<&Job>,
        ) -> Option<DateTime<Utc>> {
            Some(now)
        }

        fn schedule_job(
            &self,
            _config: &Config,
            pending_jobs: bool,
            _last_successful_job: Option<&Job>,
        ) -> Result<Option<Job>, JobServerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(JobServerError::Validation("not yet".to_string()));
            }
            if pending_jobs {
                return Ok(None);
            }
            self.job_server
                .create_job(JobType::DATA_RETENTION, HashMap::new())
                .map(Some)
        }
    }

    fn create_registry(
        is_leader: bool,
    ) -> (
        Arc<SchedulerRegistry>,
        Arc<JobServer>,
        Arc<LiveConfigService>,
        TempDir,
    ) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let job_server = Arc::new(JobServer::new(store, Arc::new(CountingMetrics::default())));
        let config_service = Arc::new(LiveConfigService::new(Config::default()));
        let registry = Arc::new(
            SchedulerRegistry::new(job_server.clone(), config_service.clone(), is_leader)
                .with_tick_interval(Duration::from_millis(20)),
        );
        (registry, job_server, config_service, temp_dir)
    }

    fn disable(config_service: &LiveConfigService, job_type: JobType) {
        let mut config = (*config_service.config()).clone();
        config.job_types.insert(
            job_type,
            JobTypeSettings {
                enabled: false,
                ..Default::default()
            },
        );
        config_service.set_config(config);
    }

    #[test]
    fn test_next_run_time_is_gated_by_leadership_and_enabled() {
        let (registry, job_server, config_service, _temp_dir) = create_registry(false);
        registry.register(
            JobType::LDAP_SYNC,
            Arc::new(PeriodicScheduler::new(
                job_server,
                JobType::LDAP_SYNC,
                Duration::from_secs(600),
            )),
        );

        registry.set_next_run_times();
        assert_eq!(registry.next_run_time(&JobType::LDAP_SYNC), None);

        registry.handle_cluster_leader_change(true);
        let before = Utc::now();
        registry.set_next_run_times();
        let next = registry.next_run_time(&JobType::LDAP_SYNC).unwrap();
        assert!(next > before);

        disable(&config_service, JobType::LDAP_SYNC);
        registry.set_next_run_times();
        assert_eq!(registry.next_run_time(&JobType::LDAP_SYNC), None);
    }

    #[test]
    fn test_failed_schedule_leaves_type_due() {
        let (registry, job_server, _config_service, _temp_dir) = create_registry(true);
        let scheduler = Arc::new(DueScheduler {
            job_server: job_server.clone(),
            failures: AtomicUsize::new(1),
            calls: AtomicUsize::new(0),
        });
        registry.register(JobType::DATA_RETENTION, scheduler.clone());
        registry.set_next_run_times();

        registry.schedule_due_jobs();
        assert_eq!(scheduler.calls.load(Ordering::SeqCst), 1);
        assert!(!job_server
            .check_for_pending_jobs_by_type(&JobType::DATA_RETENTION)
            .unwrap());
        assert!(registry.next_run_time(&JobType::DATA_RETENTION).is_some());

        registry.schedule_due_jobs();
        assert_eq!(scheduler.calls.load(Ordering::SeqCst), 2);
        assert!(job_server
            .check_for_pending_jobs_by_type(&JobType::DATA_RETENTION)
            .unwrap());

        // Pending job prevents a duplicate
        registry.schedule_due_jobs();
        assert_eq!(job_server.get_pending_jobs().unwrap().len(), 1);
    }

    #[test]
    fn test_losing_leadership_clears_due_type() {
        let (registry, job_server, _config_service, _temp_dir) = create_registry(true);
        let scheduler = Arc::new(DueScheduler {
            job_server: job_server.clone(),
            failures: AtomicUsize::new(0),
            calls: AtomicUsize::new(0),
        });
        registry.register(JobType::DATA_RETENTION, scheduler.clone());
        registry.set_next_run_times();

        registry.handle_cluster_leader_change(false);
        registry.schedule_due_jobs();

        assert_eq!(scheduler.calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.next_run_time(&JobType::DATA_RETENTION), None);
    }

    #[tokio::test]
    async fn test_double_start_and_stop_are_errors() {
        let (registry, _job_server, _config_service, _temp_dir) = create_registry(true);

        assert_eq!(registry.stop().await, Err(RegistryError::NotRunning));
        registry.start().await.unwrap();
        assert!(registry.is_running().await);
        assert_eq!(registry.start().await, Err(RegistryError::AlreadyRunning));
        registry.stop().await.unwrap();
        assert!(!registry.is_running().await);
        assert_eq!(registry.stop().await, Err(RegistryError::NotRunning));

        // Can be restarted after a stop
        registry.start().await.unwrap();
        registry.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_running_loop_creates_due_jobs() {
        let (registry, job_server, _config_service, _temp_dir) = create_registry(true);
        registry.register(
            JobType::DATA_RETENTION,
            Arc::new(DueScheduler {
                job_server: job_server.clone(),
                failures: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            }),
        );

        registry.start().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !job_server
            .check_for_pending_jobs_by_type(&JobType::DATA_RETENTION)
            .unwrap()
        {
            assert!(Instant::now() < deadline, "no job was scheduled");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        registry.stop().await.unwrap();

        assert_eq!(job_server.get_pending_jobs().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_config_change_recomputes_while_running() {
        let (registry, job_server, config_service, _temp_dir) = create_registry(true);
        registry.register(
            JobType::LDAP_SYNC,
            Arc::new(PeriodicScheduler::new(
                job_server,
                JobType::LDAP_SYNC,
                Duration::from_secs(600),
            )),
        );

        registry.start().await.unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while registry.next_run_time(&JobType::LDAP_SYNC).is_none() {
            assert!(Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        disable(&config_service, JobType::LDAP_SYNC);
        while registry.next_run_time(&JobType::LDAP_SYNC).is_some() {
            assert!(Instant::now() < deadline, "config change was not applied");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        registry.stop().await.unwrap();
    }
}
