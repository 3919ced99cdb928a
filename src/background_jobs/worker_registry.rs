use super::error::RegistryError;
use super::server::JobServer;
use super::watcher::{Watcher, DEFAULT_WATCHER_POLL_INTERVAL};
use super::worker::Worker;
use crate::config::ConfigService;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

struct RunningTask {
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

impl RunningTask {
    async fn shutdown(self, name: &str) {
        self.stop.cancel();
        if let Err(e) = self.handle.await {
            error!("{} ended abnormally: {}", name, e);
        }
    }
}

struct RunningState {
    watcher: RunningTask,
    workers: HashMap<String, RunningTask>,
    listener_id: String,
}

/// Runs the enabled [`Worker`]s and the [`Watcher`] feeding them.
///
/// Workers are started and stopped individually as configuration changes
/// enable or disable them.
pub struct WorkerRegistry {
    job_server: Arc<JobServer>,
    config_service: Arc<dyn ConfigService>,
    workers: RwLock<Vec<Arc<dyn Worker>>>,
    watcher_poll_interval: Duration,
    lifecycle: tokio::sync::Mutex<Option<RunningState>>,
}

impl WorkerRegistry {
    pub fn new(job_server: Arc<JobServer>, config_service: Arc<dyn ConfigService>) -> Self {
        Self {
            job_server,
            config_service,
            workers: RwLock::new(Vec::new()),
            watcher_poll_interval: DEFAULT_WATCHER_POLL_INTERVAL,
            lifecycle: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_watcher_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.watcher_poll_interval = poll_interval;
        self
    }

    /// Adds `worker`, replacing a previously registered worker with the same name.
    pub fn register(&self, worker: Arc<dyn Worker>) {
        info!(
            "Registering worker {} for job type {}",
            worker.name(),
            worker.job_type()
        );
        let mut workers = self.workers.write().unwrap();
        if let Some(existing) = workers.iter_mut().find(|w| w.name() == worker.name()) {
            warn!("Worker {} registered twice, keeping the latest", worker.name());
            *existing = worker;
        } else {
            workers.push(worker);
        }
    }

    /// Names of the workers currently running.
    pub async fn running_workers(&self) -> Vec<String> {
        let lifecycle = self.lifecycle.lock().await;
        let mut names: Vec<String> = lifecycle
            .as_ref()
            .map(|state| state.workers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub async fn is_running(&self) -> bool {
        self.lifecycle.lock().await.is_some()
    }

    fn registered_workers(&self) -> Vec<Arc<dyn Worker>> {
        self.workers.read().unwrap().clone()
    }

    fn spawn_worker(worker: Arc<dyn Worker>) -> RunningTask {
        let stop = CancellationToken::new();
        let worker_stop = stop.clone();
        let handle = tokio::spawn(async move { worker.run(worker_stop).await });
        RunningTask { stop, handle }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), RegistryError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.is_some() {
            return Err(RegistryError::AlreadyRunning);
        }

        let config = self.config_service.config();
        let mut watcher = Watcher::new(self.job_server.clone(), self.watcher_poll_interval);
        let mut workers = HashMap::new();
        for worker in self.registered_workers() {
            watcher.add_worker(worker.job_type().clone(), worker.job_sender());
            if worker.is_enabled(&config) {
                info!("Starting worker {}", worker.name());
                workers.insert(worker.name().to_string(), Self::spawn_worker(worker));
            }
        }

        let watcher_stop = CancellationToken::new();
        let watcher_handle = {
            let stop = watcher_stop.clone();
            tokio::spawn(async move { watcher.run(stop).await })
        };

        let runtime = tokio::runtime::Handle::current();
        let weak = Arc::downgrade(self);
        let listener_id = self
            .config_service
            .add_config_listener(Box::new(move |_old, _new| {
                if let Some(registry) = weak.upgrade() {
                    runtime.spawn(async move { registry.reconcile().await });
                }
            }));

        info!("Worker registry started with {} running workers", workers.len());
        *lifecycle = Some(RunningState {
            watcher: RunningTask {
                stop: watcher_stop,
                handle: watcher_handle,
            },
            workers,
            listener_id,
        });
        Ok(())
    }

    /// Starts newly enabled workers and stops newly disabled ones, leaving
    /// the others untouched.
    async fn reconcile(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let Some(state) = lifecycle.as_mut() else {
            return;
        };

        let config = self.config_service.config();
        for worker in self.registered_workers() {
            let name = worker.name().to_string();
            let running = state.workers.contains_key(&name);
            let enabled = worker.is_enabled(&config);

            if enabled && !running {
                info!("Worker {} enabled, starting it", name);
                state.workers.insert(name, Self::spawn_worker(worker));
            } else if !enabled && running {
                info!("Worker {} disabled, stopping it", name);
                if let Some(task) = state.workers.remove(&name) {
                    task.shutdown(&format!("Worker {}", name)).await;
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<(), RegistryError> {
        let mut lifecycle = self.lifecycle.lock().await;
        let state = lifecycle.take().ok_or(RegistryError::NotRunning)?;

        self.config_service
            .remove_config_listener(&state.listener_id);
        state.watcher.shutdown("Watcher").await;

        let shutdowns = state
            .workers
            .into_iter()
            .map(|(name, task)| async move { task.shutdown(&format!("Worker {}", name)).await });
        futures::future::join_all(shutdowns).await;

        info!("Worker registry stopped");
        Ok(())
    }
}
