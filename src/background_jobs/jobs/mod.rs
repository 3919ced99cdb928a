//! Jobs every job server runs, whatever else is registered.

pub mod cleanup;
pub mod migrations;

pub use cleanup::{jobs_cleanup_scheduler, JobsCleanupExecutor};
pub use migrations::{Migration, MigrationStep, MigrationsExecutor, MigrationsScheduler};

use super::{JobServer, JobWorker, SchedulerRegistry, WorkerRegistry};
use crate::config::ConfigService;
use crate::job_store::JobType;
use std::sync::Arc;

/// Registers the migrations and jobs cleanup schedulers and workers.
pub fn register_builtin_jobs(
    job_server: &Arc<JobServer>,
    config_service: &Arc<dyn ConfigService>,
    migrations: Vec<Arc<dyn Migration>>,
    scheduler_registry: Option<&SchedulerRegistry>,
    worker_registry: &WorkerRegistry,
) {
    if let Some(schedulers) = scheduler_registry {
        schedulers.register(
            JobType::MIGRATIONS,
            Arc::new(MigrationsScheduler::new(
                job_server.clone(),
                migrations.clone(),
            )),
        );
        schedulers.register(
            JobType::JOBS_CLEANUP,
            Arc::new(jobs_cleanup_scheduler(job_server.clone())),
        );
    }

    worker_registry.register(Arc::new(JobWorker::new(
        "migrations",
        JobType::MIGRATIONS,
        job_server.clone(),
        Arc::new(MigrationsExecutor::new(migrations)),
    )));
    worker_registry.register(Arc::new(JobWorker::new(
        "jobs_cleanup",
        JobType::JOBS_CLEANUP,
        job_server.clone(),
        Arc::new(JobsCleanupExecutor::new(config_service.clone())),
    )));
}
