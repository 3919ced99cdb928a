//! Background job scheduling and execution.
//!
//! Schedulers decide when jobs are due and create them as `Pending` records.
//! The watcher polls the store and hands each pending job to the idle worker
//! of its type, which claims it and runs its executor on a blocking thread.

mod cancellation;
mod context;
mod error;
pub mod handoff;
mod job;
pub mod jobs;
mod scheduler;
mod scheduler_registry;
pub(crate) mod server;
mod watcher;
mod worker;
mod worker_registry;

pub use context::JobContext;
pub use error::{JobServerError, RegistryError};
pub use handoff::{JobReceiver, JobSender};
pub use job::{JobError, JobExecutor};
pub use scheduler::{next_daily_occurrence, DailyScheduler, PeriodicScheduler, Scheduler};
pub use scheduler_registry::{SchedulerRegistry, DEFAULT_SCHEDULER_TICK};
pub use server::{JobServer, DEFAULT_CANCELLATION_POLL_INTERVAL};
pub use watcher::{Watcher, DEFAULT_WATCHER_POLL_INTERVAL};
pub use worker::{JobWorker, Worker};
pub use worker_registry::WorkerRegistry;
