use super::handoff::JobSender;
use super::server::JobServer;
use crate::job_store::JobType;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

pub const DEFAULT_WATCHER_POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Polls the store for pending jobs and offers each one to the worker of
/// its type.
///
/// Delivery never waits: a job whose worker is busy stays `Pending` and is
/// offered again on a later poll.
pub struct Watcher {
    job_server: Arc<JobServer>,
    senders: HashMap<JobType, JobSender>,
    poll_interval: Duration,
}

impl Watcher {
    pub fn new(job_server: Arc<JobServer>, poll_interval: Duration) -> Self {
        Self {
            job_server,
            senders: HashMap::new(),
            poll_interval,
        }
    }

    pub fn add_worker(&mut self, job_type: JobType, sender: JobSender) {
        self.senders.insert(job_type, sender);
    }

    pub async fn run(&self, stop: CancellationToken) {
        // Processes started together should not all poll at the same instant
        let initial_delay = match self.poll_interval.as_millis() as u64 {
            0 => Duration::ZERO,
            millis => Duration::from_millis(rand::rng().random_range(0..millis)),
        };
        info!(
            "Watcher starting in {:?}, polling every {:?}",
            initial_delay, self.poll_interval
        );

        tokio::select! {
            _ = stop.cancelled() => return,
            _ = tokio::time::sleep(initial_delay) => {}
        }

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.poll_and_notify();
                }
            }
        }
        info!("Watcher stopped");
    }

    /// Offers every pending job to its worker, oldest first. Returns how many
    /// jobs were handed over.
    pub fn poll_and_notify(&self) -> usize {
        let jobs = match self.job_server.get_pending_jobs() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("Watcher failed to load pending jobs: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for job in jobs {
            let Some(sender) = self.senders.get(&job.job_type) else {
                debug!(
                    "No worker registered for job type {}, skipping job {}",
                    job.job_type, job.id
                );
                continue;
            };
            match sender.try_deliver(job) {
                Ok(()) => delivered += 1,
                Err(job) => debug!(
                    "Worker for {} is busy, job {} stays pending",
                    job.job_type, job.id
                ),
            }
        }
        delivered
    }
}
