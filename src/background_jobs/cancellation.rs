use super::server::JobServer;
use crate::job_store::JobStatus;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

impl JobServer {
    /// Watches a claimed job for cancellation requests.
    ///
    /// Polls the job every cancellation poll interval and fires `cancel` once
    /// its status is `CancelRequested`. Returns as soon as `finished` fires,
    /// or when the job is gone or already terminal.
    pub async fn cancellation_watcher(
        &self,
        job_id: String,
        cancel: CancellationToken,
        finished: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.cancellation_poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = finished.cancelled() => {
                    debug!("Cancellation watcher for job {} done", job_id);
                    return;
                }
                _ = ticker.tick() => {}
            }

            match self.store().get(&job_id) {
                Ok(Some(job)) if job.status == JobStatus::CancelRequested => {
                    info!("Job {} has been requested to cancel", job_id);
                    cancel.cancel();
                    return;
                }
                Ok(Some(job)) if job.status.is_terminal() => {
                    debug!(
                        "Job {} is already {}, stopping cancellation watcher",
                        job_id, job.status
                    );
                    return;
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!("Job {} disappeared while being watched for cancellation", job_id);
                    return;
                }
                Err(e) => {
                    error!("Failed to check job {} for cancellation: {}", job_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::background_jobs::server::test_support::CountingMetrics;
    use crate::background_jobs::JobServer;
    use crate::job_store::{JobStatus, JobType, SqliteJobStore};
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn create_server() -> (Arc<JobServer>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteJobStore::new(temp_dir.path().join("jobs.db")).unwrap());
        let server = JobServer::new(store, Arc::new(CountingMetrics::default()))
            .with_cancellation_poll_interval(Duration::from_millis(10));
        (Arc::new(server), temp_dir)
    }

    #[tokio::test]
    async fn test_fires_cancel_token_on_cancel_request() {
        let (server, _temp_dir) = create_server();
        let mut job = server
            .create_job(JobType::MESSAGE_EXPORT, HashMap::new())
            .unwrap();
        assert!(server.claim_job(&mut job).unwrap());

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        let watcher = {
            let server = server.clone();
            let (cancel, finished, id) = (cancel.clone(), finished.clone(), job.id.clone());
            tokio::spawn(async move { server.cancellation_watcher(id, cancel, finished).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!cancel.is_cancelled());

        server.request_cancellation(&job.id).unwrap();
        tokio::time::timeout(Duration::from_secs(2), watcher)
            .await
            .unwrap()
            .unwrap();
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_exits_when_finished() {
        let (server, _temp_dir) = create_server();
        let mut job = server
            .create_job(JobType::MESSAGE_EXPORT, HashMap::new())
            .unwrap();
        assert!(server.claim_job(&mut job).unwrap());

        let cancel = CancellationToken::new();
        let finished = CancellationToken::new();
        finished.cancel();

        tokio::time::timeout(
            Duration::from_secs(2),
            server.cancellation_watcher(job.id.clone(), cancel.clone(), finished),
        )
        .await
        .unwrap();
        assert!(!cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_exits_when_job_missing_or_terminal() {
        let (server, _temp_dir) = create_server();

        let cancel = CancellationToken::new();
        tokio::time::timeout(
            Duration::from_secs(2),
            server.cancellation_watcher(
                "0123456789abcdef0123456789abcdef".to_string(),
                cancel.clone(),
                CancellationToken::new(),
            ),
        )
        .await
        .unwrap();
        assert!(!cancel.is_cancelled());

        let mut job = server
            .create_job(JobType::MESSAGE_EXPORT, HashMap::new())
            .unwrap();
        assert!(server.claim_job(&mut job).unwrap());
        assert!(server.set_job_success(&mut job).unwrap());
        assert_eq!(server.get_job(&job.id).unwrap().status, JobStatus::Success);

        tokio::time::timeout(
            Duration::from_secs(2),
            server.cancellation_watcher(job.id.clone(), cancel.clone(), CancellationToken::new()),
        )
        .await
        .unwrap();
        assert!(!cancel.is_cancelled());
    }
}
