use crate::job_store::{JobStatus, JobType};
use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use prometheus::{Encoder, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::sync::Arc;

/// Metric name prefix for all job server metrics
const PREFIX: &str = "jobserver";

/// Where the job server reports job activity.
pub trait MetricsSink: Send + Sync {
    fn increment_job_active(&self, job_type: &JobType);
    fn decrement_job_active(&self, job_type: &JobType);
    fn record_job_finished(&self, job_type: &JobType, status: JobStatus);
}

pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment_job_active(&self, _job_type: &JobType) {}
    fn decrement_job_active(&self, _job_type: &JobType) {}
    fn record_job_finished(&self, _job_type: &JobType, _status: JobStatus) {}
}

/// [`MetricsSink`] backed by its own Prometheus registry.
pub struct PrometheusMetrics {
    registry: Registry,
    jobs_active: IntGaugeVec,
    jobs_finished_total: IntCounterVec,
}

impl PrometheusMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let jobs_active = IntGaugeVec::new(
            Opts::new(
                format!("{PREFIX}_jobs_active"),
                "Number of jobs currently claimed by this process",
            ),
            &["type"],
        )?;
        let jobs_finished_total = IntCounterVec::new(
            Opts::new(
                format!("{PREFIX}_jobs_finished_total"),
                "Total jobs that reached a terminal status",
            ),
            &["type", "status"],
        )?;

        registry.register(Box::new(jobs_active.clone()))?;
        registry.register(Box::new(jobs_finished_total.clone()))?;

        Ok(Self {
            registry,
            jobs_active,
            jobs_finished_total,
        })
    }

    pub fn active_jobs(&self, job_type: &JobType) -> i64 {
        self.jobs_active
            .with_label_values(&[job_type.as_str()])
            .get()
    }

    pub fn finished_jobs(&self, job_type: &JobType, status: JobStatus) -> u64 {
        self.jobs_finished_total
            .with_label_values(&[job_type.as_str(), status.as_str()])
            .get()
    }

    /// Renders every metric in the Prometheus text format.
    pub fn encode(&self) -> Result<String> {
        let mut buffer = vec![];
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl MetricsSink for PrometheusMetrics {
    fn increment_job_active(&self, job_type: &JobType) {
        self.jobs_active
            .with_label_values(&[job_type.as_str()])
            .inc();
    }

    fn decrement_job_active(&self, job_type: &JobType) {
        self.jobs_active
            .with_label_values(&[job_type.as_str()])
            .dec();
    }

    fn record_job_finished(&self, job_type: &JobType, status: JobStatus) {
        self.jobs_finished_total
            .with_label_values(&[job_type.as_str(), status.as_str()])
            .inc();
    }
}

/// Handler for the /metrics endpoint
async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> impl IntoResponse {
    match metrics.encode() {
        Ok(body) => (StatusCode::OK, body),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to encode metrics: {}", e),
            )
        }
    }
}

pub fn make_metrics_app(metrics: Arc<PrometheusMetrics>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(metrics)
}

pub async fn run_metrics_server(metrics: Arc<PrometheusMetrics>, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    Ok(axum::serve(listener, make_metrics_app(metrics)).await?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_tracks_active_jobs_per_type() {
        let metrics = PrometheusMetrics::new().unwrap();

        metrics.increment_job_active(&JobType::LDAP_SYNC);
        metrics.increment_job_active(&JobType::LDAP_SYNC);
        metrics.increment_job_active(&JobType::MIGRATIONS);
        metrics.decrement_job_active(&JobType::LDAP_SYNC);

        assert_eq!(metrics.active_jobs(&JobType::LDAP_SYNC), 1);
        assert_eq!(metrics.active_jobs(&JobType::MIGRATIONS), 1);
        assert_eq!(metrics.active_jobs(&JobType::DATA_RETENTION), 0);
    }

    #[test]
    fn test_encode_contains_metric_names() {
        let metrics = PrometheusMetrics::new().unwrap();
        metrics.increment_job_active(&JobType::JOBS_CLEANUP);
        metrics.record_job_finished(&JobType::JOBS_CLEANUP, JobStatus::Success);

        let output = metrics.encode().unwrap();

        assert!(output.contains("jobserver_jobs_active"));
        assert!(output.contains("jobserver_jobs_finished_total"));
        assert!(output.contains("status=\"success\""));
        assert_eq!(
            metrics.finished_jobs(&JobType::JOBS_CLEANUP, JobStatus::Success),
            1
        );
    }

    #[test]
    fn test_separate_instances_do_not_share_state() {
        let first = PrometheusMetrics::new().unwrap();
        let second = PrometheusMetrics::new().unwrap();

        first.increment_job_active(&JobType::MIGRATIONS);

        assert_eq!(first.active_jobs(&JobType::MIGRATIONS), 1);
        assert_eq!(second.active_jobs(&JobType::MIGRATIONS), 0);
    }
}
