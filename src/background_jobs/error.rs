use crate::job_store::JobStatus;
use thiserror::Error;

/// Errors returned by [`super::JobServer`] operations.
#[derive(Debug, Error)]
pub enum JobServerError {
    #[error("Invalid job: {0}")]
    Validation(String),

    #[error("Job store operation {operation} failed: {source:#}")]
    Persistence {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Could not record error for job {0}: its status changed concurrently")]
    CouldNotRecordError(String),

    #[error("Job {id} cannot be cancelled in status {status}")]
    NotCancellable { id: String, status: JobStatus },
}

impl JobServerError {
    pub(crate) fn persistence(operation: &'static str) -> impl FnOnce(anyhow::Error) -> Self {
        move |source| JobServerError::Persistence { operation, source }
    }

    /// HTTP-style status code for callers exposing job operations over an API.
    pub fn status_code(&self) -> u16 {
        match self {
            JobServerError::Validation(_) => 400,
            JobServerError::NotFound(_) => 404,
            JobServerError::NotCancellable { .. } => 409,
            JobServerError::Persistence { .. } | JobServerError::CouldNotRecordError(_) => 500,
        }
    }
}

/// Start/stop misuse of the scheduler and worker registries.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Already running")]
    AlreadyRunning,

    #[error("Not running")]
    NotRunning,
}
