use super::context::JobContext;
use thiserror::Error;

/// Outcome of a job body that did not complete.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Execution failed: {0}")]
    Failed(String),

    /// The job was cancelled through [`super::JobServer::request_cancellation`].
    #[error("Job was cancelled")]
    Cancelled,

    /// The worker running the job is shutting down.
    #[error("Job was interrupted by worker shutdown")]
    Stopped,
}

/// Business logic of a job type.
///
/// This method is called from a blocking context using `spawn_blocking`.
/// Long running implementations should call [`JobContext::checkpoint`] between
/// units of work and return its error as is.
pub trait JobExecutor: Send + Sync {
    fn execute(&self, ctx: &mut JobContext) -> Result<(), JobError>;
}

impl<F> JobExecutor for F
where
    F: Fn(&mut JobContext) -> Result<(), JobError> + Send + Sync,
{
    fn execute(&self, ctx: &mut JobContext) -> Result<(), JobError> {
        self(ctx)
    }
}
