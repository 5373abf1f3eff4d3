use super::context::JobContext;
use std::time::Duration;

/// Schedule for when a job should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobSchedule {
    /// Run at fixed intervals, the first run one interval after startup
    Interval(Duration),
    /// Run as soon as the scheduler starts, then at fixed intervals
    StartupAndInterval(Duration),
}

impl JobSchedule {
    pub fn interval(&self) -> Duration {
        match self {
            JobSchedule::Interval(interval) | JobSchedule::StartupAndInterval(interval) => {
                *interval
            }
        }
    }

    pub fn runs_at_startup(&self) -> bool {
        matches!(self, JobSchedule::StartupAndInterval(_))
    }
}

/// How a job should be handled during shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownBehavior {
    /// Job can be cancelled immediately
    #[default]
    Cancellable,
    /// Wait for job to complete before shutdown
    WaitForCompletion,
}

/// Errors that can occur during job execution.
#[derive(Debug)]
pub enum JobError {
    ExecutionFailed(String),
    Cancelled,
}

impl std::fmt::Display for JobError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobError::ExecutionFailed(msg) => write!(f, "Execution failed: {}", msg),
            JobError::Cancelled => write!(f, "Job was cancelled"),
        }
    }
}

impl std::error::Error for JobError {}

/// Trait for background jobs.
///
/// Jobs are executed synchronously in a blocking context. Object store calls
/// are driven through [`JobContext::block_on`].
pub trait BackgroundJob: Send + Sync {
    /// Unique identifier for this job.
    fn id(&self) -> &'static str;

    /// Human-readable name for this job.
    fn name(&self) -> &'static str;

    /// Description of what this job does.
    fn description(&self) -> &'static str;

    /// When this job should be scheduled to run.
    fn schedule(&self) -> JobSchedule;

    /// How this job should be handled during shutdown.
    fn shutdown_behavior(&self) -> ShutdownBehavior {
        ShutdownBehavior::Cancellable
    }

    /// Execute the job.
    ///
    /// Called from `spawn_blocking`. Long loops should check
    /// `ctx.is_cancelled()` and return `JobError::Cancelled`.
    fn execute(&self, ctx: &JobContext) -> Result<(), JobError>;
}
