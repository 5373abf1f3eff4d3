//! Background job scheduling and execution system.
//!
//! Periodic maintenance that is not driven by queue messages: polling cold
//! storage restores and collecting stale multipart uploads.

mod context;
mod job;
pub mod jobs;
mod scheduler;

pub use context::JobContext;
pub use job::{BackgroundJob, JobError, JobSchedule, ShutdownBehavior};
pub use scheduler::JobScheduler;
