use super::context::JobContext;
use super::job::{BackgroundJob, JobError, ShutdownBehavior};
use crate::metrics;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Longest the scheduler sleeps before re-checking due jobs.
const MAX_SLEEP: Duration = Duration::from_secs(60);

const RUNNING_RECHECK: Duration = Duration::from_secs(1);

struct RunningJob {
    handle: JoinHandle<()>,
    cancel_token: CancellationToken,
}

/// Runs registered jobs on their interval.
///
/// Next-run times are kept in memory: a restart re-arms every schedule.
pub struct JobScheduler {
    jobs: HashMap<String, Arc<dyn BackgroundJob>>,

    /// When each registered job is next due.
    next_runs: HashMap<String, DateTime<Utc>>,

    running: HashMap<String, RunningJob>,

    /// Token to signal scheduler shutdown.
    shutdown_token: CancellationToken,

    /// Shared context provided to jobs during execution.
    job_context: JobContext,
}

impl JobScheduler {
    pub fn new(shutdown_token: CancellationToken, job_context: JobContext) -> Self {
        Self {
            jobs: HashMap::new(),
            next_runs: HashMap::new(),
            running: HashMap::new(),
            shutdown_token,
            job_context,
        }
    }

    /// Register a job with the scheduler.
    pub fn register_job(&mut self, job: Arc<dyn BackgroundJob>) {
        let job_id = job.id().to_string();
        info!("Registering job: {} - {}", job_id, job.description());

        let schedule = job.schedule();
        let first_run = if schedule.runs_at_startup() {
            Utc::now()
        } else {
            Utc::now() + chrono::Duration::from_std(schedule.interval()).unwrap_or_default()
        };
        self.next_runs.insert(job_id.clone(), first_run);
        self.jobs.insert(job_id, job);
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_job_running(&self, job_id: &str) -> bool {
        self.running
            .get(job_id)
            .map(|job| !job.handle.is_finished())
            .unwrap_or(false)
    }

    /// Main scheduler loop.
    pub async fn run(&mut self) {
        info!("Starting job scheduler with {} registered jobs", self.job_count());

        loop {
            self.cleanup_completed_jobs().await;

            let sleep_duration = self.time_until_next_scheduled_job();
            debug!(
                "Scheduler sleeping for {:?} until next scheduled job",
                sleep_duration
            );

            tokio::select! {
                _ = tokio::time::sleep(sleep_duration) => {
                    self.run_due_jobs();
                }
                _ = self.shutdown_token.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    self.shutdown().await;
                    break;
                }
            }
        }

        info!("Job scheduler stopped");
    }

    fn time_until_next_scheduled_job(&self) -> Duration {
        let now = Utc::now();
        self.next_runs
            .iter()
            .map(|(job_id, next_run)| {
                let remaining = (*next_run - now).to_std().unwrap_or(Duration::ZERO);
                if remaining.is_zero() && self.is_job_running(job_id) {
                    // Overdue but still running from the previous interval.
                    RUNNING_RECHECK
                } else {
                    remaining
                }
            })
            .min()
            .unwrap_or(MAX_SLEEP)
            .min(MAX_SLEEP)
    }

    fn run_due_jobs(&mut self) {
        let now = Utc::now();
        let due: Vec<String> = self
            .next_runs
            .iter()
            .filter(|(job_id, next_run)| **next_run <= now && !self.is_job_running(job_id))
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in due {
            self.spawn_job(&job_id);
        }
    }

    /// Spawn a job execution task.
    fn spawn_job(&mut self, job_id: &str) {
        let Some(job) = self.jobs.get(job_id).map(Arc::clone) else {
            error!("Attempted to spawn unknown job: {}", job_id);
            return;
        };

        // Re-arm before the run completes so a slow job is not started twice.
        let next_run =
            Utc::now() + chrono::Duration::from_std(job.schedule().interval()).unwrap_or_default();
        self.next_runs.insert(job_id.to_string(), next_run);

        info!("Starting job: {} (next run at {})", job_id, next_run);
        metrics::set_background_job_running(job_id, true);

        // Not a child of the shutdown token: shutdown cancels only Cancellable jobs.
        let cancel_token = CancellationToken::new();
        let ctx = self
            .job_context
            .with_cancellation_token(cancel_token.clone());
        let job_id_owned = job_id.to_string();

        let handle = tokio::spawn(async move {
            let start_time = Instant::now();
            let result = tokio::task::spawn_blocking(move || job.execute(&ctx)).await;
            let elapsed = start_time.elapsed();

            let status_label = match result {
                Ok(Ok(())) => {
                    info!("Job {} completed successfully in {:?}", job_id_owned, elapsed);
                    "success"
                }
                Ok(Err(JobError::Cancelled)) => {
                    info!("Job {} was cancelled after {:?}", job_id_owned, elapsed);
                    "cancelled"
                }
                Ok(Err(e)) => {
                    error!("Job {} failed after {:?}: {}", job_id_owned, elapsed, e);
                    "failed"
                }
                Err(e) => {
                    error!("Job {} panicked after {:?}: {}", job_id_owned, elapsed, e);
                    "panic"
                }
            };

            metrics::record_background_job_execution(&job_id_owned, status_label, elapsed);
            metrics::set_background_job_running(&job_id_owned, false);
        });

        self.running.insert(
            job_id.to_string(),
            RunningJob {
                handle,
                cancel_token,
            },
        );
    }

    /// Clean up handles for completed jobs.
    async fn cleanup_completed_jobs(&mut self) {
        let completed: Vec<String> = self
            .running
            .iter()
            .filter(|(_, job)| job.handle.is_finished())
            .map(|(job_id, _)| job_id.clone())
            .collect();

        for job_id in completed {
            if let Some(job) = self.running.remove(&job_id) {
                let _ = job.handle.await;
            }
        }
    }

    /// Gracefully shut down the scheduler.
    async fn shutdown(&mut self) {
        info!("Shutting down scheduler...");

        for (job_id, running) in &self.running {
            let behavior = self
                .jobs
                .get(job_id)
                .map(|job| job.shutdown_behavior())
                .unwrap_or_default();
            if behavior == ShutdownBehavior::Cancellable {
                debug!("Cancelling job: {}", job_id);
                running.cancel_token.cancel();
            } else {
                info!("Waiting for job {} to complete...", job_id);
            }
        }

        for (_, running) in self.running.drain() {
            let _ = tokio::time::timeout(Duration::from_secs(30), running.handle).await;
        }

        info!("Scheduler shutdown complete");
    }
}
