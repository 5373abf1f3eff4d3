//! Restore poller background job.
//!
//! Re-checks every item with a cold storage thaw in flight and hands the
//! finished ones to the download queue.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule},
};
use crate::job_queue::{QueueName, QueuePayload};
use crate::media_store::{DownloadOutcome, MediaItem, NO_PROGRESS};
use crate::object_store::RestoreState;
use anyhow::{anyhow, Result};
use std::time::Duration;
use tracing::{debug, error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PollResult {
    Cancelled,
    Thawed,
    Lost,
    StillRestoring,
}

pub struct RestorePollerJob {
    interval: Duration,
}

impl RestorePollerJob {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    fn poll_item(&self, ctx: &JobContext, mut item: MediaItem) -> Result<PollResult> {
        if item.is_job_cancelled {
            item.reset_download_flags();
            item.is_recovering = false;
            item.download_outcome = DownloadOutcome::NoResult;
            ctx.media_store.save(&item)?;
            info!("Restore of {} cancelled", item.path);
            return Ok(PollResult::Cancelled);
        }

        let library = ctx
            .library_store
            .find_by_id(item.library_id)?
            .ok_or_else(|| anyhow!("Library {} of {} not found", item.library_id, item.path))?;
        let head = ctx.block_on(
            ctx.object_store
                .head_metadata(&library.bucket_name, &item.path),
        )?;

        match head.restore_state() {
            RestoreState::Completed => {
                item.is_restoring = false;
                item.is_restored = true;
                ctx.media_store.save(&item)?;
                ctx.job_queue
                    .enqueue(QueueName::Download, &QueuePayload::MediaPath(item.path.clone()))?;
                info!("Restore of {} finished, download enqueued", item.path);
                Ok(PollResult::Thawed)
            }
            RestoreState::NotRequested => {
                item.is_restored = false;
                item.is_recovering = true;
                item.is_restoring = false;
                item.is_job_cancelled = false;
                item.download_outcome = DownloadOutcome::Failed;
                item.download_progress = NO_PROGRESS;
                ctx.media_store.save(&item)?;
                info!("No restore in progress for {}, marked as failed", item.path);
                Ok(PollResult::Lost)
            }
            RestoreState::InProgress => {
                debug!("Restore of {} still in progress", item.path);
                Ok(PollResult::StillRestoring)
            }
        }
    }
}

impl BackgroundJob for RestorePollerJob {
    fn id(&self) -> &'static str {
        "restore_poller"
    }

    fn name(&self) -> &'static str {
        "Restore Poller"
    }

    fn description(&self) -> &'static str {
        "Check in-flight cold storage restores and enqueue downloads for finished ones"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::StartupAndInterval(self.interval)
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let items = ctx
            .media_store
            .find_by_is_restoring(true)
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?;
        info!("Polling {} restoring items", items.len());

        let mut thawed = 0;
        let mut failures = 0;
        for item in items {
            if ctx.is_cancelled() {
                return Err(JobError::Cancelled);
            }
            let path = item.path.clone();
            match self.poll_item(ctx, item) {
                Ok(PollResult::Thawed) => thawed += 1,
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to poll restore of {}: {:#}", path, e);
                    failures += 1;
                }
            }
        }

        info!(
            "Restore poll done: {} ready for download, {} failures",
            thawed, failures
        );
        Ok(())
    }
}
