use super::{record, WorkerOutcome};
use crate::job_queue::{JobQueue, QueueHandler, QueueName, QueuePayload};
use crate::media_store::{LibraryStore, MediaItem, MediaStore, NO_PROGRESS};
use crate::object_store::{ObjectStore, RestoreState, RestoreTier};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Requests a thaw of a cold-storage archive, or hands an already thawed one
/// straight to the download queue.
pub struct RestoreWorker {
    media_store: Arc<dyn MediaStore>,
    library_store: Arc<dyn LibraryStore>,
    object_store: Arc<dyn ObjectStore>,
    job_queue: Arc<dyn JobQueue>,
    tier: RestoreTier,
    retention_days: i32,
}

fn clear_recovery(item: &mut MediaItem) {
    item.is_restored = false;
    item.is_recovering = false;
    item.is_restoring = false;
    item.is_job_cancelled = false;
    item.download_progress = NO_PROGRESS;
}

impl RestoreWorker {
    pub fn new(
        media_store: Arc<dyn MediaStore>,
        library_store: Arc<dyn LibraryStore>,
        object_store: Arc<dyn ObjectStore>,
        job_queue: Arc<dyn JobQueue>,
        tier: RestoreTier,
        retention_days: i32,
    ) -> Self {
        Self {
            media_store,
            library_store,
            object_store,
            job_queue,
            tier,
            retention_days,
        }
    }

    fn clear_by_path(&self, path: &str) -> Result<()> {
        if let Some(mut item) = self.media_store.find_by_path(path)? {
            clear_recovery(&mut item);
            self.media_store.save(&item)?;
        }
        Ok(())
    }

    async fn restore(&self, path: &str) -> Result<WorkerOutcome> {
        let Some(mut item) = self.media_store.find_by_path(path)? else {
            warn!("Restore requested for unknown item {}", path);
            return Ok(WorkerOutcome::Skipped);
        };
        if item.is_job_cancelled {
            info!("Restore of {} cancelled before start", path);
            clear_recovery(&mut item);
            self.media_store.save(&item)?;
            return Ok(WorkerOutcome::Cancelled);
        }
        let library = self
            .library_store
            .find_by_id(item.library_id)?
            .ok_or_else(|| anyhow!("Library {} of {} not found", item.library_id, path))?;

        let head = self
            .object_store
            .head_metadata(&library.bucket_name, &item.path)
            .await?;
        match head.restore_state() {
            RestoreState::Completed => {
                self.job_queue
                    .enqueue(QueueName::Download, &QueuePayload::MediaPath(item.path.clone()))?;
                info!("{} is already thawed, download enqueued", path);
            }
            RestoreState::NotRequested => {
                self.object_store
                    .initiate_restore(
                        &library.bucket_name,
                        &item.path,
                        self.tier,
                        self.retention_days,
                    )
                    .await?;
                self.media_store.update_is_restoring_by_id(item.id, true)?;
                info!(
                    "Requested {:?} restore of {} for {} days",
                    self.tier, path, self.retention_days
                );
            }
            RestoreState::InProgress => {
                self.media_store.update_is_restoring_by_id(item.id, true)?;
                debug!("Restore of {} already in progress", path);
            }
        }
        Ok(WorkerOutcome::Succeeded)
    }
}

#[async_trait]
impl QueueHandler for RestoreWorker {
    async fn handle(&self, payload: QueuePayload) {
        let QueuePayload::MediaPath(path) = payload else {
            warn!("Restore queue got unexpected payload {:?}", payload);
            return;
        };

        let outcome = match self.restore(&path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Restore of {} failed: {:#}", path, e);
                if let Err(e) = self.clear_by_path(&path) {
                    error!("Failed to reset restore state of {}: {}", path, e);
                }
                WorkerOutcome::Failed
            }
        };
        record("restore", outcome);
    }
}
