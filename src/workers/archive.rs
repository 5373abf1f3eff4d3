use super::progress::{TransferDirection, TransferProgressTracker};
use super::{record, WorkerOutcome};
use crate::archive::pack_item;
use crate::job_queue::{QueueHandler, QueuePayload};
use crate::media_store::{LibraryStore, MediaItem, MediaStore};
use crate::object_store::{ObjectStore, TransferOutcome};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Packs an item into a temporary tar and uploads it to the library bucket.
pub struct ArchiveWorker {
    media_store: Arc<dyn MediaStore>,
    library_store: Arc<dyn LibraryStore>,
    object_store: Arc<dyn ObjectStore>,
    temp_dir: PathBuf,
    progress_step: i32,
}

impl ArchiveWorker {
    pub fn new(
        media_store: Arc<dyn MediaStore>,
        library_store: Arc<dyn LibraryStore>,
        object_store: Arc<dyn ObjectStore>,
        temp_dir: PathBuf,
        progress_step: i32,
    ) -> Self {
        Self {
            media_store,
            library_store,
            object_store,
            temp_dir,
            progress_step,
        }
    }

    fn reset(&self, mut item: MediaItem) -> Result<()> {
        item.reset_archive_flags();
        self.media_store.save(&item)
    }

    fn reset_by_path(&self, path: &str) {
        match self.media_store.find_by_path(path) {
            Ok(Some(item)) => {
                if let Err(e) = self.reset(item) {
                    error!("Failed to reset archive flags of {}: {}", path, e);
                }
            }
            Ok(None) => {}
            Err(e) => error!("Failed to reload {} after archive failure: {}", path, e),
        }
    }

    async fn archive(&self, path: &str) -> Result<WorkerOutcome> {
        let Some(item) = self.media_store.find_by_path(path)? else {
            warn!("Archive requested for unknown item {}", path);
            return Ok(WorkerOutcome::Skipped);
        };
        if item.is_job_cancelled {
            info!("Archive of {} cancelled before start", path);
            self.reset(item)?;
            return Ok(WorkerOutcome::Cancelled);
        }
        let library = self
            .library_store
            .find_by_id(item.library_id)?
            .ok_or_else(|| anyhow!("Library {} of {} not found", item.library_id, path))?;

        let archive_file = tempfile::Builder::new()
            .prefix("archive-")
            .suffix(".tar")
            .tempfile_in(&self.temp_dir)
            .with_context(|| format!("Failed to create temp file in {:?}", self.temp_dir))?;

        self.media_store.update_is_tarring_by_id(item.id, true)?;
        let packed = {
            let item_path = item.path.clone();
            let is_tv = library.is_tv();
            let dest = archive_file.path().to_path_buf();
            tokio::task::spawn_blocking(move || pack_item(&item_path, is_tv, &dest)).await
        };
        self.media_store.update_is_tarring_by_id(item.id, false)?;
        packed.context("Packing task panicked")??;
        info!("Packed {} into {:?}", path, archive_file.path());

        if self.media_store.is_job_cancelled(item.id)? {
            info!("Archive of {} cancelled after packing", path);
            let item = self
                .media_store
                .find_by_id(item.id)?
                .ok_or_else(|| anyhow!("Media item {} disappeared", path))?;
            self.reset(item)?;
            return Ok(WorkerOutcome::Cancelled);
        }

        let tracker = TransferProgressTracker::new(
            Arc::clone(&self.media_store),
            &item,
            TransferDirection::Upload,
            self.progress_step,
        );
        let uploaded = self
            .object_store
            .put(
                &library.bucket_name,
                &item.path,
                library.storage_class,
                archive_file.path(),
                &tracker,
            )
            .await;

        if let Err(e) = archive_file.close() {
            warn!("Failed to remove temporary archive of {}: {}", path, e);
        }

        match uploaded {
            Ok(TransferOutcome::Completed) => {
                tracker.complete_upload()?;
                Ok(WorkerOutcome::Succeeded)
            }
            Ok(TransferOutcome::Paused) => {
                info!("Upload of {} cancelled", path);
                tracker.reset_upload()?;
                Ok(WorkerOutcome::Cancelled)
            }
            Err(e) => {
                error!("Upload of {} to {} failed: {}", path, library.bucket_name, e);
                tracker.reset_upload()?;
                Ok(WorkerOutcome::Failed)
            }
        }
    }
}

#[async_trait]
impl QueueHandler for ArchiveWorker {
    async fn handle(&self, payload: QueuePayload) {
        let QueuePayload::MediaPath(path) = payload else {
            warn!("Archive queue got unexpected payload {:?}", payload);
            return;
        };

        let outcome = match self.archive(&path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Archive of {} failed: {:#}", path, e);
                self.reset_by_path(&path);
                WorkerOutcome::Failed
            }
        };
        record("archive", outcome);
    }
}
