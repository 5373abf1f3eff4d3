use super::progress::{TransferDirection, TransferProgressTracker};
use super::{record, WorkerOutcome};
use crate::archive::{download_target, unpack_dir};
use crate::job_queue::{QueueHandler, QueuePayload};
use crate::media_store::{DownloadOutcome, LibraryStore, MediaStore};
use crate::object_store::{ObjectStore, TransferOutcome};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Downloads an item's archive into the download directory and unpacks it.
pub struct DownloadWorker {
    media_store: Arc<dyn MediaStore>,
    library_store: Arc<dyn LibraryStore>,
    object_store: Arc<dyn ObjectStore>,
    download_dir: PathBuf,
    progress_step: i32,
}

impl DownloadWorker {
    pub fn new(
        media_store: Arc<dyn MediaStore>,
        library_store: Arc<dyn LibraryStore>,
        object_store: Arc<dyn ObjectStore>,
        download_dir: PathBuf,
        progress_step: i32,
    ) -> Self {
        Self {
            media_store,
            library_store,
            object_store,
            download_dir,
            progress_step,
        }
    }

    fn mark_failed(&self, path: &str) -> Result<()> {
        let Some(mut item) = self.media_store.find_by_path(path)? else {
            return Ok(());
        };
        item.reset_download_flags();
        item.download_outcome = DownloadOutcome::Failed;
        self.media_store.save(&item)
    }

    async fn download(&self, path: &str) -> Result<WorkerOutcome> {
        let Some(mut item) = self.media_store.find_by_path(path)? else {
            warn!("Download requested for unknown item {}", path);
            return Ok(WorkerOutcome::Skipped);
        };
        if item.is_job_cancelled {
            info!("Download of {} cancelled before start", path);
            item.reset_download_flags();
            self.media_store.save(&item)?;
            self.media_store.update_is_recovering_by_id(item.id, false)?;
            return Ok(WorkerOutcome::Cancelled);
        }
        let library = self
            .library_store
            .find_by_id(item.library_id)?
            .ok_or_else(|| anyhow!("Library {} of {} not found", item.library_id, path))?;

        let dest = download_target(&self.download_dir, &item.path);
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {:?}", parent))?;
        }

        let tracker = Arc::new(TransferProgressTracker::new(
            Arc::clone(&self.media_store),
            &item,
            TransferDirection::Download,
            self.progress_step,
        ));
        let fetched = self
            .object_store
            .get(&library.bucket_name, &item.path, &dest, tracker.as_ref())
            .await;

        match fetched {
            Ok(TransferOutcome::Completed) => {
                let unpack_into = unpack_dir(&self.download_dir, &item.path);
                let tracker = Arc::clone(&tracker);
                let unpacked = tokio::task::spawn_blocking(move || {
                    tracker.complete_download(&dest, &unpack_into)
                })
                .await
                .context("Unpacking task panicked")?;
                match unpacked {
                    Ok(()) => Ok(WorkerOutcome::Succeeded),
                    Err(e) => {
                        error!("Unpacking {} failed: {:#}", path, e);
                        Ok(WorkerOutcome::Failed)
                    }
                }
            }
            Ok(TransferOutcome::Paused) => {
                tracker.acknowledge_download_pause(&dest)?;
                Ok(WorkerOutcome::Cancelled)
            }
            Err(e) => {
                error!("Download of {} from {} failed: {}", path, library.bucket_name, e);
                tracker.fail_download(&dest)?;
                Ok(WorkerOutcome::Failed)
            }
        }
    }
}

#[async_trait]
impl QueueHandler for DownloadWorker {
    async fn handle(&self, payload: QueuePayload) {
        let QueuePayload::MediaPath(path) = payload else {
            warn!("Download queue got unexpected payload {:?}", payload);
            return;
        };

        let outcome = match self.download(&path).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Download of {} failed: {:#}", path, e);
                if let Err(e) = self.mark_failed(&path) {
                    error!("Failed to record download failure of {}: {}", path, e);
                }
                WorkerOutcome::Failed
            }
        };
        record("download", outcome);
    }
}
