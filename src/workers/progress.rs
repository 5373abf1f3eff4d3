//! Progress sink shared by uploads and downloads.
//!
//! The tracker persists coarse-grained progress, turns an operator cancel into
//! a transfer pause, and applies the terminal state transitions once the
//! transfer is over.

use crate::archive::unpack_archive;
use crate::media_store::{ArchivedStatus, DownloadOutcome, MediaItem, MediaStore, NO_PROGRESS};
use crate::metrics;
use crate::object_store::{TransferListener, TransferSignal};
use anyhow::{anyhow, Result};
use chrono::Utc;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

impl TransferDirection {
    fn as_str(&self) -> &'static str {
        match self {
            TransferDirection::Upload => "upload",
            TransferDirection::Download => "download",
        }
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    last_persisted: i32,
    last_bytes: u64,
    paused: bool,
}

pub struct TransferProgressTracker {
    media_store: Arc<dyn MediaStore>,
    item_id: i64,
    item_path: String,
    direction: TransferDirection,
    progress_step: i32,
    state: Mutex<TrackerState>,
}

impl TransferProgressTracker {
    pub fn new(
        media_store: Arc<dyn MediaStore>,
        item: &MediaItem,
        direction: TransferDirection,
        progress_step: i32,
    ) -> Self {
        Self {
            media_store,
            item_id: item.id,
            item_path: item.path.clone(),
            direction,
            progress_step: progress_step.max(1),
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Whether a cancel was turned into a pause.
    pub fn was_paused(&self) -> bool {
        self.state.lock().unwrap().paused
    }

    fn persist_progress(&self, progress: i32) {
        let result = match self.direction {
            TransferDirection::Upload => {
                self.media_store.update_upload_progress_by_id(self.item_id, progress)
            }
            TransferDirection::Download => {
                self.media_store.update_download_progress_by_id(self.item_id, progress)
            }
        };
        if let Err(e) = result {
            warn!("Failed to persist progress of {}: {}", self.item_path, e);
        }
    }

    fn load_item(&self) -> Result<MediaItem> {
        self.media_store
            .find_by_id(self.item_id)?
            .ok_or_else(|| anyhow!("Media item {} disappeared", self.item_path))
    }

    /// Upload succeeded: the item is now archived.
    pub fn complete_upload(&self) -> Result<()> {
        let mut item = self.load_item()?;
        item.reset_archive_flags();
        item.archived_status = ArchivedStatus::Archived;
        item.date_archived = Some(Utc::now());
        self.media_store.save(&item)?;
        info!("Archived {}", item.path);
        Ok(())
    }

    /// Upload failed or was paused on cancel: back to idle, status unchanged.
    pub fn reset_upload(&self) -> Result<()> {
        let mut item = self.load_item()?;
        item.reset_archive_flags();
        self.media_store.save(&item)?;
        Ok(())
    }

    /// Download succeeded: unpack the archive next to where it was saved.
    ///
    /// An unpack failure is recorded as a failed download and returned.
    pub fn complete_download(&self, archive: &Path, unpack_into: &Path) -> Result<()> {
        let mut item = self.load_item()?;
        item.is_restoring = false;
        item.is_restored = false;
        self.media_store.save(&item)?;

        if let Err(e) = unpack_archive(archive, unpack_into) {
            self.fail_download(archive)?;
            return Err(e.into());
        }

        let mut item = self.load_item()?;
        item.download_outcome = DownloadOutcome::Succeeded;
        item.is_recovering = true;
        item.download_progress = NO_PROGRESS;
        item.is_job_cancelled = false;
        self.media_store.save(&item)?;
        info!("Recovered {} into {:?}", item.path, unpack_into);
        Ok(())
    }

    /// Download failed: record the failure, keep `is_recovering` for the
    /// operator to clear, and drop the partial archive.
    pub fn fail_download(&self, archive: &Path) -> Result<()> {
        let mut item = self.load_item()?;
        item.reset_download_flags();
        item.is_recovering = true;
        item.download_outcome = DownloadOutcome::Failed;
        self.media_store.save(&item)?;
        remove_partial(archive);
        Ok(())
    }

    /// Download paused on cancel. Same end state as a failure.
    pub fn acknowledge_download_pause(&self, archive: &Path) -> Result<()> {
        info!("Download of {} cancelled", self.item_path);
        self.fail_download(archive)
    }
}

fn remove_partial(archive: &Path) {
    match std::fs::remove_file(archive) {
        Ok(()) => debug!("Removed partial archive {:?}", archive),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove partial archive {:?}: {}", archive, e),
    }
}

impl TransferListener for TransferProgressTracker {
    fn transfer_initiated(&self) {
        self.persist_progress(0);
        let mut state = self.state.lock().unwrap();
        state.last_persisted = 0;
        debug!("{} of {} started", self.direction.as_str(), self.item_path);
    }

    fn bytes_transferred(&self, transferred: u64, total: u64) -> TransferSignal {
        let mut state = self.state.lock().unwrap();
        metrics::record_transfer_bytes(
            self.direction.as_str(),
            transferred.saturating_sub(state.last_bytes),
        );
        state.last_bytes = transferred;

        if state.paused {
            return TransferSignal::Pause;
        }

        match self.media_store.is_job_cancelled(self.item_id) {
            Ok(true) => {
                info!(
                    "Pausing {} of {}: job cancelled",
                    self.direction.as_str(),
                    self.item_path
                );
                state.paused = true;
                return TransferSignal::Pause;
            }
            Ok(false) => {}
            Err(e) => warn!("Failed to check cancellation of {}: {}", self.item_path, e),
        }

        let progress = if total == 0 {
            100
        } else {
            (transferred.saturating_mul(100) / total).min(100) as i32
        };
        if progress - state.last_persisted >= self.progress_step {
            state.last_persisted = progress;
            drop(state);
            self.persist_progress(progress);
        }
        TransferSignal::Continue
    }
}
