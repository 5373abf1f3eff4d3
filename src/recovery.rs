//! Startup reconciliation of job state left behind by an unclean shutdown.
//!
//! Runs once, before any queue processor starts. Every pending message is
//! dropped and every flag that claims a job is running is rolled back, so
//! the operator sees idle items and can re-issue what they still want.

use crate::job_queue::JobQueue;
use crate::media_store::{DownloadOutcome, LibraryStore, MediaItem, MediaStore, NO_PROGRESS};
use anyhow::Result;
use std::sync::Arc;
use tracing::{error, info};

/// What a reconciliation pass touched.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    pub purged_messages: usize,
    pub archives_reset: usize,
    pub recoveries_reset: usize,
    pub libraries_reset: usize,
}

pub struct StartupReconciler {
    media_store: Arc<dyn MediaStore>,
    library_store: Arc<dyn LibraryStore>,
    job_queue: Arc<dyn JobQueue>,
}

impl StartupReconciler {
    pub fn new(
        media_store: Arc<dyn MediaStore>,
        library_store: Arc<dyn LibraryStore>,
        job_queue: Arc<dyn JobQueue>,
    ) -> Self {
        Self {
            media_store,
            library_store,
            job_queue,
        }
    }

    /// Purge the queues and reset interrupted jobs. Only loading the candidate
    /// sets can fail; individual items that fail to save are logged and
    /// skipped.
    pub fn run(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport {
            purged_messages: self.job_queue.purge()?,
            ..Default::default()
        };

        for mut item in self.media_store.find_by_is_archiving(true)? {
            item.reset_archive_flags();
            if self.save_item(&item) {
                report.archives_reset += 1;
            }
        }

        // Items still thawing in cold storage are left for the restore poller.
        for mut item in self
            .media_store
            .find_by_is_recovering(true)?
            .into_iter()
            .filter(|item| !item.is_restoring)
        {
            item.is_restored = false;
            item.is_recovering = false;
            item.is_restoring = false;
            item.download_progress = NO_PROGRESS;
            item.download_outcome = DownloadOutcome::NoResult;
            item.is_job_cancelled = false;
            if self.save_item(&item) {
                report.recoveries_reset += 1;
            }
        }

        for mut library in self.library_store.find_all()? {
            if !library.is_updating {
                continue;
            }
            library.is_updating = false;
            match self.library_store.save(&library) {
                Ok(()) => report.libraries_reset += 1,
                Err(e) => error!("Failed to reset library {}: {}", library.name, e),
            }
        }

        info!(
            "Startup recovery: purged {} queued messages, reset {} archives, {} recoveries, {} libraries",
            report.purged_messages,
            report.archives_reset,
            report.recoveries_reset,
            report.libraries_reset
        );
        Ok(report)
    }

    fn save_item(&self, item: &MediaItem) -> bool {
        match self.media_store.save(item) {
            Ok(()) => true,
            Err(e) => {
                error!("Failed to reset {}: {}", item.path, e);
                false
            }
        }
    }
}
