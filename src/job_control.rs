//! Operator actions: the only way jobs are started or cancelled.
//!
//! Each action checks the item's flags, flips the ones that claim the job and
//! enqueues the message. Workers read the flags back when they pick the
//! message up.

use crate::job_queue::{JobQueue, QueueName, QueuePayload};
use crate::media_store::{
    ArchivedStatus, DownloadOutcome, Library, LibraryStore, MediaItem, MediaStore, NO_PROGRESS,
};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("Media item {0} not found")]
    ItemNotFound(i64),

    #[error("Library {0} not found")]
    LibraryNotFound(i64),

    #[error("{path} already has a job in progress")]
    ItemBusy { path: String },

    #[error("{path} has an unacknowledged download result, clear it first")]
    UnclearedResult { path: String },

    #[error("{path} has no cancellable job")]
    NotCancellable { path: String },

    #[error("Library {name} is busy: {reason}")]
    LibraryBusy { name: String, reason: &'static str },

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

pub type ControlResult<T> = Result<T, ControlError>;

fn is_cancellable(item: &MediaItem) -> bool {
    let active = (item.is_recovering && item.download_outcome == DownloadOutcome::NoResult)
        || item.is_archiving;
    active && !item.is_job_cancelled
}

pub struct JobControl {
    media_store: Arc<dyn MediaStore>,
    library_store: Arc<dyn LibraryStore>,
    job_queue: Arc<dyn JobQueue>,
}

impl JobControl {
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

    fn item(&self, id: i64) -> ControlResult<MediaItem> {
        self.media_store
            .find_by_id(id)?
            .ok_or(ControlError::ItemNotFound(id))
    }

    fn library(&self, id: i64) -> ControlResult<Library> {
        self.library_store
            .find_by_id(id)?
            .ok_or(ControlError::LibraryNotFound(id))
    }

    fn enqueue_path(&self, queue: QueueName, item: &MediaItem) -> ControlResult<()> {
        self.job_queue
            .enqueue(queue, &QueuePayload::MediaPath(item.path.clone()))?;
        Ok(())
    }

    fn archive_item(&self, mut item: MediaItem) -> ControlResult<()> {
        if item.is_archiving || item.is_recovering {
            return Err(ControlError::ItemBusy { path: item.path });
        }
        item.is_archiving = true;
        item.upload_progress = NO_PROGRESS;
        item.is_tarring = false;
        self.media_store.save(&item)?;
        self.enqueue_path(QueueName::Archive, &item)?;
        info!("Archive of {} requested", item.path);
        Ok(())
    }

    /// Start archiving one item.
    pub fn request_archive(&self, id: i64) -> ControlResult<()> {
        let item = self.item(id)?;
        self.archive_item(item)
    }

    /// Archive every item of the library that is not archived or out of
    /// date. Busy items are skipped. Returns how many were enqueued.
    pub fn archive_library(&self, library_id: i64) -> ControlResult<usize> {
        let library = self.library(library_id)?;
        let candidates = self.media_store.find_by_library_id_and_archived_status_in(
            library.id,
            &[ArchivedStatus::NotArchived, ArchivedStatus::OutOfDate],
        )?;

        let mut enqueued = 0;
        for item in candidates {
            match self.archive_item(item) {
                Ok(()) => enqueued += 1,
                Err(ControlError::ItemBusy { path }) => debug!("Skipping busy item {}", path),
                Err(e) => return Err(e),
            }
        }
        info!("Enqueued {} archives for library {}", enqueued, library.name);
        Ok(enqueued)
    }

    /// Start recovering an item: a thaw first for cold storage classes, a
    /// plain download otherwise. Returns the queue the job went to.
    pub fn prepare_download(&self, id: i64) -> ControlResult<QueueName> {
        let mut item = self.item(id)?;
        if item.is_recovering || item.is_archiving {
            return Err(ControlError::ItemBusy { path: item.path });
        }
        if item.download_outcome.is_finished() {
            return Err(ControlError::UnclearedResult { path: item.path });
        }
        let library = self.library(item.library_id)?;

        item.is_recovering = true;
        self.media_store.save(&item)?;
        let queue = if library.storage_class.requires_restore() {
            QueueName::Restore
        } else {
            QueueName::Download
        };
        self.enqueue_path(queue, &item)?;
        info!("Recovery of {} requested via {} queue", item.path, queue);
        Ok(queue)
    }

    /// Flag the item's running job for cancellation. The worker acknowledges
    /// at its next checkpoint.
    pub fn cancel_job(&self, id: i64) -> ControlResult<()> {
        let mut item = self.item(id)?;
        if !is_cancellable(&item) {
            return Err(ControlError::NotCancellable { path: item.path });
        }
        item.is_job_cancelled = true;
        self.media_store.save(&item)?;
        info!("Cancellation of {} requested", item.path);
        Ok(())
    }

    fn cancel_all(&self, items: Vec<MediaItem>) -> ControlResult<usize> {
        let mut cancelled = 0;
        for mut item in items.into_iter().filter(is_cancellable) {
            item.is_job_cancelled = true;
            self.media_store.save(&item)?;
            cancelled += 1;
        }
        Ok(cancelled)
    }

    pub fn cancel_all_archive_jobs(&self) -> ControlResult<usize> {
        let cancelled = self.cancel_all(self.media_store.find_by_is_archiving(true)?)?;
        info!("Cancelled {} archive jobs", cancelled);
        Ok(cancelled)
    }

    pub fn cancel_all_download_jobs(&self) -> ControlResult<usize> {
        let cancelled = self.cancel_all(self.media_store.find_by_is_recovering(true)?)?;
        info!("Cancelled {} download jobs", cancelled);
        Ok(cancelled)
    }

    fn clear(&self, mut item: MediaItem) -> ControlResult<bool> {
        if !item.download_outcome.is_finished() {
            return Ok(false);
        }
        item.download_outcome = DownloadOutcome::NoResult;
        item.is_recovering = false;
        self.media_store.save(&item)?;
        Ok(true)
    }

    /// Acknowledge the download results of the given items. Items without a
    /// result are left alone. Returns how many were cleared.
    pub fn clear_finished(&self, ids: &[i64]) -> ControlResult<usize> {
        let mut cleared = 0;
        for id in ids {
            if self.clear(self.item(*id)?)? {
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    pub fn clear_all_finished(&self) -> ControlResult<usize> {
        let mut cleared = 0;
        for success in [true, false] {
            for item in self.media_store.find_by_download_success(success)? {
                if self.clear(item)? {
                    cleared += 1;
                }
            }
        }
        info!("Cleared {} finished downloads", cleared);
        Ok(cleared)
    }

    fn request_update(&self, library_id: i64, queue: QueueName) -> ControlResult<()> {
        let mut library = self.library(library_id)?;
        if library.is_updating {
            return Err(ControlError::LibraryBusy {
                name: library.name,
                reason: "an update is already running",
            });
        }
        let busy = self
            .media_store
            .find_by_library_id(library.id)?
            .iter()
            .any(MediaItem::has_active_job);
        if busy {
            return Err(ControlError::LibraryBusy {
                name: library.name,
                reason: "items have jobs in progress",
            });
        }

        library.is_updating = true;
        self.library_store.save(&library)?;
        self.job_queue
            .enqueue(queue, &QueuePayload::LibraryId(library.id))?;
        info!("{} of library {} requested", queue, library.name);
        Ok(())
    }

    /// Rescan the library's directory tree.
    pub fn request_scan(&self, library_id: i64) -> ControlResult<()> {
        self.request_update(library_id, QueueName::LibraryScan)
    }

    /// Refresh archived status from the library's bucket.
    pub fn request_sync(&self, library_id: i64) -> ControlResult<()> {
        self.request_update(library_id, QueueName::LibrarySync)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_queue::SqliteJobQueue;
    use crate::media_store::{MediaCategory, SqliteMediaStore, StorageClass};
    use chrono::Utc;

    struct Fixture {
        store: Arc<SqliteMediaStore>,
        queue: Arc<SqliteJobQueue>,
        control: JobControl,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(SqliteMediaStore::in_memory().unwrap());
        let queue = Arc::new(SqliteJobQueue::new(store.connection()));
        let control = JobControl::new(store.clone(), store.clone(), queue.clone());
        Fixture {
            store,
            queue,
            control,
        }
    }

    fn library(fixture: &Fixture, class: StorageClass) -> i64 {
        let library = Library::new("lib", "/lib", MediaCategory::Other, class, "b");
        LibraryStore::insert(fixture.store.as_ref(), &library).unwrap()
    }

    fn item(fixture: &Fixture, library_id: i64, path: &str) -> i64 {
        let item = MediaItem::new(library_id, path, path, Utc::now(), 1);
        MediaStore::insert(fixture.store.as_ref(), &item).unwrap()
    }

    fn reload(fixture: &Fixture, id: i64) -> MediaItem {
        MediaStore::find_by_id(fixture.store.as_ref(), id).unwrap().unwrap()
    }

    #[test]
    fn test_request_archive_rejects_busy_item() {
        let fixture = fixture();
        let library_id = library(&fixture, StorageClass::Standard);
        let id = item(&fixture, library_id, "/lib/a");

        fixture.control.request_archive(id).unwrap();
        assert!(reload(&fixture, id).is_archiving);
        assert_eq!(fixture.queue.pending_count(QueueName::Archive).unwrap(), 1);

        assert!(matches!(
            fixture.control.request_archive(id),
            Err(ControlError::ItemBusy { .. })
        ));
        assert_eq!(fixture.queue.pending_count(QueueName::Archive).unwrap(), 1);
    }

    #[test]
    fn test_archive_library_skips_archived_items() {
        let fixture = fixture();
        let library_id = library(&fixture, StorageClass::Standard);
        item(&fixture, library_id, "/lib/a");
        item(&fixture, library_id, "/lib/b");
        let archived = item(&fixture, library_id, "/lib/c");
        let mut done = reload(&fixture, archived);
        done.archived_status = ArchivedStatus::Archived;
        MediaStore::save(fixture.store.as_ref(), &done).unwrap();

        assert_eq!(fixture.control.archive_library(library_id).unwrap(), 2);
        assert_eq!(fixture.queue.pending_count(QueueName::Archive).unwrap(), 2);
    }

    #[test]
    fn test_prepare_download_routes_by_storage_class() {
        let fixture = fixture();
        let warm = library(&fixture, StorageClass::Standard);
        let cold = {
            let library = Library::new("cold", "/cold", MediaCategory::Other, StorageClass::DeepArchive, "c");
            LibraryStore::insert(fixture.store.as_ref(), &library).unwrap()
        };
        let a = item(&fixture, warm, "/lib/a");
        let b = item(&fixture, cold, "/cold/b");

        assert_eq!(fixture.control.prepare_download(a).unwrap(), QueueName::Download);
        assert_eq!(fixture.control.prepare_download(b).unwrap(), QueueName::Restore);
        assert!(reload(&fixture, a).is_recovering);
        assert!(reload(&fixture, b).is_recovering);
    }

    #[test]
    fn test_prepare_download_requires_cleared_result() {
        let fixture = fixture();
        let library_id = library(&fixture, StorageClass::Standard);
        let id = item(&fixture, library_id, "/lib/a");
        let mut finished = reload(&fixture, id);
        finished.download_outcome = DownloadOutcome::Failed;
        MediaStore::save(fixture.store.as_ref(), &finished).unwrap();

        assert!(matches!(
            fixture.control.prepare_download(id),
            Err(ControlError::UnclearedResult { .. })
        ));
        assert_eq!(fixture.control.clear_finished(&[id]).unwrap(), 1);
        fixture.control.prepare_download(id).unwrap();
    }

    #[test]
    fn test_cancel_only_active_jobs_once() {
        let fixture = fixture();
        let library_id = library(&fixture, StorageClass::Standard);
        let idle = item(&fixture, library_id, "/lib/a");
        let busy = item(&fixture, library_id, "/lib/b");
        fixture.control.request_archive(busy).unwrap();

        assert!(matches!(
            fixture.control.cancel_job(idle),
            Err(ControlError::NotCancellable { .. })
        ));
        fixture.control.cancel_job(busy).unwrap();
        assert!(reload(&fixture, busy).is_job_cancelled);
        assert!(fixture.control.cancel_job(busy).is_err());
        assert_eq!(fixture.control.cancel_all_archive_jobs().unwrap(), 0);
    }

    #[test]
    fn test_finished_download_is_not_cancellable() {
        let fixture = fixture();
        let library_id = library(&fixture, StorageClass::Standard);
        let id = item(&fixture, library_id, "/lib/a");
        let mut done = reload(&fixture, id);
        done.is_recovering = true;
        done.download_outcome = DownloadOutcome::Succeeded;
        MediaStore::save(fixture.store.as_ref(), &done).unwrap();

        assert_eq!(fixture.control.cancel_all_download_jobs().unwrap(), 0);
        assert_eq!(fixture.control.clear_all_finished().unwrap(), 1);
        let cleared = reload(&fixture, id);
        assert!(!cleared.is_recovering);
        assert_eq!(cleared.download_outcome, DownloadOutcome::NoResult);
    }

    #[test]
    fn test_scan_rejected_while_items_are_busy() {
        let fixture = fixture();
        let library_id = library(&fixture, StorageClass::Standard);
        let id = item(&fixture, library_id, "/lib/a");
        fixture.control.request_archive(id).unwrap();

        assert!(matches!(
            fixture.control.request_scan(library_id),
            Err(ControlError::LibraryBusy { .. })
        ));
    }

    #[test]
    fn test_scan_then_sync_rejected_while_updating() {
        let fixture = fixture();
        let library_id = library(&fixture, StorageClass::Standard);

        fixture.control.request_scan(library_id).unwrap();
        assert_eq!(fixture.queue.pending_count(QueueName::LibraryScan).unwrap(), 1);
        assert!(matches!(
            fixture.control.request_sync(library_id),
            Err(ControlError::LibraryBusy { .. })
        ));
        assert!(matches!(
            fixture.control.request_scan(999),
            Err(ControlError::LibraryNotFound(999))
        ));
    }
}
