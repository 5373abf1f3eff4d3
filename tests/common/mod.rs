//! Common test infrastructure
//!
//! [`TestArchiver`] wires the SQLite stores, the durable queue and an
//! in-memory object store to every queue worker. Instead of running the
//! queue processors, tests drain a queue explicitly so each step of a job
//! can be asserted on.

#![allow(dead_code)]

use media_archiver::background_jobs::JobContext;
use media_archiver::job_queue::{JobQueue, QueueHandler, QueueName, SqliteJobQueue};
use media_archiver::library::{ArchiveSetReconciler, DirectoryScanner};
use media_archiver::media_store::{
    Library, LibraryStore, MediaCategory, MediaItem, MediaStore, SqliteMediaStore, StorageClass,
};
use media_archiver::object_store::memory::InMemoryObjectStore;
use media_archiver::object_store::RestoreTier;
use media_archiver::workers::{
    ArchiveWorker, DownloadWorker, LibraryScanWorker, LibrarySyncWorker, RestoreWorker,
};
use media_archiver::JobControl;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const BUCKET: &str = "media-archive";
pub const RESTORE_DAYS: i32 = 3;

pub struct TestArchiver {
    pub dir: TempDir,
    pub store: Arc<SqliteMediaStore>,
    pub queue: Arc<SqliteJobQueue>,
    pub objects: Arc<InMemoryObjectStore>,
    pub control: JobControl,
    handlers: Vec<(QueueName, Arc<dyn QueueHandler>)>,
}

impl TestArchiver {
    pub fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let temp_dir = dir.path().join("tmp");
        let download_dir = dir.path().join("downloads");
        fs::create_dir_all(&temp_dir).unwrap();
        fs::create_dir_all(dir.path().join("media")).unwrap();

        let store = Arc::new(SqliteMediaStore::new(dir.path().join("archive.db")).unwrap());
        let queue = Arc::new(SqliteJobQueue::new(store.connection()));
        let objects = Arc::new(InMemoryObjectStore::new().with_chunk_bytes(256));
        let control = JobControl::new(store.clone(), store.clone(), queue.clone());

        let handlers: Vec<(QueueName, Arc<dyn QueueHandler>)> = vec![
            (
                QueueName::Archive,
                Arc::new(ArchiveWorker::new(
                    store.clone(),
                    store.clone(),
                    objects.clone(),
                    temp_dir,
                    10,
                )),
            ),
            (
                QueueName::Download,
                Arc::new(DownloadWorker::new(
                    store.clone(),
                    store.clone(),
                    objects.clone(),
                    download_dir,
                    10,
                )),
            ),
            (
                QueueName::Restore,
                Arc::new(RestoreWorker::new(
                    store.clone(),
                    store.clone(),
                    objects.clone(),
                    queue.clone(),
                    RestoreTier::Bulk,
                    RESTORE_DAYS,
                )),
            ),
            (
                QueueName::LibraryScan,
                Arc::new(LibraryScanWorker::new(
                    store.clone(),
                    DirectoryScanner::new(store.clone()),
                )),
            ),
            (
                QueueName::LibrarySync,
                Arc::new(LibrarySyncWorker::new(
                    store.clone(),
                    ArchiveSetReconciler::new(store.clone(), objects.clone()),
                )),
            ),
        ];

        Self {
            dir,
            store,
            queue,
            objects,
            control,
            handlers,
        }
    }

    pub fn media_dir(&self) -> PathBuf {
        self.dir.path().join("media")
    }

    pub fn download_dir(&self) -> PathBuf {
        self.dir.path().join("downloads")
    }

    /// Create a library whose template is `template` below the media dir.
    pub fn add_library(
        &self,
        name: &str,
        template: &str,
        category: MediaCategory,
        storage_class: StorageClass,
    ) -> Library {
        let path = format!("{}/{}", self.media_dir().display(), template);
        let mut library = Library::new(name, path, category, storage_class, BUCKET);
        library.id = LibraryStore::insert(self.store.as_ref(), &library).unwrap();
        library
    }

    pub fn library(&self, id: i64) -> Library {
        LibraryStore::find_by_id(self.store.as_ref(), id)
            .unwrap()
            .unwrap()
    }

    pub fn item(&self, path: &Path) -> MediaItem {
        self.store
            .find_by_path(path.to_str().unwrap())
            .unwrap()
            .unwrap_or_else(|| panic!("no item at {:?}", path))
    }

    /// Run every pending message of `queue` through its worker. Returns the
    /// number of messages handled.
    pub async fn drain(&self, queue: QueueName) -> usize {
        let handler = self
            .handlers
            .iter()
            .find(|(name, _)| *name == queue)
            .map(|(_, handler)| handler.clone())
            .unwrap();
        let mut handled = 0;
        while let Some(message) = self.queue.claim_next(queue).unwrap() {
            handler.handle(message.decode_payload().unwrap()).await;
            self.queue.complete(message.id).unwrap();
            handled += 1;
        }
        handled
    }

    pub fn pending(&self, queue: QueueName) -> usize {
        self.queue.pending_count(queue).unwrap()
    }

    /// Job context for running background jobs. Must be called from within
    /// a tokio runtime.
    pub fn job_context(&self) -> JobContext {
        JobContext::new(
            CancellationToken::new(),
            self.store.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.objects.clone(),
        )
    }
}

/// Write `len` bytes of `fill` at `path`, creating parent directories.
pub fn write_file(path: &Path, fill: u8, len: usize) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, vec![fill; len]).unwrap();
}
