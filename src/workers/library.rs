use super::{record, WorkerOutcome};
use crate::job_queue::{QueueHandler, QueuePayload};
use crate::library::{ArchiveSetReconciler, DirectoryScanner};
use crate::media_store::{Library, LibraryStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info, warn};

fn load_library(library_store: &dyn LibraryStore, payload: QueuePayload, queue: &str) -> Option<Library> {
    let QueuePayload::LibraryId(id) = payload else {
        warn!("{} queue got unexpected payload {:?}", queue, payload);
        return None;
    };
    match library_store.find_by_id(id) {
        Ok(Some(library)) => Some(library),
        Ok(None) => {
            warn!("{} requested for unknown library {}", queue, id);
            None
        }
        Err(e) => {
            error!("Failed to load library {}: {}", id, e);
            None
        }
    }
}

/// `is_updating` is cleared whatever the outcome of the update.
fn finish_update(library_store: &dyn LibraryStore, id: i64) {
    let result = library_store.find_by_id(id).and_then(|library| match library {
        Some(mut library) => {
            library.is_updating = false;
            library_store.save(&library)
        }
        None => Ok(()),
    });
    if let Err(e) = result {
        error!("Failed to clear updating flag of library {}: {}", id, e);
    }
}

/// Walks a library's path template and upserts the items it finds.
pub struct LibraryScanWorker {
    library_store: Arc<dyn LibraryStore>,
    scanner: Arc<DirectoryScanner>,
}

impl LibraryScanWorker {
    pub fn new(library_store: Arc<dyn LibraryStore>, scanner: DirectoryScanner) -> Self {
        Self {
            library_store,
            scanner: Arc::new(scanner),
        }
    }
}

#[async_trait]
impl QueueHandler for LibraryScanWorker {
    async fn handle(&self, payload: QueuePayload) {
        let Some(library) = load_library(self.library_store.as_ref(), payload, "Scan") else {
            record("library_scan", WorkerOutcome::Skipped);
            return;
        };
        let id = library.id;
        let name = library.name.clone();

        let scanner = Arc::clone(&self.scanner);
        let outcome = match tokio::task::spawn_blocking(move || scanner.scan(&library)).await {
            Ok(Ok(count)) => {
                info!("Scan of library {} found {} items", name, count);
                WorkerOutcome::Succeeded
            }
            Ok(Err(e)) => {
                error!("Scan of library {} failed: {:#}", name, e);
                WorkerOutcome::Failed
            }
            Err(e) => {
                error!("Scan of library {} panicked: {}", name, e);
                WorkerOutcome::Failed
            }
        };

        finish_update(self.library_store.as_ref(), id);
        record("library_scan", outcome);
    }
}

/// Refreshes archived status from the library bucket's listing.
pub struct LibrarySyncWorker {
    library_store: Arc<dyn LibraryStore>,
    reconciler: ArchiveSetReconciler,
}

impl LibrarySyncWorker {
    pub fn new(library_store: Arc<dyn LibraryStore>, reconciler: ArchiveSetReconciler) -> Self {
        Self {
            library_store,
            reconciler,
        }
    }
}

#[async_trait]
impl QueueHandler for LibrarySyncWorker {
    async fn handle(&self, payload: QueuePayload) {
        let Some(library) = load_library(self.library_store.as_ref(), payload, "Sync") else {
            record("library_sync", WorkerOutcome::Skipped);
            return;
        };

        let outcome = match self.reconciler.sync(&library).await {
            Ok(_) => WorkerOutcome::Succeeded,
            Err(e) => {
                error!("Sync of library {} failed: {:#}", library.name, e);
                WorkerOutcome::Failed
            }
        };

        finish_update(self.library_store.as_ref(), library.id);
        record("library_sync", outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media_store::{
        ArchivedStatus, MediaCategory, MediaItem, MediaStore, SqliteMediaStore, StorageClass,
    };
    use crate::object_store::memory::InMemoryObjectStore;
    use chrono::Utc;
    use std::fs;
    use tempfile::TempDir;

    fn updating_library(store: &SqliteMediaStore, path: &str) -> i64 {
        let mut library = Library::new("lib", path, MediaCategory::Other, StorageClass::Standard, "b");
        library.is_updating = true;
        LibraryStore::insert(store, &library).unwrap()
    }

    #[tokio::test]
    async fn test_scan_upserts_items_and_clears_updating() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("Movie A")).unwrap();
        fs::create_dir_all(dir.path().join("Movie B/extras")).unwrap();
        fs::write(dir.path().join("Movie A/a.mkv"), b"a").unwrap();

        let store = Arc::new(SqliteMediaStore::in_memory().unwrap());
        let id = updating_library(&store, &format!("{}/${{movie}}", dir.path().display()));
        let worker = LibraryScanWorker::new(store.clone(), DirectoryScanner::new(store.clone()));

        worker.handle(QueuePayload::LibraryId(id)).await;

        assert_eq!(store.find_by_library_id(id).unwrap().len(), 2);
        for leaf in ["Movie A/a.mkv", "Movie B/extras"] {
            let path = dir.path().join(leaf);
            assert!(store.find_by_path(path.to_str().unwrap()).unwrap().is_some());
        }
        let library = LibraryStore::find_by_id(store.as_ref(), id).unwrap().unwrap();
        assert!(!library.is_updating);
    }

    #[tokio::test]
    async fn test_sync_of_empty_bucket_clears_updating() {
        let store = Arc::new(SqliteMediaStore::in_memory().unwrap());
        let id = updating_library(&store, "/nowhere");
        let worker = LibrarySyncWorker::new(
            store.clone(),
            ArchiveSetReconciler::new(store.clone(), Arc::new(InMemoryObjectStore::new())),
        );

        worker.handle(QueuePayload::LibraryId(id)).await;

        let library = LibraryStore::find_by_id(store.as_ref(), id).unwrap().unwrap();
        assert!(!library.is_updating);
    }

    #[tokio::test]
    async fn test_sync_marks_listed_items_archived() {
        let store = Arc::new(SqliteMediaStore::in_memory().unwrap());
        let id = updating_library(&store, "/media");
        let item = MediaItem::new(id, "A", "/media/A", Utc::now() - chrono::Duration::days(1), 1);
        let item_id = MediaStore::insert(store.as_ref(), &item).unwrap();

        let objects = Arc::new(InMemoryObjectStore::new());
        objects.insert_object("b", "/media/A", vec![0], StorageClass::Standard, Utc::now());
        let worker = LibrarySyncWorker::new(
            store.clone(),
            ArchiveSetReconciler::new(store.clone(), objects),
        );

        worker.handle(QueuePayload::LibraryId(id)).await;

        let item = MediaStore::find_by_id(store.as_ref(), item_id).unwrap().unwrap();
        assert_eq!(item.archived_status, ArchivedStatus::Archived);
    }

    #[tokio::test]
    async fn test_unknown_library_is_dropped() {
        let store = Arc::new(SqliteMediaStore::in_memory().unwrap());
        let worker = LibraryScanWorker::new(store.clone(), DirectoryScanner::new(store.clone()));
        worker.handle(QueuePayload::LibraryId(42)).await;
        assert!(store.find_all().unwrap().is_empty());
    }
}
