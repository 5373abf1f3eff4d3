//! End-to-end tests for archive and recovery jobs: operator actions enqueue
//! work, the queue workers move data through the in-memory object store.

mod common;

use common::{write_file, TestArchiver, BUCKET, RESTORE_DAYS};
use media_archiver::background_jobs::jobs::RestorePollerJob;
use media_archiver::background_jobs::BackgroundJob;
use media_archiver::job_queue::{JobQueue, QueueName, QueuePayload};
use media_archiver::media_store::{
    ArchivedStatus, DownloadOutcome, Library, LibraryStore, MediaCategory, MediaItem, StorageClass,
    NO_PROGRESS,
};
use media_archiver::object_store::RestoreTier;
use media_archiver::recovery::{RecoveryReport, StartupReconciler};
use media_archiver::ControlError;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where a recovered item's root lands below the download directory.
fn recovered_path(archiver: &TestArchiver, source: &Path) -> PathBuf {
    archiver
        .download_dir()
        .join(source.strip_prefix("/").unwrap())
}

fn movie_library(archiver: &TestArchiver, storage_class: StorageClass) -> (Library, PathBuf) {
    let movie = archiver.media_dir().join("movies/The Movie");
    write_file(&movie.join("movie.mkv"), 7, 1000);
    write_file(&movie.join("subs/en.srt"), 3, 40);
    let library = archiver.add_library("movies", "movies", MediaCategory::Other, storage_class);
    (library, movie)
}

async fn scanned_item(archiver: &TestArchiver, library: &Library, path: &Path) -> MediaItem {
    archiver.control.request_scan(library.id).unwrap();
    archiver.drain(QueueName::LibraryScan).await;
    archiver.item(path)
}

async fn archived_item(archiver: &TestArchiver, library: &Library, path: &Path) -> MediaItem {
    let item = scanned_item(archiver, library, path).await;
    archiver.control.request_archive(item.id).unwrap();
    archiver.drain(QueueName::Archive).await;
    archiver.item(path)
}

fn tar_entries(bytes: Vec<u8>) -> Vec<String> {
    let mut archive = tar::Archive::new(Cursor::new(bytes));
    archive
        .entries()
        .unwrap()
        .map(|entry| entry.unwrap().path().unwrap().to_string_lossy().into_owned())
        .collect()
}

#[tokio::test]
async fn test_archive_then_download_restores_files() {
    let archiver = TestArchiver::new();
    let (library, movie) = movie_library(&archiver, StorageClass::Standard);

    let item = archived_item(&archiver, &library, &movie).await;
    assert_eq!(item.archived_status, ArchivedStatus::Archived);
    assert!(item.date_archived.is_some());
    assert!(!item.is_archiving);
    assert_eq!(item.upload_progress, NO_PROGRESS);
    assert_eq!(
        archiver.objects.object_storage_class(BUCKET, &item.path),
        Some(StorageClass::Standard)
    );
    assert!(fs::read_dir(archiver.dir.path().join("tmp")).unwrap().next().is_none());

    assert_eq!(
        archiver.control.prepare_download(item.id).unwrap(),
        QueueName::Download
    );
    assert_eq!(archiver.drain(QueueName::Download).await, 1);

    let recovered = recovered_path(&archiver, &movie);
    assert_eq!(fs::read(recovered.join("movie.mkv")).unwrap(), vec![7; 1000]);
    assert_eq!(fs::read(recovered.join("subs/en.srt")).unwrap(), vec![3; 40]);

    let item = archiver.item(&movie);
    assert_eq!(item.download_outcome, DownloadOutcome::Succeeded);
    assert!(item.is_recovering);
    assert!(matches!(
        archiver.control.prepare_download(item.id),
        Err(ControlError::ItemBusy { .. })
    ));

    assert_eq!(archiver.control.clear_finished(&[item.id]).unwrap(), 1);
    let item = archiver.item(&movie);
    assert!(!item.is_recovering);
    assert_eq!(item.download_outcome, DownloadOutcome::NoResult);
}

#[tokio::test]
async fn test_tv_metadata_archive_leaves_out_seasons() {
    let archiver = TestArchiver::new();
    let show = archiver.media_dir().join("tv/Show");
    write_file(&show.join("poster.jpg"), 1, 10);
    write_file(&show.join("Season 1/e01.mkv"), 2, 10);
    write_file(&show.join("Specials/season 0 notes.txt"), 3, 10);
    let library = archiver.add_library("tv", "tv", MediaCategory::Tv, StorageClass::Standard);
    archiver.control.request_scan(library.id).unwrap();
    archiver.drain(QueueName::LibraryScan).await;

    assert_eq!(archiver.control.archive_library(library.id).unwrap(), 2);
    assert_eq!(archiver.drain(QueueName::Archive).await, 2);

    let metadata = archiver.item(&show.join("metadata"));
    let entries = tar_entries(archiver.objects.object_bytes(BUCKET, &metadata.path).unwrap());
    assert!(entries.iter().any(|e| e == "Show/poster.jpg"));
    assert!(entries.iter().any(|e| e == "Show/Specials/season 0 notes.txt"));
    assert!(!entries.iter().any(|e| e.contains("Season 1")));

    let season = archiver.item(&show.join("Season 1"));
    let entries = tar_entries(archiver.objects.object_bytes(BUCKET, &season.path).unwrap());
    assert!(entries.iter().any(|e| e == "Season 1/e01.mkv"));
}

#[tokio::test]
async fn test_archive_library_skips_archived_and_busy_items() {
    let archiver = TestArchiver::new();
    let movies = archiver.media_dir().join("movies");
    for name in ["A", "B", "C"] {
        write_file(&movies.join(name).join("movie.mkv"), 0, 10);
    }
    let library = archiver.add_library("movies", "movies", MediaCategory::Other, StorageClass::Standard);
    let a = archived_item(&archiver, &library, &movies.join("A")).await;
    assert_eq!(a.archived_status, ArchivedStatus::Archived);
    archiver
        .control
        .prepare_download(archiver.item(&movies.join("B")).id)
        .unwrap();

    assert_eq!(archiver.control.archive_library(library.id).unwrap(), 1);
    assert!(archiver.item(&movies.join("C")).is_archiving);
    assert!(!archiver.item(&movies.join("B")).is_archiving);
}

#[tokio::test]
async fn test_cancelled_archive_uploads_nothing() {
    let archiver = TestArchiver::new();
    let (library, movie) = movie_library(&archiver, StorageClass::Standard);
    let item = scanned_item(&archiver, &library, &movie).await;

    archiver.control.request_archive(item.id).unwrap();
    archiver.control.cancel_job(item.id).unwrap();
    assert!(matches!(
        archiver.control.cancel_job(item.id),
        Err(ControlError::NotCancellable { .. })
    ));
    archiver.drain(QueueName::Archive).await;

    assert!(archiver.objects.object_bytes(BUCKET, &item.path).is_none());
    let item = archiver.item(&movie);
    assert!(!item.is_archiving);
    assert!(!item.is_job_cancelled);
    assert_eq!(item.archived_status, ArchivedStatus::NotArchived);
}

#[tokio::test]
async fn test_cancelled_download_clears_recovery() {
    let archiver = TestArchiver::new();
    let (library, movie) = movie_library(&archiver, StorageClass::Standard);
    let item = archived_item(&archiver, &library, &movie).await;

    archiver.control.prepare_download(item.id).unwrap();
    assert_eq!(archiver.control.cancel_all_download_jobs().unwrap(), 1);
    archiver.drain(QueueName::Download).await;

    let item = archiver.item(&movie);
    assert!(!item.is_recovering);
    assert!(!item.is_job_cancelled);
    assert_eq!(item.download_outcome, DownloadOutcome::NoResult);
    assert!(!recovered_path(&archiver, &movie).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cold_storage_recovery_goes_through_restore() {
    let archiver = TestArchiver::new();
    let (library, movie) = movie_library(&archiver, StorageClass::Glacier);
    let item = archived_item(&archiver, &library, &movie).await;
    assert_eq!(
        archiver.objects.object_storage_class(BUCKET, &item.path),
        Some(StorageClass::Glacier)
    );

    assert_eq!(
        archiver.control.prepare_download(item.id).unwrap(),
        QueueName::Restore
    );
    archiver.drain(QueueName::Restore).await;

    let calls = archiver.objects.restore_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].tier, RestoreTier::Bulk);
    assert_eq!(calls[0].days, RESTORE_DAYS);
    assert!(archiver.item(&movie).is_restoring);
    assert_eq!(archiver.pending(QueueName::Download), 0);

    archiver.objects.complete_restore(BUCKET, &item.path);
    let ctx = archiver.job_context();
    tokio::task::spawn_blocking(move || {
        RestorePollerJob::new(Duration::from_secs(3600)).execute(&ctx)
    })
    .await
    .unwrap()
    .unwrap();

    let thawed = archiver.item(&movie);
    assert!(thawed.is_restored);
    assert!(!thawed.is_restoring);
    assert_eq!(archiver.drain(QueueName::Download).await, 1);

    let item = archiver.item(&movie);
    assert_eq!(item.download_outcome, DownloadOutcome::Succeeded);
    assert!(!item.is_restored);
    assert_eq!(
        fs::read(recovered_path(&archiver, &movie).join("movie.mkv")).unwrap(),
        vec![7; 1000]
    );
    assert_eq!(archiver.control.clear_all_finished().unwrap(), 1);
}

#[tokio::test]
async fn test_startup_reconciler_resets_interrupted_jobs() {
    let archiver = TestArchiver::new();
    let movies = archiver.media_dir().join("movies");
    for name in ["Archiving", "Recovering"] {
        write_file(&movies.join(name).join("movie.mkv"), 0, 10);
    }
    let library = archiver.add_library("movies", "movies", MediaCategory::Other, StorageClass::Standard);
    let recovering = archived_item(&archiver, &library, &movies.join("Recovering")).await;
    let archiving = archiver.item(&movies.join("Archiving"));

    archiver.control.request_archive(archiving.id).unwrap();
    archiver.control.prepare_download(recovering.id).unwrap();
    archiver
        .queue
        .enqueue(QueueName::LibraryScan, &QueuePayload::LibraryId(library.id))
        .unwrap();
    let mut updating = archiver.library(library.id);
    updating.is_updating = true;
    LibraryStore::save(archiver.store.as_ref(), &updating).unwrap();

    let report = StartupReconciler::new(
        archiver.store.clone(),
        archiver.store.clone(),
        archiver.queue.clone(),
    )
    .run()
    .unwrap();
    assert_eq!(
        report,
        RecoveryReport {
            purged_messages: 3,
            archives_reset: 1,
            recoveries_reset: 1,
            libraries_reset: 1,
        }
    );

    for queue in QueueName::ALL {
        assert_eq!(archiver.pending(queue), 0);
    }
    assert!(!archiver.item(&movies.join("Archiving")).has_active_job());
    assert!(!archiver.item(&movies.join("Recovering")).has_active_job());
    assert!(!archiver.library(library.id).is_updating);
}
