//! Media item and library storage.
//!
//! Provides SQLite-backed storage for libraries and the media items they own.

use super::models::*;
use super::schema::ARCHIVE_DB_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::open_versioned_db;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Storage operations on media items.
///
/// Workers never hold an item across calls: each transition is a
/// read-modify-write through `find_*` and `save`, or one of the narrow
/// single-column updates.
pub trait MediaStore: Send + Sync {
    // === Lookups ===

    fn find_by_path(&self, path: &str) -> Result<Option<MediaItem>>;

    fn find_by_id(&self, id: i64) -> Result<Option<MediaItem>>;

    fn find_by_library_id(&self, library_id: i64) -> Result<Vec<MediaItem>>;

    fn find_by_library_id_and_archived_status_in(
        &self,
        library_id: i64,
        statuses: &[ArchivedStatus],
    ) -> Result<Vec<MediaItem>>;

    fn find_by_is_archiving(&self, is_archiving: bool) -> Result<Vec<MediaItem>>;

    fn find_by_is_recovering(&self, is_recovering: bool) -> Result<Vec<MediaItem>>;

    fn find_by_is_restoring(&self, is_restoring: bool) -> Result<Vec<MediaItem>>;

    /// Items whose last download finished with the given outcome.
    fn find_by_download_success(&self, success: bool) -> Result<Vec<MediaItem>>;

    /// Reads only the cancellation flag. Errors if the item no longer exists.
    fn is_job_cancelled(&self, id: i64) -> Result<bool>;

    // === Writes ===

    /// Insert a new item and return its id.
    fn insert(&self, item: &MediaItem) -> Result<i64>;

    /// Overwrite every column of an existing item.
    fn save(&self, item: &MediaItem) -> Result<()>;

    fn update_upload_progress_by_id(&self, id: i64, progress: i32) -> Result<()>;

    fn update_download_progress_by_id(&self, id: i64, progress: i32) -> Result<()>;

    fn update_is_tarring_by_id(&self, id: i64, is_tarring: bool) -> Result<()>;

    fn update_is_restoring_by_id(&self, id: i64, is_restoring: bool) -> Result<()>;

    fn update_is_restored_by_id(&self, id: i64, is_restored: bool) -> Result<()>;

    fn update_is_recovering_by_id(&self, id: i64, is_recovering: bool) -> Result<()>;
}

/// Storage operations on libraries.
pub trait LibraryStore: Send + Sync {
    fn find_by_id(&self, id: i64) -> Result<Option<Library>>;

    fn find_by_name(&self, name: &str) -> Result<Option<Library>>;

    fn find_all(&self) -> Result<Vec<Library>>;

    /// Insert a new library and return its id.
    fn insert(&self, library: &Library) -> Result<i64>;

    fn save(&self, library: &Library) -> Result<()>;
}

/// SQLite-backed store for libraries and media items.
pub struct SqliteMediaStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteMediaStore {
    /// Opens an existing archive database or creates a new one with the
    /// current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_versioned_db(db_path.as_ref(), ARCHIVE_DB_VERSIONED_SCHEMAS, "archive")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        ARCHIVE_DB_VERSIONED_SCHEMAS[ARCHIVE_DB_VERSIONED_SCHEMAS.len() - 1].create(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Shared connection, used by the job queue living in the same database.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        Arc::clone(&self.conn)
    }

    fn row_to_media_item(row: &rusqlite::Row) -> rusqlite::Result<MediaItem> {
        Ok(MediaItem {
            id: row.get("id")?,
            library_id: row.get("library_id")?,
            name: row.get("name")?,
            path: row.get("path")?,
            archived_status: ArchivedStatus::from_db_str(&row.get::<_, String>("archived_status")?)
                .unwrap_or(ArchivedStatus::NotArchived),
            date_archived: row
                .get::<_, Option<i64>>("date_archived")?
                .map(from_millis),
            date_last_modified: from_millis(row.get("date_last_modified")?),
            size: row.get::<_, i64>("size")?.max(0) as u64,
            is_archiving: row.get("is_archiving")?,
            is_tarring: row.get("is_tarring")?,
            upload_progress: row.get("upload_progress")?,
            is_recovering: row.get("is_recovering")?,
            is_restoring: row.get("is_restoring")?,
            is_restored: row.get("is_restored")?,
            download_progress: row.get("download_progress")?,
            download_outcome: DownloadOutcome::from_db_str(
                row.get::<_, Option<String>>("download_outcome")?.as_deref(),
            ),
            is_job_cancelled: row.get("is_job_cancelled")?,
        })
    }

    fn row_to_library(row: &rusqlite::Row) -> rusqlite::Result<Library> {
        Ok(Library {
            id: row.get("id")?,
            name: row.get("name")?,
            path: row.get("path")?,
            category: MediaCategory::from_db_str(&row.get::<_, String>("category")?)
                .unwrap_or(MediaCategory::Other),
            storage_class: StorageClass::from_db_str(&row.get::<_, String>("storage_class")?)
                .unwrap_or(StorageClass::Standard),
            bucket_name: row.get("bucket_name")?,
            is_updating: row.get("is_updating")?,
        })
    }

    fn query_items<P: rusqlite::Params>(&self, sql: &str, params: P) -> Result<Vec<MediaItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(sql)?;
        let items = stmt
            .query_map(params, Self::row_to_media_item)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(items)
    }

    fn update_column(&self, id: i64, column: &str, value: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            &format!("UPDATE media_items SET {} = ?1 WHERE id = ?2", column),
            params![value, id],
        )?;
        if updated == 0 {
            bail!("Media item {} not found", id);
        }
        Ok(())
    }
}

pub(crate) fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

impl MediaStore for SqliteMediaStore {
    fn find_by_path(&self, path: &str) -> Result<Option<MediaItem>> {
        let conn = self.conn.lock().unwrap();
        let item = conn
            .query_row(
                "SELECT * FROM media_items WHERE path = ?1",
                [path],
                Self::row_to_media_item,
            )
            .optional()?;
        Ok(item)
    }

    fn find_by_id(&self, id: i64) -> Result<Option<MediaItem>> {
        let conn = self.conn.lock().unwrap();
        let item = conn
            .query_row(
                "SELECT * FROM media_items WHERE id = ?1",
                [id],
                Self::row_to_media_item,
            )
            .optional()?;
        Ok(item)
    }

    fn find_by_library_id(&self, library_id: i64) -> Result<Vec<MediaItem>> {
        self.query_items(
            "SELECT * FROM media_items WHERE library_id = ?1 ORDER BY path",
            [library_id],
        )
    }

    fn find_by_library_id_and_archived_status_in(
        &self,
        library_id: i64,
        statuses: &[ArchivedStatus],
    ) -> Result<Vec<MediaItem>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = (0..statuses.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT * FROM media_items WHERE library_id = ?1 AND archived_status IN ({}) ORDER BY path",
            placeholders
        );
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(library_id)];
        for status in statuses {
            values.push(Box::new(status.as_db_str()));
        }
        self.query_items(&sql, rusqlite::params_from_iter(values.iter()))
    }

    fn find_by_is_archiving(&self, is_archiving: bool) -> Result<Vec<MediaItem>> {
        self.query_items(
            "SELECT * FROM media_items WHERE is_archiving = ?1 ORDER BY id",
            [is_archiving],
        )
    }

    fn find_by_is_recovering(&self, is_recovering: bool) -> Result<Vec<MediaItem>> {
        self.query_items(
            "SELECT * FROM media_items WHERE is_recovering = ?1 ORDER BY id",
            [is_recovering],
        )
    }

    fn find_by_is_restoring(&self, is_restoring: bool) -> Result<Vec<MediaItem>> {
        self.query_items(
            "SELECT * FROM media_items WHERE is_restoring = ?1 ORDER BY id",
            [is_restoring],
        )
    }

    fn find_by_download_success(&self, success: bool) -> Result<Vec<MediaItem>> {
        let outcome = DownloadOutcome::from_success(success);
        self.query_items(
            "SELECT * FROM media_items WHERE download_outcome = ?1 ORDER BY id",
            [outcome.as_db_str()],
        )
    }

    fn is_job_cancelled(&self, id: i64) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let cancelled: Option<bool> = conn
            .query_row(
                "SELECT is_job_cancelled FROM media_items WHERE id = ?1",
                [id],
                |row| row.get(0),
            )
            .optional()?;
        match cancelled {
            Some(cancelled) => Ok(cancelled),
            None => bail!("Media item {} not found", id),
        }
    }

    fn insert(&self, item: &MediaItem) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO media_items (
                library_id, name, path, archived_status, date_archived, date_last_modified,
                size, is_archiving, is_tarring, upload_progress, is_recovering, is_restoring,
                is_restored, download_progress, download_outcome, is_job_cancelled
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"#,
            params![
                item.library_id,
                item.name,
                item.path,
                item.archived_status.as_db_str(),
                item.date_archived.map(to_millis),
                to_millis(item.date_last_modified),
                item.size as i64,
                item.is_archiving,
                item.is_tarring,
                item.upload_progress,
                item.is_recovering,
                item.is_restoring,
                item.is_restored,
                item.download_progress,
                item.download_outcome.as_db_str(),
                item.is_job_cancelled,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn save(&self, item: &MediaItem) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE media_items SET
                library_id = ?2, name = ?3, path = ?4, archived_status = ?5,
                date_archived = ?6, date_last_modified = ?7, size = ?8,
                is_archiving = ?9, is_tarring = ?10, upload_progress = ?11,
                is_recovering = ?12, is_restoring = ?13, is_restored = ?14,
                download_progress = ?15, download_outcome = ?16, is_job_cancelled = ?17
            WHERE id = ?1"#,
            params![
                item.id,
                item.library_id,
                item.name,
                item.path,
                item.archived_status.as_db_str(),
                item.date_archived.map(to_millis),
                to_millis(item.date_last_modified),
                item.size as i64,
                item.is_archiving,
                item.is_tarring,
                item.upload_progress,
                item.is_recovering,
                item.is_restoring,
                item.is_restored,
                item.download_progress,
                item.download_outcome.as_db_str(),
                item.is_job_cancelled,
            ],
        )?;
        if updated == 0 {
            bail!("Media item {} ({}) not found", item.id, item.path);
        }
        Ok(())
    }

    fn update_upload_progress_by_id(&self, id: i64, progress: i32) -> Result<()> {
        self.update_column(id, "upload_progress", progress as i64)
    }

    fn update_download_progress_by_id(&self, id: i64, progress: i32) -> Result<()> {
        self.update_column(id, "download_progress", progress as i64)
    }

    fn update_is_tarring_by_id(&self, id: i64, is_tarring: bool) -> Result<()> {
        self.update_column(id, "is_tarring", is_tarring as i64)
    }

    fn update_is_restoring_by_id(&self, id: i64, is_restoring: bool) -> Result<()> {
        self.update_column(id, "is_restoring", is_restoring as i64)
    }

    fn update_is_restored_by_id(&self, id: i64, is_restored: bool) -> Result<()> {
        self.update_column(id, "is_restored", is_restored as i64)
    }

    fn update_is_recovering_by_id(&self, id: i64, is_recovering: bool) -> Result<()> {
        self.update_column(id, "is_recovering", is_recovering as i64)
    }
}

impl LibraryStore for SqliteMediaStore {
    fn find_by_id(&self, id: i64) -> Result<Option<Library>> {
        let conn = self.conn.lock().unwrap();
        let library = conn
            .query_row(
                "SELECT * FROM libraries WHERE id = ?1",
                [id],
                Self::row_to_library,
            )
            .optional()?;
        Ok(library)
    }

    fn find_by_name(&self, name: &str) -> Result<Option<Library>> {
        let conn = self.conn.lock().unwrap();
        let library = conn
            .query_row(
                "SELECT * FROM libraries WHERE name = ?1",
                [name],
                Self::row_to_library,
            )
            .optional()?;
        Ok(library)
    }

    fn find_all(&self) -> Result<Vec<Library>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT * FROM libraries ORDER BY id")?;
        let libraries = stmt
            .query_map([], Self::row_to_library)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(libraries)
    }

    fn insert(&self, library: &Library) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO libraries (name, path, category, storage_class, bucket_name, is_updating)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
            params![
                library.name,
                library.path,
                library.category.as_db_str(),
                library.storage_class.as_db_str(),
                library.bucket_name,
                library.is_updating,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn save(&self, library: &Library) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute(
            r#"UPDATE libraries SET name = ?2, path = ?3, category = ?4, storage_class = ?5,
                   bucket_name = ?6, is_updating = ?7
               WHERE id = ?1"#,
            params![
                library.id,
                library.name,
                library.path,
                library.category.as_db_str(),
                library.storage_class.as_db_str(),
                library.bucket_name,
                library.is_updating,
            ],
        )?;
        if updated == 0 {
            bail!("Library {} not found", library.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn store_with_library() -> (SqliteMediaStore, i64) {
        let store = SqliteMediaStore::in_memory().unwrap();
        let library = Library::new(
            "shows",
            "/media/tv/",
            MediaCategory::Tv,
            StorageClass::DeepArchive,
            "tv-bucket",
        );
        let id = LibraryStore::insert(&store, &library).unwrap();
        (store, id)
    }

    fn item(library_id: i64, path: &str) -> MediaItem {
        let modified = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        MediaItem::new(library_id, path.rsplit('/').next().unwrap(), path, modified, 1024)
    }

    #[test]
    fn test_insert_and_find_by_path() {
        let (store, library_id) = store_with_library();
        let id = MediaStore::insert(&store, &item(library_id, "/media/tv/Show/metadata")).unwrap();

        let found = store.find_by_path("/media/tv/Show/metadata").unwrap().unwrap();
        assert_eq!(found.id, id);
        assert_eq!(found.size, 1024);
        assert_eq!(found.download_outcome, DownloadOutcome::NoResult);
        assert!(store.find_by_path("/media/tv/Show").unwrap().is_none());
    }

    #[test]
    fn test_save_round_trips_every_flag() {
        let (store, library_id) = store_with_library();
        let id = MediaStore::insert(&store, &item(library_id, "/media/tv/Show/Season 1")).unwrap();

        let mut saved = MediaStore::find_by_id(&store, id).unwrap().unwrap();
        saved.archived_status = ArchivedStatus::Archived;
        saved.date_archived = Some(Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap());
        saved.is_recovering = true;
        saved.is_restored = true;
        saved.download_progress = 35;
        saved.download_outcome = DownloadOutcome::Failed;
        saved.is_job_cancelled = true;
        MediaStore::save(&store, &saved).unwrap();

        let loaded = MediaStore::find_by_id(&store, id).unwrap().unwrap();
        assert_eq!(loaded, saved);
    }

    #[test]
    fn test_save_missing_item_fails() {
        let (store, library_id) = store_with_library();
        let mut ghost = item(library_id, "/media/tv/Ghost/metadata");
        ghost.id = 42;
        assert!(MediaStore::save(&store, &ghost).is_err());
        assert!(store.is_job_cancelled(42).is_err());
    }

    #[test]
    fn test_narrow_updates() {
        let (store, library_id) = store_with_library();
        let id = MediaStore::insert(&store, &item(library_id, "/media/tv/Show/metadata")).unwrap();

        store.update_upload_progress_by_id(id, 25).unwrap();
        store.update_download_progress_by_id(id, 50).unwrap();
        store.update_is_tarring_by_id(id, true).unwrap();
        store.update_is_restoring_by_id(id, true).unwrap();
        store.update_is_restored_by_id(id, true).unwrap();
        store.update_is_recovering_by_id(id, true).unwrap();

        let loaded = MediaStore::find_by_id(&store, id).unwrap().unwrap();
        assert_eq!(loaded.upload_progress, 25);
        assert_eq!(loaded.download_progress, 50);
        assert!(loaded.is_tarring && loaded.is_restoring && loaded.is_restored);
        assert!(loaded.is_recovering);
        assert!(store.update_is_tarring_by_id(999, true).is_err());
    }

    #[test]
    fn test_flag_queries() {
        let (store, library_id) = store_with_library();
        let mut archiving = item(library_id, "/media/tv/A/metadata");
        archiving.is_archiving = true;
        let mut restoring = item(library_id, "/media/tv/B/metadata");
        restoring.is_recovering = true;
        restoring.is_restoring = true;
        let mut finished = item(library_id, "/media/tv/C/metadata");
        finished.is_recovering = true;
        finished.download_outcome = DownloadOutcome::Succeeded;
        for i in [&archiving, &restoring, &finished] {
            MediaStore::insert(&store, i).unwrap();
        }

        assert_eq!(store.find_by_is_archiving(true).unwrap().len(), 1);
        assert_eq!(store.find_by_is_recovering(true).unwrap().len(), 2);
        assert_eq!(store.find_by_is_restoring(true).unwrap().len(), 1);
        assert_eq!(store.find_by_is_restoring(false).unwrap().len(), 2);
        assert_eq!(store.find_by_download_success(true).unwrap().len(), 1);
        assert!(store.find_by_download_success(false).unwrap().is_empty());
    }

    #[test]
    fn test_find_by_archived_status_in() {
        let (store, library_id) = store_with_library();
        let mut archived = item(library_id, "/media/tv/A/metadata");
        archived.archived_status = ArchivedStatus::Archived;
        let mut stale = item(library_id, "/media/tv/B/metadata");
        stale.archived_status = ArchivedStatus::OutOfDate;
        let fresh = item(library_id, "/media/tv/C/metadata");
        for i in [&archived, &stale, &fresh] {
            MediaStore::insert(&store, i).unwrap();
        }

        let eligible = store
            .find_by_library_id_and_archived_status_in(
                library_id,
                &[ArchivedStatus::NotArchived, ArchivedStatus::OutOfDate],
            )
            .unwrap();
        let paths: Vec<_> = eligible.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["/media/tv/B/metadata", "/media/tv/C/metadata"]);
        assert!(store
            .find_by_library_id_and_archived_status_in(library_id, &[])
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_library_save_and_lookup() {
        let (store, library_id) = store_with_library();
        let mut library = LibraryStore::find_by_id(&store, library_id).unwrap().unwrap();
        assert_eq!(library.category, MediaCategory::Tv);
        assert_eq!(library.storage_class, StorageClass::DeepArchive);

        library.is_updating = true;
        LibraryStore::save(&store, &library).unwrap();
        assert!(store.find_by_name("shows").unwrap().unwrap().is_updating);
        assert_eq!(store.find_all().unwrap().len(), 1);
    }

    #[test]
    fn test_reopen_file_database() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("archive.db");
        {
            let store = SqliteMediaStore::new(&db_path).unwrap();
            let library = Library::new(
                "music",
                "/music/${artist}/",
                MediaCategory::Other,
                StorageClass::Glacier,
                "music-bucket",
            );
            LibraryStore::insert(&store, &library).unwrap();
        }
        let store = SqliteMediaStore::new(&db_path).unwrap();
        assert!(store.find_by_name("music").unwrap().is_some());
    }
}
