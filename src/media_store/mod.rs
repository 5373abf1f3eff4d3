//! Persistent state of libraries and media items.

mod models;
mod schema;
mod store;

pub use models::{
    ArchivedStatus, DownloadOutcome, Library, MediaCategory, MediaItem, StorageClass, NO_PROGRESS,
};
pub use schema::ARCHIVE_DB_VERSIONED_SCHEMAS;
pub use store::{LibraryStore, MediaStore, SqliteMediaStore};
pub(crate) use store::{from_millis, to_millis};
