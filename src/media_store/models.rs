//! Media item and library models.
//!
//! Enum types round-trip through the database as stable uppercase strings.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Progress value meaning "no transfer running".
pub const NO_PROGRESS: i32 = -1;

/// Archival state of a media item relative to the object store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ArchivedStatus {
    NotArchived,
    Archived,
    OutOfDate,
}

impl ArchivedStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ArchivedStatus::NotArchived => "NOT_ARCHIVED",
            ArchivedStatus::Archived => "ARCHIVED",
            ArchivedStatus::OutOfDate => "OUT_OF_DATE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "NOT_ARCHIVED" => Some(ArchivedStatus::NotArchived),
            "ARCHIVED" => Some(ArchivedStatus::Archived),
            "OUT_OF_DATE" => Some(ArchivedStatus::OutOfDate),
            _ => None,
        }
    }
}

/// Outcome of the last completed download for an item.
///
/// `NoResult` means no job has finished since the operator last cleared it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DownloadOutcome {
    #[default]
    NoResult,
    Succeeded,
    Failed,
}

impl DownloadOutcome {
    pub fn as_db_str(&self) -> Option<&'static str> {
        match self {
            DownloadOutcome::NoResult => None,
            DownloadOutcome::Succeeded => Some("SUCCEEDED"),
            DownloadOutcome::Failed => Some("FAILED"),
        }
    }

    pub fn from_db_str(s: Option<&str>) -> Self {
        match s {
            Some("SUCCEEDED") => DownloadOutcome::Succeeded,
            Some("FAILED") => DownloadOutcome::Failed,
            _ => DownloadOutcome::NoResult,
        }
    }

    pub fn from_success(success: bool) -> Self {
        if success {
            DownloadOutcome::Succeeded
        } else {
            DownloadOutcome::Failed
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, DownloadOutcome::NoResult)
    }
}

/// Library category. TV libraries split shows into a metadata item plus one
/// item per season directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaCategory {
    Tv,
    Other,
}

impl MediaCategory {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            MediaCategory::Tv => "TV",
            MediaCategory::Other => "OTHER",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "TV" => Some(MediaCategory::Tv),
            "OTHER" => Some(MediaCategory::Other),
            _ => None,
        }
    }
}

/// Object store storage class a library archives into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StorageClass {
    Standard,
    StandardIa,
    OnezoneIa,
    IntelligentTiering,
    GlacierIr,
    Glacier,
    DeepArchive,
}

impl StorageClass {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            StorageClass::Standard => "STANDARD",
            StorageClass::StandardIa => "STANDARD_IA",
            StorageClass::OnezoneIa => "ONEZONE_IA",
            StorageClass::IntelligentTiering => "INTELLIGENT_TIERING",
            StorageClass::GlacierIr => "GLACIER_IR",
            StorageClass::Glacier => "GLACIER",
            StorageClass::DeepArchive => "DEEP_ARCHIVE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "STANDARD" => Some(StorageClass::Standard),
            "STANDARD_IA" => Some(StorageClass::StandardIa),
            "ONEZONE_IA" => Some(StorageClass::OnezoneIa),
            "INTELLIGENT_TIERING" => Some(StorageClass::IntelligentTiering),
            "GLACIER_IR" => Some(StorageClass::GlacierIr),
            "GLACIER" => Some(StorageClass::Glacier),
            "DEEP_ARCHIVE" => Some(StorageClass::DeepArchive),
            _ => None,
        }
    }

    /// Objects in these classes must be thawed before they can be downloaded.
    pub fn requires_restore(&self) -> bool {
        matches!(self, StorageClass::Glacier | StorageClass::DeepArchive)
    }
}

/// A library: a path template over the local filesystem plus the bucket its
/// items are archived into.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub id: i64,
    pub name: String,
    /// `/`-delimited template; `${name}` segments fan out over subdirectories.
    pub path: String,
    pub category: MediaCategory,
    pub storage_class: StorageClass,
    pub bucket_name: String,
    pub is_updating: bool,
}

impl Library {
    /// Build a library that has not been persisted yet.
    pub fn new(
        name: impl Into<String>,
        path: impl Into<String>,
        category: MediaCategory,
        storage_class: StorageClass,
        bucket_name: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            path: path.into(),
            category,
            storage_class,
            bucket_name: bucket_name.into(),
            is_updating: false,
        }
    }

    pub fn is_tv(&self) -> bool {
        self.category == MediaCategory::Tv
    }
}

/// One tracked file or directory within a library.
///
/// The job-state flags are independent columns rather than a single state
/// enum; workers flip them individually.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: i64,
    pub library_id: i64,
    pub name: String,
    /// Filesystem path, also used as the object key.
    pub path: String,
    pub archived_status: ArchivedStatus,
    pub date_archived: Option<DateTime<Utc>>,
    pub date_last_modified: DateTime<Utc>,
    pub size: u64,
    pub is_archiving: bool,
    pub is_tarring: bool,
    pub upload_progress: i32,
    pub is_recovering: bool,
    pub is_restoring: bool,
    pub is_restored: bool,
    pub download_progress: i32,
    pub download_outcome: DownloadOutcome,
    pub is_job_cancelled: bool,
}

impl MediaItem {
    /// Build a freshly discovered item: not archived, every job flag idle.
    pub fn new(
        library_id: i64,
        name: impl Into<String>,
        path: impl Into<String>,
        date_last_modified: DateTime<Utc>,
        size: u64,
    ) -> Self {
        Self {
            id: 0,
            library_id,
            name: name.into(),
            path: path.into(),
            archived_status: ArchivedStatus::NotArchived,
            date_archived: None,
            date_last_modified,
            size,
            is_archiving: false,
            is_tarring: false,
            upload_progress: NO_PROGRESS,
            is_recovering: false,
            is_restoring: false,
            is_restored: false,
            download_progress: NO_PROGRESS,
            download_outcome: DownloadOutcome::NoResult,
            is_job_cancelled: false,
        }
    }

    /// Clears the archive job flags after success, failure or cancellation.
    pub fn reset_archive_flags(&mut self) {
        self.is_archiving = false;
        self.upload_progress = NO_PROGRESS;
        self.is_tarring = false;
        self.is_job_cancelled = false;
    }

    /// Clears the transfer part of a recovery job. `is_recovering` is left to
    /// the caller because the different exit paths treat it differently.
    pub fn reset_download_flags(&mut self) {
        self.download_progress = NO_PROGRESS;
        self.is_restored = false;
        self.is_restoring = false;
        self.is_job_cancelled = false;
    }

    /// True while an archive or recovery job owns this item.
    pub fn has_active_job(&self) -> bool {
        self.is_archiving || self.is_recovering
    }
}
