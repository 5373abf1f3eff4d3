//! Tiered object store client.
//!
//! [`ObjectStore`] is the boundary to the blob store holding the archives:
//! resumable transfers with a progress sink, restore (thaw) requests for cold
//! storage classes, listings, and multipart upload housekeeping.

pub mod memory;
mod s3;

pub use s3::{S3ObjectStore, S3Settings};

use crate::media_store::StorageClass;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Answer of a progress sink to a progress callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferSignal {
    Continue,
    /// Stop transferring without discarding what was sent so far.
    Pause,
}

/// How a transfer ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Paused,
}

/// Progress sink attached to one upload or download.
pub trait TransferListener: Send + Sync {
    /// Called once before the first byte moves.
    fn transfer_initiated(&self);

    /// Called as bytes move. Returning [`TransferSignal::Pause`] stops the
    /// transfer at the next safe point.
    fn bytes_transferred(&self, transferred: u64, total: u64) -> TransferSignal;
}

/// Retrieval tier of a cold storage restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RestoreTier {
    #[default]
    Bulk,
    Standard,
    Expedited,
}

impl RestoreTier {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "bulk" => Some(RestoreTier::Bulk),
            "standard" => Some(RestoreTier::Standard),
            "expedited" => Some(RestoreTier::Expedited),
            _ => None,
        }
    }
}

/// State of a thaw as reported by the object's restore marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    /// No restore marker: no thaw was ever requested, or it expired.
    NotRequested,
    InProgress,
    Completed,
}

/// Subset of an object's head metadata the workers care about.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeadMetadata {
    /// Raw restore marker, e.g. `ongoing-request="false", expiry-date="..."`.
    pub restore: Option<String>,
}

impl HeadMetadata {
    pub fn restore_state(&self) -> RestoreState {
        match &self.restore {
            None => RestoreState::NotRequested,
            Some(marker) if marker.contains("ongoing-request=\"false\"") => RestoreState::Completed,
            Some(_) => RestoreState::InProgress,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSummary {
    pub key: String,
    pub last_modified: DateTime<Utc>,
    pub size: u64,
}

/// One page of a bucket listing.
#[derive(Debug, Clone, Default)]
pub struct ObjectListing {
    pub objects: Vec<ObjectSummary>,
    /// Present while more pages remain.
    pub next_token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteUpload {
    pub key: String,
    pub upload_id: String,
    pub initiated: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("Object store request failed: {0}")]
    Request(String),

    #[error("Object {bucket}/{key} not found")]
    NotFound { bucket: String, key: String },

    #[error("Object {bucket}/{key} is not readable in its storage class without a restore")]
    NotRestored { bucket: String, key: String },

    #[error("Local file error on {path:?}: {source}")]
    LocalFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ObjectStoreError {
    pub(crate) fn local(path: &Path) -> impl FnOnce(std::io::Error) -> Self + '_ {
        move |source| ObjectStoreError::LocalFile {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Tiered blob store holding one archive per media item.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `source` to `bucket/key` in `storage_class`, reporting progress
    /// to `listener`.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        storage_class: StorageClass,
        source: &Path,
        listener: &dyn TransferListener,
    ) -> Result<TransferOutcome, ObjectStoreError>;

    /// Download `bucket/key` into `dest`, reporting progress to `listener`.
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
        listener: &dyn TransferListener,
    ) -> Result<TransferOutcome, ObjectStoreError>;

    async fn head_metadata(&self, bucket: &str, key: &str)
        -> Result<HeadMetadata, ObjectStoreError>;

    /// Ask for a cold object to be thawed for `days` using `tier` retrieval.
    async fn initiate_restore(
        &self,
        bucket: &str,
        key: &str,
        tier: RestoreTier,
        days: i32,
    ) -> Result<(), ObjectStoreError>;

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectListing, ObjectStoreError>;

    async fn list_incomplete_uploads(
        &self,
        bucket: &str,
    ) -> Result<Vec<IncompleteUpload>, ObjectStoreError>;

    async fn abort_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError>;
}
