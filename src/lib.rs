//! Media Archiver Library
//!
//! Moves library media between local disk and a tiered object store. The
//! server binary drains the job queues; the operator CLI drives the
//! `job_control` actions against the same database.

pub mod archive;
pub mod background_jobs;
pub mod config;
pub mod job_control;
pub mod job_queue;
pub mod library;
pub mod media_store;
pub mod metrics;
pub mod object_store;
pub mod recovery;
pub mod sqlite_persistence;
pub mod workers;

// Re-export commonly used types for convenience
pub use job_control::{ControlError, JobControl};
pub use job_queue::{JobQueue, QueueName, SqliteJobQueue};
pub use media_store::{LibraryStore, MediaStore, SqliteMediaStore};
pub use object_store::{ObjectStore, S3ObjectStore};
pub use recovery::StartupReconciler;
