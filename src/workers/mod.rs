//! Queue handlers: one per named queue.
//!
//! Every handler looks the item (or library) up fresh from the store, checks
//! the cancellation flag, does its work and rolls the job flags back on any
//! error. Nothing is surfaced to the queue processor.

mod archive;
mod download;
mod library;
mod progress;
mod restore;

pub use archive::ArchiveWorker;
pub use download::DownloadWorker;
pub use library::{LibraryScanWorker, LibrarySyncWorker};
pub use progress::{TransferDirection, TransferProgressTracker};
pub use restore::RestoreWorker;

use crate::metrics;

/// How a handled message ended, for logs and metrics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Succeeded,
    Failed,
    Cancelled,
    /// The target vanished between enqueue and dispatch.
    Skipped,
}

impl WorkerOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerOutcome::Succeeded => "succeeded",
            WorkerOutcome::Failed => "failed",
            WorkerOutcome::Cancelled => "cancelled",
            WorkerOutcome::Skipped => "skipped",
        }
    }
}

fn record(worker: &str, outcome: WorkerOutcome) {
    metrics::record_worker_outcome(worker, outcome.as_str());
}
