//! Upload garbage collection background job.
//!
//! Paused or interrupted multipart uploads stay open on the bucket and keep
//! their parts billed. This job aborts the ones older than the retention
//! window.

use crate::background_jobs::{
    context::JobContext,
    job::{BackgroundJob, JobError, JobSchedule, ShutdownBehavior},
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{error, info, warn};

pub struct UploadGcJob {
    retention_days: u64,
    interval: Duration,
}

impl UploadGcJob {
    pub fn new(retention_days: u64, interval: Duration) -> Self {
        Self {
            retention_days,
            interval,
        }
    }

    fn collect_bucket(&self, ctx: &JobContext, bucket: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let uploads = ctx.block_on(ctx.object_store.list_incomplete_uploads(bucket))?;
        let mut aborted = 0;
        for upload in uploads.iter().filter(|u| u.initiated < cutoff) {
            match ctx.block_on(
                ctx.object_store
                    .abort_upload(bucket, &upload.key, &upload.upload_id),
            ) {
                Ok(()) => aborted += 1,
                Err(e) => warn!(
                    "Failed to abort upload {} of {} in {}: {}",
                    upload.upload_id, upload.key, bucket, e
                ),
            }
        }
        Ok(aborted)
    }
}

impl BackgroundJob for UploadGcJob {
    fn id(&self) -> &'static str {
        "upload_gc"
    }

    fn name(&self) -> &'static str {
        "Upload Garbage Collector"
    }

    fn description(&self) -> &'static str {
        "Abort stale incomplete multipart uploads on every library bucket"
    }

    fn schedule(&self) -> JobSchedule {
        JobSchedule::Interval(self.interval)
    }

    fn shutdown_behavior(&self) -> ShutdownBehavior {
        // Aborts are short requests, let the current bucket finish.
        ShutdownBehavior::WaitForCompletion
    }

    fn execute(&self, ctx: &JobContext) -> Result<(), JobError> {
        if ctx.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let cutoff = Utc::now() - chrono::Duration::days(self.retention_days as i64);
        let buckets: BTreeSet<String> = ctx
            .library_store
            .find_all()
            .map_err(|e| JobError::ExecutionFailed(e.to_string()))?
            .into_iter()
            .map(|library| library.bucket_name)
            .collect();

        info!(
            "Aborting uploads started before {} on {} buckets",
            cutoff,
            buckets.len()
        );

        let mut total = 0;
        for bucket in &buckets {
            match self.collect_bucket(ctx, bucket, cutoff) {
                Ok(aborted) => {
                    if aborted > 0 {
                        info!("Aborted {} stale uploads in {}", aborted, bucket);
                    }
                    total += aborted;
                }
                Err(e) => error!("Failed to clean uploads of bucket {}: {:#}", bucket, e),
            }
        }

        info!("Upload GC done, {} uploads aborted", total);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job_queue::SqliteJobQueue;
    use crate::media_store::{Library, LibraryStore, MediaCategory, SqliteMediaStore, StorageClass};
    use crate::object_store::memory::InMemoryObjectStore;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    #[tokio::test(flavor = "multi_thread")]
    async fn test_aborts_only_stale_uploads() {
        let store = Arc::new(SqliteMediaStore::in_memory().unwrap());
        for (name, bucket) in [("a", "bucket-a"), ("b", "bucket-b"), ("c", "bucket-a")] {
            let library =
                Library::new(name, format!("/{}", name), MediaCategory::Other, StorageClass::Standard, bucket);
            LibraryStore::insert(store.as_ref(), &library).unwrap();
        }

        let objects = Arc::new(InMemoryObjectStore::new());
        let stale = objects.add_incomplete_upload("bucket-a", "/a/1", Utc::now() - chrono::Duration::days(3));
        objects.add_incomplete_upload("bucket-a", "/a/2", Utc::now() - chrono::Duration::hours(1));
        let stale_b = objects.add_incomplete_upload("bucket-b", "/b/1", Utc::now() - chrono::Duration::days(10));

        let ctx = JobContext::new(
            CancellationToken::new(),
            store.clone(),
            store.clone(),
            Arc::new(SqliteJobQueue::new(store.connection())),
            objects.clone(),
        );
        tokio::task::spawn_blocking(move || {
            UploadGcJob::new(2, Duration::from_secs(86400)).execute(&ctx)
        })
        .await
        .unwrap()
        .unwrap();

        let aborted: Vec<String> = objects
            .aborted_uploads()
            .into_iter()
            .map(|(_, _, upload_id)| upload_id)
            .collect();
        assert_eq!(aborted.len(), 2);
        assert!(aborted.contains(&stale));
        assert!(aborted.contains(&stale_b));
    }

    #[test]
    fn test_job_metadata() {
        let job = UploadGcJob::new(2, Duration::from_secs(24 * 60 * 60));
        assert_eq!(job.id(), "upload_gc");
        assert_eq!(
            job.schedule(),
            JobSchedule::Interval(Duration::from_secs(24 * 60 * 60))
        );
        assert_eq!(job.shutdown_behavior(), ShutdownBehavior::WaitForCompletion);
    }
}
