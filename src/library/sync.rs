//! Reconciles stored archival state with what the library's bucket holds.

use crate::media_store::{ArchivedStatus, Library, MediaStore};
use crate::object_store::ObjectStore;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ArchiveSetReconciler {
    media_store: Arc<dyn MediaStore>,
    object_store: Arc<dyn ObjectStore>,
}

impl ArchiveSetReconciler {
    pub fn new(media_store: Arc<dyn MediaStore>, object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            media_store,
            object_store,
        }
    }

    /// Page through the bucket listing and refresh the status of every item
    /// whose path matches an object key. Returns the number of items updated.
    pub async fn sync(&self, library: &Library) -> Result<usize> {
        let mut continuation_token: Option<String> = None;
        let mut updated = 0;
        let mut pages = 0;

        loop {
            let listing = self
                .object_store
                .list_objects(&library.bucket_name, continuation_token.take())
                .await
                .with_context(|| format!("Failed to list bucket {}", library.bucket_name))?;
            pages += 1;

            for object in &listing.objects {
                let Some(mut item) = self.media_store.find_by_path(&object.key)? else {
                    continue;
                };
                item.archived_status = if item.date_last_modified > object.last_modified {
                    ArchivedStatus::OutOfDate
                } else {
                    ArchivedStatus::Archived
                };
                item.date_archived = Some(object.last_modified);
                debug!("{} is {:?} in {}", item.path, item.archived_status, library.bucket_name);
                self.media_store.save(&item)?;
                updated += 1;
            }

            match listing.next_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }

        info!(
            "Synced library {} with bucket {}: {} items updated over {} pages",
            library.name, library.bucket_name, updated, pages
        );
        Ok(updated)
    }
}
