//! In-process [`ObjectStore`] used by tests and local dry runs.
//!
//! Objects live in a map keyed by bucket and key. Cold storage classes behave
//! like S3: reads fail until a restore was requested and then completed with
//! [`InMemoryObjectStore::complete_restore`].

use super::*;
use std::collections::HashMap;
use std::sync::Mutex;

const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
struct StoredObject {
    data: Vec<u8>,
    storage_class: StorageClass,
    last_modified: DateTime<Utc>,
    restore: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreCall {
    pub bucket: String,
    pub key: String,
    pub tier: RestoreTier,
    pub days: i32,
}

#[derive(Default)]
struct State {
    objects: HashMap<(String, String), StoredObject>,
    uploads: HashMap<String, Vec<IncompleteUpload>>,
    aborted: Vec<(String, String, String)>,
    restore_calls: Vec<RestoreCall>,
    next_upload_id: u64,
    fail_puts: bool,
    fail_gets: bool,
    after_first_chunk: Option<Box<dyn FnOnce() + Send>>,
}

pub struct InMemoryObjectStore {
    state: Mutex<State>,
    chunk_bytes: usize,
    page_size: usize,
}

impl Default for InMemoryObjectStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryObjectStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            page_size: 1000,
        }
    }

    /// Report progress every `chunk_bytes` instead of every 64 KiB.
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    /// Return at most `page_size` objects per listing page.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub fn insert_object(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        storage_class: StorageClass,
        last_modified: DateTime<Utc>,
    ) {
        self.state.lock().unwrap().objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                data,
                storage_class,
                last_modified,
                restore: None,
            },
        );
    }

    pub fn object_bytes(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.data.clone())
    }

    pub fn object_storage_class(&self, bucket: &str, key: &str) -> Option<StorageClass> {
        self.state
            .lock()
            .unwrap()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.storage_class)
    }

    /// Mark a previously requested thaw as finished.
    pub fn complete_restore(&self, bucket: &str, key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(&(bucket.to_string(), key.to_string())) {
            object.restore =
                Some("ongoing-request=\"false\", expiry-date=\"Fri, 01 Jan 2100 00:00:00 GMT\"".into());
        }
    }

    /// Drop the restore marker, as when a thawed copy expires.
    pub fn expire_restore(&self, bucket: &str, key: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(object) = state.objects.get_mut(&(bucket.to_string(), key.to_string())) {
            object.restore = None;
        }
    }

    pub fn restore_calls(&self) -> Vec<RestoreCall> {
        self.state.lock().unwrap().restore_calls.clone()
    }

    pub fn add_incomplete_upload(&self, bucket: &str, key: &str, initiated: DateTime<Utc>) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_upload_id += 1;
        let upload_id = format!("upload-{}", state.next_upload_id);
        state
            .uploads
            .entry(bucket.to_string())
            .or_default()
            .push(IncompleteUpload {
                key: key.to_string(),
                upload_id: upload_id.clone(),
                initiated,
            });
        upload_id
    }

    /// `(bucket, key, upload_id)` of every aborted upload, in order.
    pub fn aborted_uploads(&self) -> Vec<(String, String, String)> {
        self.state.lock().unwrap().aborted.clone()
    }

    pub fn set_fail_puts(&self, fail: bool) {
        self.state.lock().unwrap().fail_puts = fail;
    }

    pub fn set_fail_gets(&self, fail: bool) {
        self.state.lock().unwrap().fail_gets = fail;
    }

    /// Run `hook` once, after the first chunk of the next transfer moved and
    /// before the listener hears about it.
    pub fn on_first_chunk(&self, hook: impl FnOnce() + Send + 'static) {
        self.state.lock().unwrap().after_first_chunk = Some(Box::new(hook));
    }

    fn send_chunks(
        &self,
        total: u64,
        listener: &dyn TransferListener,
        mut on_chunk: impl FnMut(std::ops::Range<usize>) -> Result<(), ObjectStoreError>,
    ) -> Result<TransferOutcome, ObjectStoreError> {
        let mut transferred = 0usize;
        while (transferred as u64) < total {
            let end = (transferred + self.chunk_bytes).min(total as usize);
            on_chunk(transferred..end)?;
            if transferred == 0 {
                let hook = self.state.lock().unwrap().after_first_chunk.take();
                if let Some(hook) = hook {
                    hook();
                }
            }
            transferred = end;
            if listener.bytes_transferred(transferred as u64, total) == TransferSignal::Pause {
                return Ok(TransferOutcome::Paused);
            }
        }
        Ok(TransferOutcome::Completed)
    }
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        storage_class: StorageClass,
        source: &Path,
        listener: &dyn TransferListener,
    ) -> Result<TransferOutcome, ObjectStoreError> {
        let data = tokio::fs::read(source)
            .await
            .map_err(ObjectStoreError::local(source))?;
        listener.transfer_initiated();
        if self.state.lock().unwrap().fail_puts {
            return Err(ObjectStoreError::Request("injected put failure".into()));
        }

        let outcome = self.send_chunks(data.len() as u64, listener, |_| Ok(()))?;
        match outcome {
            TransferOutcome::Completed => {
                self.insert_object(bucket, key, data, storage_class, Utc::now());
            }
            TransferOutcome::Paused => {
                self.add_incomplete_upload(bucket, key, Utc::now());
            }
        }
        Ok(outcome)
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
        listener: &dyn TransferListener,
    ) -> Result<TransferOutcome, ObjectStoreError> {
        listener.transfer_initiated();
        let data = {
            let state = self.state.lock().unwrap();
            if state.fail_gets {
                return Err(ObjectStoreError::Request("injected get failure".into()));
            }
            let object = state
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .ok_or_else(|| ObjectStoreError::NotFound {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                })?;
            let thawed = HeadMetadata {
                restore: object.restore.clone(),
            }
            .restore_state()
                == RestoreState::Completed;
            if object.storage_class.requires_restore() && !thawed {
                return Err(ObjectStoreError::NotRestored {
                    bucket: bucket.to_string(),
                    key: key.to_string(),
                });
            }
            object.data.clone()
        };

        let mut written = Vec::with_capacity(data.len());
        let outcome = self.send_chunks(data.len() as u64, listener, |range| {
            written.extend_from_slice(&data[range]);
            Ok(())
        })?;
        tokio::fs::write(dest, &written)
            .await
            .map_err(ObjectStoreError::local(dest))?;
        Ok(outcome)
    }

    async fn head_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<HeadMetadata, ObjectStoreError> {
        let state = self.state.lock().unwrap();
        let object = state
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        Ok(HeadMetadata {
            restore: object.restore.clone(),
        })
    }

    async fn initiate_restore(
        &self,
        bucket: &str,
        key: &str,
        tier: RestoreTier,
        days: i32,
    ) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock().unwrap();
        let object = state
            .objects
            .get_mut(&(bucket.to_string(), key.to_string()))
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?;
        object.restore = Some("ongoing-request=\"true\"".to_string());
        state.restore_calls.push(RestoreCall {
            bucket: bucket.to_string(),
            key: key.to_string(),
            tier,
            days,
        });
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectListing, ObjectStoreError> {
        let state = self.state.lock().unwrap();
        let mut objects: Vec<ObjectSummary> = state
            .objects
            .iter()
            .filter(|((b, _), _)| b == bucket)
            .map(|((_, key), object)| ObjectSummary {
                key: key.clone(),
                last_modified: object.last_modified,
                size: object.data.len() as u64,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));

        let start = match continuation_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| ObjectStoreError::Request(format!("Bad continuation token {}", token)))?,
            None => 0,
        };
        let end = (start + self.page_size).min(objects.len());
        let next_token = (end < objects.len()).then(|| end.to_string());
        Ok(ObjectListing {
            objects: objects.get(start..end).map(<[_]>::to_vec).unwrap_or_default(),
            next_token,
        })
    }

    async fn list_incomplete_uploads(
        &self,
        bucket: &str,
    ) -> Result<Vec<IncompleteUpload>, ObjectStoreError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .uploads
            .get(bucket)
            .cloned()
            .unwrap_or_default())
    }

    async fn abort_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(uploads) = state.uploads.get_mut(bucket) {
            uploads.retain(|u| u.upload_id != upload_id);
        }
        state
            .aborted
            .push((bucket.to_string(), key.to_string(), upload_id.to_string()));
        Ok(())
    }
}
