//! [`ObjectStore`] on top of the AWS S3 SDK.

use super::*;
use aws_sdk_s3::{
    config::{Credentials, Region},
    error::DisplayErrorContext,
    primitives::ByteStream,
    types::{
        CompletedMultipartUpload, CompletedPart, GlacierJobParameters, RestoreRequest,
        StorageClass as S3StorageClass, Tier,
    },
    Client as S3Client,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

/// Downloads report progress at most once per this many bytes.
const DOWNLOAD_PROGRESS_BYTES: u64 = 1024 * 1024;

/// S3 rejects multipart uploads with more parts than this.
const MAX_UPLOAD_PARTS: u64 = 10_000;

/// Part size for uploading `total` bytes: the configured size, grown so the
/// upload never needs more than [`MAX_UPLOAD_PARTS`] parts.
fn multipart_part_size(total: u64, configured: usize) -> usize {
    let needed = total.div_ceil(MAX_UPLOAD_PARTS);
    configured.max(usize::try_from(needed).unwrap_or(usize::MAX))
}

/// Connection settings for an S3 compatible endpoint.
#[derive(Debug, Clone)]
pub struct S3Settings {
    pub region: String,
    /// Custom endpoint (MinIO, Ceph...). Switches to path-style addressing.
    pub endpoint: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Archives larger than this go through multipart upload.
    pub part_size_bytes: usize,
}

pub struct S3ObjectStore {
    client: S3Client,
    part_size_bytes: usize,
}

impl S3ObjectStore {
    pub fn new(settings: &S3Settings) -> Self {
        let credentials = Credentials::new(
            settings.access_key_id.clone(),
            settings.secret_access_key.clone(),
            None,
            None,
            "media-archiver",
        );

        let mut config_builder = aws_sdk_s3::config::Builder::new()
            .behavior_version_latest()
            .region(Region::new(settings.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint) = settings
            .endpoint
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            config_builder = config_builder
                .endpoint_url(endpoint.to_string())
                .force_path_style(true);
        }

        Self {
            client: S3Client::from_conf(config_builder.build()),
            part_size_bytes: settings.part_size_bytes.max(5 * 1024 * 1024),
        }
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        storage_class: StorageClass,
        source: &Path,
        total: u64,
        listener: &dyn TransferListener,
    ) -> Result<TransferOutcome, ObjectStoreError> {
        let multipart = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .storage_class(to_s3_storage_class(storage_class))
            .send()
            .await
            .map_err(request_error)?;
        let upload_id = multipart
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| ObjectStoreError::Request("Missing multipart upload id".into()))?;

        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(ObjectStoreError::local(source))?;
        let part_size = multipart_part_size(total, self.part_size_bytes);
        if part_size > self.part_size_bytes {
            debug!("Raised part size of {} to {} bytes", key, part_size);
        }
        let mut transferred: u64 = 0;
        let mut part_number: i32 = 1;
        let mut parts: Vec<CompletedPart> = Vec::new();

        let upload_result: Result<TransferOutcome, ObjectStoreError> = async {
            loop {
                let mut buffer = vec![0u8; part_size];
                let mut read_total: usize = 0;
                while read_total < buffer.len() {
                    let read = file
                        .read(&mut buffer[read_total..])
                        .await
                        .map_err(ObjectStoreError::local(source))?;
                    if read == 0 {
                        break;
                    }
                    read_total += read;
                }

                if read_total == 0 {
                    break;
                }
                buffer.truncate(read_total);

                let output = self
                    .client
                    .upload_part()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(upload_id.clone())
                    .part_number(part_number)
                    .body(ByteStream::from(buffer))
                    .send()
                    .await
                    .map_err(request_error)?;

                parts.push(
                    CompletedPart::builder()
                        .set_e_tag(output.e_tag().map(str::to_string))
                        .part_number(part_number)
                        .build(),
                );

                transferred += read_total as u64;
                part_number += 1;
                if listener.bytes_transferred(transferred, total) == TransferSignal::Pause {
                    // The multipart upload stays open; stale ones are aborted by the upload GC.
                    info!(
                        "Pausing upload of {} after {} parts (upload id {})",
                        key,
                        parts.len(),
                        upload_id
                    );
                    return Ok(TransferOutcome::Paused);
                }
            }

            let completed_upload = CompletedMultipartUpload::builder()
                .set_parts(Some(parts))
                .build();

            self.client
                .complete_multipart_upload()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id.clone())
                .multipart_upload(completed_upload)
                .send()
                .await
                .map_err(request_error)?;

            Ok(TransferOutcome::Completed)
        }
        .await;

        if upload_result.is_err() {
            if let Err(e) = self.abort_upload(bucket, key, &upload_id).await {
                warn!("Failed to abort upload {} of {}: {}", upload_id, key, e);
            }
        }
        upload_result
    }
}

fn request_error<E: std::error::Error>(err: E) -> ObjectStoreError {
    ObjectStoreError::Request(DisplayErrorContext(err).to_string())
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    dt.to_millis()
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_millis)
}

fn to_s3_storage_class(storage_class: StorageClass) -> S3StorageClass {
    match storage_class {
        StorageClass::Standard => S3StorageClass::Standard,
        StorageClass::StandardIa => S3StorageClass::StandardIa,
        StorageClass::OnezoneIa => S3StorageClass::OnezoneIa,
        StorageClass::IntelligentTiering => S3StorageClass::IntelligentTiering,
        StorageClass::GlacierIr => S3StorageClass::GlacierIr,
        StorageClass::Glacier => S3StorageClass::Glacier,
        StorageClass::DeepArchive => S3StorageClass::DeepArchive,
    }
}

fn to_s3_tier(tier: RestoreTier) -> Tier {
    match tier {
        RestoreTier::Bulk => Tier::Bulk,
        RestoreTier::Standard => Tier::Standard,
        RestoreTier::Expedited => Tier::Expedited,
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        storage_class: StorageClass,
        source: &Path,
        listener: &dyn TransferListener,
    ) -> Result<TransferOutcome, ObjectStoreError> {
        let total = tokio::fs::metadata(source)
            .await
            .map_err(ObjectStoreError::local(source))?
            .len();
        listener.transfer_initiated();

        if total > self.part_size_bytes as u64 {
            return self
                .put_multipart(bucket, key, storage_class, source, total, listener)
                .await;
        }

        debug!("Uploading {} ({} bytes) in a single request", key, total);
        let body = ByteStream::from_path(source)
            .await
            .map_err(|e| ObjectStoreError::Request(format!("Failed reading {:?}: {}", source, e)))?;
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .storage_class(to_s3_storage_class(storage_class))
            .body(body)
            .send()
            .await
            .map_err(request_error)?;
        // The object is already stored, a pause here can only be reported.
        if listener.bytes_transferred(total, total) == TransferSignal::Pause {
            info!("Cancel of {} arrived after its single request completed", key);
        }
        Ok(TransferOutcome::Completed)
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        dest: &Path,
        listener: &dyn TransferListener,
    ) -> Result<TransferOutcome, ObjectStoreError> {
        listener.transfer_initiated();
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(request_error)?;
        let total = output.content_length().unwrap_or(0).max(0) as u64;

        let file = tokio::fs::File::create(dest)
            .await
            .map_err(ObjectStoreError::local(dest))?;
        let mut writer = BufWriter::new(file);
        let mut body = output.body;
        let mut transferred: u64 = 0;
        let mut last_reported: u64 = 0;

        while let Some(bytes) = body
            .try_next()
            .await
            .map_err(|e| ObjectStoreError::Request(format!("Download stream failed: {}", e)))?
        {
            writer
                .write_all(&bytes)
                .await
                .map_err(ObjectStoreError::local(dest))?;
            transferred += bytes.len() as u64;

            if transferred - last_reported >= DOWNLOAD_PROGRESS_BYTES || transferred == total {
                last_reported = transferred;
                if listener.bytes_transferred(transferred, total) == TransferSignal::Pause {
                    writer.flush().await.map_err(ObjectStoreError::local(dest))?;
                    info!("Pausing download of {} at {} bytes", key, transferred);
                    return Ok(TransferOutcome::Paused);
                }
            }
        }

        writer.flush().await.map_err(ObjectStoreError::local(dest))?;
        Ok(TransferOutcome::Completed)
    }

    async fn head_metadata(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<HeadMetadata, ObjectStoreError> {
        let output = self
            .client
            .head_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(request_error)?;
        Ok(HeadMetadata {
            restore: output.restore().map(str::to_string),
        })
    }

    async fn initiate_restore(
        &self,
        bucket: &str,
        key: &str,
        tier: RestoreTier,
        days: i32,
    ) -> Result<(), ObjectStoreError> {
        let job_parameters = GlacierJobParameters::builder()
            .tier(to_s3_tier(tier))
            .build()
            .map_err(request_error)?;
        let restore_request = RestoreRequest::builder()
            .days(days)
            .glacier_job_parameters(job_parameters)
            .build();

        self.client
            .restore_object()
            .bucket(bucket)
            .key(key)
            .restore_request(restore_request)
            .send()
            .await
            .map_err(request_error)?;
        Ok(())
    }

    async fn list_objects(
        &self,
        bucket: &str,
        continuation_token: Option<String>,
    ) -> Result<ObjectListing, ObjectStoreError> {
        let mut request = self.client.list_objects_v2().bucket(bucket);
        if let Some(token) = continuation_token {
            request = request.continuation_token(token);
        }
        let output = request.send().await.map_err(request_error)?;

        let objects = output
            .contents()
            .iter()
            .filter_map(|object| {
                Some(ObjectSummary {
                    key: object.key()?.to_string(),
                    last_modified: object.last_modified().and_then(to_chrono)?,
                    size: object.size().unwrap_or(0).max(0) as u64,
                })
            })
            .collect();

        let next_token = if output.is_truncated().unwrap_or(false) {
            output.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(ObjectListing {
            objects,
            next_token,
        })
    }

    async fn list_incomplete_uploads(
        &self,
        bucket: &str,
    ) -> Result<Vec<IncompleteUpload>, ObjectStoreError> {
        let mut uploads = Vec::new();
        let mut key_marker: Option<String> = None;
        let mut upload_id_marker: Option<String> = None;

        loop {
            let mut request = self.client.list_multipart_uploads().bucket(bucket);
            if let Some(marker) = key_marker.take() {
                request = request.key_marker(marker);
            }
            if let Some(marker) = upload_id_marker.take() {
                request = request.upload_id_marker(marker);
            }
            let output = request.send().await.map_err(request_error)?;

            for upload in output.uploads() {
                if let (Some(key), Some(upload_id)) = (upload.key(), upload.upload_id()) {
                    uploads.push(IncompleteUpload {
                        key: key.to_string(),
                        upload_id: upload_id.to_string(),
                        // Unknown start time reads as "just started" so it is never aborted.
                        initiated: upload.initiated().and_then(to_chrono).unwrap_or_else(Utc::now),
                    });
                }
            }

            if !output.is_truncated().unwrap_or(false) {
                break;
            }
            key_marker = output.next_key_marker().map(str::to_string);
            upload_id_marker = output.next_upload_id_marker().map(str::to_string);
            if key_marker.is_none() {
                break;
            }
        }

        Ok(uploads)
    }

    async fn abort_upload(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(request_error)?;
        Ok(())
    }
}
