use super::{ObjectStore, ObjectSummary, StorageError, StorageResult};
use crate::config::S3Config;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, TaggingDirective};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use tracing::{debug, info, instrument};

/// S3 backed object store. Bucket names are supplied per call since a job
/// reads from its source bucket and writes to the mapped destination.
pub struct S3ObjectStore {
    client: S3Client,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3ObjectStore {
    /// Create a new S3 object store
    pub async fn new(config: &S3Config) -> Self {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            region = %config.region,
            endpoint = ?config.endpoint_url,
            "S3 object store initialized"
        );

        Self {
            client,
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes.max(MIN_PART_SIZE),
        }
    }

    /// Simple single-part upload for small files
    async fn simple_upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    /// Multipart upload for large files
    async fn multipart_upload(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        let create_response = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(storage_error)?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| StorageError::S3("No upload ID in response".to_string()))?;

        let mut completed_parts = Vec::new();

        for (index, chunk) in body.chunks(self.part_size_bytes).enumerate() {
            let part_number = index as i32 + 1;

            let upload_part_response = match self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(body.slice_ref(chunk)))
                .send()
                .await
            {
                Ok(response) => response,
                Err(e) => {
                    self.abort_multipart(bucket, key, upload_id).await;
                    return Err(storage_error(e));
                }
            };

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );
        }

        let completed_upload = CompletedMultipartUpload::builder()
            .set_parts(Some(completed_parts))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(completed_upload)
            .send()
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    async fn abort_multipart(&self, bucket: &str, key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
        {
            debug!(key, error = %DisplayErrorContext(&e), "Failed to abort multipart upload");
        }
    }
}

/// S3 rejects multipart parts smaller than 5MB (except the last one).
const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

#[async_trait::async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn get_object(&self, bucket: &str, key: &str, max_bytes: u64) -> StorageResult<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound {
                        bucket: bucket.to_string(),
                        key: key.to_string(),
                    }
                } else {
                    storage_error(e)
                }
            })?;

        if let Some(size) = response.content_length().and_then(|len| u64::try_from(len).ok()) {
            if size > max_bytes {
                return Err(StorageError::TooLarge {
                    size,
                    limit: max_bytes,
                });
            }
        }

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::S3(format!("Failed to read object body: {e}")))?;

        Ok(body.into_bytes())
    }

    #[instrument(skip(self))]
    async fn list_objects(
        &self,
        bucket: &str,
        prefix: &str,
        max_keys: usize,
    ) -> StorageResult<Vec<ObjectSummary>> {
        let response = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .max_keys(i32::try_from(max_keys).unwrap_or(i32::MAX))
            .send()
            .await
            .map_err(storage_error)?;

        Ok(response
            .contents()
            .iter()
            .filter_map(|obj| {
                obj.key().map(|key| ObjectSummary {
                    key: key.to_string(),
                    size: obj.size().unwrap_or_default().max(0) as u64,
                })
            })
            .collect())
    }

    #[instrument(skip(self, body), fields(size_bytes = body.len()))]
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> StorageResult<()> {
        if body.len() > self.multipart_threshold_bytes {
            self.multipart_upload(bucket, key, body, content_type).await
        } else {
            self.simple_upload(bucket, key, body, content_type).await
        }
    }

    #[instrument(skip(self, tags))]
    async fn copy_object(
        &self,
        bucket: &str,
        source_key: &str,
        dest_key: &str,
        tags: &[(String, String)],
    ) -> StorageResult<()> {
        self.client
            .copy_object()
            .bucket(bucket)
            .key(dest_key)
            .copy_source(format!("{}/{}", bucket, encode_copy_source(source_key)))
            .tagging(tagging_header(tags))
            .tagging_directive(TaggingDirective::Replace)
            .send()
            .await
            .map_err(storage_error)?;

        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete_object(&self, bucket: &str, key: &str) -> StorageResult<()> {
        self.client
            .delete_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(storage_error)?;

        debug!(bucket, key, "Object deleted");
        Ok(())
    }
}

/// Map an SDK error onto the retry-aware storage error.
fn storage_error<E, R>(err: SdkError<E, R>) -> StorageError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
    R: std::fmt::Debug,
{
    match err.code() {
        Some(code @ ("AccessDenied" | "InvalidRequest" | "InvalidArgument" | "NoSuchBucket")) => {
            StorageError::Rejected(format!("{code}: {}", DisplayErrorContext(&err)))
        }
        _ => StorageError::S3(DisplayErrorContext(&err).to_string()),
    }
}

/// Encode tags as the URL query string expected by `x-amz-tagging`.
fn tagging_header(tags: &[(String, String)]) -> String {
    url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(tags.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .finish()
}

/// Percent-encode an object key for the `x-amz-copy-source` header, keeping `/`.
fn encode_copy_source(key: &str) -> String {
    let mut encoded = String::with_capacity(key.len());
    for byte in key.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' => {
                encoded.push(byte as char)
            }
            _ => encoded.push_str(&format!("%{byte:02X}")),
        }
    }
    encoded
}
