// tfstate-backup/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use s3::config::http::HttpResponse;
use s3::config::{BehaviorVersion, Credentials, Region};
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::operation::put_object::PutObjectError;
use s3::primitives::ByteStream;
use s3::types::ChecksumAlgorithm;
use std::sync::Arc;
use tracing::info;

use super::archive::ArchiveArtifact;
use super::object_key::ObjectKey;
use crate::config::StorageConfig;
use crate::errors::{AppError, Result};
use crate::utils::retry::RetryPolicy;

pub const ARCHIVE_CONTENT_TYPE: &str = "application/zip";

/// Write side of the object store.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Stores `body` under `key` in a single request: readers see either the
    /// whole object or none of it. An existing key is replaced.
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<()>;
}

/// S3 or an S3-compatible service (DigitalOcean Spaces, MinIO, ...).
pub struct S3ArtifactStore {
    client: s3::Client,
    bucket: String,
}

impl S3ArtifactStore {
    pub async fn from_config(storage: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest())
            // Retries are bounded by the uploader.
            .retry_config(aws_config::retry::RetryConfig::disabled());
        if let Some(region) = &storage.region {
            loader = loader.region(Region::new(region.clone()));
        }
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        if let Some((access_key_id, secret_access_key)) = &storage.static_credentials {
            loader = loader.credentials_provider(Credentials::new(
                access_key_id,
                secret_access_key,
                None, // session_token
                None, // expiry
                "Static",
            ));
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(storage.endpoint_url.is_some())
            .build();

        S3ArtifactStore {
            client: s3::Client::from_conf(s3_config),
            bucket: storage.bucket_name.clone(),
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    async fn put_object(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        let content_length = body.len() as i64;
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .content_length(content_length)
            .checksum_algorithm(ChecksumAlgorithm::Sha256)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(classify_put_error)?;
        Ok(())
    }
}

fn classify_put_error(err: SdkError<PutObjectError, HttpResponse>) -> AppError {
    let retryable = match &err {
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) | SdkError::ResponseError(_) => true,
        SdkError::ServiceError(ctx) => {
            is_retryable_storage_failure(ctx.raw().status().as_u16(), ctx.err().code())
        }
        _ => false,
    };
    AppError::Storage {
        message: DisplayErrorContext(&err).to_string(),
        retryable,
    }
}

pub fn is_retryable_storage_failure(status: u16, code: Option<&str>) -> bool {
    status == 429
        || status >= 500
        || matches!(
            code,
            Some("SlowDown") | Some("RequestTimeout") | Some("InternalError") | Some("ServiceUnavailable")
        )
}

/// Sends packaged archives to the object store.
#[derive(Clone)]
pub struct Uploader {
    store: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
}

impl Uploader {
    pub fn new(store: Arc<dyn ArtifactStore>, retry: RetryPolicy) -> Self {
        Uploader { store, retry }
    }

    pub async fn upload(&self, key: &ObjectKey, artifact: &ArchiveArtifact) -> Result<()> {
        let key = key.to_string();
        self.retry
            .run("upload archive", || {
                // Bytes clones share the buffer.
                self.store
                    .put_object(&key, artifact.bytes.clone(), ARCHIVE_CONTENT_TYPE)
            })
            .await?;

        info!(
            key = %key,
            archive_bytes = artifact.bytes.len(),
            "uploaded state archive"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::archive::{extract_single_entry, package};
    use crate::backup::object_key::{RunTimestamp, format_key};
    use crate::backup::testing::{FakeArtifactStore, fast_retry};

    fn key_for(ws: &str) -> ObjectKey {
        format_key("terraform_cloud", ws, "acme", RunTimestamp::from_unix(1_700_000_000).unwrap())
    }

    #[tokio::test]
    async fn test_upload_stores_archive_under_key() -> anyhow::Result<()> {
        let store = Arc::new(FakeArtifactStore::new());
        let uploader = Uploader::new(store.clone(), fast_retry(3));
        let artifact = package("ws-1", b"{\"version\":4}")?;

        uploader.upload(&key_for("ws-1"), &artifact).await?;

        let objects = store.objects();
        let stored = objects
            .get("terraform_cloud/2023-11-14/terraform-acme/1700000000_ws-1-backup.zip")
            .expect("object stored under the formatted key");
        let (name, content) = extract_single_entry(stored)?;
        assert_eq!(name, "ws-1.tfstate");
        assert_eq!(content, b"{\"version\":4}");
        Ok(())
    }

    #[tokio::test]
    async fn test_throttled_upload_is_retried() -> anyhow::Result<()> {
        let store = Arc::new(FakeArtifactStore::new().with_put_failures("ws-1", true, 2));
        let uploader = Uploader::new(store.clone(), fast_retry(3));
        let artifact = package("ws-1", b"{}")?;

        uploader.upload(&key_for("ws-1"), &artifact).await?;
        assert_eq!(store.put_calls(), 3);
        assert_eq!(store.objects().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_denied_upload_is_not_retried() -> anyhow::Result<()> {
        let store = Arc::new(FakeArtifactStore::new().with_put_failures("ws-1", false, 1));
        let uploader = Uploader::new(store.clone(), fast_retry(3));
        let artifact = package("ws-1", b"{}")?;

        let result = uploader.upload(&key_for("ws-1"), &artifact).await;
        assert!(matches!(result, Err(AppError::Storage { retryable: false, .. })));
        assert_eq!(store.put_calls(), 1);
        assert!(store.objects().is_empty());
        Ok(())
    }

    #[test]
    fn test_sdk_transport_failures_are_retryable() {
        let timed_out = classify_put_error(SdkError::<PutObjectError, HttpResponse>::timeout_error(
            std::io::Error::new(std::io::ErrorKind::TimedOut, "put timed out"),
        ));
        assert!(matches!(timed_out, AppError::Storage { retryable: true, .. }));
        assert!(timed_out.is_transient());

        let unbuildable = classify_put_error(SdkError::<PutObjectError, HttpResponse>::construction_failure(
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "bucket name missing"),
        ));
        assert!(matches!(unbuildable, AppError::Storage { retryable: false, .. }));
        assert!(!unbuildable.is_transient());
        assert!(unbuildable.to_string().contains("bucket name missing"));
    }

    #[test]
    fn test_storage_failure_classification() {
        assert!(is_retryable_storage_failure(503, Some("SlowDown")));
        assert!(is_retryable_storage_failure(500, None));
        assert!(is_retryable_storage_failure(400, Some("RequestTimeout")));
        assert!(!is_retryable_storage_failure(403, Some("AccessDenied")));
        assert!(!is_retryable_storage_failure(404, Some("NoSuchBucket")));
    }
}
