//! Object storage behind a narrow async trait, with the S3 implementation.

use crate::config::S3Config;
use crate::error::ObjectStoreError;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Characters left as-is in a `CopySource`: RFC 3986 unreserved plus `/`
const COPY_SOURCE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Inclusive byte range, rendered as an HTTP `Range` header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// The first `len` bytes of an object
    pub fn prefix(len: u64) -> Self {
        Self {
            start: 0,
            end: len.saturating_sub(1),
        }
    }

    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// Durable binary storage keyed by `(bucket, key)`
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Read an object, or only `range` of it
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, ObjectStoreError>;

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError>;

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), ObjectStoreError>;

    /// Time-limited URL a client can PUT an upload to
    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError>;
}

/// S3 (or S3-compatible) object store
pub struct S3ObjectStore {
    client: S3Client,
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            upload_bucket = %config.upload_bucket,
            archive_bucket = %config.archive_bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self { client })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(bucket = %bucket, key = %key))]
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<ByteRange>,
    ) -> Result<Bytes, ObjectStoreError> {
        let sent = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .set_range(range.map(|r| r.header_value()))
            .send()
            .await;

        let output = match sent {
            Ok(output) => output,
            Err(e) => return empty_if_past_end(classify_sdk_error(e, bucket, key), range),
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| ObjectStoreError::Unavailable(format!("reading body of {bucket}/{key}: {e}")))?
            .into_bytes();

        debug!(size_bytes = body.len(), "Object read");
        Ok(body)
    }

    #[instrument(skip(self, body), fields(bucket = %bucket, key = %key, size_bytes = body.len()))]
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;

        debug!("Object written");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> Result<(), ObjectStoreError> {
        self.client
            .copy_object()
            .copy_source(copy_source(src_bucket, src_key))
            .bucket(dst_bucket)
            .key(dst_key)
            .send()
            .await
            .map_err(|e| classify_sdk_error(e, src_bucket, src_key))?;

        debug!("Object copied");
        Ok(())
    }

    async fn presign_put(
        &self,
        bucket: &str,
        key: &str,
        content_type: &str,
        expires_in: Duration,
    ) -> Result<String, ObjectStoreError> {
        let presigning_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| ObjectStoreError::Other(format!("invalid presigning expiry: {e}")))?;

        let presigned = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .content_type(content_type)
            .presigned(presigning_config)
            .await
            .map_err(|e| classify_sdk_error(e, bucket, key))?;

        Ok(presigned.uri().to_string())
    }
}

/// `bucket/key` with the key percent-encoded, as `CopyObject` expects
fn copy_source(bucket: &str, key: &str) -> String {
    format!("{bucket}/{}", utf8_percent_encode(key, COPY_SOURCE))
}

/// A ranged read past the end of the object (S3 answers 416) reads as no bytes
fn empty_if_past_end(err: ObjectStoreError, range: Option<ByteRange>) -> Result<Bytes, ObjectStoreError> {
    match err {
        ObjectStoreError::RangeNotSatisfiable { .. } if range.is_some() => {
            debug!("Range starts past end of object, reading as empty");
            Ok(Bytes::new())
        }
        other => Err(other),
    }
}

/// Map an SDK failure onto the transient/non-transient taxonomy
fn classify_sdk_error<E>(err: SdkError<E, HttpResponse>, bucket: &str, key: &str) -> ObjectStoreError
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let message = DisplayErrorContext(&err).to_string();

    match &err {
        SdkError::TimeoutError(_) => ObjectStoreError::Timeout(message),
        SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            ObjectStoreError::Unavailable(message)
        }
        SdkError::ServiceError(service) => classify_service_error(
            service.err().code(),
            service.raw().status().as_u16(),
            message,
            bucket,
            key,
        ),
        _ => ObjectStoreError::Other(message),
    }
}

/// Classify a service response by S3 error code, falling back to HTTP status
fn classify_service_error(
    code: Option<&str>,
    status: u16,
    message: String,
    bucket: &str,
    key: &str,
) -> ObjectStoreError {
    let not_found = || ObjectStoreError::NotFound {
        bucket: bucket.to_string(),
        key: key.to_string(),
    };

    match code {
        Some("NoSuchKey") | Some("NotFound") | Some("NoSuchBucket") => not_found(),
        Some("InvalidRange") => ObjectStoreError::RangeNotSatisfiable {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        Some("SlowDown") | Some("Throttling") | Some("ThrottlingException")
        | Some("RequestLimitExceeded") => ObjectStoreError::Throttled(message),
        Some("RequestTimeout") => ObjectStoreError::Timeout(message),
        _ if status == 404 => not_found(),
        _ if status == 416 => ObjectStoreError::RangeNotSatisfiable {
            bucket: bucket.to_string(),
            key: key.to_string(),
        },
        _ if status == 429 => ObjectStoreError::Throttled(message),
        _ if status >= 500 => ObjectStoreError::Unavailable(message),
        _ => ObjectStoreError::Other(message),
    }
}
