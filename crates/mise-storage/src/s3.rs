use crate::traits::{ByteReader, ByteStream, ObjectHeaders, Storage, StorageError, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use mise_core::models::{BackendId, BackendKind, ObjectKind};
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::Error as ObjectStoreError;
use object_store::{
    Attribute, Attributes, GetOptions, ObjectStore, ObjectStoreExt, PutMultipartOptions,
    PutOptions, PutPayload, Result as ObjectResult, WriteMultipart,
};
use tokio::io::AsyncReadExt;

/// Part size for multipart uploads of large masters.
const MULTIPART_CHUNK_BYTES: usize = 16 * 1024 * 1024;
/// Parts allowed in flight before the reader is paused.
const MULTIPART_MAX_IN_FLIGHT: usize = 4;
const READ_BUFFER_BYTES: usize = 1024 * 1024;

/// S3-compatible storage implementation (AWS, MinIO, R2, Spaces...)
#[derive(Clone)]
pub struct S3Storage {
    id: BackendId,
    store: AmazonS3,
    bucket: String,
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// # Arguments
    /// * `bucket` - bucket name
    /// * `region` - AWS region (or region identifier for S3-compatible providers)
    /// * `endpoint_url` - custom endpoint for S3-compatible providers; when set, path-style
    ///   addressing is used (e.g. "http://localhost:9000" for MinIO)
    pub fn new(
        id: BackendId,
        bucket: String,
        region: String,
        endpoint_url: Option<String>,
    ) -> StorageResult<Self> {
        // Credentials come from the environment (AWS_ACCESS_KEY_ID etc.).
        let mut builder = AmazonS3Builder::from_env()
            .with_region(region)
            .with_bucket_name(bucket.clone());

        if let Some(ref endpoint) = endpoint_url {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_virtual_hosted_style_request(false)
                .with_allow_http(allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::Config(e.to_string()))?;

        Ok(S3Storage { id, store, bucket })
    }

    /// Only throttling, server errors and transport failures are worth retrying. Every
    /// other refusal (auth, 4xx, failed preconditions) is permanent.
    fn classify(key: &str, err: ObjectStoreError) -> StorageError {
        let message = err.to_string();
        if is_quota_message(&message) {
            return StorageError::QuotaExceeded(message);
        }
        match err {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
            ObjectStoreError::Generic { ref source, .. } => {
                match http_status(source.as_ref()) {
                    Some(507) => StorageError::QuotaExceeded(message),
                    Some(408) | Some(429) => StorageError::Transient(message),
                    Some(status) if (400..500).contains(&status) => {
                        StorageError::Permanent(message)
                    }
                    _ => StorageError::Transient(message),
                }
            }
            ObjectStoreError::JoinError { .. } => StorageError::Transient(message),
            _ => StorageError::Permanent(message),
        }
    }

    fn headers_for(
        key: &str,
        size: u64,
        etag: Option<String>,
        content_type: Option<String>,
    ) -> ObjectHeaders {
        ObjectHeaders {
            size,
            etag,
            content_type: content_type
                .or_else(|| Some(ObjectKind::from_key(key).content_type().to_string())),
        }
    }
}

/// HTTP status carried anywhere in an error's source chain, as rendered by the client's
/// retry layer ("... status code: 400 Bad Request ...").
fn http_status(err: &(dyn std::error::Error + 'static)) -> Option<u16> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(status) = status_in_message(&e.to_string()) {
            return Some(status);
        }
        current = e.source();
    }
    None
}

fn status_in_message(message: &str) -> Option<u16> {
    let lower = message.to_lowercase();
    lower.match_indices("status").find_map(|(at, _)| {
        lower[at..]
            .split(|c: char| !c.is_ascii_digit())
            .find(|part| !part.is_empty())
            .filter(|digits| digits.len() == 3)
            .and_then(|digits| digits.parse::<u16>().ok())
            .filter(|status| (100..600).contains(status))
    })
}

fn is_quota_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("quotaexceeded")
        || lower.contains("quota exceeded")
        || lower.contains("insufficient storage")
        || lower.contains("storagelimitexceeded")
}

#[async_trait]
impl Storage for S3Storage {
    fn backend_id(&self) -> &BackendId {
        &self.id
    }

    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn put(
        &self,
        key: &str,
        data: Bytes,
        content_type: &str,
    ) -> StorageResult<ObjectHeaders> {
        let size = data.len() as u64;
        let location = Path::from(key.to_string());
        let start = std::time::Instant::now();

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let options = PutOptions {
            attributes,
            ..Default::default()
        };

        let result: ObjectResult<_> = self
            .store
            .put_opts(&location, PutPayload::from(data), options)
            .await;

        let put = result.map_err(|e| {
            tracing::error!(
                error = %e,
                backend = %self.id,
                bucket = %self.bucket,
                key = %key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 put failed"
            );
            Self::classify(key, e)
        })?;

        tracing::debug!(
            backend = %self.id,
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 put successful"
        );

        Ok(ObjectHeaders {
            size,
            etag: put.e_tag,
            content_type: Some(content_type.to_string()),
        })
    }

    async fn put_stream(
        &self,
        key: &str,
        mut reader: ByteReader,
        content_type: &str,
    ) -> StorageResult<ObjectHeaders> {
        let location = Path::from(key.to_string());
        let start = std::time::Instant::now();

        let mut attributes = Attributes::new();
        attributes.insert(Attribute::ContentType, content_type.to_string().into());
        let options = PutMultipartOptions {
            attributes,
            ..Default::default()
        };
        let upload = self
            .store
            .put_multipart_opts(&location, options)
            .await
            .map_err(|e| Self::classify(key, e))?;
        let mut writer = WriteMultipart::new_with_chunk_size(upload, MULTIPART_CHUNK_BYTES);

        let mut buffer = vec![0u8; READ_BUFFER_BYTES];
        let mut total: u64 = 0;
        loop {
            let read = match reader.read(&mut buffer).await {
                Ok(read) => read,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(StorageError::Io(e));
                }
            };
            if read == 0 {
                break;
            }
            if let Err(e) = writer.wait_for_capacity(MULTIPART_MAX_IN_FLIGHT).await {
                let _ = writer.abort().await;
                return Err(Self::classify(key, e));
            }
            writer.write(&buffer[..read]);
            total += read as u64;
        }

        let put = writer.finish().await.map_err(|e| {
            tracing::error!(
                error = %e,
                backend = %self.id,
                bucket = %self.bucket,
                key = %key,
                size_bytes = total,
                "S3 multipart upload failed"
            );
            Self::classify(key, e)
        })?;

        tracing::info!(
            backend = %self.id,
            bucket = %self.bucket,
            key = %key,
            size_bytes = total,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 multipart upload successful"
        );

        Ok(Self::headers_for(
            key,
            total,
            put.e_tag,
            Some(content_type.to_string()),
        ))
    }

    async fn get(&self, key: &str) -> StorageResult<Bytes> {
        let start = std::time::Instant::now();
        let location = Path::from(key.to_string());

        let result: ObjectResult<_> = self.store.get(&location).await;
        let result = result.map_err(|e| Self::classify(key, e))?;

        let bytes = result
            .bytes()
            .await
            .map_err(|e| Self::classify(key, e))?;

        tracing::debug!(
            backend = %self.id,
            bucket = %self.bucket,
            key = %key,
            size_bytes = bytes.len() as u64,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 get successful"
        );

        Ok(bytes)
    }

    async fn get_stream(&self, key: &str) -> StorageResult<ByteStream> {
        let location = Path::from(key.to_string());

        let result: ObjectResult<_> = self.store.get(&location).await;
        let result = result.map_err(|e| Self::classify(key, e))?;

        let backend = self.id.clone();
        let owned_key = key.to_string();

        let stream = result.into_stream().map(move |res| match res {
            Ok(bytes) => Ok(bytes),
            Err(e) => {
                tracing::error!(
                    error = %e,
                    backend = %backend,
                    key = %owned_key,
                    "S3 stream read error"
                );
                Err(Self::classify(&owned_key, e))
            }
        });

        Ok(Box::pin(stream))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let location = Path::from(key.to_string());

        // S3 deletes are idempotent; probe first so a missing key surfaces as NotFound.
        self.store
            .head(&location)
            .await
            .map_err(|e| Self::classify(key, e))?;

        let result: ObjectResult<_> = self.store.delete(&location).await;
        result.map_err(|e| {
            tracing::error!(
                error = %e,
                backend = %self.id,
                bucket = %self.bucket,
                key = %key,
                "S3 delete failed"
            );
            Self::classify(key, e)
        })?;

        tracing::debug!(backend = %self.id, bucket = %self.bucket, key = %key, "S3 delete successful");
        Ok(())
    }

    async fn head(&self, key: &str) -> StorageResult<ObjectHeaders> {
        let location = Path::from(key.to_string());
        // A HEAD through get_opts also returns the attributes stored with the object.
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = self
            .store
            .get_opts(&location, options)
            .await
            .map_err(|e| Self::classify(key, e))?;
        let content_type = result
            .attributes
            .get(&Attribute::ContentType)
            .map(|value| value.to_string());
        Ok(Self::headers_for(
            key,
            result.meta.size as u64,
            result.meta.e_tag,
            content_type,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_messages_detected() {
        assert!(is_quota_message("Generic S3 error: QuotaExceeded: bucket full"));
        assert!(is_quota_message("HTTP 507 Insufficient Storage"));
        assert!(!is_quota_message("HTTP 503 Slow Down"));
    }

    #[test]
    fn not_found_and_permission_errors_classified() {
        let not_found = ObjectStoreError::NotFound {
            path: "a/b".to_string(),
            source: "missing".into(),
        };
        assert!(matches!(
            S3Storage::classify("a/b", not_found),
            StorageError::NotFound(_)
        ));

        let denied = ObjectStoreError::PermissionDenied {
            path: "a/b".to_string(),
            source: "403".into(),
        };
        assert!(matches!(
            S3Storage::classify("a/b", denied),
            StorageError::Permanent(_)
        ));

        let generic = ObjectStoreError::Generic {
            store: "S3",
            source: "connection reset".into(),
        };
        assert!(S3Storage::classify("a/b", generic).is_retryable());
    }

    fn generic(source: &str) -> ObjectStoreError {
        ObjectStoreError::Generic {
            store: "S3",
            source: source.to_string().into(),
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for source in [
            "Server returned non-2xx status code: 400 Bad Request: <Error>MalformedXML</Error>",
            "Server returned non-2xx status code: 411 Length Required",
            "Server returned non-2xx status code: 413 Payload Too Large: EntityTooLarge",
        ] {
            let err = S3Storage::classify("a/b", generic(source));
            assert!(matches!(err, StorageError::Permanent(_)), "{}", source);
            assert!(!err.is_retryable());
        }

        let precondition = ObjectStoreError::Precondition {
            path: "a/b".to_string(),
            source: "etag mismatch".into(),
        };
        assert!(matches!(
            S3Storage::classify("a/b", precondition),
            StorageError::Permanent(_)
        ));

        let exists = ObjectStoreError::AlreadyExists {
            path: "a/b".to_string(),
            source: "exists".into(),
        };
        assert!(matches!(
            S3Storage::classify("a/b", exists),
            StorageError::Permanent(_)
        ));

        let not_modified = ObjectStoreError::NotModified {
            path: "a/b".to_string(),
            source: "304".into(),
        };
        assert!(matches!(
            S3Storage::classify("a/b", not_modified),
            StorageError::Permanent(_)
        ));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        for source in [
            "Server returned non-2xx status code: 503 Service Unavailable: SlowDown",
            "Server returned non-2xx status code: 429 Too Many Requests",
            "Server returned non-2xx status code: 500 Internal Server Error",
        ] {
            assert!(
                S3Storage::classify("a/b", generic(source)).is_retryable(),
                "{}",
                source
            );
        }
        assert!(matches!(
            S3Storage::classify("a/b", generic("status code: 507 Insufficient Storage")),
            StorageError::QuotaExceeded(_)
        ));
    }

    #[test]
    fn status_parsed_from_message() {
        assert_eq!(status_in_message("non-2xx status code: 404 Not Found"), Some(404));
        assert_eq!(status_in_message("HTTP status 503"), Some(503));
        assert_eq!(status_in_message("connection reset by peer"), None);
        assert_eq!(status_in_message("status unknown, retried 10 times"), None);
    }
}
