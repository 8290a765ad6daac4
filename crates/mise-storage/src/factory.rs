#[cfg(feature = "storage-local")]
use crate::LocalStorage;
#[cfg(feature = "storage-s3")]
use crate::S3Storage;
use crate::{
    InMemoryStorage, ObjectCatalog, ObjectStoreAdapter, RetryPolicy, Storage, StorageError,
    StorageResult,
};
use mise_core::models::BackendKind;
use mise_core::{BackendConfig, StorageSettings};
use std::sync::Arc;

/// Create one storage backend from its configuration
pub async fn create_backend(config: &BackendConfig) -> StorageResult<Arc<dyn Storage>> {
    match config.kind {
        #[cfg(feature = "storage-s3")]
        BackendKind::S3 => {
            let bucket = config.bucket.clone().ok_or_else(|| {
                StorageError::Config(format!("Bucket not configured for backend {}", config.id))
            })?;
            let region = config
                .region
                .clone()
                .unwrap_or_else(|| "us-east-1".to_string());

            let storage = S3Storage::new(config.id.clone(), bucket, region, config.endpoint.clone())?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-s3"))]
        BackendKind::S3 => Err(StorageError::Config(
            "S3 storage backend not available (storage-s3 feature not enabled)".to_string(),
        )),

        #[cfg(feature = "storage-local")]
        BackendKind::Local => {
            let base_path = config.local_path.clone().ok_or_else(|| {
                StorageError::Config(format!("Path not configured for backend {}", config.id))
            })?;

            let storage = LocalStorage::new(config.id.clone(), base_path).await?;
            Ok(Arc::new(storage))
        }

        #[cfg(not(feature = "storage-local"))]
        BackendKind::Local => Err(StorageError::Config(
            "Local storage backend not available (storage-local feature not enabled)".to_string(),
        )),

        BackendKind::Memory => Ok(Arc::new(InMemoryStorage::new(config.id.clone()))),
    }
}

/// Build every configured backend and wrap them in an adapter over `catalog`.
pub async fn create_adapter(
    settings: &StorageSettings,
    catalog: Arc<dyn ObjectCatalog>,
) -> StorageResult<ObjectStoreAdapter> {
    let mut backends = Vec::with_capacity(settings.backends.len());
    for backend in &settings.backends {
        let storage = create_backend(backend).await?;
        tracing::info!(
            backend = %backend.id,
            kind = %backend.kind,
            primary = backend.id == settings.primary,
            "Storage backend initialized"
        );
        backends.push(storage);
    }

    let retry = RetryPolicy {
        max_attempts: settings.retry_max_attempts.max(1),
        base_delay: settings.retry_base_delay,
        max_delay: settings.retry_max_delay,
    };

    Ok(
        ObjectStoreAdapter::new(backends, settings.primary.clone(), catalog)?
            .with_retry(retry)
            .with_verify_checksum_max_bytes(settings.verify_checksum_max_bytes),
    )
}
