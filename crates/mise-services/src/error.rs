use mise_core::AppError;
use mise_storage::StorageError;

/// Map a storage failure onto the caller-facing taxonomy.
pub fn storage_app_error(err: StorageError) -> AppError {
    match err {
        StorageError::Transient(msg) => AppError::Transient(msg),
        StorageError::Io(e) => AppError::Transient(e.to_string()),
        StorageError::Catalog(msg) => AppError::Transient(msg),
        StorageError::Permanent(msg) => AppError::Permanent(msg),
        StorageError::QuotaExceeded(msg) => {
            tracing::error!(alert = true, error = %msg, "Storage quota exceeded");
            AppError::QuotaExceeded(msg)
        }
        StorageError::NotFound(key) => AppError::NotFound(format!("Object {} not found", key)),
        StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
        e @ StorageError::IntegrityMismatch { .. } => AppError::Permanent(e.to_string()),
        e @ (StorageError::UnknownBackend(_) | StorageError::Config(_)) => {
            AppError::Internal(e.to_string())
        }
    }
}
