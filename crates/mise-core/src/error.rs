//! Error types module
//!
//! `AppError` is the error taxonomy surfaced to callers of the pipeline: uploaders, players
//! and operators. Storage and encoder failures are mapped into it at the service boundary.
//!
//! `Denied` deliberately shares its HTTP status, code and client message with `NotFound` so
//! an unauthorized caller cannot probe whether an object exists.

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected errors like validation failures
    Debug,
    /// Recoverable issues like conflicts or quota
    Warn,
    /// Unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error code (e.g., "CONFLICT")
    fn error_code(&self) -> &'static str;

    /// Whether this error is recoverable (can be retried)
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden in responses
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// Network, 5xx, encoder busy: safe to retry.
    #[error("Transient error: {0}")]
    Transient(String),

    /// Auth failure at a backend, malformed request, bad input: never retried.
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// A job is already queued or running for the video.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Access denied: {0}")]
    Denied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error: {message}")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl AppError {
    /// Variant name, used as `error_type` in non-production responses and logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            AppError::Transient(_) => "Transient",
            AppError::Permanent(_) => "Permanent",
            AppError::Conflict(_) => "Conflict",
            // Reported as NotFound even in logs shipped to clients.
            AppError::Denied(_) => "NotFound",
            AppError::NotFound(_) => "NotFound",
            AppError::QuotaExceeded(_) => "QuotaExceeded",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::PayloadTooLarge(_) => "PayloadTooLarge",
            #[cfg(feature = "sqlx")]
            AppError::Database(_) => "Database",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Full error chain for logs and non-production responses.
    pub fn detailed_message(&self) -> String {
        match self {
            AppError::InternalWithSource { message, source } => {
                format!("{}: {:#}", message, source)
            }
            AppError::Denied(_) => AppError::NotFound(String::new()).client_message(),
            other => other.to_string(),
        }
    }
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        match err {
            SqlxError::RowNotFound => AppError::NotFound("Record not found".to_string()),
            other => AppError::Database(other),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

type StaticMetadata = (u16, &'static str, bool, Option<&'static str>, bool, LogLevel);

fn app_error_static_metadata(err: &AppError) -> StaticMetadata {
    match err {
        AppError::Transient(_) => (
            503,
            "TRANSIENT_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Warn,
        ),
        AppError::Permanent(_) => (
            422,
            "PERMANENT_ERROR",
            false,
            Some("Check the request and the uploaded media"),
            false,
            LogLevel::Warn,
        ),
        AppError::Conflict(_) => (
            409,
            "CONFLICT",
            false,
            Some("Wait for the active transcode job to finish"),
            false,
            LogLevel::Debug,
        ),
        AppError::Denied(_) | AppError::NotFound(_) => (
            404,
            "NOT_FOUND",
            false,
            Some("Verify the resource ID exists"),
            false,
            LogLevel::Debug,
        ),
        AppError::QuotaExceeded(_) => (
            507,
            "QUOTA_EXCEEDED",
            false,
            Some("Storage quota reached, contact an operator"),
            true,
            LogLevel::Error,
        ),
        AppError::InvalidInput(_) => (
            400,
            "INVALID_INPUT",
            false,
            Some("Check request parameters and try again"),
            false,
            LogLevel::Debug,
        ),
        AppError::PayloadTooLarge(_) => (
            413,
            "PAYLOAD_TOO_LARGE",
            false,
            Some("Reduce file size"),
            false,
            LogLevel::Debug,
        ),
        #[cfg(feature = "sqlx")]
        AppError::Database(_) => (
            500,
            "DATABASE_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => (
            500,
            "INTERNAL_ERROR",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).2
    }

    fn suggested_action(&self) -> Option<&'static str> {
        app_error_static_metadata(self).3
    }

    fn is_sensitive(&self) -> bool {
        app_error_static_metadata(self).4
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).5
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Transient(_) => "Temporary failure, please retry".to_string(),
            AppError::Permanent(ref msg) => msg.clone(),
            AppError::Conflict(ref msg) => msg.clone(),
            AppError::Denied(_) | AppError::NotFound(_) => "Resource not found".to_string(),
            AppError::QuotaExceeded(_) => "Storage quota exceeded".to_string(),
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::PayloadTooLarge(ref msg) => msg.clone(),
            #[cfg(feature = "sqlx")]
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::Internal(_) | AppError::InternalWithSource { .. } => {
                "Internal server error".to_string()
            }
        }
    }
}
