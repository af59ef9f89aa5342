//! Error taxonomy for the LSIF server

use std::sync::Arc;

use lsif_domain::ValidationError;
use thiserror::Error;

type Source = Arc<dyn std::error::Error + Send + Sync>;

/// Main error type for LSIF server operations
///
/// Sources are reference counted so a single failure can be handed to every
/// caller waiting on the same cache construction.
#[derive(Error, Debug, Clone)]
pub enum LsifError {
    #[error("{message}")]
    ValidationError { field: String, message: String },

    #[error("Method must be one of {}", supported.join(", "))]
    UnsupportedMethod { method: String, supported: Vec<String> },

    #[error("No LSIF data available for {key}")]
    NotFound { key: String },

    #[error("The size of the given LSIF file ({size} bytes) exceeds the max of {max}")]
    PayloadTooLarge { size: u64, max: u64 },

    #[error(
        "The size of the given LSIF file ({actual} bytes) exceeds the specified Content-Length {declared}"
    )]
    SizeMismatch { declared: u64, actual: u64 },

    #[error("Corrupt LSIF database {path}: {reason}")]
    CorruptIndex {
        path: String,
        reason: String,
        #[source]
        source: Option<Source>,
    },

    #[error("Storage operation failed: {operation}")]
    StorageError {
        operation: String,
        #[source]
        source: Option<Source>,
    },

    #[error("Queue backend unavailable: {operation}")]
    QueueUnavailable {
        operation: String,
        #[source]
        source: Option<Source>,
    },

    #[error("Configuration error: {field}")]
    ConfigurationError {
        field: String,
        #[source]
        source: Option<Source>,
    },

    #[error("Internal server error: {message}")]
    InternalError {
        message: String,
        #[source]
        source: Option<Source>,
    },
}

impl LsifError {
    /// Create a new validation error
    pub fn validation_error(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError { field: field.into(), message: message.into() }
    }

    /// Create a new unsupported method error
    pub fn unsupported_method(method: impl Into<String>, supported: &[&str]) -> Self {
        Self::UnsupportedMethod {
            method: method.into(),
            supported: supported.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Create a new not found error
    pub fn not_found(key: impl ToString) -> Self {
        Self::NotFound { key: key.to_string() }
    }

    /// Create a new corrupt index error
    pub fn corrupt_index(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptIndex { path: path.into(), reason: reason.into(), source: None }
    }

    /// Create a new corrupt index error with source
    pub fn corrupt_index_with_source(
        path: impl Into<String>,
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::CorruptIndex {
            path: path.into(),
            reason: reason.into(),
            source: Some(Arc::new(source)),
        }
    }

    /// Create a new storage error
    pub fn storage_error(operation: impl Into<String>) -> Self {
        Self::StorageError { operation: operation.into(), source: None }
    }

    /// Create a new storage error with source
    pub fn storage_error_with_source(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::StorageError { operation: operation.into(), source: Some(Arc::new(source)) }
    }

    /// Create a new queue error with source
    pub fn queue_unavailable_with_source(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::QueueUnavailable { operation: operation.into(), source: Some(Arc::new(source)) }
    }

    /// Create a new configuration error
    pub fn configuration_error(field: impl Into<String>) -> Self {
        Self::ConfigurationError { field: field.into(), source: None }
    }

    /// Create a new configuration error with source
    pub fn configuration_error_with_source(
        field: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::ConfigurationError { field: field.into(), source: Some(Arc::new(source)) }
    }

    /// Create a new internal error
    pub fn internal_error(message: impl Into<String>) -> Self {
        Self::InternalError { message: message.into(), source: None }
    }

    /// Get the error code for HTTP responses
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::UnsupportedMethod { .. } => "UNSUPPORTED_METHOD",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::CorruptIndex { .. } => "CORRUPT_INDEX",
            Self::StorageError { .. } => "STORAGE_ERROR",
            Self::QueueUnavailable { .. } => "QUEUE_UNAVAILABLE",
            Self::ConfigurationError { .. } => "CONFIGURATION_ERROR",
            Self::InternalError { .. } => "INTERNAL_ERROR",
        }
    }

    /// Get the HTTP status code for this error
    pub fn http_status_code(&self) -> u16 {
        match self {
            Self::ValidationError { .. } => 400,
            Self::PayloadTooLarge { .. } => 400,
            Self::SizeMismatch { .. } => 400,
            Self::UnsupportedMethod { .. } => 422,
            Self::NotFound { .. } => 404,
            Self::CorruptIndex { .. } => 500,
            Self::StorageError { .. } => 500,
            Self::QueueUnavailable { .. } => 500,
            Self::ConfigurationError { .. } => 500,
            Self::InternalError { .. } => 500,
        }
    }

    /// Missing data is an expected outcome, not a failure
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the process can no longer do its job and should exit
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::QueueUnavailable { .. })
    }
}

/// Result type alias for LSIF server operations
pub type Result<T> = std::result::Result<T, LsifError>;

impl From<ValidationError> for LsifError {
    fn from(err: ValidationError) -> Self {
        Self::ValidationError { field: err.field().to_string(), message: err.to_string() }
    }
}
