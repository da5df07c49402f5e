use thiserror::Error;
use uuid::Uuid;

use crate::domains::core::file_storage_service::FileStorageError;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Error executing statement: {0}")]
    Execution(String),

    #[error("Record not found: {0} with ID {1}")]
    NotFound(String, String),

    #[error("Database error: {0}")]
    Other(String),
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::Query(s) => DbError::Query(s.clone()),
            DbError::Execution(s) => DbError::Execution(s.clone()),
            DbError::NotFound(s1, s2) => DbError::NotFound(s1.clone(), s2.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Entity not found: {0} with ID {1}")]
    EntityNotFound(String, Uuid),

    #[error("Export exceeds maximum rows limit of {max} (query matched {total})")]
    RowLimitExceeded { max: u64, total: u64 },

    #[error("No columns selected for export")]
    NoColumnsSelected,

    #[error("Unknown column: {0}")]
    UnknownColumn(String),

    #[error("Unknown storage disk: {0}")]
    UnknownDisk(String),

    #[error("File error: {0}")]
    File(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("External error: {0}")]
    External(String),
}

impl From<FileStorageError> for DomainError {
    fn from(error: FileStorageError) -> Self {
        match error {
            FileStorageError::NotFound(path) => DomainError::File(format!("not found: {}", path)),
            other => DomainError::External(format!("File storage error: {}", other)),
        }
    }
}

/// Service-level errors (application specific)
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Authentication error: {0}")]
    Authentication(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}
