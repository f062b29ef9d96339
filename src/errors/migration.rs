//! Error taxonomy for migration, transfer and restore operations.
//!
//! Validation and authentication failures happen before any mutation and are
//! always fatal for the call that raised them. Transfer errors distinguish
//! transient conditions (retried with backoff by the transfer engine) from
//! terminal ones. Integrity errors fail the owning job and trigger rollback
//! when a valid checkpoint exists.

use thiserror::Error;

/// Errors raised by the migration subsystem
#[derive(Error, Debug)]
pub enum MigrationError {
    /// Malformed or incomplete archive/bundle, or a manifest checksum mismatch
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Invalid, expired, revoked, consumed or out-of-allowlist token
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Transient transfer failure (timeout, connection reset); retried with backoff
    #[error("Transfer failed (transient): {0}")]
    TransferTransient(String),

    /// Terminal transfer failure (remote file missing, permission denied)
    #[error("Transfer failed: {0}")]
    TransferTerminal(String),

    /// Post-apply verification mismatch
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Unique-key collision the configured policy cannot resolve, or a
    /// destructive operation already holds the target environment
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Job was cancelled by an operator between chunks
    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    /// Referenced job, token or checkpoint does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Underlying storage or database unreachable; never retried
    #[error("Fatal system error: {0}")]
    FatalSystem(String),

    /// Database error
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MigrationError {
    /// Check if this is a client error (400-series)
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MigrationError::Validation(_)
                | MigrationError::Authentication(_)
                | MigrationError::Conflict(_)
                | MigrationError::NotFound(_)
        )
    }

    /// Whether the transfer engine may retry this failure
    pub fn is_transient(&self) -> bool {
        matches!(self, MigrationError::TransferTransient(_))
    }

    /// Get error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            MigrationError::Validation(_) => "VALIDATION_ERROR",
            MigrationError::Authentication(_) => "AUTHENTICATION_ERROR",
            MigrationError::TransferTransient(_) => "TRANSFER_TRANSIENT",
            MigrationError::TransferTerminal(_) => "TRANSFER_TERMINAL",
            MigrationError::Integrity(_) => "INTEGRITY_ERROR",
            MigrationError::Conflict(_) => "CONFLICT_ERROR",
            MigrationError::Cancelled(_) => "CANCELLED",
            MigrationError::NotFound(_) => "NOT_FOUND",
            MigrationError::FatalSystem(_) => "FATAL_SYSTEM_ERROR",
            MigrationError::Database(_) => "DATABASE_ERROR",
            MigrationError::Serialization(_) => "SERIALIZATION_ERROR",
            MigrationError::Io(_) => "IO_ERROR",
        }
    }
}

impl From<reqwest::Error> for MigrationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            MigrationError::TransferTransient(err.to_string())
        } else {
            MigrationError::TransferTerminal(err.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, MigrationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error() {
        let err = MigrationError::Validation("manifest missing".to_string());
        assert_eq!(err.to_string(), "Validation failed: manifest missing");
        assert!(err.is_client_error());
        assert!(!err.is_transient());
        assert_eq!(err.error_code(), "VALIDATION_ERROR");
    }

    #[test]
    fn test_transient_transfer_error() {
        let err = MigrationError::TransferTransient("connection reset".to_string());
        assert!(err.is_transient());
        assert!(!err.is_client_error());
        assert_eq!(err.error_code(), "TRANSFER_TRANSIENT");
    }

    #[test]
    fn test_integrity_error() {
        let err = MigrationError::Integrity("events: expected 10, found 9".to_string());
        assert!(!err.is_client_error());
        assert_eq!(err.error_code(), "INTEGRITY_ERROR");
    }
}
