use thiserror::Error;

use crate::models::ServiceState;

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Service is already initialized")]
    AlreadyInitialized,

    #[error("Service is not initialized")]
    NotInitialized,

    #[error("Service is already running")]
    AlreadyRunning,

    #[error("Service is not running (state: {0})")]
    NotRunning(ServiceState),

    #[error("Refusing to apply a peer list with no enabled peers")]
    NoPeersEnabled,

    #[error("Resource busy: {0}")]
    ResourceBusy(String),

    #[error("Backup authentication failed: wrong password or corrupted file")]
    AuthenticationFailed,

    #[error("Invalid backup file: {0}")]
    InvalidBackup(String),

    #[error("Partial restore: configuration was replaced but storage was not: {0}")]
    PartialRestore(String),

    #[error("Operation timed out: {0}")]
    OperationTimedOut(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid peer URI: {0}")]
    InvalidUri(String),

    #[error("Engine error: {0}")]
    EngineError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    IoError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("HTTP request error: {0}")]
    RequestError(String),

    #[error("Encryption error: {0}")]
    CryptoError(String),

    #[error("Task join error: {0}")]
    TaskJoinError(String),
}

// Utility methods for error classification
impl AppError {
    /// Conditions that may succeed if the caller retries later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::ResourceBusy(_) | AppError::OperationTimedOut(_) | AppError::IoError(_)
        )
    }

    /// A deliberate stop, not something to alert the user about
    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::Cancelled)
    }

    pub fn from_io_error(err: std::io::Error) -> Self {
        AppError::IoError(err.to_string())
    }

    pub fn from_serde_error(err: serde_json::Error) -> Self {
        AppError::SerializationError(err.to_string())
    }
}

// From trait implementations for common error types
impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::from_io_error(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::from_serde_error(err)
    }
}

impl From<bincode::Error> for AppError {
    fn from(err: bincode::Error) -> Self {
        AppError::SerializationError(err.to_string())
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::RequestError(err.to_string())
    }
}

impl From<tokio::task::JoinError> for AppError {
    fn from(err: tokio::task::JoinError) -> Self {
        AppError::TaskJoinError(err.to_string())
    }
}

impl From<std::env::VarError> for AppError {
    fn from(err: std::env::VarError) -> Self {
        AppError::ConfigError(format!("Environment variable error: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_timeout_are_retryable() {
        assert!(AppError::ResourceBusy("storage".into()).is_retryable());
        assert!(AppError::OperationTimedOut("stop".into()).is_retryable());
        assert!(!AppError::AuthenticationFailed.is_retryable());
        assert!(!AppError::PartialRestore("disk full".into()).is_retryable());
    }

    #[test]
    fn cancelled_is_not_an_alert() {
        assert!(AppError::Cancelled.is_cancelled());
        assert!(!AppError::NoPeersEnabled.is_cancelled());
    }
}
