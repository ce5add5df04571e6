//! Error types for the offline store and sync engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Encryption error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("No cached key could decrypt payload (tried {tried} key versions)")]
    KeyNotAvailable { tried: usize },

    #[error("Key rotation blocked: {pending} operations still queued for sync")]
    RotationBlocked { pending: i64 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Server rejected payload: {0}")]
    ValidationRejected(String),

    #[error("Invalid export filter: {}", .0.join("; "))]
    ExportValidation(Vec<String>),

    #[error("No conflict records match the export filter")]
    EmptyExport,

    #[error("Export cancelled by caller")]
    Cancelled,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            StoreError::Timeout(err.to_string())
        } else {
            StoreError::Network(err.to_string())
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
