use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("Platform crypto unavailable: {0}")]
    CryptoUnavailable(String),

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Decryption failed: authentication tag mismatch")]
    DecryptionFailed,

    #[error("Invalid key material: {0}")]
    InvalidKey(String),

    #[error("Invalid key length: expected {expected}, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Invalid encrypted data format: {0}")]
    InvalidFormat(String),

    #[error("Invalid UTF-8 in decrypted data: {0}")]
    InvalidUtf8(String),
}

pub type CryptoResult<T> = Result<T, CryptoError>;
