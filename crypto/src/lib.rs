//! Payload encryption for the relief offline store
//!
//! Provides:
//! - AES-256-GCM authenticated encryption of persisted payloads
//! - Base64 key material export/import for the local key table
//! - Key rotation schedule helpers (90-day period, bounded retention)
//!
//! Plaintext never touches persistent storage: the store seals every
//! record payload through [`PayloadCipher`] on the way in.

pub mod aes_gcm;
pub mod error;
pub mod rotation;

pub use aes_gcm::{export_key, import_key, PayloadCipher, KEY_LEN, NONCE_LEN};
pub use error::{CryptoError, CryptoResult};
