use crate::error::{CryptoError, CryptoResult};
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use zeroize::ZeroizeOnDrop;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// GCM nonce length in bytes (96 bits, recommended for GCM)
pub const NONCE_LEN: usize = 12;

/// AES-256-GCM payload cipher
///
/// Encrypts record payloads before they reach persistent storage:
/// - fresh random 96-bit nonce per call (never reused for the same key)
/// - authentication tag for integrity
/// - output is `base64(nonce || ciphertext)` as a single string
/// - key material zeroized on drop
///
/// The cipher is deliberately version-agnostic: the store records which
/// key version sealed each payload next to the ciphertext, and the keyring
/// picks the candidate cipher to try.
#[derive(ZeroizeOnDrop)]
pub struct PayloadCipher {
    #[zeroize(skip)]
    cipher: Aes256Gcm,
    /// Raw key - automatically zeroized on drop
    key: [u8; KEY_LEN],
}

impl PayloadCipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(key: [u8; KEY_LEN]) -> CryptoResult<Self> {
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| CryptoError::CryptoUnavailable(e.to_string()))?;

        Ok(Self { cipher, key })
    }

    /// Create from base64-encoded key material
    pub fn from_exported(material: &str) -> CryptoResult<Self> {
        Self::new(import_key(material)?)
    }

    /// Generate a new random 256-bit key (cryptographically secure)
    pub fn generate_key() -> [u8; KEY_LEN] {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        key
    }

    /// Base64-encoded form of this cipher's key, suitable for the key table
    pub fn export(&self) -> String {
        export_key(&self.key)
    }

    /// Encrypt a plaintext string into `base64(nonce || ciphertext)`
    pub fn encrypt_string(&self, plaintext: &str) -> CryptoResult<String> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(sealed))
    }

    /// Decrypt a `base64(nonce || ciphertext)` string
    ///
    /// Fails with [`CryptoError::DecryptionFailed`] when the authentication
    /// tag does not verify (wrong key or tampered data). Callers treat that
    /// as "try a different key", not as corrupted storage.
    pub fn decrypt_string(&self, encoded: &str) -> CryptoResult<String> {
        let sealed = BASE64
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidFormat(e.to_string()))?;

        if sealed.len() < NONCE_LEN {
            return Err(CryptoError::InvalidFormat(format!(
                "sealed payload too short: {} bytes",
                sealed.len()
            )));
        }

        let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let plaintext = self
            .cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|e| CryptoError::InvalidUtf8(e.to_string()))
    }
}

/// Serialize key material to a storable base64 string
pub fn export_key(key: &[u8; KEY_LEN]) -> String {
    BASE64.encode(key)
}

/// Deserialize key material from its base64 form
///
/// Round trip is lossless: `import_key(&export_key(&k)) == Ok(k)`.
pub fn import_key(material: &str) -> CryptoResult<[u8; KEY_LEN]> {
    let bytes = BASE64
        .decode(material)
        .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;

    if bytes.len() != KEY_LEN {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_LEN,
            got: bytes.len(),
        });
    }

    let mut key = [0u8; KEY_LEN];
    key.copy_from_slice(&bytes);
    Ok(key)
}
