//! Key cache and rotation protocol
//!
//! Owns the process-wide view of payload keys:
//! - lazy, single-flight initialization of the first key
//! - an ordered candidate list for decryption (hinted version first, then
//!   active, then retained historical keys newest-first)
//! - the all-or-nothing rotation protocol with a compensating reactivation
//!   of the previous key on mid-rotation failure
//!
//! All state sits behind one `tokio` mutex, so concurrent first uses share
//! a single in-flight initialization instead of racing.

use crate::error::{StoreError, StoreResult};
use crate::local_db::LocalDatabase;
use crate::models::KeyRotationStatus;
use chrono::Utc;
use crypto::rotation::{self, MAX_RETAINED_KEYS};
use crypto::{CryptoError, PayloadCipher};
use tokio::sync::Mutex;

/// Key name used for all record payloads
pub const PRIMARY_KEY_NAME: &str = "primary";

struct CachedKey {
    version: i64,
    cipher: PayloadCipher,
}

/// In-memory key cache over the `encryption_keys` table
pub struct Keyring {
    key_name: String,
    /// Active key first, then historical keys newest-first.
    /// Empty until first use.
    cache: Mutex<Vec<CachedKey>>,
}

impl Keyring {
    pub fn new() -> Self {
        Self {
            key_name: PRIMARY_KEY_NAME.to_string(),
            cache: Mutex::new(Vec::new()),
        }
    }

    /// Load the cache from the key table, generating the first key if the
    /// table is empty. Holding the mutex across the load gives the
    /// single-in-flight initialization the store promises.
    async fn load_locked(
        &self,
        db: &LocalDatabase,
        cache: &mut Vec<CachedKey>,
    ) -> StoreResult<()> {
        if !cache.is_empty() {
            return Ok(());
        }

        let mut records = db.keys_for(&self.key_name).await?;

        if records.iter().all(|k| !k.is_active) {
            let now = Utc::now();
            let version = records.first().map(|k| k.version + 1).unwrap_or(1);
            let key = PayloadCipher::generate_key();
            let material = crypto::export_key(&key);

            db.insert_key(
                &self.key_name,
                &material,
                version,
                now,
                rotation::next_rotation_date(now),
                true,
            )
            .await?;

            tracing::info!(key_name = %self.key_name, version, "Generated initial payload key");
            records = db.keys_for(&self.key_name).await?;
        }

        // Active key first, then historical newest-first (records arrive
        // version-descending already)
        records.sort_by_key(|k| (!k.is_active, std::cmp::Reverse(k.version)));

        let mut loaded = Vec::with_capacity(records.len());
        for record in &records {
            loaded.push(CachedKey {
                version: record.version,
                cipher: PayloadCipher::from_exported(&record.material)?,
            });
        }

        if let Some(active) = records.first() {
            db.touch_key(active.id, Utc::now()).await?;
        }

        *cache = loaded;
        Ok(())
    }

    /// Encrypt a plaintext payload under the active key.
    /// Returns the sealed payload and the key version that sealed it.
    pub async fn seal(&self, db: &LocalDatabase, plaintext: &str) -> StoreResult<(String, i64)> {
        let mut cache = self.cache.lock().await;
        self.load_locked(db, &mut cache).await?;

        let active = cache
            .first()
            .ok_or_else(|| StoreError::Internal("key cache empty after init".to_string()))?;

        let sealed = active.cipher.encrypt_string(plaintext)?;
        Ok((sealed, active.version))
    }

    /// Decrypt a sealed payload, trying candidate keys in order: the hinted
    /// version first, then the active key, then historical keys
    /// newest-first. Exhaustion is the named [`StoreError::KeyNotAvailable`]
    /// so batch readers can skip the one bad record and continue.
    pub async fn open(
        &self,
        db: &LocalDatabase,
        sealed: &str,
        key_version_hint: Option<i64>,
    ) -> StoreResult<String> {
        let mut cache = self.cache.lock().await;
        self.load_locked(db, &mut cache).await?;

        let hinted = key_version_hint
            .and_then(|v| cache.iter().position(|k| k.version == v));

        let candidates = hinted
            .into_iter()
            .chain((0..cache.len()).filter(|i| Some(*i) != hinted));

        let mut tried = 0usize;
        for index in candidates {
            tried += 1;
            match cache[index].cipher.decrypt_string(sealed) {
                Ok(plaintext) => return Ok(plaintext),
                // Wrong key - try the next candidate
                Err(CryptoError::DecryptionFailed) => continue,
                // Anything else is corrupted storage, not a key mismatch
                Err(e) => return Err(e.into()),
            }
        }

        Err(StoreError::KeyNotAvailable { tried })
    }

    /// Version of the currently active key
    pub async fn active_version(&self, db: &LocalDatabase) -> StoreResult<i64> {
        let mut cache = self.cache.lock().await;
        self.load_locked(db, &mut cache).await?;

        cache
            .first()
            .map(|k| k.version)
            .ok_or_else(|| StoreError::Internal("key cache empty after init".to_string()))
    }

    /// Rotation may only proceed while nothing is queued for sync
    pub async fn can_rotate(&self, db: &LocalDatabase) -> StoreResult<bool> {
        Ok(db.queue_count().await? == 0)
    }

    /// Rotate the active key: deactivate the current key, persist a new
    /// active key with the next version, prune historical keys beyond the
    /// retention bound. All-or-nothing: any mid-rotation failure reactivates
    /// the previous key before the error is re-raised.
    pub async fn rotate(&self, db: &LocalDatabase) -> StoreResult<i64> {
        let mut cache = self.cache.lock().await;
        self.load_locked(db, &mut cache).await?;

        let pending = db.queue_count().await?;
        if pending > 0 {
            return Err(StoreError::RotationBlocked { pending });
        }

        let old = db
            .active_key(&self.key_name)
            .await?
            .ok_or_else(|| StoreError::Internal("no active key to rotate".to_string()))?;

        db.set_key_active(old.id, false).await?;

        match self.install_new_key(db, old.version + 1).await {
            Ok(new_version) => {
                // Reload so the cache reflects the new active ordering
                cache.clear();
                self.load_locked(db, &mut cache).await?;

                tracing::info!(
                    key_name = %self.key_name,
                    old_version = old.version,
                    new_version,
                    "Rotated payload key"
                );
                Ok(new_version)
            }
            Err(e) => {
                // Compensate: the previous key must come back before the
                // error surfaces, or pre-rotation data loses its active key
                db.set_key_active(old.id, true).await?;

                tracing::warn!(
                    key_name = %self.key_name,
                    version = old.version,
                    error = %e,
                    "Key rotation failed, previous key restored"
                );
                Err(e)
            }
        }
    }

    async fn install_new_key(&self, db: &LocalDatabase, version: i64) -> StoreResult<i64> {
        let now = Utc::now();
        let key = PayloadCipher::generate_key();
        let material = crypto::export_key(&key);

        db.insert_key(
            &self.key_name,
            &material,
            version,
            now,
            rotation::next_rotation_date(now),
            true,
        )
        .await?;

        db.prune_inactive_keys(&self.key_name, MAX_RETAINED_KEYS as i64)
            .await?;

        Ok(version)
    }

    /// Snapshot for the rotation UI
    pub async fn rotation_status(&self, db: &LocalDatabase) -> StoreResult<KeyRotationStatus> {
        {
            let mut cache = self.cache.lock().await;
            self.load_locked(db, &mut cache).await?;
        }

        let active = db
            .active_key(&self.key_name)
            .await?
            .ok_or_else(|| StoreError::Internal("no active key after init".to_string()))?;

        Ok(KeyRotationStatus {
            current_version: active.version,
            should_rotate: rotation::should_rotate(active.created_at),
            next_rotation_date: active.rotation_due_at,
            can_rotate_now: self.can_rotate(db).await?,
        })
    }
}

impl Default for Keyring {
    fn default() -> Self {
        Self::new()
    }
}
