//! Offline store facade
//!
//! The single entry point application code talks to. Every write seals the
//! payload under the active key before it touches SQLite and queues the
//! matching mutation for sync; every read decrypts on the way out.
//! Plaintext never reaches disk.

use crate::api::SyncApi;
use crate::error::{StoreError, StoreResult};
use crate::export::ConflictExporter;
use crate::keyring::Keyring;
use crate::local_db::{LocalDatabase, StoreConfig};
use crate::models::{
    KeyRotationStatus, PendingOperation, Record, RecordKind, StorageInfo, StoredRecord,
    SyncAction, SyncStatus,
};
use crate::queue;
use crate::reconciler::Reconciler;
use chrono::Utc;
use uuid::Uuid;

/// Encrypted, versioned, offline-first record store
pub struct OfflineStore {
    db: LocalDatabase,
    keyring: Keyring,
}

impl OfflineStore {
    /// Open (creating if necessary) the store at the configured path
    pub async fn open(config: &StoreConfig) -> StoreResult<Self> {
        let db = LocalDatabase::new(config).await?;
        Ok(Self {
            db,
            keyring: Keyring::new(),
        })
    }

    pub async fn add_assessment(
        &self,
        owner_id: Option<&str>,
        data: &serde_json::Value,
    ) -> StoreResult<Uuid> {
        self.add_record(RecordKind::Assessment, owner_id, data).await
    }

    pub async fn add_response(
        &self,
        owner_id: Option<&str>,
        data: &serde_json::Value,
    ) -> StoreResult<Uuid> {
        self.add_record(RecordKind::Response, owner_id, data).await
    }

    pub async fn add_entity(
        &self,
        owner_id: Option<&str>,
        data: &serde_json::Value,
    ) -> StoreResult<Uuid> {
        self.add_record(RecordKind::Entity, owner_id, data).await
    }

    /// Persist a new record and queue its creation for sync.
    /// The record is immediately readable locally with `sync_status =
    /// pending`.
    pub async fn add_record(
        &self,
        kind: RecordKind,
        owner_id: Option<&str>,
        data: &serde_json::Value,
    ) -> StoreResult<Uuid> {
        let plaintext = serde_json::to_string(data)?;
        let (sealed, key_version) = self.keyring.seal(&self.db, &plaintext).await?;

        let now = Utc::now();
        let record = StoredRecord {
            uuid: Uuid::new_v4(),
            owner_id: owner_id.map(str::to_string),
            payload: sealed.clone(),
            key_version,
            version: 0,
            sync_status: SyncStatus::Pending,
            created_at: now,
            last_modified: now,
        };
        self.db.insert_record(kind, &record).await?;

        queue::enqueue(
            &self.db,
            kind,
            SyncAction::Create,
            record.uuid,
            sealed,
            key_version,
        )
        .await?;

        tracing::debug!(kind = kind.as_str(), uuid = %record.uuid, "Stored new record");
        Ok(record.uuid)
    }

    pub async fn get_assessment(&self, uuid: Uuid) -> StoreResult<Option<Record>> {
        self.get_record(RecordKind::Assessment, uuid).await
    }

    pub async fn get_response(&self, uuid: Uuid) -> StoreResult<Option<Record>> {
        self.get_record(RecordKind::Response, uuid).await
    }

    pub async fn get_entity(&self, uuid: Uuid) -> StoreResult<Option<Record>> {
        self.get_record(RecordKind::Entity, uuid).await
    }

    /// Fetch and decrypt one record
    pub async fn get_record(&self, kind: RecordKind, uuid: Uuid) -> StoreResult<Option<Record>> {
        let Some(stored) = self.db.fetch_record(kind, uuid).await? else {
            return Ok(None);
        };

        let plaintext = self
            .keyring
            .open(&self.db, &stored.payload, Some(stored.key_version))
            .await?;

        Ok(Some(Record {
            uuid: stored.uuid,
            owner_id: stored.owner_id,
            data: serde_json::from_str(&plaintext)?,
            key_version: stored.key_version,
            version: stored.version,
            sync_status: stored.sync_status,
            created_at: stored.created_at,
            last_modified: stored.last_modified,
        }))
    }

    /// Replace a record's payload, re-sealed under the current active key,
    /// and queue the update for sync
    pub async fn update_record(
        &self,
        kind: RecordKind,
        uuid: Uuid,
        data: &serde_json::Value,
    ) -> StoreResult<()> {
        let plaintext = serde_json::to_string(data)?;
        let (sealed, key_version) = self.keyring.seal(&self.db, &plaintext).await?;

        self.db
            .update_payload(kind, uuid, &sealed, key_version, Utc::now())
            .await?;

        queue::enqueue(
            &self.db,
            kind,
            SyncAction::Update,
            uuid,
            sealed,
            key_version,
        )
        .await?;

        Ok(())
    }

    /// Reassign a record's owner. Metadata only, so no re-encryption and
    /// nothing to sync.
    pub async fn update_owner(
        &self,
        kind: RecordKind,
        uuid: Uuid,
        owner_id: &str,
    ) -> StoreResult<()> {
        self.db.update_owner(kind, uuid, owner_id, Utc::now()).await
    }

    /// Queue a record's deletion, coalescing against queued writes to the
    /// same record first. A still-queued create means the server has never
    /// seen this record, so the create (and any queued updates) are
    /// cancelled and the row dropped locally - no delete goes on the wire
    /// for an entity the server cannot know. Otherwise the local row
    /// survives, marked pending, until the server confirms; the reconciler
    /// removes it on delivery.
    pub async fn delete_record(&self, kind: RecordKind, uuid: Uuid) -> StoreResult<()> {
        let stored = self
            .db
            .fetch_record(kind, uuid)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("{}/{}", kind.as_str(), uuid)))?;

        // Deletes supersede every queued operation on the same record
        let queued = self.db.queue_items_for_target(kind, uuid).await?;
        let unsent_create = queued.iter().any(|i| i.action == SyncAction::Create);
        for item in &queued {
            self.db.remove_queue_item(item.id).await?;
        }

        if unsent_create {
            self.db.delete_record_row(kind, uuid).await?;

            tracing::debug!(
                kind = kind.as_str(),
                uuid = %uuid,
                cancelled = queued.len(),
                "Cancelled never-synced record locally"
            );
            return Ok(());
        }

        self.db
            .update_payload(kind, uuid, &stored.payload, stored.key_version, Utc::now())
            .await?;

        queue::enqueue(
            &self.db,
            kind,
            SyncAction::Delete,
            uuid,
            stored.payload,
            stored.key_version,
        )
        .await?;

        Ok(())
    }

    /// Queued operations in drain order with payloads decrypted
    pub async fn get_sync_queue(&self, limit: i64) -> StoreResult<Vec<PendingOperation>> {
        queue::pending_operations(&self.db, &self.keyring, limit).await
    }

    /// A reconciler draining this store's queue through `api`
    pub fn reconciler<'a>(&'a self, api: &'a dyn SyncApi) -> Reconciler<'a> {
        Reconciler::new(&self.db, &self.keyring, api)
    }

    /// A conflict report exporter reading through `api`
    pub fn exporter<'a>(&self, api: &'a dyn SyncApi) -> ConflictExporter<'a> {
        ConflictExporter::new(api)
    }

    pub async fn key_rotation_status(&self) -> StoreResult<KeyRotationStatus> {
        self.keyring.rotation_status(&self.db).await
    }

    /// Rotate the payload key now. Fails with
    /// [`StoreError::RotationBlocked`] while anything is queued for sync.
    pub async fn force_key_rotation(&self) -> StoreResult<i64> {
        self.keyring.rotate(&self.db).await
    }

    pub async fn storage_info(&self) -> StoreResult<StorageInfo> {
        Ok(StorageInfo {
            assessments: self.db.count_records(RecordKind::Assessment).await?,
            responses: self.db.count_records(RecordKind::Response).await?,
            entities: self.db.count_records(RecordKind::Entity).await?,
            queued: self.db.queue_count().await?,
            key_version: self.keyring.active_version(&self.db).await?,
        })
    }

    /// Wipe all records, queue items and conflict history. Keys survive so
    /// any off-device backups sealed under them stay recoverable.
    pub async fn clear_all(&self) -> StoreResult<()> {
        self.db.clear_all().await
    }

    pub fn database(&self) -> &LocalDatabase {
        &self.db
    }

    pub fn keyring(&self) -> &Keyring {
        &self.keyring
    }
}
