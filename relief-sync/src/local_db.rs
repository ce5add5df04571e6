//! Local SQLite database for offline-first field operations
//!
//! Provides:
//! - Encrypted-at-rest persistence of assessments, responses and entities
//! - Durable sync queue for deferred mutations
//! - Key table with versioned material and single-active invariant
//! - Conflict audit log
//!
//! This layer is deliberately dumb: it moves ciphertext and metadata in and
//! out of SQLite. Encryption lives in the keyring, ordering policy in the
//! queue module, resolution policy in the reconciler.

use crate::error::{StoreError, StoreResult};
use crate::models::{
    ConflictRecord, KeyRecord, QueueItem, RecordKind, StoredRecord, SyncAction, SyncStatus,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use uuid::Uuid;

/// Configuration for the local database
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the database file
    pub db_path: String,
    /// Maximum number of connections in the pool
    pub max_connections: u32,
    /// Whether to enable WAL mode
    pub enable_wal: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "relief_local.db".to_string(),
            max_connections: 5,
            enable_wal: true,
        }
    }
}

/// Local database handle
pub struct LocalDatabase {
    pool: SqlitePool,
}

impl LocalDatabase {
    /// Open (creating if necessary) the local database and its schema
    pub async fn new(config: &StoreConfig) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(&config.db_path)
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        if config.enable_wal {
            sqlx::query("PRAGMA journal_mode = WAL")
                .execute(&pool)
                .await?;
        }

        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&pool)
            .await?;

        let db = Self { pool };
        db.initialize_schema().await?;

        Ok(db)
    }

    /// Initialize database schema
    async fn initialize_schema(&self) -> StoreResult<()> {
        // One table per domain record kind, identical shape
        for kind in RecordKind::ALL {
            let table = kind.table();

            sqlx::query(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {table} (
                    uuid TEXT PRIMARY KEY,
                    owner_id TEXT,
                    payload TEXT NOT NULL,
                    key_version INTEGER NOT NULL,
                    version INTEGER NOT NULL DEFAULT 0,
                    sync_status TEXT NOT NULL,
                    created_at TEXT NOT NULL,
                    last_modified TEXT NOT NULL
                )
                "#
            ))
            .execute(&self.pool)
            .await?;

            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_status ON {table}(sync_status)"
            ))
            .execute(&self.pool)
            .await?;
            sqlx::query(&format!(
                "CREATE INDEX IF NOT EXISTS idx_{table}_modified ON {table}(last_modified)"
            ))
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_queue (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                action TEXT NOT NULL,
                target_uuid TEXT NOT NULL,
                payload TEXT NOT NULL,
                key_version INTEGER NOT NULL,
                priority INTEGER NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                last_attempt TEXT,
                next_retry TEXT,
                last_error TEXT,
                enqueued_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_sync_queue_order ON sync_queue(priority DESC, enqueued_at)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_sync_queue_retry ON sync_queue(next_retry)")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS encryption_keys (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                key_name TEXT NOT NULL,
                material TEXT NOT NULL,
                version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                last_used_at TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                rotation_due_at TEXT NOT NULL,
                UNIQUE(key_name, version)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_keys_active ON encryption_keys(key_name, is_active)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS conflict_log (
                id TEXT PRIMARY KEY,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                conflict_date TEXT NOT NULL,
                resolution_method TEXT NOT NULL,
                local_version INTEGER NOT NULL,
                server_version INTEGER NOT NULL,
                is_resolved INTEGER NOT NULL DEFAULT 0,
                resolved_at TEXT,
                resolved_by TEXT,
                auto_resolved INTEGER NOT NULL DEFAULT 0,
                reason TEXT NOT NULL,
                local_last_modified TEXT NOT NULL,
                server_last_modified TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_conflict_entity ON conflict_log(entity_type, entity_id)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    // ---- domain records ----

    /// Insert a freshly sealed record
    pub async fn insert_record(&self, kind: RecordKind, rec: &StoredRecord) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (uuid, owner_id, payload, key_version, version,
                            sync_status, created_at, last_modified)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            kind.table()
        ))
        .bind(rec.uuid.to_string())
        .bind(&rec.owner_id)
        .bind(&rec.payload)
        .bind(rec.key_version)
        .bind(rec.version)
        .bind(rec.sync_status.as_str())
        .bind(rec.created_at.to_rfc3339())
        .bind(rec.last_modified.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Fetch a record by uuid, payload still sealed
    pub async fn fetch_record(
        &self,
        kind: RecordKind,
        uuid: Uuid,
    ) -> StoreResult<Option<StoredRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT uuid, owner_id, payload, key_version, version,
                   sync_status, created_at, last_modified
            FROM {} WHERE uuid = ?
            "#,
            kind.table()
        ))
        .bind(uuid.to_string())
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_record_row).transpose()
    }

    /// Replace a record's sealed payload, bumping key version and mtime
    pub async fn update_payload(
        &self,
        kind: RecordKind,
        uuid: Uuid,
        payload: &str,
        key_version: i64,
        last_modified: DateTime<Utc>,
    ) -> StoreResult<()> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET payload = ?, key_version = ?, last_modified = ?,
                          sync_status = 'pending'
            WHERE uuid = ?
            "#,
            kind.table()
        ))
        .bind(payload)
        .bind(key_version)
        .bind(last_modified.to_rfc3339())
        .bind(uuid.to_string())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(format!(
                "{}/{}",
                kind.as_str(),
                uuid
            )));
        }
        Ok(())
    }

    /// Update non-payload metadata (owner) without re-encryption
    pub async fn update_owner(
        &self,
        kind: RecordKind,
        uuid: Uuid,
        owner_id: &str,
        last_modified: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET owner_id = ?, last_modified = ? WHERE uuid = ?",
            kind.table()
        ))
        .bind(owner_id)
        .bind(last_modified.to_rfc3339())
        .bind(uuid.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a record delivered, stamping the server-assigned version
    pub async fn mark_record_synced(
        &self,
        kind: RecordKind,
        uuid: Uuid,
        server_version: i64,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET sync_status = 'synced', version = ? WHERE uuid = ?",
            kind.table()
        ))
        .bind(server_version)
        .bind(uuid.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Mark a record terminally failed; the queue item keeps the error text
    pub async fn mark_record_failed(&self, kind: RecordKind, uuid: Uuid) -> StoreResult<()> {
        sqlx::query(&format!(
            "UPDATE {} SET sync_status = 'failed' WHERE uuid = ?",
            kind.table()
        ))
        .bind(uuid.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Overwrite a record with the server's canonical view after a
    /// conflict. Upserts: when the local row is already gone (the losing
    /// side was a delete), the server's data still lands locally.
    pub async fn apply_server_payload(
        &self,
        kind: RecordKind,
        uuid: Uuid,
        payload: &str,
        key_version: i64,
        server_version: i64,
        server_last_modified: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(&format!(
            r#"
            INSERT INTO {} (uuid, owner_id, payload, key_version, version,
                            sync_status, created_at, last_modified)
            VALUES (?, NULL, ?, ?, ?, 'synced', ?, ?)
            ON CONFLICT(uuid) DO UPDATE SET
                payload = excluded.payload,
                key_version = excluded.key_version,
                version = excluded.version,
                sync_status = 'synced',
                last_modified = excluded.last_modified
            "#,
            kind.table()
        ))
        .bind(uuid.to_string())
        .bind(payload)
        .bind(key_version)
        .bind(server_version)
        .bind(server_last_modified.to_rfc3339())
        .bind(server_last_modified.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Remove a record row once the server confirms its deletion
    pub async fn delete_record_row(&self, kind: RecordKind, uuid: Uuid) -> StoreResult<()> {
        sqlx::query(&format!("DELETE FROM {} WHERE uuid = ?", kind.table()))
            .bind(uuid.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Reset failed records back to pending; returns how many were reset
    pub async fn reset_failed_records(&self, kind: RecordKind) -> StoreResult<u64> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET sync_status = 'pending' WHERE sync_status = 'failed'",
            kind.table()
        ))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_records(&self, kind: RecordKind) -> StoreResult<i64> {
        let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {}", kind.table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    /// Empty all record and queue tables. Key records are preserved so
    /// older exports and backups stay decryptable.
    pub async fn clear_all(&self) -> StoreResult<()> {
        for kind in RecordKind::ALL {
            sqlx::query(&format!("DELETE FROM {}", kind.table()))
                .execute(&self.pool)
                .await?;
        }
        sqlx::query("DELETE FROM sync_queue")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM conflict_log")
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    // ---- sync queue ----

    pub async fn insert_queue_item(&self, item: &QueueItem) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_queue (
                id, entity_type, action, target_uuid, payload, key_version,
                priority, attempts, last_attempt, next_retry, last_error, enqueued_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(item.id.to_string())
        .bind(item.kind.as_str())
        .bind(item.action.as_str())
        .bind(item.target_uuid.to_string())
        .bind(&item.payload)
        .bind(item.key_version)
        .bind(item.priority)
        .bind(item.attempts)
        .bind(item.last_attempt.map(|t| t.to_rfc3339()))
        .bind(item.next_retry.map(|t| t.to_rfc3339()))
        .bind(&item.last_error)
        .bind(item.enqueued_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Items eligible for a drain attempt right now, in drain order
    pub async fn due_queue_items(
        &self,
        now: DateTime<Utc>,
        limit: i64,
        max_attempts: i32,
    ) -> StoreResult<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_type, action, target_uuid, payload, key_version,
                   priority, attempts, last_attempt, next_retry, last_error, enqueued_at
            FROM sync_queue
            WHERE attempts < ?
              AND (next_retry IS NULL OR next_retry <= ?)
            ORDER BY priority DESC, enqueued_at ASC
            LIMIT ?
            "#,
        )
        .bind(max_attempts)
        .bind(now.to_rfc3339())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_queue_row).collect()
    }

    /// All queued items in drain order, including deferred and terminal
    /// ones - this is what the "pending sync" UI shows
    pub async fn queued_items(&self, limit: i64) -> StoreResult<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_type, action, target_uuid, payload, key_version,
                   priority, attempts, last_attempt, next_retry, last_error, enqueued_at
            FROM sync_queue
            ORDER BY priority DESC, enqueued_at ASC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_queue_row).collect()
    }

    /// Still-queued items targeting one record, in enqueue order
    pub async fn queue_items_for_target(
        &self,
        kind: RecordKind,
        target_uuid: Uuid,
    ) -> StoreResult<Vec<QueueItem>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_type, action, target_uuid, payload, key_version,
                   priority, attempts, last_attempt, next_retry, last_error, enqueued_at
            FROM sync_queue
            WHERE entity_type = ? AND target_uuid = ?
            ORDER BY enqueued_at ASC
            "#,
        )
        .bind(kind.as_str())
        .bind(target_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_queue_row).collect()
    }

    pub async fn queue_count(&self) -> StoreResult<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM sync_queue")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }

    pub async fn remove_queue_item(&self, id: Uuid) -> StoreResult<()> {
        sqlx::query("DELETE FROM sync_queue WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Record a failed attempt; `next_retry` of `None` parks the item
    pub async fn record_queue_failure(
        &self,
        id: Uuid,
        attempts: i32,
        last_attempt: DateTime<Utc>,
        next_retry: Option<DateTime<Utc>>,
        last_error: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE sync_queue
            SET attempts = ?, last_attempt = ?, next_retry = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(attempts)
        .bind(last_attempt.to_rfc3339())
        .bind(next_retry.map(|t| t.to_rfc3339()))
        .bind(last_error)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Make deferred and parked items immediately eligible again
    pub async fn reset_queue_backoff(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE sync_queue SET attempts = 0, next_retry = NULL")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ---- encryption keys ----

    /// Persist new key material; returns the row id
    pub async fn insert_key(
        &self,
        key_name: &str,
        material: &str,
        version: i64,
        created_at: DateTime<Utc>,
        rotation_due_at: DateTime<Utc>,
        is_active: bool,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO encryption_keys (
                key_name, material, version, created_at, last_used_at,
                is_active, rotation_due_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(key_name)
        .bind(material)
        .bind(version)
        .bind(created_at.to_rfc3339())
        .bind(created_at.to_rfc3339())
        .bind(is_active)
        .bind(rotation_due_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    /// The single active key for `key_name`, if one exists
    pub async fn active_key(&self, key_name: &str) -> StoreResult<Option<KeyRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, key_name, material, version, created_at, last_used_at,
                   is_active, rotation_due_at
            FROM encryption_keys
            WHERE key_name = ? AND is_active = 1
            "#,
        )
        .bind(key_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(parse_key_row).transpose()
    }

    /// All keys for `key_name`, newest version first
    pub async fn keys_for(&self, key_name: &str) -> StoreResult<Vec<KeyRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, key_name, material, version, created_at, last_used_at,
                   is_active, rotation_due_at
            FROM encryption_keys
            WHERE key_name = ?
            ORDER BY version DESC
            "#,
        )
        .bind(key_name)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_key_row).collect()
    }

    pub async fn set_key_active(&self, id: i64, is_active: bool) -> StoreResult<()> {
        sqlx::query("UPDATE encryption_keys SET is_active = ? WHERE id = ?")
            .bind(is_active)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn touch_key(&self, id: i64, last_used_at: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE encryption_keys SET last_used_at = ? WHERE id = ?")
            .bind(last_used_at.to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Drop inactive keys beyond the newest `keep`; returns pruned count
    pub async fn prune_inactive_keys(&self, key_name: &str, keep: i64) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM encryption_keys
            WHERE key_name = ? AND is_active = 0 AND version NOT IN (
                SELECT version FROM encryption_keys
                WHERE key_name = ? AND is_active = 0
                ORDER BY version DESC
                LIMIT ?
            )
            "#,
        )
        .bind(key_name)
        .bind(key_name)
        .bind(keep)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    // ---- conflict log ----

    pub async fn insert_conflict(&self, c: &ConflictRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO conflict_log (
                id, entity_type, entity_id, conflict_date, resolution_method,
                local_version, server_version, is_resolved, resolved_at,
                resolved_by, auto_resolved, reason,
                local_last_modified, server_last_modified
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(c.id.to_string())
        .bind(c.entity_type.as_str())
        .bind(c.entity_id.to_string())
        .bind(c.conflict_date.to_rfc3339())
        .bind(&c.resolution_method)
        .bind(c.local_version)
        .bind(c.server_version)
        .bind(c.is_resolved)
        .bind(c.resolved_at.map(|t| t.to_rfc3339()))
        .bind(&c.resolved_by)
        .bind(c.auto_resolved)
        .bind(&c.reason)
        .bind(c.local_last_modified.to_rfc3339())
        .bind(c.server_last_modified.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Conflicts for one entity, newest first (audit views)
    pub async fn conflicts_for(
        &self,
        kind: RecordKind,
        entity_id: Uuid,
    ) -> StoreResult<Vec<ConflictRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_type, entity_id, conflict_date, resolution_method,
                   local_version, server_version, is_resolved, resolved_at,
                   resolved_by, auto_resolved, reason,
                   local_last_modified, server_last_modified
            FROM conflict_log
            WHERE entity_type = ? AND entity_id = ?
            ORDER BY conflict_date DESC
            "#,
        )
        .bind(kind.as_str())
        .bind(entity_id.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(parse_conflict_row).collect()
    }

    /// Get database pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close database connection
    pub async fn close(self) -> StoreResult<()> {
        self.pool.close().await;
        Ok(())
    }
}

// ---- row parsing ----

fn parse_uuid(s: &str) -> StoreResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Internal(format!("Invalid UUID: {}", e)))
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Internal(format!("Invalid timestamp: {}", e)))
}

fn parse_opt_ts(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_ts).transpose()
}

fn parse_record_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<StoredRecord> {
    let uuid: String = row.try_get("uuid")?;
    let sync_status: String = row.try_get("sync_status")?;
    let created_at: String = row.try_get("created_at")?;
    let last_modified: String = row.try_get("last_modified")?;

    Ok(StoredRecord {
        uuid: parse_uuid(&uuid)?,
        owner_id: row.try_get("owner_id")?,
        payload: row.try_get("payload")?,
        key_version: row.try_get("key_version")?,
        version: row.try_get("version")?,
        sync_status: SyncStatus::from_str(&sync_status)?,
        created_at: parse_ts(&created_at)?,
        last_modified: parse_ts(&last_modified)?,
    })
}

fn parse_queue_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<QueueItem> {
    let id: String = row.try_get("id")?;
    let entity_type: String = row.try_get("entity_type")?;
    let action: String = row.try_get("action")?;
    let target_uuid: String = row.try_get("target_uuid")?;
    let last_attempt: Option<String> = row.try_get("last_attempt")?;
    let next_retry: Option<String> = row.try_get("next_retry")?;
    let enqueued_at: String = row.try_get("enqueued_at")?;

    Ok(QueueItem {
        id: parse_uuid(&id)?,
        kind: RecordKind::from_str(&entity_type)?,
        action: SyncAction::from_str(&action)?,
        target_uuid: parse_uuid(&target_uuid)?,
        payload: row.try_get("payload")?,
        key_version: row.try_get("key_version")?,
        priority: row.try_get("priority")?,
        attempts: row.try_get("attempts")?,
        last_attempt: parse_opt_ts(last_attempt)?,
        next_retry: parse_opt_ts(next_retry)?,
        last_error: row.try_get("last_error")?,
        enqueued_at: parse_ts(&enqueued_at)?,
    })
}

fn parse_key_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<KeyRecord> {
    let created_at: String = row.try_get("created_at")?;
    let last_used_at: String = row.try_get("last_used_at")?;
    let rotation_due_at: String = row.try_get("rotation_due_at")?;

    Ok(KeyRecord {
        id: row.try_get("id")?,
        key_name: row.try_get("key_name")?,
        material: row.try_get("material")?,
        version: row.try_get("version")?,
        created_at: parse_ts(&created_at)?,
        last_used_at: parse_ts(&last_used_at)?,
        is_active: row.try_get("is_active")?,
        rotation_due_at: parse_ts(&rotation_due_at)?,
    })
}

fn parse_conflict_row(row: sqlx::sqlite::SqliteRow) -> StoreResult<ConflictRecord> {
    let id: String = row.try_get("id")?;
    let entity_type: String = row.try_get("entity_type")?;
    let entity_id: String = row.try_get("entity_id")?;
    let conflict_date: String = row.try_get("conflict_date")?;
    let resolved_at: Option<String> = row.try_get("resolved_at")?;
    let local_last_modified: String = row.try_get("local_last_modified")?;
    let server_last_modified: String = row.try_get("server_last_modified")?;

    Ok(ConflictRecord {
        id: parse_uuid(&id)?,
        entity_type: RecordKind::from_str(&entity_type)?,
        entity_id: parse_uuid(&entity_id)?,
        conflict_date: parse_ts(&conflict_date)?,
        resolution_method: row.try_get("resolution_method")?,
        local_version: row.try_get("local_version")?,
        server_version: row.try_get("server_version")?,
        is_resolved: row.try_get("is_resolved")?,
        resolved_at: parse_opt_ts(resolved_at)?,
        resolved_by: row.try_get("resolved_by")?,
        auto_resolved: row.try_get("auto_resolved")?,
        reason: row.try_get("reason")?,
        local_last_modified: parse_ts(&local_last_modified)?,
        server_last_modified: parse_ts(&server_last_modified)?,
    })
}

/// Fresh on-disk database for unit tests; keep the guard alive
#[cfg(test)]
pub(crate) async fn create_test_db() -> (LocalDatabase, tempfile::NamedTempFile) {
    let temp_file = tempfile::NamedTempFile::new().unwrap();
    let config = StoreConfig {
        db_path: temp_file.path().to_str().unwrap().to_string(),
        ..StoreConfig::default()
    };

    (LocalDatabase::new(&config).await.unwrap(), temp_file)
}
