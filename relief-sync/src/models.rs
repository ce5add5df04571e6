//! Domain model for the offline store
//!
//! Everything persisted locally carries a stable UUID distinct from any
//! SQLite rowid, and payloads are stored as ciphertext stamped with the
//! key version that sealed them.

use crate::error::{StoreError, StoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Kind of domain record held by the store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Assessment,
    Response,
    Entity,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Assessment => "assessment",
            RecordKind::Response => "response",
            RecordKind::Entity => "entity",
        }
    }

    pub fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "assessment" => Ok(RecordKind::Assessment),
            "response" => Ok(RecordKind::Response),
            "entity" => Ok(RecordKind::Entity),
            _ => Err(StoreError::InvalidOperation(format!(
                "Unknown record kind: {}",
                s
            ))),
        }
    }

    /// Local table backing this kind
    pub fn table(&self) -> &'static str {
        match self {
            RecordKind::Assessment => "assessments",
            RecordKind::Response => "responses",
            RecordKind::Entity => "entities",
        }
    }

    pub const ALL: [RecordKind; 3] = [
        RecordKind::Assessment,
        RecordKind::Response,
        RecordKind::Entity,
    ];
}

/// Sync state of a stored record
///
/// Transitions: `pending -> (synced | failed)`; `failed` may be reset to
/// `pending` by the reconciler for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    Pending,
    Synced,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "failed" => Ok(SyncStatus::Failed),
            _ => Err(StoreError::InvalidOperation(format!(
                "Unknown sync status: {}",
                s
            ))),
        }
    }
}

/// Deferred mutation type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
    Delete,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "create",
            SyncAction::Update => "update",
            SyncAction::Delete => "delete",
        }
    }

    pub fn from_str(s: &str) -> StoreResult<Self> {
        match s {
            "create" => Ok(SyncAction::Create),
            "update" => Ok(SyncAction::Update),
            "delete" => Ok(SyncAction::Delete),
            _ => Err(StoreError::InvalidOperation(format!(
                "Unknown sync action: {}",
                s
            ))),
        }
    }

    /// Drain priority: deletes and creates go ahead of passive updates.
    /// The ranking is stable - items drain by priority descending, then
    /// enqueue order.
    pub fn priority(&self) -> i32 {
        match self {
            SyncAction::Delete => 3,
            SyncAction::Create => 2,
            SyncAction::Update => 1,
        }
    }
}

/// A domain record as persisted: payload still sealed
#[derive(Debug, Clone)]
pub struct StoredRecord {
    pub uuid: Uuid,
    pub owner_id: Option<String>,
    /// `base64(nonce || ciphertext)` of the JSON payload
    pub payload: String,
    /// Which key version sealed the payload; never rewritten retroactively
    pub key_version: i64,
    /// Last server version observed for this record (0 before first sync)
    pub version: i64,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// A domain record with its payload decrypted for the caller
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub uuid: Uuid,
    pub owner_id: Option<String>,
    pub data: serde_json::Value,
    pub key_version: i64,
    pub version: i64,
    pub sync_status: SyncStatus,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// One deferred mutation awaiting network delivery
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: Uuid,
    pub kind: RecordKind,
    pub action: SyncAction,
    pub target_uuid: Uuid,
    /// Sealed payload, same encoding as the record tables
    pub payload: String,
    pub key_version: i64,
    pub priority: i32,
    /// Only ever increases
    pub attempts: i32,
    pub last_attempt: Option<DateTime<Utc>>,
    /// Item is not retried before this instant; always >= `last_attempt`
    pub next_retry: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// A queue item with its payload decrypted, as handed to UI collaborators
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingOperation {
    pub id: Uuid,
    pub kind: RecordKind,
    pub action: SyncAction,
    pub target_uuid: Uuid,
    pub data: serde_json::Value,
    pub priority: i32,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

/// A row of the local key table
#[derive(Debug, Clone)]
pub struct KeyRecord {
    pub id: i64,
    pub key_name: String,
    /// Base64 exported key material
    pub material: String,
    /// Monotonic per `key_name`
    pub version: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
    pub is_active: bool,
    pub rotation_due_at: DateTime<Utc>,
}

/// Resolution method recorded on every conflict, automatic or manual
pub const RESOLUTION_LAST_WRITE_WINS: &str = "last_write_wins";

/// Audit record of one detected-and-resolved sync conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub id: Uuid,
    pub entity_type: RecordKind,
    pub entity_id: Uuid,
    pub conflict_date: DateTime<Utc>,
    pub resolution_method: String,
    pub local_version: i64,
    pub server_version: i64,
    pub is_resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub auto_resolved: bool,
    pub reason: String,
    pub local_last_modified: DateTime<Utc>,
    pub server_last_modified: DateTime<Utc>,
}

/// Aggregate conflict counts from the server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictSummary {
    pub total_conflicts: i64,
    pub unresolved_conflicts: i64,
    /// Resolved fraction in [0, 1]
    pub resolution_rate: f64,
    pub by_entity_type: HashMap<String, i64>,
}

/// Snapshot of key lifecycle state for diagnostics and the rotation UI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyRotationStatus {
    pub current_version: i64,
    pub should_rotate: bool,
    pub next_rotation_date: DateTime<Utc>,
    pub can_rotate_now: bool,
}

/// Row counts per table plus the current key version; diagnostics only
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageInfo {
    pub assessments: i64,
    pub responses: i64,
    pub entities: i64,
    pub queued: i64,
    pub key_version: i64,
}
