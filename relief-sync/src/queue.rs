//! Sync queue policy
//!
//! Ordering and retry rules for deferred mutations. The queue itself is a
//! table in the local database; this module owns the policy around it:
//! priority ranking (delete > create > update), the exponential backoff
//! schedule, and the attempt cap after which an item is parked for manual
//! intervention instead of silently dropped.

use crate::error::StoreResult;
use crate::keyring::Keyring;
use crate::local_db::LocalDatabase;
use crate::models::{PendingOperation, QueueItem, RecordKind, SyncAction};
use chrono::{Duration, Utc};
use uuid::Uuid;

/// Attempts after which an item is parked and its record marked failed
pub const MAX_SYNC_ATTEMPTS: i32 = 5;

const BACKOFF_BASE_SECS: i64 = 30;
const BACKOFF_CAP_SECS: i64 = 3600;

/// Delay before the next retry after `attempts` failed attempts.
/// Exponential from a 30 second base, capped at one hour; monotonic in
/// `attempts` so `next_retry` never moves backwards.
pub fn backoff_delay(attempts: i32) -> Duration {
    let exponent = attempts.saturating_sub(1).clamp(0, 30) as u32;
    let secs = BACKOFF_BASE_SECS
        .saturating_mul(1i64 << exponent.min(20))
        .min(BACKOFF_CAP_SECS);
    Duration::seconds(secs)
}

/// Append a deferred mutation to the queue.
/// The payload arrives already sealed; the queue stores ciphertext only.
pub async fn enqueue(
    db: &LocalDatabase,
    kind: RecordKind,
    action: SyncAction,
    target_uuid: Uuid,
    payload: String,
    key_version: i64,
) -> StoreResult<Uuid> {
    let item = QueueItem {
        id: Uuid::new_v4(),
        kind,
        action,
        target_uuid,
        payload,
        key_version,
        priority: action.priority(),
        attempts: 0,
        last_attempt: None,
        next_retry: None,
        last_error: None,
        enqueued_at: Utc::now(),
    };

    db.insert_queue_item(&item).await?;

    tracing::debug!(
        item_id = %item.id,
        kind = kind.as_str(),
        action = action.as_str(),
        target = %target_uuid,
        priority = item.priority,
        "Queued operation for sync"
    );

    Ok(item.id)
}

/// Queued operations with decrypted payloads, in drain order, for the
/// "pending sync" UI. An undecryptable item is skipped with a warning
/// rather than aborting the whole listing.
pub async fn pending_operations(
    db: &LocalDatabase,
    keyring: &Keyring,
    limit: i64,
) -> StoreResult<Vec<PendingOperation>> {
    let items = db.queued_items(limit).await?;

    let mut operations = Vec::with_capacity(items.len());
    for item in items {
        let plaintext = match keyring.open(db, &item.payload, Some(item.key_version)).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(item_id = %item.id, error = %e, "Skipping undecryptable queue item");
                continue;
            }
        };

        operations.push(PendingOperation {
            id: item.id,
            kind: item.kind,
            action: item.action,
            target_uuid: item.target_uuid,
            data: serde_json::from_str(&plaintext)?,
            priority: item.priority,
            attempts: item.attempts,
            last_error: item.last_error,
            enqueued_at: item.enqueued_at,
        });
    }

    Ok(operations)
}
