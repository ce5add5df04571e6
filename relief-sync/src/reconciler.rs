//! Queue drain and conflict reconciliation
//!
//! Replays queued mutations against the server in priority order and
//! resolves version conflicts deterministically by last-write-wins on
//! modification timestamps, ties going to the server. Every resolution
//! leaves exactly one row in the conflict audit log; the losing edit
//! survives nowhere else.

use crate::api::{PushOutcome, ServerRecord, SyncApi};
use crate::error::{StoreError, StoreResult};
use crate::keyring::Keyring;
use crate::local_db::LocalDatabase;
use crate::models::{
    ConflictRecord, QueueItem, StoredRecord, SyncAction, RESOLUTION_LAST_WRITE_WINS,
};
use crate::queue::{backoff_delay, MAX_SYNC_ATTEMPTS};
use chrono::Utc;
use uuid::Uuid;

/// What one drain pass accomplished
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DrainReport {
    /// Items delivered and removed from the queue
    pub delivered: usize,
    /// Subset of deliveries that went through conflict resolution
    pub conflicts_resolved: usize,
    /// Items deferred to a later retry
    pub deferred: usize,
    /// Items parked terminally, their records marked failed
    pub failed: usize,
}

/// Drains the sync queue and reconciles conflicts against the server
pub struct Reconciler<'a> {
    db: &'a LocalDatabase,
    keyring: &'a Keyring,
    api: &'a dyn SyncApi,
}

impl<'a> Reconciler<'a> {
    pub fn new(db: &'a LocalDatabase, keyring: &'a Keyring, api: &'a dyn SyncApi) -> Self {
        Self { db, keyring, api }
    }

    /// Attempt every due queue item once, in drain order
    pub async fn drain(&self, limit: i64) -> StoreResult<DrainReport> {
        let now = Utc::now();
        let items = self.db.due_queue_items(now, limit, MAX_SYNC_ATTEMPTS).await?;
        let mut report = DrainReport::default();

        for item in items {
            match self.attempt(&item).await {
                Ok(resolved_conflict) => {
                    report.delivered += 1;
                    if resolved_conflict {
                        report.conflicts_resolved += 1;
                    }
                }
                Err(StoreError::Network(e)) | Err(StoreError::Timeout(e)) => {
                    self.schedule_retry(&item, &e).await?;
                    if item.attempts + 1 >= MAX_SYNC_ATTEMPTS {
                        report.failed += 1;
                    } else {
                        report.deferred += 1;
                    }
                }
                Err(e) => {
                    // Validation rejections and undecryptable payloads can
                    // never succeed on retry: park for manual intervention
                    self.park(&item, &e.to_string()).await?;
                    report.failed += 1;
                }
            }
        }

        tracing::debug!(
            delivered = report.delivered,
            conflicts = report.conflicts_resolved,
            deferred = report.deferred,
            failed = report.failed,
            "Drain pass complete"
        );

        Ok(report)
    }

    /// Reset failed records to pending and clear queue backoff so the next
    /// drain retries everything
    pub async fn retry_failed(&self) -> StoreResult<u64> {
        let mut reset = 0;
        for kind in crate::models::RecordKind::ALL {
            reset += self.db.reset_failed_records(kind).await?;
        }
        self.db.reset_queue_backoff().await?;
        Ok(reset)
    }

    /// Deliver one item; returns true when delivery went through conflict
    /// resolution
    async fn attempt(&self, item: &QueueItem) -> StoreResult<bool> {
        let plaintext = self
            .keyring
            .open(self.db, &item.payload, Some(item.key_version))
            .await?;
        let data: serde_json::Value = serde_json::from_str(&plaintext)?;

        let local = self.db.fetch_record(item.kind, item.target_uuid).await?;
        let (local_version, local_modified) = match &local {
            Some(rec) => (rec.version, rec.last_modified),
            None => (0, item.enqueued_at),
        };

        let outcome = self
            .api
            .push(
                item.kind,
                item.action,
                item.target_uuid,
                &data,
                local_version,
                local_modified,
            )
            .await?;

        match outcome {
            PushOutcome::Applied { version, .. } => {
                self.finish_delivery(item, version).await?;
                Ok(false)
            }
            PushOutcome::Conflict(server) => {
                self.resolve_conflict(item, local, &data, server).await?;
                Ok(true)
            }
        }
    }

    async fn finish_delivery(&self, item: &QueueItem, server_version: i64) -> StoreResult<()> {
        self.db.remove_queue_item(item.id).await?;

        if item.action == SyncAction::Delete {
            self.db.delete_record_row(item.kind, item.target_uuid).await?;
        } else {
            self.db
                .mark_record_synced(item.kind, item.target_uuid, server_version)
                .await?;
        }

        tracing::debug!(
            item_id = %item.id,
            kind = item.kind.as_str(),
            action = item.action.as_str(),
            server_version,
            "Delivered queued operation"
        );
        Ok(())
    }

    /// Last-write-wins: compare modification timestamps, ties go to the
    /// server as the authoritative source. The winner becomes canonical in
    /// the local store; the loser is retained only in the audit log.
    async fn resolve_conflict(
        &self,
        item: &QueueItem,
        local: Option<StoredRecord>,
        local_data: &serde_json::Value,
        server: ServerRecord,
    ) -> StoreResult<()> {
        let (local_version, local_modified) = match &local {
            Some(rec) => (rec.version, rec.last_modified),
            None => (0, item.enqueued_at),
        };

        let server_wins = server.last_modified >= local_modified;

        if server_wins {
            self.accept_server(item, &server).await?;
        } else {
            // Local edit is newer: rebase the push onto the server's
            // version and retry within this drain
            let rebased = self
                .api
                .push(
                    item.kind,
                    item.action,
                    item.target_uuid,
                    local_data,
                    server.version,
                    local_modified,
                )
                .await?;

            match rebased {
                PushOutcome::Applied { version, .. } => {
                    self.finish_delivery(item, version).await?;
                }
                // The server moved again underneath us; take its word
                PushOutcome::Conflict(newer) => {
                    self.accept_server(item, &newer).await?;
                }
            }
        }

        let now = Utc::now();
        let conflict = ConflictRecord {
            id: Uuid::new_v4(),
            entity_type: item.kind,
            entity_id: item.target_uuid,
            conflict_date: now,
            resolution_method: RESOLUTION_LAST_WRITE_WINS.to_string(),
            local_version,
            server_version: server.version,
            is_resolved: true,
            resolved_at: Some(now),
            resolved_by: Some("reconciler".to_string()),
            auto_resolved: true,
            reason: format!(
                "{} write won: local modified {}, server modified {}",
                if server_wins { "server" } else { "local" },
                local_modified.to_rfc3339(),
                server.last_modified.to_rfc3339(),
            ),
            local_last_modified: local_modified,
            server_last_modified: server.last_modified,
        };
        self.db.insert_conflict(&conflict).await?;

        tracing::warn!(
            kind = item.kind.as_str(),
            entity = %item.target_uuid,
            winner = if server_wins { "server" } else { "local" },
            local_version,
            server_version = server.version,
            "Resolved sync conflict"
        );

        Ok(())
    }

    /// Make the server's version canonical locally and drop the queued edit
    async fn accept_server(&self, item: &QueueItem, server: &ServerRecord) -> StoreResult<()> {
        let plaintext = serde_json::to_string(&server.data)?;
        let (sealed, key_version) = self.keyring.seal(self.db, &plaintext).await?;

        self.db
            .apply_server_payload(
                item.kind,
                item.target_uuid,
                &sealed,
                key_version,
                server.version,
                server.last_modified,
            )
            .await?;
        self.db.remove_queue_item(item.id).await?;

        Ok(())
    }

    async fn schedule_retry(&self, item: &QueueItem, error: &str) -> StoreResult<()> {
        let now = Utc::now();
        let attempts = item.attempts + 1;

        if attempts >= MAX_SYNC_ATTEMPTS {
            // Out of retries: park the item, surface through the record
            self.db
                .record_queue_failure(item.id, attempts, now, None, error)
                .await?;
            self.db.mark_record_failed(item.kind, item.target_uuid).await?;

            tracing::warn!(
                item_id = %item.id,
                attempts,
                error,
                "Sync attempts exhausted, operation parked"
            );
        } else {
            let next_retry = now + backoff_delay(attempts);
            self.db
                .record_queue_failure(item.id, attempts, now, Some(next_retry), error)
                .await?;

            tracing::warn!(
                item_id = %item.id,
                attempts,
                next_retry = %next_retry.to_rfc3339(),
                error,
                "Sync attempt failed, retry scheduled"
            );
        }

        Ok(())
    }

    /// Terminal failure: keep the item visible but never auto-retry it
    async fn park(&self, item: &QueueItem, error: &str) -> StoreResult<()> {
        let now = Utc::now();
        self.db
            .record_queue_failure(item.id, MAX_SYNC_ATTEMPTS, now, None, error)
            .await?;
        self.db.mark_record_failed(item.kind, item.target_uuid).await?;

        tracing::warn!(item_id = %item.id, error, "Operation terminally rejected");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local_db::create_test_db;
    use crate::models::{RecordKind, SyncStatus};
    use crate::queue;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use std::collections::VecDeque;
    use tokio::sync::Mutex;

    /// Scripted server double: pops one canned outcome per push
    struct ScriptedApi {
        outcomes: Mutex<VecDeque<StoreResult<PushOutcome>>>,
        pushes: Mutex<Vec<(RecordKind, SyncAction, Uuid, i64)>>,
    }

    impl ScriptedApi {
        fn new(outcomes: Vec<StoreResult<PushOutcome>>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes.into()),
                pushes: Mutex::new(Vec::new()),
            }
        }

        async fn push_log(&self) -> Vec<(RecordKind, SyncAction, Uuid, i64)> {
            self.pushes.lock().await.clone()
        }
    }

    #[async_trait]
    impl SyncApi for ScriptedApi {
        async fn push(
            &self,
            kind: RecordKind,
            action: SyncAction,
            uuid: Uuid,
            _data: &serde_json::Value,
            version: i64,
            _last_modified: DateTime<Utc>,
        ) -> StoreResult<PushOutcome> {
            self.pushes.lock().await.push((kind, action, uuid, version));
            self.outcomes
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| Err(StoreError::Network("script exhausted".to_string())))
        }

        async fn list_conflicts(
            &self,
            _filter: &crate::export::ConflictFilter,
            _page: u32,
            _limit: u32,
        ) -> StoreResult<crate::api::ConflictPage> {
            Err(StoreError::Internal("not scripted".to_string()))
        }

        async fn conflict_summary(&self) -> StoreResult<crate::models::ConflictSummary> {
            Err(StoreError::Internal("not scripted".to_string()))
        }
    }

    async fn seed_pending_record(
        db: &LocalDatabase,
        keyring: &Keyring,
        kind: RecordKind,
        data: &serde_json::Value,
    ) -> Uuid {
        let uuid = Uuid::new_v4();
        let now = Utc::now();
        let (sealed, key_version) = keyring
            .seal(db, &serde_json::to_string(data).unwrap())
            .await
            .unwrap();

        db.insert_record(
            kind,
            &StoredRecord {
                uuid,
                owner_id: Some("assessor-3".to_string()),
                payload: sealed.clone(),
                key_version,
                version: 0,
                sync_status: SyncStatus::Pending,
                created_at: now,
                last_modified: now,
            },
        )
        .await
        .unwrap();

        queue::enqueue(db, kind, SyncAction::Create, uuid, sealed, key_version)
            .await
            .unwrap();

        uuid
    }

    #[tokio::test]
    async fn test_drain_delivers_and_marks_synced() {
        let (db, _guard) = create_test_db().await;
        let keyring = Keyring::new();
        let data = serde_json::json!({"needs": "water"});
        let uuid = seed_pending_record(&db, &keyring, RecordKind::Assessment, &data).await;

        let api = ScriptedApi::new(vec![Ok(PushOutcome::Applied {
            version: 1,
            last_modified: Utc::now(),
        })]);
        let reconciler = Reconciler::new(&db, &keyring, &api);

        let report = reconciler.drain(50).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.conflicts_resolved, 0);

        assert_eq!(db.queue_count().await.unwrap(), 0);
        let rec = db
            .fetch_record(RecordKind::Assessment, uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Synced);
        assert_eq!(rec.version, 1);
    }

    #[tokio::test]
    async fn test_network_failure_schedules_backoff() {
        let (db, _guard) = create_test_db().await;
        let keyring = Keyring::new();
        let data = serde_json::json!({"needs": "shelter"});
        let uuid = seed_pending_record(&db, &keyring, RecordKind::Response, &data).await;

        let api = ScriptedApi::new(vec![Err(StoreError::Network("unreachable".to_string()))]);
        let reconciler = Reconciler::new(&db, &keyring, &api);

        let report = reconciler.drain(50).await.unwrap();
        assert_eq!(report.deferred, 1);
        assert_eq!(report.delivered, 0);

        let items = db.queued_items(10).await.unwrap();
        assert_eq!(items[0].attempts, 1);
        assert_eq!(items[0].last_error.as_deref(), Some("unreachable"));
        let next_retry = items[0].next_retry.unwrap();
        assert!(next_retry >= items[0].last_attempt.unwrap());

        // Record is still pending, not failed - retries remain
        let rec = db
            .fetch_record(RecordKind::Response, uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Pending);

        // Not due again until the backoff elapses
        assert!(reconciler.drain(50).await.unwrap() == DrainReport::default());
    }

    #[tokio::test]
    async fn test_validation_rejection_is_terminal() {
        let (db, _guard) = create_test_db().await;
        let keyring = Keyring::new();
        let data = serde_json::json!({"bad": "payload"});
        let uuid = seed_pending_record(&db, &keyring, RecordKind::Entity, &data).await;

        let api = ScriptedApi::new(vec![Err(StoreError::ValidationRejected(
            "422: missing field".to_string(),
        ))]);
        let reconciler = Reconciler::new(&db, &keyring, &api);

        let report = reconciler.drain(50).await.unwrap();
        assert_eq!(report.failed, 1);

        let rec = db
            .fetch_record(RecordKind::Entity, uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Failed);

        // Parked, visible, not eligible for auto-retry
        let items = db.queued_items(10).await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].attempts, MAX_SYNC_ATTEMPTS);
        assert!(db
            .due_queue_items(Utc::now() + Duration::hours(2), 10, MAX_SYNC_ATTEMPTS)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_conflict_server_wins_becomes_canonical() {
        let (db, _guard) = create_test_db().await;
        let keyring = Keyring::new();
        let local_data = serde_json::json!({"status": "local edit"});
        let uuid = seed_pending_record(&db, &keyring, RecordKind::Entity, &local_data).await;

        let server_data = serde_json::json!({"status": "server edit"});
        let server_modified = Utc::now() + Duration::minutes(5);
        let api = ScriptedApi::new(vec![Ok(PushOutcome::Conflict(ServerRecord {
            version: 7,
            last_modified: server_modified,
            data: server_data.clone(),
        }))]);
        let reconciler = Reconciler::new(&db, &keyring, &api);

        let report = reconciler.drain(50).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.conflicts_resolved, 1);
        assert_eq!(db.queue_count().await.unwrap(), 0);

        // Server data is now canonical locally
        let rec = db
            .fetch_record(RecordKind::Entity, uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Synced);
        assert_eq!(rec.version, 7);
        let opened = keyring
            .open(&db, &rec.payload, Some(rec.key_version))
            .await
            .unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&opened).unwrap(),
            server_data
        );

        // Exactly one auto-resolved audit row
        let conflicts = db.conflicts_for(RecordKind::Entity, uuid).await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].is_resolved);
        assert!(conflicts[0].auto_resolved);
        assert_eq!(conflicts[0].server_version, 7);
        assert_eq!(
            conflicts[0].resolution_method,
            RESOLUTION_LAST_WRITE_WINS
        );
    }

    #[tokio::test]
    async fn test_conflict_local_wins_rebases_push() {
        let (db, _guard) = create_test_db().await;
        let keyring = Keyring::new();
        let local_data = serde_json::json!({"status": "fresh local edit"});
        let uuid = seed_pending_record(&db, &keyring, RecordKind::Assessment, &local_data).await;

        // Server's copy is older than the local edit
        let server_modified = Utc::now() - Duration::minutes(30);
        let api = ScriptedApi::new(vec![
            Ok(PushOutcome::Conflict(ServerRecord {
                version: 4,
                last_modified: server_modified,
                data: serde_json::json!({"status": "stale server edit"}),
            })),
            Ok(PushOutcome::Applied {
                version: 5,
                last_modified: Utc::now(),
            }),
        ]);
        let reconciler = Reconciler::new(&db, &keyring, &api);

        let report = reconciler.drain(50).await.unwrap();
        assert_eq!(report.delivered, 1);
        assert_eq!(report.conflicts_resolved, 1);

        // Second push was rebased onto the server's version
        let pushes = api.push_log().await;
        assert_eq!(pushes.len(), 2);
        assert_eq!(pushes[1].3, 4);

        // Local data survived and the record carries the new version
        let rec = db
            .fetch_record(RecordKind::Assessment, uuid)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Synced);
        assert_eq!(rec.version, 5);
        let opened = keyring
            .open(&db, &rec.payload, Some(rec.key_version))
            .await
            .unwrap();
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&opened).unwrap(),
            local_data
        );

        let conflicts = db
            .conflicts_for(RecordKind::Assessment, uuid)
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
        assert!(conflicts[0].reason.starts_with("local write won"));
    }

    #[tokio::test]
    async fn test_retry_failed_resets_state() {
        let (db, _guard) = create_test_db().await;
        let keyring = Keyring::new();
        let data = serde_json::json!({"bad": "payload"});
        let uuid = seed_pending_record(&db, &keyring, RecordKind::Entity, &data).await;

        let api = ScriptedApi::new(vec![
            Err(StoreError::ValidationRejected("422".to_string())),
            Ok(PushOutcome::Applied {
                version: 1,
                last_modified: Utc::now(),
            }),
        ]);
        let reconciler = Reconciler::new(&db, &keyring, &api);

        reconciler.drain(50).await.unwrap();
        let rec = db.fetch_record(RecordKind::Entity, uuid).await.unwrap().unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Failed);

        // Explicit retry: failed -> pending, backoff cleared, next drain
        // delivers
        let reset = reconciler.retry_failed().await.unwrap();
        assert_eq!(reset, 1);

        let report = reconciler.drain(50).await.unwrap();
        assert_eq!(report.delivered, 1);
        let rec = db.fetch_record(RecordKind::Entity, uuid).await.unwrap().unwrap();
        assert_eq!(rec.sync_status, SyncStatus::Synced);
    }
}
