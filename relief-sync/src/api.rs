//! Server transport for sync draining and conflict reporting
//!
//! The reconciler and exporter talk to the relief server through the
//! [`SyncApi`] trait so tests can substitute an in-memory double. The
//! production implementation is [`HttpSyncApi`]: REST/JSON over HTTPS with
//! a bounded request timeout - a timed-out push takes the same retry path
//! as any other network failure.

use crate::error::{StoreError, StoreResult};
use crate::export::ConflictFilter;
use crate::models::{ConflictRecord, ConflictSummary, RecordKind, SyncAction};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use uuid::Uuid;

/// Default bound on any single sync request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The server's view of an entity, returned alongside a conflict
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub version: i64,
    pub last_modified: DateTime<Utc>,
    pub data: Value,
}

/// Result of pushing one queued mutation
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// Server accepted the mutation and assigned this version
    Applied {
        version: i64,
        last_modified: DateTime<Utc>,
    },
    /// Server holds a newer version of the entity
    Conflict(ServerRecord),
}

/// One page of the server's conflict listing
#[derive(Debug, Clone)]
pub struct ConflictPage {
    pub conflicts: Vec<ConflictRecord>,
    pub total: i64,
}

/// Server endpoints consumed by the sync engine
#[async_trait]
pub trait SyncApi: Send + Sync {
    /// Deliver one mutation; `version` is the last server version the
    /// client observed, for optimistic concurrency.
    async fn push(
        &self,
        kind: RecordKind,
        action: SyncAction,
        uuid: Uuid,
        data: &Value,
        version: i64,
        last_modified: DateTime<Utc>,
    ) -> StoreResult<PushOutcome>;

    /// Paginated conflict listing matching `filter`
    async fn list_conflicts(
        &self,
        filter: &ConflictFilter,
        page: u32,
        limit: u32,
    ) -> StoreResult<ConflictPage>;

    /// Aggregate conflict counts for the dashboard
    async fn conflict_summary(&self) -> StoreResult<ConflictSummary>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    uuid: Uuid,
    data: &'a Value,
    version: i64,
    last_modified: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplyResponse {
    version: i64,
    last_modified: DateTime<Utc>,
}

#[derive(Deserialize)]
struct Pagination {
    total: i64,
}

#[derive(Deserialize)]
struct ConflictListResponse {
    conflicts: Vec<ConflictRecord>,
    pagination: Pagination,
}

/// REST collection for a record kind
fn collection(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Assessment => "assessments",
        RecordKind::Response => "responses",
        RecordKind::Entity => "entities",
    }
}

/// REST/JSON sync client
pub struct HttpSyncApi {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSyncApi {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> StoreResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn handle_push_response(
        &self,
        response: reqwest::Response,
        pushed_version: i64,
    ) -> StoreResult<PushOutcome> {
        let status = response.status();

        if status == reqwest::StatusCode::CONFLICT {
            let server: ServerRecord = response.json().await?;
            return Ok(PushOutcome::Conflict(server));
        }

        if status.is_success() {
            if status == reqwest::StatusCode::NO_CONTENT {
                // Deletes come back bodyless
                return Ok(PushOutcome::Applied {
                    version: pushed_version + 1,
                    last_modified: Utc::now(),
                });
            }
            let applied: ApplyResponse = response.json().await?;
            return Ok(PushOutcome::Applied {
                version: applied.version,
                last_modified: applied.last_modified,
            });
        }

        let body = response.text().await.unwrap_or_default();
        if status.is_client_error() {
            // Malformed or rejected payload: terminal, no auto-retry
            Err(StoreError::ValidationRejected(format!(
                "{}: {}",
                status, body
            )))
        } else {
            // Server-side trouble is transient
            Err(StoreError::Network(format!("{}: {}", status, body)))
        }
    }
}

#[async_trait]
impl SyncApi for HttpSyncApi {
    async fn push(
        &self,
        kind: RecordKind,
        action: SyncAction,
        uuid: Uuid,
        data: &Value,
        version: i64,
        last_modified: DateTime<Utc>,
    ) -> StoreResult<PushOutcome> {
        let body = PushRequest {
            uuid,
            data,
            version,
            last_modified,
        };

        let response = match action {
            SyncAction::Create => {
                self.client
                    .post(self.url(collection(kind)))
                    .json(&body)
                    .send()
                    .await?
            }
            SyncAction::Update => {
                self.client
                    .put(self.url(&format!("{}/{}", collection(kind), uuid)))
                    .json(&body)
                    .send()
                    .await?
            }
            SyncAction::Delete => {
                self.client
                    .delete(self.url(&format!("{}/{}", collection(kind), uuid)))
                    .query(&[("version", version)])
                    .send()
                    .await?
            }
        };

        self.handle_push_response(response, version).await
    }

    async fn list_conflicts(
        &self,
        filter: &ConflictFilter,
        page: u32,
        limit: u32,
    ) -> StoreResult<ConflictPage> {
        let mut request = self
            .client
            .get(self.url("sync/conflicts"))
            .query(&[("page", page), ("limit", limit)]);

        if let Some(kind) = filter.entity_type {
            request = request.query(&[("entityType", kind.as_str())]);
        }
        if let Some(resolved) = filter.resolved {
            request = request.query(&[("resolved", resolved)]);
        }
        if let Some(from) = filter.date_from {
            request = request.query(&[("dateFrom", from.to_rfc3339())]);
        }
        if let Some(to) = filter.date_to {
            request = request.query(&[("dateTo", to.to_rfc3339())]);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(StoreError::Network(format!(
                "conflict listing failed: {}",
                response.status()
            )));
        }

        let parsed: ConflictListResponse = response.json().await?;
        Ok(ConflictPage {
            conflicts: parsed.conflicts,
            total: parsed.pagination.total,
        })
    }

    async fn conflict_summary(&self) -> StoreResult<ConflictSummary> {
        let response = self
            .client
            .get(self.url("sync/conflicts/summary"))
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(StoreError::Network(format!(
                "conflict summary failed: {}",
                response.status()
            )));
        }

        Ok(response.json().await?)
    }
}
