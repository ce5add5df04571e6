//! Conflict report export
//!
//! Renders the server's conflict log as CSV for audit. The exporter only
//! reads: it pages conflicts through [`SyncApi::list_conflicts`], yields to
//! the scheduler between batches so a UI stays responsive, and can be
//! cancelled at any point without leaving partial state behind.

use crate::api::SyncApi;
use crate::error::{StoreError, StoreResult};
use crate::models::{ConflictRecord, RecordKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Conflicts fetched per request while paging
const PAGE_SIZE: u32 = 100;

const CSV_HEADER: &str = "Conflict ID, Entity Type, Entity ID, Conflict Date, \
Resolution Method, Local Version, Server Version, Resolved, Resolved At, \
Resolved By, Auto Resolved, Conflict Reason, Local Last Modified, \
Server Last Modified";

/// Which conflicts to include in a report
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConflictFilter {
    pub entity_type: Option<RecordKind>,
    pub resolved: Option<bool>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
}

impl ConflictFilter {
    /// Every problem with the filter, phrased for an end user. Checked
    /// before any network call.
    pub fn validate(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut problems = Vec::new();

        if let (Some(from), Some(to)) = (self.date_from, self.date_to) {
            if from > to {
                problems.push("Start date must not be after end date".to_string());
            }
        }
        if let Some(from) = self.date_from {
            if from > now {
                problems.push("Start date must not be in the future".to_string());
            }
        }
        if let Some(to) = self.date_to {
            if to > now {
                problems.push("End date must not be in the future".to_string());
            }
        }

        problems
    }
}

/// Export pipeline stage, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportStage {
    Fetching,
    Processing,
    Generating,
    Complete,
}

/// Progress callback payload; `percent` never decreases across calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportProgress {
    pub stage: ExportStage,
    pub percent: u8,
}

/// A finished report: CSV body plus the filename it should be saved under
#[derive(Debug, Clone)]
pub struct ConflictReport {
    pub filename: String,
    pub csv: String,
    pub row_count: usize,
}

/// Cooperative cancellation flag shared with the caller
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// Streams conflicts from the server and renders the CSV report
pub struct ConflictExporter<'a> {
    api: &'a dyn SyncApi,
}

impl<'a> ConflictExporter<'a> {
    pub fn new(api: &'a dyn SyncApi) -> Self {
        Self { api }
    }

    /// Produce a conflict report for `filter`.
    /// `progress` is invoked with monotonically increasing percentages as
    /// the export moves through its stages; `cancel` aborts cleanly with
    /// [`StoreError::Cancelled`].
    pub async fn export(
        &self,
        filter: &ConflictFilter,
        cancel: &CancelToken,
        mut progress: impl FnMut(ExportProgress),
    ) -> StoreResult<ConflictReport> {
        let problems = filter.validate(Utc::now());
        if !problems.is_empty() {
            return Err(StoreError::ExportValidation(problems));
        }

        progress(ExportProgress {
            stage: ExportStage::Fetching,
            percent: 0,
        });

        // Fetching covers 0..60% of the bar, proportional to pages
        let mut conflicts = Vec::new();
        let mut page = 1u32;
        let mut total = loop {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }

            let batch = self.api.list_conflicts(filter, page, PAGE_SIZE).await?;
            if page == 1 && batch.total == 0 {
                return Err(StoreError::EmptyExport);
            }

            let page_len = batch.conflicts.len();
            conflicts.extend(batch.conflicts);
            let fetched = conflicts.len() as i64;
            let percent = if batch.total > 0 {
                (fetched * 60 / batch.total).min(60) as u8
            } else {
                60
            };
            progress(ExportProgress {
                stage: ExportStage::Fetching,
                percent,
            });

            if fetched >= batch.total || page_len == 0 {
                break batch.total;
            }

            page += 1;
            tokio::task::yield_now().await;
        };

        if total < conflicts.len() as i64 {
            total = conflicts.len() as i64;
        }

        progress(ExportProgress {
            stage: ExportStage::Processing,
            percent: 70,
        });
        if cancel.is_cancelled() {
            return Err(StoreError::Cancelled);
        }

        // Oldest first so the report reads chronologically
        conflicts.sort_by_key(|c| c.conflict_date);

        progress(ExportProgress {
            stage: ExportStage::Generating,
            percent: 85,
        });

        let mut csv = String::with_capacity(conflicts.len() * 160 + CSV_HEADER.len());
        csv.push_str(CSV_HEADER);
        csv.push('\n');

        for (i, conflict) in conflicts.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            csv.push_str(&render_row(conflict));
            csv.push('\n');

            if i % 256 == 255 {
                tokio::task::yield_now().await;
            }
        }

        let report = ConflictReport {
            filename: export_filename(filter, Utc::now()),
            csv,
            row_count: conflicts.len(),
        };

        progress(ExportProgress {
            stage: ExportStage::Complete,
            percent: 100,
        });

        tracing::info!(
            rows = report.row_count,
            total,
            filename = %report.filename,
            "Generated conflict report"
        );

        Ok(report)
    }
}

fn render_row(c: &ConflictRecord) -> String {
    let fields = [
        c.id.to_string(),
        c.entity_type.as_str().to_string(),
        c.entity_id.to_string(),
        c.conflict_date.to_rfc3339(),
        c.resolution_method.clone(),
        c.local_version.to_string(),
        c.server_version.to_string(),
        c.is_resolved.to_string(),
        c.resolved_at.map(|t| t.to_rfc3339()).unwrap_or_default(),
        c.resolved_by.clone().unwrap_or_default(),
        c.auto_resolved.to_string(),
        c.reason.clone(),
        c.local_last_modified.to_rfc3339(),
        c.server_last_modified.to_rfc3339(),
    ];

    fields
        .iter()
        .map(|f| escape_field(f))
        .collect::<Vec<_>>()
        .join(",")
}

/// Standard CSV quoting: wrap when the field contains a comma, quote or
/// line break, doubling any internal quotes
fn escape_field(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

/// `conflict-report-<date>[-<entityType>][-resolved|-unresolved]
/// [-<dateFrom>-to-<dateTo>].csv`
fn export_filename(filter: &ConflictFilter, now: DateTime<Utc>) -> String {
    let mut name = format!("conflict-report-{}", now.format("%Y-%m-%d"));

    if let Some(kind) = filter.entity_type {
        name.push('-');
        name.push_str(kind.as_str());
    }
    if let Some(resolved) = filter.resolved {
        name.push_str(if resolved { "-resolved" } else { "-unresolved" });
    }
    if let (Some(from), Some(to)) = (filter.date_from, filter.date_to) {
        name.push_str(&format!(
            "-{}-to-{}",
            from.format("%Y-%m-%d"),
            to.format("%Y-%m-%d")
        ));
    }

    name.push_str(".csv");
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ConflictPage, PushOutcome};
    use crate::models::{ConflictSummary, RESOLUTION_LAST_WRITE_WINS};
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use uuid::Uuid;

    fn sample_conflict(reason: &str, date: DateTime<Utc>) -> ConflictRecord {
        ConflictRecord {
            id: Uuid::new_v4(),
            entity_type: RecordKind::Assessment,
            entity_id: Uuid::new_v4(),
            conflict_date: date,
            resolution_method: RESOLUTION_LAST_WRITE_WINS.to_string(),
            local_version: 2,
            server_version: 3,
            is_resolved: true,
            resolved_at: Some(date),
            resolved_by: Some("reconciler".to_string()),
            auto_resolved: true,
            reason: reason.to_string(),
            local_last_modified: date - Duration::minutes(10),
            server_last_modified: date,
        }
    }

    /// Serves a fixed conflict list in pages
    struct PagedApi {
        conflicts: Vec<ConflictRecord>,
    }

    #[async_trait]
    impl SyncApi for PagedApi {
        async fn push(
            &self,
            _kind: RecordKind,
            _action: crate::models::SyncAction,
            _uuid: Uuid,
            _data: &serde_json::Value,
            _version: i64,
            _last_modified: DateTime<Utc>,
        ) -> StoreResult<PushOutcome> {
            Err(StoreError::Internal("export tests never push".to_string()))
        }

        async fn list_conflicts(
            &self,
            _filter: &ConflictFilter,
            page: u32,
            limit: u32,
        ) -> StoreResult<ConflictPage> {
            let start = ((page - 1) * limit) as usize;
            let end = (start + limit as usize).min(self.conflicts.len());
            let slice = if start < self.conflicts.len() {
                self.conflicts[start..end].to_vec()
            } else {
                Vec::new()
            };

            Ok(ConflictPage {
                conflicts: slice,
                total: self.conflicts.len() as i64,
            })
        }

        async fn conflict_summary(&self) -> StoreResult<ConflictSummary> {
            Err(StoreError::Internal("not needed".to_string()))
        }
    }

    /// Minimal CSV parser for round-trip assertions
    fn parse_csv_line(line: &str) -> Vec<String> {
        let mut fields = Vec::new();
        let mut field = String::new();
        let mut chars = line.chars().peekable();
        let mut quoted = false;

        while let Some(ch) = chars.next() {
            if quoted {
                if ch == '"' {
                    if chars.peek() == Some(&'"') {
                        chars.next();
                        field.push('"');
                    } else {
                        quoted = false;
                    }
                } else {
                    field.push(ch);
                }
            } else if ch == '"' {
                quoted = true;
            } else if ch == ',' {
                fields.push(std::mem::take(&mut field));
            } else {
                field.push(ch);
            }
        }
        fields.push(field);
        fields
    }

    #[test]
    fn test_escape_field() {
        assert_eq!(escape_field("plain"), "plain");
        assert_eq!(escape_field("a,b"), "\"a,b\"");
        assert_eq!(escape_field("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_field("line\nbreak"), "\"line\nbreak\"");
    }

    #[test]
    fn test_filter_validation() {
        let now = Utc::now();

        assert!(ConflictFilter::default().validate(now).is_empty());

        let inverted = ConflictFilter {
            date_from: Some(now),
            date_to: Some(now - Duration::days(1)),
            ..Default::default()
        };
        let problems = inverted.validate(now);
        assert_eq!(problems.len(), 1);
        assert!(problems[0].contains("after end date"));

        let future = ConflictFilter {
            date_from: Some(now + Duration::days(2)),
            date_to: Some(now + Duration::days(3)),
            ..Default::default()
        };
        // Inverted range is fine here, but both dates are in the future
        assert_eq!(future.validate(now).len(), 2);
    }

    #[test]
    fn test_export_filename_variants() {
        let now = Utc.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap();

        assert_eq!(
            export_filename(&ConflictFilter::default(), now),
            "conflict-report-2024-03-15.csv"
        );

        let full = ConflictFilter {
            entity_type: Some(RecordKind::Entity),
            resolved: Some(false),
            date_from: Some(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()),
            date_to: Some(Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()),
        };
        assert_eq!(
            export_filename(&full, now),
            "conflict-report-2024-03-15-entity-unresolved-2024-01-01-to-2024-02-01.csv"
        );
    }

    #[tokio::test]
    async fn test_export_round_trips_awkward_reason() {
        let date = Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap();
        let reason = "\"hello, world\"";
        let api = PagedApi {
            conflicts: vec![sample_conflict(reason, date)],
        };

        let exporter = ConflictExporter::new(&api);
        let report = exporter
            .export(&ConflictFilter::default(), &CancelToken::new(), |_| {})
            .await
            .unwrap();

        let lines: Vec<&str> = report.csv.trim_end().lines().collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], CSV_HEADER);

        let fields = parse_csv_line(lines[1]);
        assert_eq!(fields.len(), 14);
        assert_eq!(fields[11], reason);
        assert_eq!(fields[1], "assessment");
        assert_eq!(fields[7], "true");
    }

    #[tokio::test]
    async fn test_export_pages_and_progress_is_monotone() {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let conflicts: Vec<_> = (0..250)
            .map(|i| sample_conflict("drift", base + Duration::minutes(i)))
            .collect();
        let api = PagedApi { conflicts };

        let mut seen = Vec::new();
        let exporter = ConflictExporter::new(&api);
        let report = exporter
            .export(&ConflictFilter::default(), &CancelToken::new(), |p| {
                seen.push(p)
            })
            .await
            .unwrap();

        assert_eq!(report.row_count, 250);
        assert!(seen.windows(2).all(|w| w[0].percent <= w[1].percent));
        assert_eq!(seen.first().map(|p| p.stage), Some(ExportStage::Fetching));
        assert_eq!(
            seen.last().copied(),
            Some(ExportProgress {
                stage: ExportStage::Complete,
                percent: 100
            })
        );
    }

    #[tokio::test]
    async fn test_empty_export_is_an_error() {
        let api = PagedApi { conflicts: vec![] };
        let exporter = ConflictExporter::new(&api);

        let err = exporter
            .export(&ConflictFilter::default(), &CancelToken::new(), |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::EmptyExport));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_cleanly() {
        let date = Utc.with_ymd_and_hms(2024, 3, 15, 9, 30, 0).unwrap();
        let api = PagedApi {
            conflicts: vec![sample_conflict("drift", date)],
        };

        let cancel = CancelToken::new();
        cancel.cancel();

        let exporter = ConflictExporter::new(&api);
        let err = exporter
            .export(&ConflictFilter::default(), &cancel, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Cancelled));
    }

    #[tokio::test]
    async fn test_bad_filter_fails_before_network() {
        let api = PagedApi { conflicts: vec![] };
        let exporter = ConflictExporter::new(&api);

        let now = Utc::now();
        let filter = ConflictFilter {
            date_from: Some(now + Duration::days(5)),
            ..Default::default()
        };

        let err = exporter
            .export(&filter, &CancelToken::new(), |_| {})
            .await
            .unwrap_err();
        match err {
            StoreError::ExportValidation(problems) => {
                assert_eq!(problems.len(), 1);
            }
            other => panic!("expected validation error, got {:?}", other),
        }
    }
}
