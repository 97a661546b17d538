//! Process-wide progress registry for long-running operations.
//!
//! Every ingest, upload, re-embed and code-extraction job allocates a `progress_id` here and
//! publishes monotonic status updates against it. Consumers poll by id over HTTP; operators
//! cancel by removing the id from the active-task registry. Producers are expected to check
//! [`ProgressTracker::is_active`] at their checkpoints and publish a `cancelled` record on
//! their own before exiting.
//!
//! Publishing never fails out-of-band: updates against unknown or already-terminal records
//! are logged and dropped. Terminal records are immutable and are garbage-collected lazily
//! once they outlive the retention window.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use serde_json::{Map, Value};
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Kinds of long-running operations tracked by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    /// Web crawl ingestion.
    Crawl,
    /// Uploaded-file ingestion.
    Upload,
    /// Bulk re-embedding run.
    ReEmbed,
    /// Standalone code-extraction pass.
    CodeExtraction,
}

/// Lifecycle states of a tracked operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Record created, no work performed yet.
    Starting,
    /// Crawling or downloading source material.
    Fetching,
    /// Extracting, chunking, preparing documents.
    Processing,
    /// Embedding batches in flight.
    Embedding,
    /// Writing vectors and records to the store.
    Storing,
    /// Finished successfully.
    Completed,
    /// Stopped by operator request.
    Cancelled,
    /// Finished with a fatal error.
    Error,
}

impl OperationStatus {
    /// Whether this state ends the operation; terminal records never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

/// Pollable status record for one operation.
#[derive(Debug, Clone, Serialize)]
pub struct OperationProgress {
    /// Identifier allocated when the operation started.
    pub progress_id: Uuid,
    /// What kind of work this record describes.
    pub operation_type: OperationType,
    /// Current lifecycle state.
    pub status: OperationStatus,
    /// Completion percentage, monotonically non-decreasing until terminal.
    pub progress: u8,
    /// Human-readable description of the latest step.
    pub log: String,
    /// Structured counters published by the producer (chunks_processed, ...).
    pub payload: Map<String, Value>,
    /// RFC3339 timestamp of record creation.
    pub started_at: String,
    /// RFC3339 timestamp of the latest update.
    pub updated_at: String,
    #[serde(skip)]
    touched: OffsetDateTime,
}

/// Terminal records older than this are removed during registry access.
const TERMINAL_RETENTION_SECONDS: i64 = 3_600;

/// Registry mapping operation ids to progress records and live cancellation handles.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    records: Arc<RwLock<HashMap<Uuid, OperationProgress>>>,
    active: Arc<RwLock<HashMap<Uuid, CancellationToken>>>,
}

impl ProgressTracker {
    /// Create an empty tracker. One instance is shared process-wide.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record in state `starting` and register the operation as active.
    ///
    /// Returns the cancellation token the producer should watch at its checkpoints.
    pub async fn start(
        &self,
        progress_id: Uuid,
        operation_type: OperationType,
        payload: Map<String, Value>,
    ) -> CancellationToken {
        let now = OffsetDateTime::now_utc();
        let record = OperationProgress {
            progress_id,
            operation_type,
            status: OperationStatus::Starting,
            progress: 0,
            log: "Operation starting".to_string(),
            payload,
            started_at: format_rfc3339(now),
            updated_at: format_rfc3339(now),
            touched: now,
        };

        let token = CancellationToken::new();
        self.records.write().await.insert(progress_id, record);
        self.active.write().await.insert(progress_id, token.clone());
        tracing::debug!(%progress_id, operation_type = ?operation_type, "Operation registered");
        token
    }

    /// Publish a non-terminal update; `progress` below the current value is clamped upward.
    ///
    /// Updates against unknown or terminal records are dropped with a debug log.
    pub async fn update(
        &self,
        progress_id: Uuid,
        status: OperationStatus,
        progress: u8,
        log: impl Into<String>,
        payload: Option<Map<String, Value>>,
    ) {
        let mut records = self.records.write().await;
        let Some(record) = records.get_mut(&progress_id) else {
            tracing::debug!(%progress_id, "Dropping update for unknown operation");
            return;
        };
        if record.status.is_terminal() {
            tracing::debug!(%progress_id, "Dropping update for terminal operation");
            return;
        }

        record.status = status;
        record.progress = record.progress.max(progress.min(100));
        record.log = log.into();
        if let Some(extra) = payload {
            for (key, value) in extra {
                record.payload.insert(key, value);
            }
        }
        touch(record);
    }

    /// Transition to `completed`, merge the final payload, and drop the active handle.
    ///
    /// Idempotent: a second terminal transition is ignored.
    pub async fn complete(&self, progress_id: Uuid, payload: Map<String, Value>) {
        self.finish(
            progress_id,
            OperationStatus::Completed,
            "Operation completed".to_string(),
            payload,
        )
        .await;
    }

    /// Transition to `error` with a redacted message and drop the active handle.
    pub async fn error(&self, progress_id: Uuid, message: impl Into<String>) {
        let message = crate::errors::redact_secrets(&message.into());
        self.finish(progress_id, OperationStatus::Error, message, Map::new())
            .await;
    }

    /// Transition to `cancelled`; called by the producer once it observes the stop request.
    pub async fn cancelled(&self, progress_id: Uuid, log: impl Into<String>) {
        self.finish(progress_id, OperationStatus::Cancelled, log.into(), Map::new())
            .await;
    }

    async fn finish(
        &self,
        progress_id: Uuid,
        status: OperationStatus,
        log: String,
        payload: Map<String, Value>,
    ) {
        {
            let mut records = self.records.write().await;
            match records.get_mut(&progress_id) {
                Some(record) if !record.status.is_terminal() => {
                    record.status = status;
                    if status == OperationStatus::Completed {
                        record.progress = 100;
                    }
                    record.log = log;
                    for (key, value) in payload {
                        record.payload.insert(key, value);
                    }
                    touch(record);
                }
                Some(_) => {
                    tracing::debug!(%progress_id, "Ignoring repeated terminal transition");
                }
                None => {
                    tracing::debug!(%progress_id, "Ignoring terminal transition for unknown id");
                }
            }
        }
        self.active.write().await.remove(&progress_id);
    }

    /// Fetch the current record, sweeping stale terminal records on the way.
    pub async fn get(&self, progress_id: Uuid) -> Option<OperationProgress> {
        self.sweep().await;
        self.records.read().await.get(&progress_id).cloned()
    }

    /// True iff the operation is still registered in the live-task registry.
    pub async fn is_active(&self, progress_id: Uuid) -> bool {
        self.active.read().await.contains_key(&progress_id)
    }

    /// Request cancellation: remove the id from the active registry and fire its token.
    ///
    /// Returns `false` when the id was not active (already finished, already stopped, or
    /// unknown); stopping twice is a no-op.
    pub async fn stop(&self, progress_id: Uuid) -> bool {
        let removed = self.active.write().await.remove(&progress_id);
        match removed {
            Some(token) => {
                token.cancel();
                tracing::info!(%progress_id, "Operation stop requested");
                true
            }
            None => false,
        }
    }

    /// Drop terminal records whose last update is older than the retention window.
    async fn sweep(&self) {
        let cutoff = OffsetDateTime::now_utc()
            - time::Duration::seconds(TERMINAL_RETENTION_SECONDS);
        let mut records = self.records.write().await;
        records.retain(|_, record| !(record.status.is_terminal() && record.touched < cutoff));
    }
}

fn touch(record: &mut OperationProgress) {
    let now = OffsetDateTime::now_utc();
    record.touched = now;
    record.updated_at = format_rfc3339(now);
}

fn format_rfc3339(moment: OffsetDateTime) -> String {
    moment
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn payload(entries: &[(&str, Value)]) -> Map<String, Value> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    #[tokio::test]
    async fn progress_is_monotonic() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.start(id, OperationType::Crawl, Map::new()).await;

        tracker
            .update(id, OperationStatus::Fetching, 40, "fetching", None)
            .await;
        tracker
            .update(id, OperationStatus::Processing, 25, "late update", None)
            .await;

        let record = tracker.get(id).await.expect("record");
        assert_eq!(record.progress, 40);
        assert_eq!(record.status, OperationStatus::Processing);
    }

    #[tokio::test]
    async fn terminal_records_are_immutable() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.start(id, OperationType::Upload, Map::new()).await;
        tracker
            .complete(id, payload(&[("chunks_processed", json!(7))]))
            .await;

        tracker
            .update(id, OperationStatus::Embedding, 10, "stale producer", None)
            .await;
        tracker.error(id, "stale error").await;

        let record = tracker.get(id).await.expect("record");
        assert_eq!(record.status, OperationStatus::Completed);
        assert_eq!(record.progress, 100);
        assert_eq!(record.payload["chunks_processed"], json!(7));
    }

    #[tokio::test]
    async fn stop_cancels_once_and_is_then_a_noop() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        let token = tracker.start(id, OperationType::ReEmbed, Map::new()).await;

        assert!(tracker.is_active(id).await);
        assert!(tracker.stop(id).await);
        assert!(token.is_cancelled());
        assert!(!tracker.is_active(id).await);
        assert!(!tracker.stop(id).await);
    }

    #[tokio::test]
    async fn completing_deregisters_the_task() {
        let tracker = ProgressTracker::new();
        let id = Uuid::new_v4();
        tracker.start(id, OperationType::Crawl, Map::new()).await;
        tracker.complete(id, Map::new()).await;
        assert!(!tracker.is_active(id).await);
    }

    #[tokio::test]
    async fn unknown_ids_report_not_found() {
        let tracker = ProgressTracker::new();
        assert!(tracker.get(Uuid::new_v4()).await.is_none());
        assert!(!tracker.is_active(Uuid::new_v4()).await);
    }
}
