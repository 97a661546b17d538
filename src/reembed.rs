//! Bulk re-embedding when the active embedding model changes.
//!
//! Walks every chunk row in stable id order, re-embeds its content with the current
//! provider and rewrites the row into the column matching the new dimension, nulling the
//! other three. The run is not atomic: cancellation leaves a mixed store, which is fine
//! because each row records its own model and dimension. Only one run may be active at a
//! time; a second start returns a conflict.

use crate::config::get_config;
use crate::embedding::{EmbeddingClient, embed_batch_with_retry};
use crate::errors::redact_secrets;
use crate::progress::{OperationStatus, OperationType, ProgressTracker};
use crate::store::postgrest::{EmbeddingStat, PostgrestStore};
use crate::store::{CHUNKS_COLLECTION, StoreError, VectorStore};
use serde_json::{Map, json};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Chunk rows fetched per page.
const FETCH_PAGE_SIZE: usize = 100;

/// Progress floor once embedding begins.
const PROGRESS_FLOOR: usize = 15;

/// Progress ceiling while embedding is still running.
const PROGRESS_CEILING: usize = 95;

/// Errors surfaced when starting or inspecting a re-embed run.
#[derive(Debug, Error)]
pub enum ReEmbedError {
    /// Another run is already active.
    #[error("a re-embed operation is already running")]
    AlreadyRunning,
    /// Store interaction failed.
    #[error("{0}")]
    Store(#[from] StoreError),
}

/// Bulk recomputation engine for chunk embeddings.
pub struct ReEmbedService {
    store: Arc<PostgrestStore>,
    embedder: Arc<dyn EmbeddingClient>,
    tracker: ProgressTracker,
    active: Arc<Mutex<Option<Uuid>>>,
}

impl ReEmbedService {
    /// Build the service from shared components.
    pub fn new(
        store: Arc<PostgrestStore>,
        embedder: Arc<dyn EmbeddingClient>,
        tracker: ProgressTracker,
    ) -> Self {
        Self {
            store,
            embedder,
            tracker,
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Start a bulk re-embed, returning its progress id.
    ///
    /// Fails with [`ReEmbedError::AlreadyRunning`] while a previous run is still active.
    pub async fn start(self: &Arc<Self>) -> Result<Uuid, ReEmbedError> {
        let mut active = self.active.lock().await;
        if let Some(existing) = *active
            && self.tracker.is_active(existing).await
        {
            return Err(ReEmbedError::AlreadyRunning);
        }

        let progress_id = Uuid::new_v4();
        let mut payload = Map::new();
        payload.insert(
            "embedding_model".into(),
            json!(get_config().embedding_model),
        );
        self.tracker
            .start(progress_id, OperationType::ReEmbed, payload)
            .await;
        *active = Some(progress_id);
        drop(active);

        let service = Arc::clone(self);
        tokio::spawn(async move {
            service.run(progress_id).await;
            *service.active.lock().await = None;
        });
        Ok(progress_id)
    }

    /// Request cancellation of a running re-embed.
    pub async fn stop(&self, progress_id: Uuid) -> bool {
        self.tracker.stop(progress_id).await
    }

    /// Per-model/dimension row counts for the stats endpoint.
    pub async fn stats(&self) -> Result<Vec<EmbeddingStat>, ReEmbedError> {
        Ok(self.store.embedding_stats().await?)
    }

    async fn run(&self, progress_id: Uuid) {
        let config = get_config();
        let model = config.embedding_model.clone();

        self.tracker
            .update(
                progress_id,
                OperationStatus::Fetching,
                5,
                format!("Fetching documents to re-embed with model: {model}"),
                None,
            )
            .await;

        let total = match self.store.get_collection_info(CHUNKS_COLLECTION).await {
            Ok(info) => info.row_count as usize,
            Err(error) => {
                self.tracker
                    .error(progress_id, format!("failed to count chunks: {error}"))
                    .await;
                return;
            }
        };
        if total == 0 {
            let mut payload = Map::new();
            payload.insert("chunks_processed".into(), json!(0));
            payload.insert("log".into(), json!("No documents to re-embed"));
            self.tracker.complete(progress_id, payload).await;
            return;
        }

        let mut processed = 0usize;
        let mut failed = 0usize;
        let mut offset = 0usize;

        loop {
            // Checkpoint between fetched pages.
            if !self.tracker.is_active(progress_id).await {
                self.tracker
                    .cancelled(
                        progress_id,
                        format!("Re-embed cancelled after {processed} chunks"),
                    )
                    .await;
                return;
            }

            let rows = match self.store.fetch_chunk_rows(FETCH_PAGE_SIZE, offset).await {
                Ok(rows) => rows,
                Err(error) => {
                    self.tracker
                        .error(progress_id, format!("failed to fetch chunks: {error}"))
                        .await;
                    return;
                }
            };
            if rows.is_empty() {
                break;
            }
            offset += rows.len();

            let texts: Vec<String> = rows.iter().map(|row| row.content.clone()).collect();
            let outcome =
                match embed_batch_with_retry(self.embedder.as_ref(), &texts, &model).await {
                    Ok(outcome) => outcome,
                    Err(error) => {
                        tracing::warn!(
                            error = %redact_secrets(&error.to_string()),
                            "Re-embed batch failed; marking page failed"
                        );
                        failed += rows.len();
                        continue;
                    }
                };

            for (row, slot) in rows.iter().zip(outcome.embeddings.into_iter()) {
                let Some(vector) = slot else {
                    failed += 1;
                    continue;
                };
                match self
                    .store
                    .update_chunk_embedding(row.id, &vector.values, &model)
                    .await
                {
                    Ok(()) => processed += 1,
                    Err(error) => {
                        tracing::warn!(chunk_id = %row.id, error = %error, "Chunk rewrite failed");
                        failed += 1;
                    }
                }
            }

            let ratio = (processed + failed).min(total) * (PROGRESS_CEILING - PROGRESS_FLOOR)
                / total.max(1);
            self.tracker
                .update(
                    progress_id,
                    OperationStatus::Embedding,
                    (PROGRESS_FLOOR + ratio) as u8,
                    format!("Re-embedded {processed}/{total} chunks"),
                    None,
                )
                .await;
        }

        let mut payload = Map::new();
        payload.insert("chunks_processed".into(), json!(processed));
        payload.insert("chunks_failed".into(), json!(failed));
        payload.insert("embedding_model".into(), json!(model));
        self.tracker.complete(progress_id, payload).await;
        tracing::info!(processed, failed, model = %model, "Re-embed completed");
    }
}
