//! Vector store abstraction and backends.
//!
//! The pipeline and search engine talk to storage exclusively through the [`VectorStore`]
//! trait so the deployment can pick between the columnar SQL backend (the default, speaking
//! PostgREST) and a Qdrant instance. Both backends share the same validation rules: a
//! document must carry a URL and content, and its embedding must be non-empty, of a
//! supported width, and not the all-zero vector.
//!
//! Embeddings of different widths co-locate in one table through four pre-allocated
//! dimension columns; [`dimension_column`] picks the target and unknown widths fall back to
//! the 1536 column with a warning.

/// Columnar PostgREST-backed store (default deployment).
pub mod postgrest;
/// Qdrant-backed store.
pub mod qdrant;
mod types;

pub use types::{
    ChunkRow, CollectionInfo, DistanceMetric, FilterCriteria, FilterValue, HealthSnapshot,
    PageRecord, ScoredDocument, SearchQuery, SourceRecord, StoreError, UpsertOutcome,
    VectorDocument,
};

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

/// Collection holding prose chunks.
pub const CHUNKS_COLLECTION: &str = "crawled_pages";
/// Collection holding extracted code examples.
pub const CODE_COLLECTION: &str = "code_examples";

/// Embedding widths with a dedicated column in the store.
pub const SUPPORTED_DIMENSIONS: [usize; 4] = [768, 1024, 1536, 3072];

/// Provider-agnostic interface over a vector database.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create a collection if it does not exist yet; repeated calls are no-ops.
    async fn create_collection(
        &self,
        name: &str,
        vector_size: usize,
        distance: DistanceMetric,
    ) -> Result<(), StoreError>;

    /// Write documents in batches, returning a per-item outcome.
    ///
    /// Upserts are keyed by `(url, chunk_number)` so re-ingesting identical content is
    /// idempotent. Partial failure is reported per item, not raised.
    async fn upsert(
        &self,
        collection: &str,
        documents: Vec<VectorDocument>,
        batch_size: usize,
    ) -> Result<Vec<UpsertOutcome>, StoreError>;

    /// Similarity search ordered by descending score.
    async fn search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ScoredDocument>, StoreError>;

    /// Delete rows matching a conjunction of field criteria; returns the removed count.
    async fn delete(
        &self,
        collection: &str,
        filter: &FilterCriteria,
        batch_size: usize,
    ) -> Result<u64, StoreError>;

    /// Replace the stored metadata of a single document.
    async fn update_metadata(
        &self,
        collection: &str,
        id: Uuid,
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError>;

    /// Row count and schema details for a collection.
    async fn get_collection_info(&self, collection: &str) -> Result<CollectionInfo, StoreError>;

    /// Names of every collection managed by this backend.
    async fn list_collections(&self) -> Result<Vec<String>, StoreError>;

    /// Connectivity and collection inventory snapshot.
    async fn health_check(&self) -> HealthSnapshot;
}

/// Pick the embedding column for a vector width.
///
/// Unsupported widths route to the 1536 column; the caller stores the real width alongside
/// so rows stay self-describing.
pub fn dimension_column(dimension: usize) -> &'static str {
    match dimension {
        768 => "embedding_768",
        1024 => "embedding_1024",
        1536 => "embedding_1536",
        3072 => "embedding_3072",
        other => {
            tracing::warn!(
                dimension = other,
                "Unsupported embedding dimension; defaulting to embedding_1536"
            );
            "embedding_1536"
        }
    }
}

/// Validate a document before it reaches any backend.
///
/// Rejects documents without both URL and content, empty embeddings, undeclared widths and
/// the all-zero vector (a zero vector has undefined cosine similarity and always signals an
/// upstream failure).
pub fn validate_document(document: &VectorDocument) -> Result<(), StoreError> {
    if document.url.trim().is_empty() || document.content.trim().is_empty() {
        return Err(StoreError::Validation(
            "document requires both url and content".into(),
        ));
    }
    if document.embedding.is_empty() {
        return Err(StoreError::Validation("embedding must be non-empty".into()));
    }
    if document.embedding.len() != document.embedding_dimension {
        return Err(StoreError::Validation(format!(
            "embedding length {} does not match declared dimension {}",
            document.embedding.len(),
            document.embedding_dimension
        )));
    }
    if document.embedding.iter().all(|value| *value == 0.0) {
        return Err(StoreError::Validation(
            "all-zero embeddings are rejected".into(),
        ));
    }
    Ok(())
}

/// Normalise a metadata filter so `source` and `source_id` behave identically.
pub fn normalize_source_filter(filter: &Map<String, Value>) -> Option<String> {
    filter
        .get("source_id")
        .or_else(|| filter.get("source"))
        .and_then(|value| value.as_str())
        .map(|value| value.to_string())
}
