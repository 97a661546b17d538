//! Shared types used by the vector store backends.

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Errors returned while interacting with a store backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Base URL failed to parse or normalize.
    #[error("Invalid store URL: {0}")]
    InvalidUrl(String),
    /// HTTP layer failed before receiving a response.
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// Backend responded with an unexpected status code.
    #[error("Unexpected store response ({status}): {body}")]
    UnexpectedStatus {
        /// HTTP status returned from the backend.
        status: StatusCode,
        /// Body payload associated with the failing response.
        body: String,
    },
    /// Input failed validation before any I/O happened.
    #[error("{0}")]
    Validation(String),
    /// The requested record does not exist.
    #[error("Record not found: {0}")]
    NotFound(String),
    /// A conflicting operation blocks this one.
    #[error("{0}")]
    Conflict(String),
}

/// Distance metric used when creating a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DistanceMetric {
    /// Cosine similarity (default for text embeddings).
    Cosine,
    /// Euclidean distance.
    Euclidean,
    /// Dot product.
    Dot,
}

/// A document prepared for upsert: content, provenance and one embedding.
#[derive(Debug, Clone)]
pub struct VectorDocument {
    /// Row identifier; generated by the caller so retries stay idempotent.
    pub id: Uuid,
    /// Owning source.
    pub source_id: String,
    /// Owning page, when known (code examples may omit it).
    pub page_id: Option<Uuid>,
    /// Canonical URL of the originating document.
    pub url: String,
    /// 0-based position within the source document; `None` for code examples.
    pub chunk_number: Option<i64>,
    /// Chunk or code body.
    pub content: String,
    /// Free-form metadata supplied by the caller.
    pub metadata: Map<String, Value>,
    /// Embedding vector, exactly `embedding_dimension` wide.
    pub embedding: Vec<f32>,
    /// Model that produced the embedding.
    pub embedding_model: String,
    /// Declared width of the embedding.
    pub embedding_dimension: usize,
}

/// Per-item result of an upsert batch.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// Document id the outcome refers to.
    pub id: Uuid,
    /// Whether the write succeeded.
    pub stored: bool,
    /// Redacted failure description when `stored` is false.
    pub error: Option<String>,
}

/// Similarity query against one collection.
#[derive(Debug, Clone)]
pub struct SearchQuery {
    /// Query embedding; its width selects the dimension column.
    pub embedding: Vec<f32>,
    /// Maximum number of results.
    pub match_count: usize,
    /// Conjunction of metadata constraints; `source`/`source_id` are interchangeable.
    pub filter_metadata: Map<String, Value>,
    /// Minimum similarity accepted.
    pub similarity_threshold: f32,
}

/// Scored row returned from a similarity search.
#[derive(Debug, Clone)]
pub struct ScoredDocument {
    /// Row identifier.
    pub id: Uuid,
    /// Owning source.
    pub source_id: String,
    /// Owning page, when stored.
    pub page_id: Option<Uuid>,
    /// Originating URL.
    pub url: String,
    /// Chunk position, when stored.
    pub chunk_number: Option<i64>,
    /// Stored content.
    pub content: String,
    /// Stored metadata.
    pub metadata: Map<String, Value>,
    /// Similarity in `[0, 1]`.
    pub similarity: f32,
}

/// Conjunction of `{field: value}` or `{field: [values]}` constraints for deletion.
#[derive(Debug, Clone, Default)]
pub struct FilterCriteria {
    /// Field constraints; every entry must match.
    pub fields: Vec<(String, FilterValue)>,
}

/// A single field constraint.
#[derive(Debug, Clone)]
pub enum FilterValue {
    /// Field equals the value.
    Equals(String),
    /// Field equals any of the values.
    AnyOf(Vec<String>),
}

impl FilterCriteria {
    /// Convenience constructor for a single equality constraint.
    pub fn equals(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            fields: vec![(field.into(), FilterValue::Equals(value.into()))],
        }
    }
}

/// Row count and schema summary for one collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    /// Collection name.
    pub name: String,
    /// Number of stored rows.
    pub row_count: u64,
    /// Embedding widths observed or configured.
    pub dimensions: Vec<usize>,
}

/// Connectivity snapshot returned by `health_check`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    /// Whether the backend answered at all.
    pub connected: bool,
    /// Number of collections visible.
    pub collections_count: usize,
    /// Collection names.
    pub collections: Vec<String>,
    /// Short status label (`healthy` or an error summary).
    pub status: String,
}

/// A knowledge source: a logical corpus identified by a stable string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceRecord {
    /// Stable identifier derived from the canonical URL or file identity.
    pub source_id: String,
    /// Human-readable title.
    pub title: String,
    /// AI-generated summary; empty until the first chunk batch lands.
    #[serde(default)]
    pub summary: String,
    /// Aggregate word count across pages.
    #[serde(default)]
    pub total_word_count: i64,
    /// Arbitrary key/value metadata (knowledge_type, tags, crawl provenance).
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// A whole source document: crawled page, parsed PDF, or llms-full section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PageRecord {
    /// Row identifier.
    pub id: Uuid,
    /// Owning source.
    pub source_id: String,
    /// Original URL; llms-full sections append a synthetic `#section-N-<slug>` anchor.
    pub url: String,
    /// Section heading for llms-full sections.
    #[serde(default)]
    pub section_title: Option<String>,
    /// Section ordinal for llms-full sections.
    #[serde(default)]
    pub section_order: Option<i64>,
    /// Full markdown content.
    pub full_content: String,
    /// Word count of `full_content`.
    pub word_count: i64,
    /// Character count of `full_content`.
    pub char_count: i64,
    /// Number of chunks produced; patched in after chunking completes.
    #[serde(default)]
    pub chunk_count: i64,
    /// Arbitrary metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

/// Chunk row as fetched back for re-embedding.
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkRow {
    /// Row identifier.
    pub id: Uuid,
    /// Stored content.
    pub content: String,
    /// Originating URL.
    pub url: String,
    /// Chunk position.
    pub chunk_number: i64,
    /// Owning source.
    pub source_id: String,
    /// Stored metadata.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}
