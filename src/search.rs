//! Hybrid vector + keyword retrieval with optional reranking.
//!
//! A query is embedded with the active model and routed to the matching dimension column;
//! vector candidates are optionally unioned with keyword matches (rank-weighted boost) and
//! optionally re-ordered by an external cross-encoder. Results come back in `chunks` mode
//! (raw chunk payloads) or `pages` mode (chunks grouped by page, oversized bodies replaced
//! with a placeholder so agents request detail explicitly).
//!
//! Ordering is deterministic: rerank score when present, then similarity, then
//! `chunk_number`, then id.

use crate::config::get_config;
use crate::embedding::EmbeddingClient;
use crate::errors::redact_secrets;
use crate::store::postgrest::PostgrestStore;
use crate::store::{
    CHUNKS_COLLECTION, CODE_COLLECTION, ScoredDocument, SearchQuery, StoreError, VectorStore,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Upper bound applied to `match_count`.
const MAX_MATCH_COUNT: usize = 50;

/// Default `match_count` when the caller omits it.
const DEFAULT_MATCH_COUNT: usize = 10;

/// Candidate multiplier while reranking is enabled.
const RERANK_CANDIDATE_FACTOR: usize = 3;

/// Baseline similarity floor requested from the store.
const SIMILARITY_FLOOR: f32 = 0.05;

/// Maximum boost contributed by the best keyword rank.
const KEYWORD_BOOST: f32 = 0.1;

/// Placeholder body returned for pages longer than `MAX_PAGE_CHARS`.
const LARGE_PAGE_PLACEHOLDER: &str =
    "[Content exceeds the inline limit. Fetch this page by id for the full text.]";

/// Errors raised by the search engine.
#[derive(Debug, Error)]
pub enum SearchError {
    /// Bad query input.
    #[error("{0}")]
    Validation(String),
    /// Query embedding failed.
    #[error("Failed to embed query: {0}")]
    Embedding(#[from] crate::embedding::EmbeddingError),
    /// Store round-trip failed.
    #[error("Search request failed: {0}")]
    Store(#[from] StoreError),
}

/// Return shape requested by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnMode {
    /// Individual chunk payloads.
    #[default]
    Chunks,
    /// Whole pages grouped from their best chunks.
    Pages,
}

/// Parameters for one retrieval call.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Non-empty query text.
    pub query: String,
    /// Number of results; clamped to `[1, 50]`, default 10.
    pub match_count: Option<usize>,
    /// Restrict results to one source.
    pub source_filter: Option<String>,
    /// Chunks or pages.
    pub return_mode: ReturnMode,
}

/// One search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    /// Row id of the chunk (or page in pages mode).
    pub id: Uuid,
    /// Chunk content, or page content in pages mode.
    pub content: String,
    /// Stored metadata; always carries `source_id` and `url`.
    pub metadata: Map<String, Value>,
    /// Vector similarity in `[0, 1]` (keyword boost included in hybrid mode).
    pub similarity_score: f32,
    /// Cross-encoder score when reranking ran.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rerank_score: Option<f32>,
}

/// Envelope returned to every search caller.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    /// Always true when the call returns; failures surface as errors instead.
    pub success: bool,
    /// Ordered results.
    pub results: Vec<SearchResult>,
    /// `vector`, `hybrid`, or the same with `+rerank`.
    pub search_mode: String,
    /// Number of results after filtering and truncation.
    pub total_found: usize,
}

/// Hybrid retrieval engine over the chunk and code-example collections.
pub struct SearchEngine {
    store: Arc<PostgrestStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    http: reqwest::Client,
}

impl SearchEngine {
    /// Build the engine from shared components.
    ///
    /// Vector similarity goes through `vectors`; keyword search and page lookups always go
    /// through the relational store.
    pub fn new(
        store: Arc<PostgrestStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("archon/search")
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client construction is infallible with static config");
        Self {
            store,
            vectors,
            embedder,
            http,
        }
    }

    /// Retrieve chunks (or pages) for a RAG query.
    pub async fn search(&self, request: SearchRequest) -> Result<SearchResponse, SearchError> {
        self.search_collection(CHUNKS_COLLECTION, request).await
    }

    /// Retrieve code examples; identical pipeline over the code collection.
    pub async fn search_code_examples(
        &self,
        request: SearchRequest,
    ) -> Result<SearchResponse, SearchError> {
        let request = SearchRequest {
            return_mode: ReturnMode::Chunks,
            ..request
        };
        self.search_collection(CODE_COLLECTION, request).await
    }

    async fn search_collection(
        &self,
        collection: &str,
        request: SearchRequest,
    ) -> Result<SearchResponse, SearchError> {
        let query = request.query.trim();
        if query.is_empty() {
            return Err(SearchError::Validation("query must be non-empty".into()));
        }
        let config = get_config();
        let match_count = request
            .match_count
            .unwrap_or(DEFAULT_MATCH_COUNT)
            .clamp(1, MAX_MATCH_COUNT);

        let rerank = config.use_reranking && config.reranker_url.is_some();
        let candidate_count = if rerank {
            match_count * RERANK_CANDIDATE_FACTOR
        } else {
            match_count
        };

        let embedding = self.embed_query(query, &config.embedding_model).await?;

        let mut filter = Map::new();
        if let Some(source) = &request.source_filter {
            filter.insert("source_id".into(), json!(source));
        }
        let mut candidates = self
            .vectors
            .search(
                collection,
                &SearchQuery {
                    embedding,
                    match_count: candidate_count,
                    filter_metadata: filter,
                    similarity_threshold: SIMILARITY_FLOOR,
                },
            )
            .await?;

        let mut search_mode = String::from("vector");
        if config.use_hybrid_search {
            search_mode = String::from("hybrid");
            let keyword_hits = self
                .store
                .keyword_search(
                    collection,
                    query,
                    candidate_count,
                    request.source_filter.as_deref(),
                )
                .await
                .unwrap_or_else(|error| {
                    tracing::warn!(error = %error, "Keyword search failed; vector-only results");
                    Vec::new()
                });
            merge_keyword_hits(&mut candidates, keyword_hits);
        }

        let mut results = to_results(candidates);

        if rerank {
            if let Some(reranker_url) = &config.reranker_url {
                match self.rerank(reranker_url, query, &results).await {
                    Ok(scores) => {
                        for (result, score) in results.iter_mut().zip(scores) {
                            result.rerank_score = Some(score);
                        }
                        search_mode.push_str("+rerank");
                    }
                    Err(error) => {
                        tracing::warn!(error = %redact_secrets(&error), "Rerank failed; keeping vector order");
                    }
                }
            }
        }

        sort_results(&mut results);
        results.truncate(match_count);

        if request.return_mode == ReturnMode::Pages && collection == CHUNKS_COLLECTION {
            results = self.group_into_pages(results, config.max_page_chars).await?;
        }

        Ok(SearchResponse {
            success: true,
            total_found: results.len(),
            search_mode,
            results,
        })
    }

    async fn embed_query(&self, query: &str, model: &str) -> Result<Vec<f32>, SearchError> {
        let texts = [query.to_string()];
        let outcome = self.embedder.embed_batch(&texts, model).await?;
        outcome
            .embeddings
            .into_iter()
            .next()
            .flatten()
            .map(|vector| vector.values)
            .ok_or_else(|| {
                SearchError::Validation("embedding provider returned nothing for the query".into())
            })
    }

    /// Score candidates with the external cross-encoder service.
    async fn rerank(
        &self,
        reranker_url: &str,
        query: &str,
        results: &[SearchResult],
    ) -> Result<Vec<f32>, String> {
        #[derive(Deserialize)]
        struct RerankResponse {
            scores: Vec<f32>,
        }

        let documents: Vec<&str> = results.iter().map(|result| result.content.as_str()).collect();
        let response = self
            .http
            .post(format!("{}/rerank", reranker_url.trim_end_matches('/')))
            .json(&json!({ "query": query, "documents": documents }))
            .send()
            .await
            .map_err(|error| error.to_string())?;
        if !response.status().is_success() {
            return Err(format!("reranker returned {}", response.status()));
        }
        let parsed: RerankResponse = response.json().await.map_err(|error| error.to_string())?;
        if parsed.scores.len() != results.len() {
            return Err(format!(
                "reranker returned {} scores for {} documents",
                parsed.scores.len(),
                results.len()
            ));
        }
        Ok(parsed.scores)
    }

    /// Group chunk hits by page, returning page records ordered by best chunk score.
    async fn group_into_pages(
        &self,
        results: Vec<SearchResult>,
        max_page_chars: usize,
    ) -> Result<Vec<SearchResult>, SearchError> {
        let mut order: Vec<Uuid> = Vec::new();
        let mut best: HashMap<Uuid, SearchResult> = HashMap::new();

        for result in results {
            let Some(page_id) = result
                .metadata
                .get("page_id")
                .and_then(Value::as_str)
                .and_then(|value| Uuid::parse_str(value).ok())
            else {
                continue;
            };
            if !best.contains_key(&page_id) {
                order.push(page_id);
                best.insert(page_id, result);
            }
        }

        let mut pages = Vec::with_capacity(order.len());
        for page_id in order {
            let chunk_hit = best.remove(&page_id).expect("page id recorded above");
            let page = match self.store.get_page(page_id).await {
                Ok(page) => page,
                Err(StoreError::NotFound(_)) => continue,
                Err(error) => return Err(error.into()),
            };

            let content = if page.full_content.chars().count() > max_page_chars {
                LARGE_PAGE_PLACEHOLDER.to_string()
            } else {
                page.full_content
            };

            let mut metadata = page.metadata;
            metadata.insert("source_id".into(), json!(page.source_id));
            metadata.insert("url".into(), json!(page.url));
            metadata.insert("word_count".into(), json!(page.word_count));
            if let Some(section_title) = page.section_title {
                metadata.insert("section_title".into(), json!(section_title));
            }
            pages.push(SearchResult {
                id: page.id,
                content,
                metadata,
                similarity_score: chunk_hit.similarity_score,
                rerank_score: chunk_hit.rerank_score,
            });
        }
        Ok(pages)
    }
}

/// Union keyword hits into the candidate set with a rank-weighted boost.
fn merge_keyword_hits(candidates: &mut Vec<ScoredDocument>, keyword_hits: Vec<ScoredDocument>) {
    let total = keyword_hits.len().max(1);
    let mut present: HashMap<Uuid, usize> = candidates
        .iter()
        .enumerate()
        .map(|(index, doc)| (doc.id, index))
        .collect();

    for (rank, mut hit) in keyword_hits.into_iter().enumerate() {
        let boost = KEYWORD_BOOST * (total - rank) as f32 / total as f32;
        match present.get(&hit.id) {
            Some(&index) => {
                candidates[index].similarity = (candidates[index].similarity + boost).min(1.0);
            }
            None => {
                hit.similarity = boost;
                present.insert(hit.id, candidates.len());
                candidates.push(hit);
            }
        }
    }
}

fn to_results(candidates: Vec<ScoredDocument>) -> Vec<SearchResult> {
    candidates
        .into_iter()
        .map(|doc| {
            let mut metadata = doc.metadata;
            metadata.insert("source_id".into(), json!(doc.source_id));
            metadata.insert("url".into(), json!(doc.url));
            if let Some(chunk_number) = doc.chunk_number {
                metadata.insert("chunk_number".into(), json!(chunk_number));
            }
            if let Some(page_id) = doc.page_id {
                metadata.insert("page_id".into(), json!(page_id));
            }
            SearchResult {
                id: doc.id,
                content: doc.content,
                metadata,
                similarity_score: doc.similarity.clamp(0.0, 1.0),
                rerank_score: None,
            }
        })
        .collect()
}

/// Deterministic ordering: rerank desc, similarity desc, chunk_number asc, id asc.
fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| {
        let by_rerank = match (b.rerank_score, a.rerank_score) {
            (Some(rb), Some(ra)) => rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal),
            _ => std::cmp::Ordering::Equal,
        };
        by_rerank
            .then_with(|| {
                b.similarity_score
                    .partial_cmp(&a.similarity_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .then_with(|| {
                let chunk_a = a.metadata.get("chunk_number").and_then(Value::as_i64);
                let chunk_b = b.metadata.get("chunk_number").and_then(Value::as_i64);
                chunk_a.cmp(&chunk_b)
            })
            .then_with(|| a.id.cmp(&b.id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(id_byte: u8, similarity: f32, chunk_number: i64) -> ScoredDocument {
        ScoredDocument {
            id: Uuid::from_bytes([id_byte; 16]),
            source_id: "example.com".into(),
            page_id: None,
            url: format!("https://example.com/{id_byte}"),
            chunk_number: Some(chunk_number),
            content: format!("content {id_byte}"),
            metadata: Map::new(),
            similarity,
        }
    }

    #[test]
    fn results_sort_by_similarity_then_chunk_then_id() {
        let mut results = to_results(vec![
            doc(3, 0.5, 4),
            doc(1, 0.9, 2),
            doc(2, 0.5, 1),
            doc(4, 0.5, 1),
        ]);
        sort_results(&mut results);

        assert_eq!(results[0].id, Uuid::from_bytes([1; 16]));
        // Equal similarity: lower chunk_number wins, then id.
        assert_eq!(results[1].id, Uuid::from_bytes([2; 16]));
        assert_eq!(results[2].id, Uuid::from_bytes([4; 16]));
        assert_eq!(results[3].id, Uuid::from_bytes([3; 16]));
    }

    #[test]
    fn rerank_scores_dominate_ordering() {
        let mut results = to_results(vec![doc(1, 0.9, 0), doc(2, 0.2, 1)]);
        results[0].rerank_score = Some(0.1);
        results[1].rerank_score = Some(0.8);
        sort_results(&mut results);
        assert_eq!(results[0].id, Uuid::from_bytes([2; 16]));
    }

    #[test]
    fn keyword_union_boosts_existing_and_appends_new() {
        let mut candidates = vec![doc(1, 0.8, 0)];
        let keyword = vec![doc(1, 0.0, 0), doc(9, 0.0, 3)];
        merge_keyword_hits(&mut candidates, keyword);

        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].similarity > 0.8);
        // Keyword-only hit enters with just its rank boost.
        assert!(candidates[1].similarity <= KEYWORD_BOOST);
        assert_eq!(candidates[1].id, Uuid::from_bytes([9; 16]));
    }

    #[test]
    fn scores_stay_in_unit_range() {
        let mut candidates = vec![doc(1, 0.98, 0)];
        merge_keyword_hits(&mut candidates, vec![doc(1, 0.0, 0)]);
        assert!(candidates[0].similarity <= 1.0);

        let results = to_results(candidates);
        assert!(results[0].similarity_score >= 0.0 && results[0].similarity_score <= 1.0);
    }

    #[test]
    fn metadata_carries_source_and_url() {
        let results = to_results(vec![doc(5, 0.7, 2)]);
        assert_eq!(results[0].metadata["source_id"], json!("example.com"));
        assert_eq!(results[0].metadata["url"], json!("https://example.com/5"));
        assert_eq!(results[0].metadata["chunk_number"], json!(2));
    }
}
