//! HTTP surface for Archon.
//!
//! This module exposes the Axum router that drives the ingestion, retrieval and re-embed
//! core:
//!
//! - `POST /api/knowledge/crawl` / `POST /api/knowledge-items/upload` – start ingest jobs,
//!   returning 202 with a `progress_id`.
//! - `GET /api/crawl-progress/{id}` (ETag-aware) and `POST /api/crawl-progress/{id}/stop` –
//!   poll and cancel long-running operations.
//! - `POST /api/knowledge-items/search` – hybrid retrieval in `chunks` or `pages` mode.
//! - `GET /api/pages`, `GET /api/pages/{id}`, `GET /api/pages/by-url` – open the originals.
//! - `GET /api/sources` / `DELETE /api/sources/{source_id}` – list and cascade-delete.
//! - `POST /api/re-embed/start|stop/{id}`, `GET /api/re-embed/stats` – bulk recomputation.
//! - `POST /rpc` – the JSON-RPC tool bridge (see [`crate::rpc`]).
//! - `GET /health` – store reachability and ingestion counters.
//!
//! Every route sits behind a single bearer token; absence or mismatch yields 401.

use crate::config::get_config;
use crate::errors::ApiError;
use crate::metrics::IngestMetrics;
use crate::pipeline::{CrawlRequest, IngestPipeline, PipelineError, UploadRequest};
use crate::progress::ProgressTracker;
use crate::reembed::{ReEmbedError, ReEmbedService};
use crate::search::{ReturnMode, SearchEngine, SearchError, SearchRequest, SearchResponse};
use crate::sessions::SessionManager;
use crate::store::postgrest::PostgrestStore;
use crate::store::{StoreError, VectorStore};
use axum::{
    Json, Router,
    extract::{Path, Query, Request, State},
    http::{HeaderMap, StatusCode, header},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Shared state handed to every handler.
pub struct AppState {
    /// Ingestion pipeline.
    pub pipeline: Arc<IngestPipeline>,
    /// Retrieval engine.
    pub search: Arc<SearchEngine>,
    /// Bulk re-embedding service.
    pub reembed: Arc<ReEmbedService>,
    /// Columnar store (relational surface).
    pub store: Arc<PostgrestStore>,
    /// Vector backend receiving embedding-bearing rows.
    pub vectors: Arc<dyn VectorStore>,
    /// Tool-bridge session registry.
    pub sessions: SessionManager,
}

impl AppState {
    /// Wire up every component from the loaded configuration.
    ///
    /// Embedding-bearing rows go to Qdrant when `QDRANT_URL` is set; otherwise the columnar
    /// store serves both the relational and the vector surface. Both collections are
    /// ensured up front so the first ingest never races collection creation.
    pub async fn initialize() -> anyhow::Result<Arc<Self>> {
        let config = get_config();
        let store = Arc::new(PostgrestStore::new()?);
        let vectors: Arc<dyn VectorStore> = if config.qdrant_url.is_some() {
            Arc::new(crate::store::qdrant::QdrantStore::new()?)
        } else {
            Arc::clone(&store) as Arc<dyn VectorStore>
        };
        for collection in [crate::store::CHUNKS_COLLECTION, crate::store::CODE_COLLECTION] {
            vectors
                .create_collection(collection, 1536, crate::store::DistanceMetric::Cosine)
                .await?;
        }
        let embedder: Arc<dyn crate::embedding::EmbeddingClient> =
            Arc::from(crate::embedding::get_embedding_client()?);
        let tracker = ProgressTracker::new();
        let metrics = Arc::new(IngestMetrics::new());

        let pipeline = Arc::new(IngestPipeline::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            tracker.clone(),
            metrics,
        ));
        let search = Arc::new(SearchEngine::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
        ));
        let reembed = Arc::new(ReEmbedService::new(
            Arc::clone(&store),
            embedder,
            tracker,
        ));
        let sessions = SessionManager::new(Duration::from_secs(config.session_timeout_seconds));

        Ok(Arc::new(Self {
            pipeline,
            search,
            reembed,
            store,
            vectors,
            sessions,
        }))
    }
}

/// Build the full router with bearer authentication applied to every route.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/knowledge/crawl", post(start_crawl))
        .route("/api/knowledge-items/upload", post(start_upload))
        .route("/api/crawl-progress/:progress_id", get(get_progress))
        .route("/api/crawl-progress/:progress_id/stop", post(stop_progress))
        .route("/api/knowledge-items/search", post(search_knowledge))
        .route("/api/pages", get(list_pages))
        .route("/api/pages/by-url", get(get_page_by_url))
        .route("/api/pages/:page_id", get(get_page))
        .route("/api/sources", get(list_sources))
        .route("/api/sources/:source_id", delete(delete_source))
        .route("/api/re-embed/start", post(start_re_embed))
        .route("/api/re-embed/stop/:progress_id", post(stop_re_embed))
        .route("/api/re-embed/stats", get(re_embed_stats))
        .route("/rpc", post(crate::rpc::handle_rpc))
        .route("/health", get(health))
        .layer(middleware::from_fn(require_bearer_token))
        .with_state(state)
}

/// Reject requests whose bearer token is absent or wrong.
async fn require_bearer_token(request: Request, next: Next) -> Response {
    let expected = &get_config().api_token;
    let authorized = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token == expected.as_str())
        .unwrap_or(false);

    if !authorized {
        return ApiError::Unauthorized.into_response();
    }
    next.run(request).await
}

/// Request body for `POST /api/knowledge/crawl`.
#[derive(Deserialize)]
struct CrawlBody {
    url: String,
    #[serde(default = "default_knowledge_type")]
    knowledge_type: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_max_depth")]
    max_depth: usize,
    #[serde(default = "default_true")]
    extract_code_examples: bool,
    #[serde(default)]
    include_patterns: Vec<String>,
    #[serde(default)]
    exclude_patterns: Vec<String>,
}

fn default_knowledge_type() -> String {
    "documentation".to_string()
}

fn default_max_depth() -> usize {
    2
}

fn default_true() -> bool {
    true
}

/// 202 body for ingest starts.
#[derive(Serialize)]
struct ProgressStarted {
    progress_id: Uuid,
}

async fn start_crawl(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CrawlBody>,
) -> Result<(StatusCode, Json<ProgressStarted>), ApiError> {
    validate_knowledge_type(&body.knowledge_type)?;
    let progress_id = state
        .pipeline
        .start_crawl(CrawlRequest {
            url: body.url,
            knowledge_type: body.knowledge_type,
            tags: body.tags,
            max_depth: body.max_depth,
            extract_code_examples: body.extract_code_examples,
            include_patterns: body.include_patterns,
            exclude_patterns: body.exclude_patterns,
        })
        .await
        .map_err(pipeline_error)?;
    Ok((StatusCode::ACCEPTED, Json(ProgressStarted { progress_id })))
}

/// Request body for `POST /api/knowledge-items/upload`.
///
/// The browser-facing multipart decoding lives in the outer surface; the core accepts the
/// file inline, either as UTF-8 text or base64 for binary formats like PDF.
#[derive(Deserialize)]
struct UploadBody {
    filename: String,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    content_base64: Option<String>,
    #[serde(default = "default_knowledge_type")]
    knowledge_type: String,
    #[serde(default)]
    tags: Vec<String>,
    #[serde(default = "default_true")]
    extract_code_examples: bool,
}

async fn start_upload(
    State(state): State<Arc<AppState>>,
    Json(body): Json<UploadBody>,
) -> Result<(StatusCode, Json<ProgressStarted>), ApiError> {
    validate_knowledge_type(&body.knowledge_type)?;
    let bytes = match (&body.content, &body.content_base64) {
        (Some(text), _) => text.clone().into_bytes(),
        (None, Some(encoded)) => base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|error| ApiError::Validation(format!("invalid base64 content: {error}")))?,
        (None, None) => {
            return Err(ApiError::Validation(
                "either content or content_base64 is required".into(),
            ));
        }
    };

    let progress_id = state
        .pipeline
        .start_upload(UploadRequest {
            filename: body.filename,
            bytes,
            knowledge_type: body.knowledge_type,
            tags: body.tags,
            extract_code_examples: body.extract_code_examples,
        })
        .await
        .map_err(pipeline_error)?;
    Ok((StatusCode::ACCEPTED, Json(ProgressStarted { progress_id })))
}

async fn get_progress(
    State(state): State<Arc<AppState>>,
    Path(progress_id): Path<Uuid>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let record = state
        .pipeline
        .tracker()
        .get(progress_id)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("progress {progress_id}")))?;

    let body = serde_json::to_string(&record)
        .map_err(|error| ApiError::Internal(error.to_string()))?;
    let etag = format!("\"{}\"", hex::encode(&Sha256::digest(body.as_bytes())[..16]));

    if headers
        .get(header::IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|candidate| candidate == etag)
    {
        return Ok(StatusCode::NOT_MODIFIED.into_response());
    }

    let mut response = (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response();
    if let Ok(value) = header::HeaderValue::from_str(&etag) {
        response.headers_mut().insert(header::ETAG, value);
    }
    Ok(response)
}

async fn stop_progress(
    State(state): State<Arc<AppState>>,
    Path(progress_id): Path<Uuid>,
) -> Json<serde_json::Value> {
    // Idempotent: stopping a finished or unknown operation is a no-op.
    let stopped = state.pipeline.tracker().stop(progress_id).await;
    Json(json!({ "success": true, "stopped": stopped }))
}

/// Request body for `POST /api/knowledge-items/search`.
#[derive(Deserialize)]
struct SearchBody {
    query: String,
    #[serde(default)]
    source: Option<String>,
    #[serde(default)]
    match_count: Option<usize>,
    #[serde(default)]
    return_mode: ReturnMode,
}

async fn search_knowledge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SearchBody>,
) -> Result<Json<SearchResponse>, ApiError> {
    let response = state
        .search
        .search(SearchRequest {
            query: body.query,
            match_count: body.match_count,
            source_filter: body.source,
            return_mode: body.return_mode,
        })
        .await
        .map_err(search_error)?;
    Ok(Json(response))
}

/// Query parameters for `GET /api/pages`.
#[derive(Deserialize)]
struct PagesQuery {
    source_id: String,
    #[serde(default)]
    section: Option<String>,
    #[serde(default = "default_page_limit")]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

fn default_page_limit() -> usize {
    50
}

async fn list_pages(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PagesQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if query.source_id.trim().is_empty() {
        return Err(ApiError::Validation("source_id is required".into()));
    }
    let limit = query.limit.clamp(1, 200);
    let pages = state
        .store
        .list_pages(
            &query.source_id,
            query.section.as_deref(),
            limit,
            query.offset,
        )
        .await
        .map_err(store_error)?;
    let summaries: Vec<serde_json::Value> = pages
        .iter()
        .map(|page| {
            json!({
                "id": page.id,
                "url": page.url,
                "section_title": page.section_title,
                "section_order": page.section_order,
                "word_count": page.word_count,
                "chunk_count": page.chunk_count,
            })
        })
        .collect();
    Ok(Json(json!({
        "pages": summaries,
        "count": summaries.len(),
        "offset": query.offset,
    })))
}

async fn get_page(
    State(state): State<Arc<AppState>>,
    Path(page_id): Path<Uuid>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state.store.get_page(page_id).await.map_err(store_error)?;
    Ok(Json(render_page(page)))
}

/// Query parameters for `GET /api/pages/by-url`.
#[derive(Deserialize)]
struct PageByUrlQuery {
    url: String,
}

async fn get_page_by_url(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PageByUrlQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let page = state
        .store
        .get_page_by_url(&query.url)
        .await
        .map_err(store_error)?;
    Ok(Json(render_page(page)))
}

fn render_page(page: crate::store::PageRecord) -> serde_json::Value {
    let max_chars = get_config().max_page_chars;
    let content = if page.full_content.chars().count() > max_chars {
        format!(
            "[Content is {} characters, above the {} character inline limit. \
             Narrow the request to a section.]",
            page.full_content.chars().count(),
            max_chars
        )
    } else {
        page.full_content
    };
    json!({
        "id": page.id,
        "source_id": page.source_id,
        "url": page.url,
        "section_title": page.section_title,
        "section_order": page.section_order,
        "content": content,
        "word_count": page.word_count,
        "char_count": page.char_count,
        "chunk_count": page.chunk_count,
        "metadata": page.metadata,
    })
}

async fn list_sources(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let sources = state.store.list_sources().await.map_err(store_error)?;
    let count = sources.len();
    Ok(Json(json!({ "sources": sources, "count": count })))
}

async fn delete_source(
    State(state): State<Arc<AppState>>,
    Path(source_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    // Pages, chunks and code examples cascade with the source row.
    state
        .store
        .delete_source(&source_id)
        .await
        .map_err(store_error)?;

    // A separate vector backend holds its own copies of the embedding rows.
    let filter = crate::store::FilterCriteria::equals("source_id", source_id.as_str());
    for collection in [crate::store::CHUNKS_COLLECTION, crate::store::CODE_COLLECTION] {
        if let Err(error) = state.vectors.delete(collection, &filter, 100).await {
            tracing::warn!(source_id, collection, error = %error, "Vector cleanup failed");
        }
    }

    tracing::info!(source_id, "Source deleted");
    Ok(Json(json!({ "success": true, "source_id": source_id })))
}

async fn start_re_embed(
    State(state): State<Arc<AppState>>,
) -> Result<(StatusCode, Json<ProgressStarted>), ApiError> {
    let progress_id = state.reembed.start().await.map_err(|error| match error {
        ReEmbedError::AlreadyRunning => ApiError::Conflict(error.to_string()),
        ReEmbedError::Store(inner) => store_error(inner),
    })?;
    Ok((StatusCode::ACCEPTED, Json(ProgressStarted { progress_id })))
}

async fn stop_re_embed(
    State(state): State<Arc<AppState>>,
    Path(progress_id): Path<Uuid>,
) -> Json<serde_json::Value> {
    let stopped = state.reembed.stop(progress_id).await;
    Json(json!({ "success": true, "stopped": stopped }))
}

async fn re_embed_stats(
    State(state): State<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = state.reembed.stats().await.map_err(|error| match error {
        ReEmbedError::AlreadyRunning => ApiError::Conflict(error.to_string()),
        ReEmbedError::Store(inner) => store_error(inner),
    })?;
    Ok(Json(json!({ "stats": stats })))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let store = state.store.health_check().await;
    let sessions = state.sessions.active_sessions().await.len();
    Json(json!({
        "store": store,
        "ingestion": state.pipeline.metrics_snapshot(),
        "active_sessions": sessions,
    }))
}

fn validate_knowledge_type(knowledge_type: &str) -> Result<(), ApiError> {
    match knowledge_type {
        "documentation" | "technical" => Ok(()),
        other => Err(ApiError::Validation(format!(
            "knowledge_type must be 'documentation' or 'technical', got '{other}'"
        ))),
    }
}

fn pipeline_error(error: PipelineError) -> ApiError {
    match error {
        PipelineError::Validation(message) => ApiError::Validation(message),
        PipelineError::Crawl(crate::crawler::CrawlError::Validation(message)) => {
            ApiError::Validation(message)
        }
        other => ApiError::Internal(other.to_string()),
    }
}

fn search_error(error: SearchError) -> ApiError {
    match error {
        SearchError::Validation(message) => ApiError::Validation(message),
        SearchError::Store(inner) => store_error(inner),
        other => ApiError::Internal(other.to_string()),
    }
}

fn store_error(error: StoreError) -> ApiError {
    match error {
        StoreError::NotFound(what) => ApiError::NotFound(what),
        StoreError::Validation(message) => ApiError::Validation(message),
        StoreError::Conflict(message) => ApiError::Conflict(message),
        other => ApiError::Store(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CONFIG, Config, ProviderKind};
    use crate::embedding::{EmbeddingClient, EmbeddingError, EmbeddingOutcome, EmbeddingVector};
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::{Method, Request as HttpRequest};
    use std::sync::Once;
    use tower::ServiceExt;

    fn ensure_test_config() {
        static INIT: Once = Once::new();
        INIT.call_once(|| {
            let _ = CONFIG.set(Config {
                store_url: "http://127.0.0.1:9".into(),
                store_service_key: None,
                qdrant_url: None,
                qdrant_api_key: None,
                llm_provider: ProviderKind::Ollama,
                embedding_provider: ProviderKind::Ollama,
                embedding_model: "test-embed".into(),
                embedding_batch_size: 100,
                rag_agent_model: None,
                ollama_base_url: None,
                openai_api_key: None,
                openai_base_url: None,
                anthropic_api_key: None,
                bedrock_api_key: None,
                bedrock_region: None,
                lmstudio_base_url: None,
                server_port: None,
                allowed_origins: vec!["http://localhost:3737".into()],
                api_token: "test-token".into(),
                encryption_key: "test-encryption-key".into(),
                max_page_chars: 20_000,
                concurrent_crawl_limit: 3,
                session_timeout_seconds: 3600,
                chunk_size: 5_000,
                code_min_length: 20,
                use_contextual_embeddings: false,
                use_hybrid_search: false,
                use_reranking: false,
                reranker_url: None,
            });
        });
    }

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingClient for StubEmbedder {
        async fn embed_batch(
            &self,
            texts: &[String],
            _model: &str,
        ) -> Result<EmbeddingOutcome, EmbeddingError> {
            Ok(EmbeddingOutcome {
                embeddings: texts
                    .iter()
                    .map(|_| {
                        Some(EmbeddingVector {
                            values: vec![0.1; 768],
                            dimension: 768,
                        })
                    })
                    .collect(),
                failures: Vec::new(),
            })
        }
    }

    fn test_state() -> Arc<AppState> {
        ensure_test_config();
        let store = Arc::new(
            PostgrestStore::with_connection("http://127.0.0.1:9", None).expect("store"),
        );
        let vectors: Arc<dyn VectorStore> = Arc::clone(&store) as Arc<dyn VectorStore>;
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(StubEmbedder);
        let tracker = ProgressTracker::new();
        let metrics = Arc::new(IngestMetrics::new());
        let pipeline = Arc::new(IngestPipeline::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
            tracker.clone(),
            metrics,
        ));
        let search = Arc::new(SearchEngine::new(
            Arc::clone(&store),
            Arc::clone(&vectors),
            Arc::clone(&embedder),
        ));
        let reembed = Arc::new(ReEmbedService::new(
            Arc::clone(&store),
            embedder,
            tracker,
        ));
        Arc::new(AppState {
            pipeline,
            search,
            reembed,
            store,
            vectors,
            sessions: SessionManager::new(Duration::from_secs(3600)),
        })
    }

    fn authorized(builder: axum::http::request::Builder) -> axum::http::request::Builder {
        builder.header(header::AUTHORIZATION, "Bearer test-token")
    }

    #[tokio::test]
    async fn requests_without_token_get_401() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(Method::GET)
                    .uri("/health")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn wrong_token_gets_401() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(Method::GET)
                    .uri("/health")
                    .header(header::AUTHORIZATION, "Bearer wrong")
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn unknown_progress_is_404() {
        let app = create_router(test_state());
        let response = app
            .oneshot(
                authorized(HttpRequest::builder())
                    .method(Method::GET)
                    .uri(format!("/api/crawl-progress/{}", Uuid::new_v4()))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn progress_poll_honours_etag() {
        let state = test_state();
        let progress_id = Uuid::new_v4();
        state
            .pipeline
            .tracker()
            .start(
                progress_id,
                crate::progress::OperationType::Crawl,
                serde_json::Map::new(),
            )
            .await;

        let app = create_router(Arc::clone(&state));
        let first = app
            .clone()
            .oneshot(
                authorized(HttpRequest::builder())
                    .method(Method::GET)
                    .uri(format!("/api/crawl-progress/{progress_id}"))
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(first.status(), StatusCode::OK);
        let etag = first
            .headers()
            .get(header::ETAG)
            .and_then(|value| value.to_str().ok())
            .expect("etag present")
            .to_string();

        let second = app
            .oneshot(
                authorized(HttpRequest::builder())
                    .method(Method::GET)
                    .uri(format!("/api/crawl-progress/{progress_id}"))
                    .header(header::IF_NONE_MATCH, etag)
                    .body(Body::empty())
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(second.status(), StatusCode::NOT_MODIFIED);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let state = test_state();
        let progress_id = Uuid::new_v4();
        state
            .pipeline
            .tracker()
            .start(
                progress_id,
                crate::progress::OperationType::Crawl,
                serde_json::Map::new(),
            )
            .await;

        let app = create_router(Arc::clone(&state));
        for expected_stopped in [true, false] {
            let response = app
                .clone()
                .oneshot(
                    authorized(HttpRequest::builder())
                        .method(Method::POST)
                        .uri(format!("/api/crawl-progress/{progress_id}/stop"))
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("response");
            assert_eq!(response.status(), StatusCode::OK);
            let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
            let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
            assert_eq!(body["stopped"], json!(expected_stopped));
        }
    }

    #[tokio::test]
    async fn crawl_rejects_dangerous_urls_before_registering() {
        let app = create_router(test_state());
        let payload = json!({ "url": "http://127.0.0.1/internal", "knowledge_type": "documentation" });
        let response = app
            .oneshot(
                authorized(HttpRequest::builder())
                    .method(Method::POST)
                    .uri("/api/knowledge/crawl")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn crawl_rejects_bad_knowledge_type() {
        let app = create_router(test_state());
        let payload = json!({ "url": "https://docs.example.com", "knowledge_type": "mystery" });
        let response = app
            .oneshot(
                authorized(HttpRequest::builder())
                    .method(Method::POST)
                    .uri("/api/knowledge/crawl")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn upload_requires_content() {
        let app = create_router(test_state());
        let payload = json!({ "filename": "notes.md" });
        let response = app
            .oneshot(
                authorized(HttpRequest::builder())
                    .method(Method::POST)
                    .uri("/api/knowledge-items/upload")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn search_rejects_empty_queries() {
        let app = create_router(test_state());
        let payload = json!({ "query": "   " });
        let response = app
            .oneshot(
                authorized(HttpRequest::builder())
                    .method(Method::POST)
                    .uri("/api/knowledge-items/search")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn rpc_rejects_unknown_methods_with_json_rpc_error() {
        let app = create_router(test_state());
        let payload = json!({ "jsonrpc": "2.0", "method": "frobnicate", "params": {}, "id": 1 });
        let response = app
            .oneshot(
                authorized(HttpRequest::builder())
                    .method(Method::POST)
                    .uri("/rpc")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(payload.to_string()))
                    .expect("request"),
            )
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(crate::rpc::SESSION_HEADER));

        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let body: serde_json::Value = serde_json::from_slice(&bytes).expect("json");
        assert_eq!(body["error"]["code"], json!(-32601));
        assert_eq!(body["id"], json!(1));
    }
}
