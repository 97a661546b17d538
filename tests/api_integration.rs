//! Router-level integration tests.
//!
//! The store is an httpmock PostgREST stand-in and the embedding provider is a local stub,
//! so these tests exercise the real pipeline, progress registry, search engine and RPC
//! bridge end to end without external services.

use archon::api::{AppState, create_router};
use archon::config::{CONFIG, Config, ProviderKind};
use archon::embedding::{EmbeddingClient, EmbeddingError, EmbeddingOutcome, EmbeddingVector};
use archon::metrics::IngestMetrics;
use archon::pipeline::IngestPipeline;
use archon::progress::ProgressTracker;
use archon::reembed::ReEmbedService;
use archon::search::SearchEngine;
use archon::sessions::SessionManager;
use archon::store::postgrest::PostgrestStore;
use archon::store::VectorStore;
use async_trait::async_trait;
use axum::body::{Body, to_bytes};
use axum::http::{Method, Request, StatusCode, header};
use httpmock::MockServer;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const TOKEN: &str = "integration-token";

fn ensure_config() {
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
        ollama_base_url: Some("http://127.0.0.1:9".into()),
        openai_api_key: None,
        openai_base_url: None,
        anthropic_api_key: None,
        bedrock_api_key: None,
        bedrock_region: None,
        lmstudio_base_url: None,
        server_port: None,
        allowed_origins: vec!["http://localhost:3737".into()],
        api_token: TOKEN.into(),
        encryption_key: "integration-encryption-key".into(),
        max_page_chars: 20_000,
        concurrent_crawl_limit: 3,
        session_timeout_seconds: 3600,
        chunk_size: 200,
        code_min_length: 20,
        use_contextual_embeddings: false,
        use_hybrid_search: false,
        use_reranking: false,
        reranker_url: None,
    });
}

/// Deterministic embedder: every text becomes a 768-wide constant vector.
struct StubEmbedder {
    delay: Duration,
}

#[async_trait]
impl EmbeddingClient for StubEmbedder {
    async fn embed_batch(
        &self,
        texts: &[String],
        _model: &str,
    ) -> Result<EmbeddingOutcome, EmbeddingError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(EmbeddingOutcome {
            embeddings: texts
                .iter()
                .map(|_| {
                    Some(EmbeddingVector {
                        values: vec![0.25; 768],
                        dimension: 768,
                    })
                })
                .collect(),
            failures: Vec::new(),
        })
    }
}

fn build_state(store_base: &str, embed_delay: Duration) -> Arc<AppState> {
    ensure_config();
    let store = Arc::new(PostgrestStore::with_connection(store_base, None).expect("store"));
    let vectors: Arc<dyn VectorStore> = Arc::clone(&store) as Arc<dyn VectorStore>;
    let embedder: Arc<dyn EmbeddingClient> = Arc::new(StubEmbedder { delay: embed_delay });
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
    let reembed = Arc::new(ReEmbedService::new(Arc::clone(&store), embedder, tracker));

    Arc::new(AppState {
        pipeline,
        search,
        reembed,
        store,
        vectors,
        sessions: SessionManager::new(Duration::from_secs(3600)),
    })
}

fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json");
    match body {
        Some(body) => builder.body(Body::from(body.to_string())).expect("request"),
        None => builder.body(Body::empty()).expect("request"),
    }
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
    serde_json::from_slice(&bytes).expect("json body")
}

/// Poll the progress endpoint until the operation reaches a terminal state.
async fn wait_for_terminal(app: &axum::Router, progress_id: &str) -> Value {
    for _ in 0..100 {
        let response = app
            .clone()
            .oneshot(request(
                Method::GET,
                &format!("/api/crawl-progress/{progress_id}"),
                None,
            ))
            .await
            .expect("progress response");
        assert_eq!(response.status(), StatusCode::OK);
        let record = json_body(response).await;
        let status = record["status"].as_str().expect("status").to_string();
        if matches!(status.as_str(), "completed" | "cancelled" | "error") {
            return record;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("operation never reached a terminal state");
}

async fn mock_store_writes(server: &MockServer) {
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/sources");
            then.status(201);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::PATCH).path("/sources");
            then.status(204);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/pages");
            then.status(201);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::PATCH).path("/pages");
            then.status(204);
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/code_examples");
            then.status(201);
        })
        .await;
}

#[tokio::test]
async fn upload_ingestion_runs_to_completion() {
    let store = MockServer::start_async().await;
    mock_store_writes(&store).await;
    let chunk_upserts = store
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/crawled_pages")
                .query_param("on_conflict", "url,chunk_number")
                .body_contains("\"embedding_768\":[")
                .body_contains("\"embedding_1536\":null");
            then.status(201);
        })
        .await;

    let state = build_state(&store.base_url(), Duration::ZERO);
    let app = create_router(state);

    let markdown = format!(
        "# Core Concepts\n\nAlpha text about ingestion. {}\n\n# Getting Started\n\nBeta text. {}\n\n```python\ndef ingest(doc):\n    return chunk(doc)\n```\n",
        "More prose here. ".repeat(20),
        "Setup steps follow. ".repeat(20),
    );
    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/api/knowledge-items/upload",
            Some(json!({
                "filename": "guide.md",
                "content": markdown,
                "knowledge_type": "documentation",
                "tags": ["rust"],
                "extract_code_examples": true,
            })),
        ))
        .await
        .expect("upload response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    let progress_id = body["progress_id"].as_str().expect("progress id").to_string();

    let record = wait_for_terminal(&app, &progress_id).await;
    assert_eq!(record["status"], json!("completed"));
    assert_eq!(record["progress"], json!(100));
    assert_eq!(record["payload"]["pages_stored"], json!(1));
    assert!(record["payload"]["chunks_processed"].as_u64().unwrap() >= 2);
    assert_eq!(record["payload"]["chunks_failed"], json!(0));
    assert_eq!(record["payload"]["code_examples_stored"], json!(1));

    // At least one chunk batch landed with exactly the 768 column populated.
    assert!(chunk_upserts.hits_async().await >= 1);
}

#[tokio::test]
async fn upload_cancellation_stops_before_store_writes() {
    let store = MockServer::start_async().await;
    mock_store_writes(&store).await;
    let chunk_upserts = store
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/crawled_pages");
            then.status(201);
        })
        .await;

    // A slow embedder keeps the job inside the pipeline long enough to cancel it.
    let state = build_state(&store.base_url(), Duration::from_millis(250));
    let app = create_router(state);

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/api/knowledge-items/upload",
            Some(json!({
                "filename": "big.md",
                "content": "word ".repeat(20_000),
                "knowledge_type": "technical",
            })),
        ))
        .await
        .expect("upload response");
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let body = json_body(response).await;
    let progress_id = body["progress_id"].as_str().expect("progress id").to_string();

    let stop = app
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/api/crawl-progress/{progress_id}/stop"),
            None,
        ))
        .await
        .expect("stop response");
    assert_eq!(stop.status(), StatusCode::OK);

    let record = wait_for_terminal(&app, &progress_id).await;
    assert_eq!(record["status"], json!("cancelled"));

    // The cancellation checkpoint runs before each upsert batch.
    assert_eq!(chunk_upserts.hits_async().await, 0);

    // Stopping again is a no-op.
    let second = app
        .clone()
        .oneshot(request(
            Method::POST,
            &format!("/api/crawl-progress/{progress_id}/stop"),
            None,
        ))
        .await
        .expect("second stop");
    let second_body = json_body(second).await;
    assert_eq!(second_body["stopped"], json!(false));
}

#[tokio::test]
async fn search_passes_source_filter_through_to_the_store() {
    let store = MockServer::start_async().await;
    let match_rpc = store
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST)
                .path("/rpc/match_crawled_pages")
                .json_body_partial(json!({ "source_filter": "s1.example.com" }).to_string());
            then.status(200).json_body(json!([
                {
                    "id": "7a6f3a52-11f2-4b41-9149-3e6cbd1f0d6f",
                    "source_id": "s1.example.com",
                    "url": "https://s1.example.com/docker",
                    "chunk_number": 0,
                    "content": "Docker compose quickstart",
                    "metadata": {"knowledge_type": "documentation"},
                    "similarity": 0.92
                }
            ]));
        })
        .await;

    let state = build_state(&store.base_url(), Duration::ZERO);
    let app = create_router(state);

    let response = app
        .oneshot(request(
            Method::POST,
            "/api/knowledge-items/search",
            Some(json!({
                "query": "docker",
                "source": "s1.example.com",
                "match_count": 5,
            })),
        ))
        .await
        .expect("search response");
    assert_eq!(response.status(), StatusCode::OK);

    let body = json_body(response).await;
    assert_eq!(body["success"], json!(true));
    assert_eq!(body["search_mode"], json!("vector"));
    assert_eq!(body["total_found"], json!(1));
    let result = &body["results"][0];
    assert_eq!(result["metadata"]["source_id"], json!("s1.example.com"));
    assert!(result["similarity_score"].as_f64().unwrap() <= 1.0);
    match_rpc.assert_async().await;
}

#[tokio::test]
async fn rpc_rag_query_round_trips_with_session_header() {
    let store = MockServer::start_async().await;
    store
        .mock_async(|when, then| {
            when.method(httpmock::Method::POST).path("/rpc/match_crawled_pages");
            then.status(200).json_body(json!([
                {
                    "id": "2d1bb5a3-79a5-4a3b-8d14-51e0fb8b4f6e",
                    "source_id": "docs.example.com",
                    "url": "https://docs.example.com/intro",
                    "chunk_number": 1,
                    "content": "Introduction to the system",
                    "metadata": {},
                    "similarity": 0.77
                }
            ]));
        })
        .await;

    let state = build_state(&store.base_url(), Duration::ZERO);
    let app = create_router(state);

    let response = app
        .clone()
        .oneshot(request(
            Method::POST,
            "/rpc",
            Some(json!({
                "jsonrpc": "2.0",
                "method": "perform_rag_query",
                "params": { "query": "introduction", "match_count": 3 },
                "id": 42,
            })),
        ))
        .await
        .expect("rpc response");
    assert_eq!(response.status(), StatusCode::OK);

    let session = response
        .headers()
        .get("mcp-session-id")
        .and_then(|value| value.to_str().ok())
        .expect("session header")
        .to_string();

    let body = json_body(response).await;
    assert_eq!(body["jsonrpc"], json!("2.0"));
    assert_eq!(body["id"], json!(42));
    assert_eq!(body["result"]["total_found"], json!(1));
    assert_eq!(
        body["result"]["results"][0]["metadata"]["source_id"],
        json!("docs.example.com")
    );

    // Presenting the issued session id keeps the session.
    let follow_up = app
        .oneshot(
            Request::builder()
                .method(Method::POST)
                .uri("/rpc")
                .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
                .header(header::CONTENT_TYPE, "application/json")
                .header("mcp-session-id", &session)
                .body(Body::from(
                    json!({
                        "jsonrpc": "2.0",
                        "method": "get_available_sources",
                        "params": {},
                        "id": 43,
                    })
                    .to_string(),
                ))
                .expect("request"),
        )
        .await
        .expect("rpc response");
    let echoed = follow_up
        .headers()
        .get("mcp-session-id")
        .and_then(|value| value.to_str().ok())
        .expect("session header")
        .to_string();
    assert_eq!(echoed, session);
}

#[tokio::test]
async fn source_deletion_cascades_through_the_store() {
    let store = MockServer::start_async().await;
    let delete_mock = store
        .mock_async(|when, then| {
            when.method(httpmock::Method::DELETE)
                .path("/sources")
                .query_param("source_id", "eq.old.example.com");
            then.status(204);
        })
        .await;

    let state = build_state(&store.base_url(), Duration::ZERO);
    let app = create_router(state);

    let response = app
        .oneshot(request(
            Method::DELETE,
            "/api/sources/old.example.com",
            None,
        ))
        .await
        .expect("delete response");
    assert_eq!(response.status(), StatusCode::OK);
    delete_mock.assert_async().await;
}
