//! Qdrant-backed vector store.
//!
//! The pure-vector alternative to the columnar SQL backend. Each collection is created with
//! four named vectors (`768`, `1024`, `1536`, `3072`) so embeddings of different widths
//! co-locate the same way the SQL store's dimension columns do; queries select the named
//! vector matching the query width.

use crate::config::get_config;
use crate::errors::redact_secrets;
use crate::store::{
    CollectionInfo, DistanceMetric, FilterCriteria, FilterValue, HealthSnapshot, ScoredDocument,
    SearchQuery, StoreError, SUPPORTED_DIMENSIONS, UpsertOutcome, VectorDocument, VectorStore,
    normalize_source_filter, validate_document,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// Lightweight HTTP client for Qdrant operations.
pub struct QdrantStore {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl QdrantStore {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, StoreError> {
        let config = get_config();
        let base_url = config.qdrant_url.clone().ok_or_else(|| {
            StoreError::Validation("QDRANT_URL is required for the qdrant backend".into())
        })?;
        Self::with_connection(&base_url, config.qdrant_api_key.clone())
    }

    /// Construct a client against an explicit endpoint (used by tests).
    pub fn with_connection(base_url: &str, api_key: Option<String>) -> Result<Self, StoreError> {
        let client = Client::builder().user_agent("archon/0.3").build()?;
        let base_url = normalize_base_url(base_url).map_err(StoreError::InvalidUrl)?;
        tracing::debug!(
            url = %base_url,
            has_api_key = api_key.as_deref().map(|value| !value.is_empty()).unwrap_or(false),
            "Initialized Qdrant client"
        );
        Ok(Self {
            client,
            base_url,
            api_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(api_key) = &self.api_key
            && !api_key.is_empty()
        {
            req = req.header("api-key", api_key);
        }
        req
    }

    async fn ensure_success(&self, response: reqwest::Response) -> Result<(), StoreError> {
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = StoreError::UnexpectedStatus { status, body };
        tracing::error!(error = %error, "Qdrant request failed");
        Err(error)
    }

    async fn collection_exists(&self, name: &str) -> Result<bool, StoreError> {
        let response = self
            .request(Method::GET, &format!("collections/{name}"))
            .send()
            .await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(StoreError::UnexpectedStatus { status, body })
            }
        }
    }

    async fn upsert_batch(
        &self,
        collection: &str,
        batch: &[VectorDocument],
    ) -> Result<(), StoreError> {
        let points: Vec<Value> = batch.iter().map(point_body).collect();
        let response = self
            .request(Method::PUT, &format!("collections/{collection}/points"))
            .query(&[("wait", true)])
            .json(&json!({ "points": points }))
            .send()
            .await?;
        self.ensure_success(response).await
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn create_collection(
        &self,
        name: &str,
        _vector_size: usize,
        distance: DistanceMetric,
    ) -> Result<(), StoreError> {
        if self.collection_exists(name).await? {
            return Ok(());
        }

        let distance = match distance {
            DistanceMetric::Cosine => "Cosine",
            DistanceMetric::Euclidean => "Euclid",
            DistanceMetric::Dot => "Dot",
        };
        let mut vectors = Map::new();
        for dimension in SUPPORTED_DIMENSIONS {
            vectors.insert(
                dimension.to_string(),
                json!({ "size": dimension, "distance": distance }),
            );
        }

        let response = self
            .request(Method::PUT, &format!("collections/{name}"))
            .json(&json!({ "vectors": vectors }))
            .send()
            .await?;
        self.ensure_success(response).await?;
        tracing::debug!(collection = name, "Collection created");
        Ok(())
    }

    async fn upsert(
        &self,
        collection: &str,
        documents: Vec<VectorDocument>,
        batch_size: usize,
    ) -> Result<Vec<UpsertOutcome>, StoreError> {
        let batch_size = batch_size.max(1);
        let mut outcomes = Vec::with_capacity(documents.len());
        let mut valid = Vec::with_capacity(documents.len());

        for document in documents {
            match validate_document(&document) {
                Ok(()) => valid.push(document),
                Err(error) => outcomes.push(UpsertOutcome {
                    id: document.id,
                    stored: false,
                    error: Some(error.to_string()),
                }),
            }
        }

        for batch in valid.chunks(batch_size) {
            let mut result = self.upsert_batch(collection, batch).await;
            if result.is_err() {
                tracing::warn!(collection, "Qdrant upsert batch failed; retrying once");
                result = self.upsert_batch(collection, batch).await;
            }
            match result {
                Ok(()) => outcomes.extend(batch.iter().map(|doc| UpsertOutcome {
                    id: doc.id,
                    stored: true,
                    error: None,
                })),
                Err(error) => {
                    let message = redact_secrets(&error.to_string());
                    outcomes.extend(batch.iter().map(|doc| UpsertOutcome {
                        id: doc.id,
                        stored: false,
                        error: Some(message.clone()),
                    }));
                }
            }
        }

        Ok(outcomes)
    }

    async fn search(
        &self,
        collection: &str,
        query: &SearchQuery,
    ) -> Result<Vec<ScoredDocument>, StoreError> {
        if query.embedding.is_empty() {
            return Err(StoreError::Validation(
                "query embedding must be non-empty".into(),
            ));
        }

        let mut body = json!({
            "query": query.embedding,
            "using": query.embedding.len().to_string(),
            "limit": query.match_count,
            "score_threshold": query.similarity_threshold,
            "with_payload": true,
        });
        if let Some(source_id) = normalize_source_filter(&query.filter_metadata) {
            body.as_object_mut()
                .expect("query body should remain an object")
                .insert(
                    "filter".into(),
                    json!({
                        "must": [
                            { "key": "source_id", "match": { "value": source_id } }
                        ]
                    }),
                );
        }

        let response = self
            .request(Method::POST, &format!("collections/{collection}/points/query"))
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let error = StoreError::UnexpectedStatus { status, body };
            tracing::error!(collection, error = %error, "Qdrant search failed");
            return Err(error);
        }

        let payload: QueryResponse = response.json().await?;
        Ok(payload
            .result
            .points
            .into_iter()
            .filter_map(scored_from_point)
            .collect())
    }

    async fn delete(
        &self,
        collection: &str,
        filter: &FilterCriteria,
        _batch_size: usize,
    ) -> Result<u64, StoreError> {
        if filter.fields.is_empty() {
            return Err(StoreError::Validation(
                "refusing to delete without filter criteria".into(),
            ));
        }
        let must: Vec<Value> = filter
            .fields
            .iter()
            .map(|(field, value)| match value {
                FilterValue::Equals(value) => {
                    json!({ "key": field, "match": { "value": value } })
                }
                FilterValue::AnyOf(values) => {
                    json!({ "key": field, "match": { "any": values } })
                }
            })
            .collect();

        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection}/points/delete"),
            )
            .query(&[("wait", true)])
            .json(&json!({ "filter": { "must": must } }))
            .send()
            .await?;
        self.ensure_success(response).await?;
        // Qdrant's delete acknowledgement does not carry a count.
        Ok(0)
    }

    async fn update_metadata(
        &self,
        collection: &str,
        id: Uuid,
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let response = self
            .request(
                Method::POST,
                &format!("collections/{collection}/points/payload"),
            )
            .query(&[("wait", true)])
            .json(&json!({
                "payload": { "metadata": metadata },
                "points": [id],
            }))
            .send()
            .await?;
        self.ensure_success(response).await
    }

    async fn get_collection_info(&self, collection: &str) -> Result<CollectionInfo, StoreError> {
        let response = self
            .request(Method::GET, &format!("collections/{collection}"))
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(StoreError::NotFound(format!("collection {collection}")));
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::UnexpectedStatus { status, body });
        }
        let payload: CollectionInfoResponse = response.json().await?;
        Ok(CollectionInfo {
            name: collection.to_string(),
            row_count: payload.result.points_count.unwrap_or(0),
            dimensions: SUPPORTED_DIMENSIONS.to_vec(),
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        let response = self.request(Method::GET, "collections").send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::UnexpectedStatus { status, body });
        }
        let payload: ListCollectionsResponse = response.json().await?;
        Ok(payload
            .result
            .collections
            .into_iter()
            .map(|collection| collection.name)
            .collect())
    }

    async fn health_check(&self) -> HealthSnapshot {
        match self.list_collections().await {
            Ok(collections) => HealthSnapshot {
                connected: true,
                collections_count: collections.len(),
                collections,
                status: "healthy".to_string(),
            },
            Err(error) => HealthSnapshot {
                connected: false,
                collections_count: 0,
                collections: Vec::new(),
                status: redact_secrets(&error.to_string()),
            },
        }
    }
}

fn point_body(document: &VectorDocument) -> Value {
    let mut payload = Map::new();
    payload.insert("source_id".into(), json!(document.source_id));
    payload.insert("page_id".into(), json!(document.page_id));
    payload.insert("url".into(), json!(document.url));
    payload.insert("chunk_number".into(), json!(document.chunk_number));
    payload.insert("content".into(), json!(document.content));
    payload.insert("metadata".into(), Value::Object(document.metadata.clone()));
    payload.insert("embedding_model".into(), json!(document.embedding_model));
    payload.insert(
        "embedding_dimension".into(),
        json!(document.embedding.len()),
    );

    let mut vector = Map::new();
    vector.insert(
        document.embedding.len().to_string(),
        json!(document.embedding),
    );

    json!({
        "id": document.id,
        "vector": vector,
        "payload": payload,
    })
}

fn scored_from_point(point: QueryPoint) -> Option<ScoredDocument> {
    let payload = point.payload?;
    let id = point.id.as_str().and_then(|id| Uuid::parse_str(id).ok())?;
    Some(ScoredDocument {
        id,
        source_id: payload
            .get("source_id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        page_id: payload
            .get("page_id")
            .and_then(Value::as_str)
            .and_then(|value| Uuid::parse_str(value).ok()),
        url: payload
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        chunk_number: payload.get("chunk_number").and_then(Value::as_i64),
        content: payload
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        metadata: payload
            .get("metadata")
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default(),
        similarity: point.score.clamp(0.0, 1.0),
    })
}

fn normalize_base_url(url: &str) -> Result<String, String> {
    let mut parsed = reqwest::Url::parse(url).map_err(|err| err.to_string())?;
    let path = parsed.path().trim_end_matches('/').to_string();
    parsed.set_path(&path);
    Ok(parsed.to_string())
}

fn format_endpoint(base: &str, path: &str) -> String {
    let base = base.trim_end_matches('/');
    let path = path.trim_start_matches('/');
    format!("{base}/{path}")
}

#[derive(Deserialize)]
struct ListCollectionsResponse {
    result: ListCollectionsResult,
}

#[derive(Deserialize)]
struct ListCollectionsResult {
    collections: Vec<CollectionDescription>,
}

#[derive(Deserialize)]
struct CollectionDescription {
    name: String,
}

#[derive(Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfoResult,
}

#[derive(Deserialize)]
struct CollectionInfoResult {
    #[serde(default)]
    points_count: Option<u64>,
}

#[derive(Deserialize)]
struct QueryResponse {
    result: QueryResult,
}

#[derive(Deserialize)]
struct QueryResult {
    #[serde(default)]
    points: Vec<QueryPoint>,
}

#[derive(Deserialize)]
struct QueryPoint {
    id: Value,
    score: f32,
    #[serde(default)]
    payload: Option<Map<String, Value>>,
}
