//! Columnar SQL store speaking PostgREST.
//!
//! The default deployment persists everything in Postgres behind a PostgREST gateway:
//! `sources`, `pages`, and the two embedding-bearing tables `crawled_pages` and
//! `code_examples` with one column per supported vector width. This module implements both
//! the provider-agnostic [`VectorStore`] trait and the relational surface (source and page
//! lifecycle, keyword search, re-embed paging) that only the SQL backend offers.
//!
//! Similarity search is delegated to `match_*` SQL functions via PostgREST RPC so distance
//! math runs next to the data; everything else is plain REST with `Prefer` headers.

use crate::config::get_config;
use crate::errors::redact_secrets;
use crate::store::{
    CHUNKS_COLLECTION, CODE_COLLECTION, ChunkRow, CollectionInfo, DistanceMetric, FilterCriteria,
    FilterValue, HealthSnapshot, PageRecord, ScoredDocument, SearchQuery, SourceRecord,
    StoreError, SUPPORTED_DIMENSIONS, UpsertOutcome, VectorDocument, VectorStore,
    dimension_column, normalize_source_filter, validate_document,
};
use async_trait::async_trait;
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

/// HTTP client for the PostgREST-fronted columnar store.
pub struct PostgrestStore {
    client: Client,
    base_url: String,
    service_key: Option<String>,
}

impl PostgrestStore {
    /// Construct a new client using configuration derived from the environment.
    pub fn new() -> Result<Self, StoreError> {
        let config = get_config();
        Self::with_connection(&config.store_url, config.store_service_key.clone())
    }

    /// Construct a client against an explicit endpoint (used by tests).
    pub fn with_connection(
        base_url: &str,
        service_key: Option<String>,
    ) -> Result<Self, StoreError> {
        let client = Client::builder().user_agent("archon/0.3").build()?;
        let base_url = normalize_base_url(base_url).map_err(StoreError::InvalidUrl)?;
        tracing::debug!(url = %base_url, "Initialized columnar store client");
        Ok(Self {
            client,
            base_url,
            service_key,
        })
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format_endpoint(&self.base_url, path);
        let mut req = self.client.request(method, url);
        if let Some(key) = &self.service_key
            && !key.is_empty()
        {
            req = req
                .header("apikey", key)
                .header("Authorization", format!("Bearer {key}"));
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
        tracing::error!(error = %error, "Store request failed");
        Err(error)
    }

    /// Insert or refresh a source record, merging on `source_id`.
    pub async fn upsert_source(&self, source: &SourceRecord) -> Result<(), StoreError> {
        let response = self
            .request(Method::POST, "sources")
            .query(&[("on_conflict", "source_id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&json!([source]))
            .send()
            .await?;
        self.ensure_success(response).await
    }

    /// Patch the AI summary and aggregate word count onto an existing source.
    pub async fn update_source_summary(
        &self,
        source_id: &str,
        summary: &str,
        total_word_count: i64,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::PATCH, "sources")
            .query(&[("source_id", format!("eq.{source_id}"))])
            .header("Prefer", "return=minimal")
            .json(&json!({
                "summary": summary,
                "total_word_count": total_word_count,
            }))
            .send()
            .await?;
        self.ensure_success(response).await
    }

    /// List every known source.
    pub async fn list_sources(&self) -> Result<Vec<SourceRecord>, StoreError> {
        let response = self
            .request(Method::GET, "sources")
            .query(&[("select", "*"), ("order", "source_id.asc")])
            .send()
            .await?;
        decode_rows(response).await
    }

    /// Fetch one source by id.
    pub async fn get_source(&self, source_id: &str) -> Result<SourceRecord, StoreError> {
        let response = self
            .request(Method::GET, "sources")
            .query(&[
                ("select", "*".to_string()),
                ("source_id", format!("eq.{source_id}")),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let mut rows: Vec<SourceRecord> = decode_rows(response).await?;
        rows.pop()
            .ok_or_else(|| StoreError::NotFound(format!("source {source_id}")))
    }

    /// Delete a source; pages, chunks and code examples cascade at the database level.
    pub async fn delete_source(&self, source_id: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::DELETE, "sources")
            .query(&[("source_id", format!("eq.{source_id}"))])
            .send()
            .await?;
        self.ensure_success(response).await
    }

    /// Insert pages before chunking so chunks can reference stable page ids.
    ///
    /// Merges on `(source_id, url)` so re-crawls refresh content in place.
    pub async fn insert_pages(&self, pages: &[PageRecord]) -> Result<(), StoreError> {
        if pages.is_empty() {
            return Ok(());
        }
        let response = self
            .request(Method::POST, "pages")
            .query(&[("on_conflict", "source_id,url")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(pages)
            .send()
            .await?;
        self.ensure_success(response).await
    }

    /// Patch `chunk_count` onto a page after chunking completes.
    pub async fn set_page_chunk_count(
        &self,
        page_id: Uuid,
        chunk_count: i64,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::PATCH, "pages")
            .query(&[("id", format!("eq.{page_id}"))])
            .header("Prefer", "return=minimal")
            .json(&json!({ "chunk_count": chunk_count }))
            .send()
            .await?;
        self.ensure_success(response).await
    }

    /// Fetch one page by row id.
    pub async fn get_page(&self, page_id: Uuid) -> Result<PageRecord, StoreError> {
        let response = self
            .request(Method::GET, "pages")
            .query(&[
                ("select", "*".to_string()),
                ("id", format!("eq.{page_id}")),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let mut rows: Vec<PageRecord> = decode_rows(response).await?;
        rows.pop()
            .ok_or_else(|| StoreError::NotFound(format!("page {page_id}")))
    }

    /// Fetch one page by its canonical URL.
    pub async fn get_page_by_url(&self, url: &str) -> Result<PageRecord, StoreError> {
        let response = self
            .request(Method::GET, "pages")
            .query(&[
                ("select", "*".to_string()),
                ("url", format!("eq.{url}")),
                ("limit", "1".to_string()),
            ])
            .send()
            .await?;
        let mut rows: Vec<PageRecord> = decode_rows(response).await?;
        rows.pop()
            .ok_or_else(|| StoreError::NotFound(format!("page for url {url}")))
    }

    /// List pages for a source, ordered by section then URL, with offset pagination.
    ///
    /// `section` narrows to pages whose section title matches exactly.
    pub async fn list_pages(
        &self,
        source_id: &str,
        section: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<PageRecord>, StoreError> {
        let mut params = vec![
            ("select".to_string(), "*".to_string()),
            ("source_id".to_string(), format!("eq.{source_id}")),
            (
                "order".to_string(),
                "section_order.asc.nullslast,url.asc".to_string(),
            ),
            ("limit".to_string(), limit.to_string()),
            ("offset".to_string(), offset.to_string()),
        ];
        if let Some(section) = section {
            params.push(("section_title".to_string(), format!("eq.{section}")));
        }
        let response = self
            .request(Method::GET, "pages")
            .query(&params)
            .send()
            .await?;
        decode_rows(response).await
    }

    /// Fetch a stable-order page of chunk rows for bulk re-embedding.
    pub async fn fetch_chunk_rows(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ChunkRow>, StoreError> {
        let response = self
            .request(Method::GET, CHUNKS_COLLECTION)
            .query(&[
                (
                    "select",
                    "id,content,url,chunk_number,source_id,metadata".to_string(),
                ),
                ("order", "id.asc".to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
            ])
            .send()
            .await?;
        decode_rows(response).await
    }

    /// Rewrite a chunk's embedding into the column for `embedding.len()`.
    ///
    /// The other three columns are nulled in the same request so the row never carries two
    /// vectors, even transiently.
    pub async fn update_chunk_embedding(
        &self,
        chunk_id: Uuid,
        embedding: &[f32],
        embedding_model: &str,
    ) -> Result<(), StoreError> {
        let mut body = Map::new();
        let target = dimension_column(embedding.len());
        for dimension in SUPPORTED_DIMENSIONS {
            let column = dimension_column(dimension);
            if column == target {
                body.insert(column.to_string(), json!(embedding));
            } else {
                body.insert(column.to_string(), Value::Null);
            }
        }
        body.insert("embedding_model".into(), json!(embedding_model));
        body.insert("embedding_dimension".into(), json!(embedding.len()));

        let response = self
            .request(Method::PATCH, CHUNKS_COLLECTION)
            .query(&[("id", format!("eq.{chunk_id}"))])
            .header("Prefer", "return=minimal")
            .json(&body)
            .send()
            .await?;
        self.ensure_success(response).await
    }

    /// Case-insensitive keyword search used by the hybrid retrieval path.
    pub async fn keyword_search(
        &self,
        collection: &str,
        query: &str,
        match_count: usize,
        source_filter: Option<&str>,
    ) -> Result<Vec<ScoredDocument>, StoreError> {
        let escaped = query.replace('%', "\\%").replace('_', "\\_");
        let mut params = vec![
            (
                "select".to_string(),
                "id,source_id,page_id,url,chunk_number,content,metadata".to_string(),
            ),
            ("content".to_string(), format!("ilike.*{escaped}*")),
            ("limit".to_string(), match_count.to_string()),
            ("order".to_string(), "id.asc".to_string()),
        ];
        if let Some(source_id) = source_filter {
            params.push(("source_id".to_string(), format!("eq.{source_id}")));
        }
        let response = self
            .request(Method::GET, collection)
            .query(&params)
            .send()
            .await?;
        let rows: Vec<MatchRow> = decode_rows(response).await?;
        Ok(rows.into_iter().map(MatchRow::into_scored).collect())
    }

    /// Insert one row into an arbitrary table, returning the stored representation.
    ///
    /// Backs the tool bridge's thin CRUD surface (projects, tasks, documents); the core
    /// imposes no schema beyond what the database enforces.
    pub async fn insert_row(&self, table: &str, body: &Value) -> Result<Value, StoreError> {
        let response = self
            .request(Method::POST, table)
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let mut rows: Vec<Value> = decode_rows(response).await?;
        Ok(rows.pop().unwrap_or(Value::Null))
    }

    /// List rows of an arbitrary table with optional equality filters.
    pub async fn list_rows(
        &self,
        table: &str,
        filters: &[(String, String)],
    ) -> Result<Value, StoreError> {
        let mut params = vec![("select".to_string(), "*".to_string())];
        for (field, value) in filters {
            params.push((field.clone(), format!("eq.{value}")));
        }
        let response = self.request(Method::GET, table).query(&params).send().await?;
        let rows: Vec<Value> = decode_rows(response).await?;
        Ok(Value::Array(rows))
    }

    /// Update one row of an arbitrary table by id, returning the new representation.
    pub async fn update_row(
        &self,
        table: &str,
        id: &str,
        body: &Value,
    ) -> Result<Value, StoreError> {
        let response = self
            .request(Method::PATCH, table)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=representation")
            .json(body)
            .send()
            .await?;
        let mut rows: Vec<Value> = decode_rows(response).await?;
        rows.pop()
            .ok_or_else(|| StoreError::NotFound(format!("{table} row {id}")))
    }

    /// Delete one row of an arbitrary table by id.
    pub async fn delete_row(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let response = self
            .request(Method::DELETE, table)
            .query(&[("id", format!("eq.{id}"))])
            .send()
            .await?;
        self.ensure_success(response).await
    }

    /// Per-model and per-dimension chunk counts for the re-embed stats endpoint.
    pub async fn embedding_stats(&self) -> Result<Vec<EmbeddingStat>, StoreError> {
        let response = self
            .request(Method::POST, "rpc/embedding_stats")
            .json(&json!({}))
            .send()
            .await?;
        decode_rows(response).await
    }

    async fn upsert_batch(
        &self,
        collection: &str,
        batch: &[VectorDocument],
    ) -> Result<(), StoreError> {
        let rows: Vec<Value> = batch.iter().map(document_row).collect();
        let conflict_target = if collection == CODE_COLLECTION {
            "id"
        } else {
            "url,chunk_number"
        };
        let response = self
            .request(Method::POST, collection)
            .query(&[("on_conflict", conflict_target)])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&rows)
            .send()
            .await?;
        self.ensure_success(response).await
    }

    async fn count_rows(&self, collection: &str) -> Result<u64, StoreError> {
        let response = self
            .request(Method::GET, collection)
            .query(&[("select", "id"), ("limit", "1")])
            .header("Prefer", "count=exact")
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::UnexpectedStatus { status, body });
        }
        let total = response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.rsplit('/').next())
            .and_then(|total| total.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(total)
    }
}

#[async_trait]
impl VectorStore for PostgrestStore {
    async fn create_collection(
        &self,
        name: &str,
        vector_size: usize,
        _distance: DistanceMetric,
    ) -> Result<(), StoreError> {
        // Tables are provisioned by migration; creation here just verifies reachability.
        if !SUPPORTED_DIMENSIONS.contains(&vector_size) {
            tracing::warn!(
                collection = name,
                vector_size,
                "Collection created for a width without a dedicated column"
            );
        }
        self.count_rows(name).await.map(|_| ())
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
            // One retry on failure, then each item in the batch is reported failed.
            let mut result = self.upsert_batch(collection, batch).await;
            if result.is_err() {
                tracing::warn!(collection, "Upsert batch failed; retrying once");
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

        let function = match collection {
            CHUNKS_COLLECTION => "rpc/match_crawled_pages",
            CODE_COLLECTION => "rpc/match_code_examples",
            other => {
                return Err(StoreError::Validation(format!(
                    "unknown collection: {other}"
                )));
            }
        };

        let body = json!({
            "query_embedding": query.embedding,
            "embedding_dimension": query.embedding.len(),
            "match_count": query.match_count,
            "similarity_threshold": query.similarity_threshold,
            "source_filter": normalize_source_filter(&query.filter_metadata),
        });

        let response = self.request(Method::POST, function).json(&body).send().await?;
        let rows: Vec<MatchRow> = decode_rows(response).await?;
        Ok(rows.into_iter().map(MatchRow::into_scored).collect())
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
        let mut params = Vec::with_capacity(filter.fields.len());
        for (field, value) in &filter.fields {
            match value {
                FilterValue::Equals(value) => params.push((field.clone(), format!("eq.{value}"))),
                FilterValue::AnyOf(values) => {
                    params.push((field.clone(), format!("in.({})", values.join(","))));
                }
            }
        }
        let response = self
            .request(Method::DELETE, collection)
            .query(&params)
            .header("Prefer", "count=exact")
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::UnexpectedStatus { status, body });
        }
        let removed = response
            .headers()
            .get("content-range")
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.rsplit('/').next())
            .and_then(|total| total.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(removed)
    }

    async fn update_metadata(
        &self,
        collection: &str,
        id: Uuid,
        metadata: Map<String, Value>,
    ) -> Result<(), StoreError> {
        let response = self
            .request(Method::PATCH, collection)
            .query(&[("id", format!("eq.{id}"))])
            .header("Prefer", "return=minimal")
            .json(&json!({ "metadata": metadata }))
            .send()
            .await?;
        self.ensure_success(response).await
    }

    async fn get_collection_info(&self, collection: &str) -> Result<CollectionInfo, StoreError> {
        let row_count = self.count_rows(collection).await?;
        Ok(CollectionInfo {
            name: collection.to_string(),
            row_count,
            dimensions: SUPPORTED_DIMENSIONS.to_vec(),
        })
    }

    async fn list_collections(&self) -> Result<Vec<String>, StoreError> {
        Ok(vec![
            CHUNKS_COLLECTION.to_string(),
            CODE_COLLECTION.to_string(),
        ])
    }

    async fn health_check(&self) -> HealthSnapshot {
        match self.count_rows(CHUNKS_COLLECTION).await {
            Ok(_) => HealthSnapshot {
                connected: true,
                collections_count: 2,
                collections: vec![CHUNKS_COLLECTION.to_string(), CODE_COLLECTION.to_string()],
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

/// One row of a per-model embedding census.
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct EmbeddingStat {
    /// Model recorded on the rows.
    pub embedding_model: String,
    /// Vector width recorded on the rows.
    pub embedding_dimension: i64,
    /// Number of rows carrying this model/width pair.
    pub count: i64,
}

#[derive(Deserialize)]
struct MatchRow {
    id: Uuid,
    source_id: String,
    #[serde(default)]
    page_id: Option<Uuid>,
    url: String,
    #[serde(default)]
    chunk_number: Option<i64>,
    content: String,
    #[serde(default)]
    metadata: Map<String, Value>,
    #[serde(default)]
    similarity: f32,
}

impl MatchRow {
    fn into_scored(self) -> ScoredDocument {
        ScoredDocument {
            id: self.id,
            source_id: self.source_id,
            page_id: self.page_id,
            url: self.url,
            chunk_number: self.chunk_number,
            content: self.content,
            metadata: self.metadata,
            similarity: self.similarity.clamp(0.0, 1.0),
        }
    }
}

fn document_row(document: &VectorDocument) -> Value {
    let mut row = Map::new();
    row.insert("id".into(), json!(document.id));
    row.insert("source_id".into(), json!(document.source_id));
    row.insert("page_id".into(), json!(document.page_id));
    row.insert("url".into(), json!(document.url));
    row.insert("chunk_number".into(), json!(document.chunk_number));
    row.insert("content".into(), json!(document.content));
    row.insert("metadata".into(), Value::Object(document.metadata.clone()));

    let target = dimension_column(document.embedding.len());
    for dimension in SUPPORTED_DIMENSIONS {
        let column = dimension_column(dimension);
        if column == target {
            row.insert(column.to_string(), json!(document.embedding));
        } else {
            row.insert(column.to_string(), Value::Null);
        }
    }
    row.insert("embedding_model".into(), json!(document.embedding_model));
    row.insert(
        "embedding_dimension".into(),
        json!(document.embedding.len()),
    );
    Value::Object(row)
}

async fn decode_rows<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<Vec<T>, StoreError> {
    if response.status() == StatusCode::NOT_FOUND {
        return Err(StoreError::NotFound("relation missing".into()));
    }
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(StoreError::UnexpectedStatus { status, body });
    }
    Ok(response.json().await?)
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

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::{Method::PATCH, Method::POST, MockServer};

    fn sample_document(dimension: usize) -> VectorDocument {
        VectorDocument {
            id: Uuid::new_v4(),
            source_id: "example.com".into(),
            page_id: Some(Uuid::new_v4()),
            url: "https://example.com/guide".into(),
            chunk_number: Some(3),
            content: "chunk body".into(),
            metadata: Map::new(),
            embedding: vec![0.25; dimension],
            embedding_model: "test-embed".into(),
            embedding_dimension: dimension,
        }
    }

    #[test]
    fn document_row_populates_exactly_one_column() {
        let row = document_row(&sample_document(1024));
        assert!(row["embedding_1024"].is_array());
        assert!(row["embedding_768"].is_null());
        assert!(row["embedding_1536"].is_null());
        assert!(row["embedding_3072"].is_null());
        assert_eq!(row["embedding_dimension"], json!(1024));
    }

    #[tokio::test]
    async fn upsert_sends_merge_duplicates() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/crawled_pages")
                    .query_param("on_conflict", "url,chunk_number");
                then.status(201);
            })
            .await;

        let store = PostgrestStore::with_connection(&server.base_url(), None).expect("store");
        let outcomes = store
            .upsert(CHUNKS_COLLECTION, vec![sample_document(1536)], 50)
            .await
            .expect("upsert");

        mock.assert();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].stored);
    }

    #[tokio::test]
    async fn upsert_reports_invalid_documents_without_io() {
        let server = MockServer::start_async().await;
        let store = PostgrestStore::with_connection(&server.base_url(), None).expect("store");

        let mut zero = sample_document(768);
        zero.embedding = vec![0.0; 768];

        let outcomes = store
            .upsert(CHUNKS_COLLECTION, vec![zero], 50)
            .await
            .expect("upsert");
        assert_eq!(outcomes.len(), 1);
        assert!(!outcomes[0].stored);
        assert!(outcomes[0].error.as_deref().unwrap().contains("all-zero"));
    }

    #[tokio::test]
    async fn search_calls_match_function() {
        let server = MockServer::start_async().await;
        let row_id = Uuid::new_v4();
        let mock = server
            .mock_async(|when, then| {
                when.method(POST).path("/rpc/match_crawled_pages");
                then.status(200).json_body(json!([
                    {
                        "id": row_id,
                        "source_id": "example.com",
                        "url": "https://example.com/guide",
                        "chunk_number": 0,
                        "content": "docker compose up",
                        "metadata": {"source_id": "example.com"},
                        "similarity": 0.91
                    }
                ]));
            })
            .await;

        let store = PostgrestStore::with_connection(&server.base_url(), None).expect("store");
        let mut filter = Map::new();
        filter.insert("source".into(), json!("example.com"));
        let results = store
            .search(
                CHUNKS_COLLECTION,
                &SearchQuery {
                    embedding: vec![0.1; 1536],
                    match_count: 5,
                    filter_metadata: filter,
                    similarity_threshold: 0.05,
                },
            )
            .await
            .expect("search");

        mock.assert();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, row_id);
        assert!((results[0].similarity - 0.91).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn update_chunk_embedding_nulls_other_columns() {
        let server = MockServer::start_async().await;
        let chunk_id = Uuid::new_v4();
        let mock = server
            .mock_async(|when, then| {
                when.method(PATCH)
                    .path("/crawled_pages")
                    .query_param("id", format!("eq.{chunk_id}"))
                    .json_body_partial(
                        json!({
                            "embedding_1536": null,
                            "embedding_3072": null,
                            "embedding_1024": null,
                            "embedding_model": "new-model",
                            "embedding_dimension": 768
                        })
                        .to_string(),
                    );
                then.status(204);
            })
            .await;

        let store = PostgrestStore::with_connection(&server.base_url(), None).expect("store");
        store
            .update_chunk_embedding(chunk_id, &vec![0.5; 768], "new-model")
            .await
            .expect("update");
        mock.assert();
    }

    #[tokio::test]
    async fn search_rejects_unknown_collection() {
        let server = MockServer::start_async().await;
        let store = PostgrestStore::with_connection(&server.base_url(), None).expect("store");
        let error = store
            .search(
                "mystery",
                &SearchQuery {
                    embedding: vec![0.1; 768],
                    match_count: 5,
                    filter_metadata: Map::new(),
                    similarity_threshold: 0.0,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(error, StoreError::Validation(_)));
    }
}
