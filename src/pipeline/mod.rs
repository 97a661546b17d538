//! Ingestion pipeline orchestration.
//!
//! One job runs crawl → extract → page insert → chunk → (optional contextual prefix) →
//! code extraction → batch embed → upsert, publishing progress throughout and checking for
//! cancellation after each crawled page, before each embedding batch and before each store
//! batch. Item-level failures aggregate into counters; only component-level failures (store
//! unreachable, crawl seed invalid) move the operation to `error`.
//!
//! Pages are inserted before chunking so chunks can reference a stable `page_id`; chunk
//! counts are patched onto pages after chunking. Upserts are keyed by `(url, chunk_number)`
//! with ids derived from that key, so re-crawling identical content rewrites rows in place
//! instead of growing the table.

use crate::chunker::chunk_markdown;
use crate::code_extractor::extract_code_blocks;
use crate::config::get_config;
use crate::crawler::{
    CRAWL_CHANNEL_CAPACITY, CrawlEvent, CrawlOptions, Crawler, SeedKind, classify_seed,
};
use crate::docproc::llms_full::parse_llms_full_sections;
use crate::docproc::{extract_document, fix_code_span_spaces, word_count};
use crate::embedding::{EmbeddingClient, embed_batch_with_retry};
use crate::errors::redact_secrets;
use crate::llm::{
    build_contextual_prefix_prompt, build_source_summary_prompt, default_chat_model,
    fallback_source_summary, get_chat_client,
};
use crate::metrics::IngestMetrics;
use crate::progress::{OperationStatus, OperationType, ProgressTracker};
use crate::store::postgrest::PostgrestStore;
use crate::store::{
    CHUNKS_COLLECTION, CODE_COLLECTION, PageRecord, SourceRecord, VectorDocument, VectorStore,
};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use url::Url;
use uuid::Uuid;

/// Errors that abort an ingest job before it starts.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Bad request input, reported before any I/O.
    #[error("{0}")]
    Validation(String),
    /// The embedding provider could not be constructed.
    #[error("{0}")]
    Embedding(#[from] crate::embedding::EmbeddingError),
    /// The crawler rejected the seed or patterns.
    #[error("{0}")]
    Crawl(#[from] crate::crawler::CrawlError),
}

/// Number of pages buffered before a batch insert.
const PAGE_INSERT_BATCH: usize = 20;

/// Concurrent contextual-prefix calls per job.
const CONTEXT_WORKERS: usize = 4;

/// Parameters for a crawl-driven ingest.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    /// Seed URL.
    pub url: String,
    /// `documentation` or `technical`.
    pub knowledge_type: String,
    /// Tags stored on every chunk.
    pub tags: Vec<String>,
    /// Recursion depth for plain page seeds.
    pub max_depth: usize,
    /// Whether to run code extraction on each page.
    pub extract_code_examples: bool,
    /// Include glob patterns for candidate URLs.
    pub include_patterns: Vec<String>,
    /// Exclude glob patterns for candidate URLs.
    pub exclude_patterns: Vec<String>,
}

/// Parameters for an upload-driven ingest.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Original filename, used for format detection and source identity.
    pub filename: String,
    /// Raw file bytes.
    pub bytes: Vec<u8>,
    /// `documentation` or `technical`.
    pub knowledge_type: String,
    /// Tags stored on every chunk.
    pub tags: Vec<String>,
    /// Whether to run code extraction on the document.
    pub extract_code_examples: bool,
}

/// Shared ingestion pipeline; one instance serves every HTTP and RPC caller.
pub struct IngestPipeline {
    store: Arc<PostgrestStore>,
    vectors: Arc<dyn VectorStore>,
    embedder: Arc<dyn EmbeddingClient>,
    tracker: ProgressTracker,
    metrics: Arc<IngestMetrics>,
    jobs: Arc<Semaphore>,
}

impl IngestPipeline {
    /// Build the pipeline from shared components.
    ///
    /// `store` owns the relational surface (sources, pages); `vectors` receives the
    /// embedding-bearing rows and may be the same store or a separate vector database.
    pub fn new(
        store: Arc<PostgrestStore>,
        vectors: Arc<dyn VectorStore>,
        embedder: Arc<dyn EmbeddingClient>,
        tracker: ProgressTracker,
        metrics: Arc<IngestMetrics>,
    ) -> Self {
        let limit = get_config().concurrent_crawl_limit;
        Self {
            store,
            vectors,
            embedder,
            tracker,
            metrics,
            jobs: Arc::new(Semaphore::new(limit)),
        }
    }

    /// Handle on the progress tracker, for surfaces that poll and cancel.
    pub fn tracker(&self) -> &ProgressTracker {
        &self.tracker
    }

    /// Ingestion counters for the health endpoint.
    pub fn metrics_snapshot(&self) -> crate::metrics::MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Validate a crawl request and launch it in the background.
    ///
    /// Validation (SSRF, glob sanitisation) happens before the job is registered, so bad
    /// requests fail synchronously with a validation error and no progress id.
    pub async fn start_crawl(
        self: &Arc<Self>,
        request: CrawlRequest,
    ) -> Result<Uuid, PipelineError> {
        crate::crawler::urls::validate_url_against_ssrf(&request.url).await?;
        let options = CrawlOptions {
            max_depth: request.max_depth,
            concurrency: get_config().concurrent_crawl_limit,
            include_patterns: request.include_patterns.clone(),
            exclude_patterns: request.exclude_patterns.clone(),
            stealth: false,
        };
        // Glob sanitisation runs inside Crawler::new; building it here surfaces pattern
        // errors before the 202 is issued.
        let crawler = Crawler::new(options)?;

        let progress_id = Uuid::new_v4();
        let mut payload = Map::new();
        payload.insert("url".into(), json!(request.url));
        let token = self
            .tracker
            .start(progress_id, OperationType::Crawl, payload)
            .await;

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = pipeline.jobs.clone().acquire_owned().await;
            pipeline.run_crawl_job(progress_id, request, crawler, token).await;
        });
        Ok(progress_id)
    }

    /// Validate an upload request and launch it in the background.
    pub async fn start_upload(
        self: &Arc<Self>,
        request: UploadRequest,
    ) -> Result<Uuid, PipelineError> {
        if request.filename.trim().is_empty() {
            return Err(PipelineError::Validation("filename is required".into()));
        }
        if request.bytes.is_empty() {
            return Err(PipelineError::Validation("file is empty".into()));
        }

        let progress_id = Uuid::new_v4();
        let mut payload = Map::new();
        payload.insert("filename".into(), json!(request.filename));
        self.tracker
            .start(progress_id, OperationType::Upload, payload)
            .await;

        let pipeline = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = pipeline.jobs.clone().acquire_owned().await;
            pipeline.run_upload_job(progress_id, request).await;
        });
        Ok(progress_id)
    }

    async fn run_crawl_job(
        &self,
        progress_id: Uuid,
        request: CrawlRequest,
        crawler: Crawler,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let seed_kind = classify_seed(&request.url);
        let source_id = derive_source_id(&request.url);
        let source = SourceRecord {
            source_id: source_id.clone(),
            title: source_title(&request.url),
            summary: String::new(),
            total_word_count: 0,
            metadata: source_metadata(&request.knowledge_type, &request.tags, &request.url),
        };
        if let Err(error) = self.store.upsert_source(&source).await {
            self.tracker
                .error(progress_id, format!("failed to register source: {error}"))
                .await;
            return;
        }

        let mut indexer = Indexer::new(
            self,
            progress_id,
            source_id.clone(),
            chunk_metadata(&request.knowledge_type, &request.tags, seed_kind),
            request.extract_code_examples,
        );

        let (events_tx, mut events_rx) = mpsc::channel(CRAWL_CHANNEL_CAPACITY);
        let seed = request.url.clone();
        let crawl_cancel = cancel.clone();
        let crawl_task = tokio::spawn(async move {
            crawler.crawl(&seed, events_tx, crawl_cancel).await
        });

        let mut discovered = 0usize;
        let mut completed = 0usize;
        let mut aborted = false;

        while let Some(event) = events_rx.recv().await {
            // Checkpoint: one crawled page per iteration.
            if !self.tracker.is_active(progress_id).await {
                cancel.cancel();
                aborted = true;
                break;
            }
            match event {
                CrawlEvent::Discovered(total) => discovered = total.max(discovered),
                CrawlEvent::Page(page) => {
                    completed += 1;
                    let progress = fetch_progress(completed, discovered);
                    self.tracker
                        .update(
                            progress_id,
                            OperationStatus::Fetching,
                            progress,
                            format!("Fetched {completed}/{} pages", discovered.max(completed)),
                            None,
                        )
                        .await;

                    let docs = match seed_kind {
                        SeedKind::LlmsFull => sections_to_docs(&page.markdown, &request.url),
                        _ => vec![ProcessedDoc {
                            url: page.url,
                            title: Some(page.title),
                            section_title: None,
                            section_order: None,
                            markdown: fix_code_span_spaces(&page.markdown),
                        }],
                    };
                    for doc in docs {
                        if indexer.add_document(doc).await.is_err() {
                            aborted = true;
                            break;
                        }
                    }
                    if aborted {
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
        drop(events_rx);

        match crawl_task.await {
            Ok(Ok(stats)) => {
                if stats.cancelled {
                    aborted = true;
                }
            }
            Ok(Err(error)) => {
                self.tracker
                    .error(progress_id, format!("crawl failed: {error}"))
                    .await;
                return;
            }
            Err(error) => {
                self.tracker
                    .error(progress_id, format!("crawl task panicked: {error}"))
                    .await;
                return;
            }
        }

        if aborted || !self.tracker.is_active(progress_id).await {
            self.tracker
                .cancelled(progress_id, "Crawl stopped by request")
                .await;
            return;
        }

        self.finish_job(progress_id, indexer, &source_id, &source.title)
            .await;
    }

    async fn run_upload_job(&self, progress_id: Uuid, request: UploadRequest) {
        self.tracker
            .update(
                progress_id,
                OperationStatus::Processing,
                10,
                format!("Extracting text from {}", request.filename),
                None,
            )
            .await;

        let markdown = match extract_document(&request.filename, &request.bytes).await {
            Ok(markdown) => markdown,
            Err(error) => {
                self.tracker
                    .error(progress_id, format!("document extraction failed: {error}"))
                    .await;
                return;
            }
        };

        let source_id = derive_upload_source_id(&request.filename);
        let source = SourceRecord {
            source_id: source_id.clone(),
            title: request.filename.clone(),
            summary: String::new(),
            total_word_count: 0,
            metadata: source_metadata(&request.knowledge_type, &request.tags, &request.filename),
        };
        if let Err(error) = self.store.upsert_source(&source).await {
            self.tracker
                .error(progress_id, format!("failed to register source: {error}"))
                .await;
            return;
        }

        let mut indexer = Indexer::new(
            self,
            progress_id,
            source_id.clone(),
            chunk_metadata(&request.knowledge_type, &request.tags, SeedKind::Page),
            request.extract_code_examples,
        );

        let doc = ProcessedDoc {
            url: format!("file://{}", request.filename),
            title: Some(request.filename.clone()),
            section_title: None,
            section_order: None,
            markdown,
        };
        if indexer.add_document(doc).await.is_err()
            || !self.tracker.is_active(progress_id).await
        {
            self.tracker
                .cancelled(progress_id, "Upload stopped by request")
                .await;
            return;
        }

        self.finish_job(progress_id, indexer, &source_id, &request.filename)
            .await;
    }

    /// Flush buffers, write the source summary, patch chunk counts, publish `completed`.
    async fn finish_job(
        &self,
        progress_id: Uuid,
        mut indexer: Indexer<'_>,
        source_id: &str,
        source_title: &str,
    ) {
        if indexer.finish().await.is_err() {
            self.tracker
                .cancelled(progress_id, "Ingest stopped by request")
                .await;
            return;
        }

        let counters = indexer.counters();
        self.tracker
            .update(
                progress_id,
                OperationStatus::Storing,
                92,
                "Generating source summary",
                None,
            )
            .await;

        let summary = self
            .generate_source_summary(source_title, &indexer.summary_sample, counters.pages_stored)
            .await
            .unwrap_or_else(|| fallback_source_summary(source_id, counters.pages_stored));
        if let Err(error) = self
            .store
            .update_source_summary(source_id, &summary, indexer.total_words as i64)
            .await
        {
            tracing::warn!(source_id, error = %error, "Failed to patch source summary");
        }

        for (page_id, chunk_count) in &indexer.page_chunk_counts {
            if let Err(error) = self
                .store
                .set_page_chunk_count(*page_id, *chunk_count as i64)
                .await
            {
                tracing::warn!(page_id = %page_id, error = %error, "Failed to patch chunk count");
            }
        }

        self.metrics.record_job(
            counters.pages_stored as u64,
            counters.chunks_processed as u64,
            counters.code_examples_stored as u64,
        );

        let mut payload = Map::new();
        payload.insert("chunks_processed".into(), json!(counters.chunks_processed));
        payload.insert("chunks_failed".into(), json!(counters.chunks_failed));
        payload.insert(
            "code_examples_stored".into(),
            json!(counters.code_examples_stored),
        );
        payload.insert("pages_stored".into(), json!(counters.pages_stored));
        self.tracker.complete(progress_id, payload).await;
    }

    /// Best-effort source summary via the chat provider.
    async fn generate_source_summary(
        &self,
        title: &str,
        sample: &str,
        pages: usize,
    ) -> Option<String> {
        if sample.trim().is_empty() {
            return None;
        }
        let client = match get_chat_client() {
            Ok(client) => client,
            Err(error) => {
                tracing::info!(error = %error, pages, "Chat provider unavailable; using fallback summary");
                return None;
            }
        };
        let request = build_source_summary_prompt(title, sample);
        match client.complete(&default_chat_model(), &request).await {
            Ok(response) => {
                let summary = response.content.trim().to_string();
                (!summary.is_empty()).then_some(summary)
            }
            Err(error) => {
                tracing::warn!(error = %redact_secrets(&error.to_string()), "Summary generation failed; using fallback");
                None
            }
        }
    }

    /// Generate contextual prefixes for a chunk batch through a bounded worker pool.
    ///
    /// Any failure degrades silently to the bare chunk text.
    async fn contextualize_batch(&self, page_excerpt: &str, chunks: &mut [PendingChunk]) {
        let client: Arc<dyn crate::llm::ChatClient> = match get_chat_client() {
            Ok(client) => Arc::from(client),
            Err(_) => return,
        };
        let workers = Arc::new(Semaphore::new(CONTEXT_WORKERS));
        let model = default_chat_model();
        let mut tasks = tokio::task::JoinSet::new();

        for (index, chunk) in chunks.iter().enumerate() {
            let client = Arc::clone(&client);
            let workers = Arc::clone(&workers);
            let model = model.clone();
            let request = build_contextual_prefix_prompt(page_excerpt, &chunk.content);
            tasks.spawn(async move {
                let Ok(_permit) = workers.acquire_owned().await else {
                    return (index, None);
                };
                match client.complete(&model, &request).await {
                    Ok(response) => (index, Some(response.content.trim().to_string())),
                    Err(_) => (index, None),
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Ok((index, Some(prefix))) = joined
                && !prefix.is_empty()
            {
                chunks[index].embed_text = format!("{prefix}\n\n{}", chunks[index].content);
            }
        }
    }
}

/// One document ready for page insertion and chunking.
struct ProcessedDoc {
    url: String,
    title: Option<String>,
    section_title: Option<String>,
    section_order: Option<i64>,
    markdown: String,
}

/// Chunk awaiting embedding.
struct PendingChunk {
    page_id: Uuid,
    url: String,
    chunk_number: i64,
    content: String,
    embed_text: String,
}

/// Code example awaiting embedding.
struct PendingCode {
    url: String,
    code: String,
    language: String,
    context_before: String,
    context_after: String,
}

/// Counters published on completion.
#[derive(Debug, Clone, Copy, Default)]
struct JobCounters {
    pages_stored: usize,
    chunks_processed: usize,
    chunks_failed: usize,
    code_examples_stored: usize,
}

/// Buffering indexer driving pages → chunks → embeddings for one job.
struct Indexer<'a> {
    pipeline: &'a IngestPipeline,
    progress_id: Uuid,
    source_id: String,
    chunk_metadata: Map<String, Value>,
    extract_code: bool,
    page_buffer: Vec<PageRecord>,
    chunk_buffer: Vec<PendingChunk>,
    code_buffer: Vec<PendingCode>,
    page_ids: HashMap<String, Uuid>,
    page_chunk_counts: Vec<(Uuid, usize)>,
    summary_sample: String,
    total_words: usize,
    counters: JobCounters,
    embed_batches_done: usize,
}

/// Signal that the operation was cancelled and the job should unwind.
struct CancelledMarker;

impl<'a> Indexer<'a> {
    fn new(
        pipeline: &'a IngestPipeline,
        progress_id: Uuid,
        source_id: String,
        chunk_metadata: Map<String, Value>,
        extract_code: bool,
    ) -> Self {
        Self {
            pipeline,
            progress_id,
            source_id,
            chunk_metadata,
            extract_code,
            page_buffer: Vec::new(),
            chunk_buffer: Vec::new(),
            code_buffer: Vec::new(),
            page_ids: HashMap::new(),
            page_chunk_counts: Vec::new(),
            summary_sample: String::new(),
            total_words: 0,
            counters: JobCounters::default(),
            embed_batches_done: 0,
        }
    }

    fn counters(&self) -> JobCounters {
        self.counters
    }

    /// Ingest one processed document: page row, chunks, code example candidates.
    async fn add_document(&mut self, doc: ProcessedDoc) -> Result<(), CancelledMarker> {
        let config = get_config();
        let words = word_count(&doc.markdown);
        self.total_words += words;
        if self.summary_sample.is_empty() {
            self.summary_sample = doc.markdown.chars().take(2_000).collect();
        }

        let page_id = deterministic_id(&self.source_id, &doc.url);
        self.page_ids.insert(doc.url.clone(), page_id);
        self.page_buffer.push(PageRecord {
            id: page_id,
            source_id: self.source_id.clone(),
            url: doc.url.clone(),
            section_title: doc.section_title.or(doc.title),
            section_order: doc.section_order,
            full_content: doc.markdown.clone(),
            word_count: words as i64,
            char_count: doc.markdown.chars().count() as i64,
            chunk_count: 0,
            metadata: self.chunk_metadata.clone(),
        });
        if self.page_buffer.len() >= PAGE_INSERT_BATCH {
            self.flush_pages().await;
        }

        let chunks = chunk_markdown(&doc.markdown, config.chunk_size);
        let chunk_total = chunks.len();
        self.page_chunk_counts.push((page_id, chunk_total));
        for (chunk_number, content) in chunks.into_iter().enumerate() {
            self.chunk_buffer.push(PendingChunk {
                page_id,
                url: doc.url.clone(),
                chunk_number: chunk_number as i64,
                embed_text: content.clone(),
                content,
            });
        }

        if self.extract_code {
            for block in extract_code_blocks(&doc.markdown, config.code_min_length) {
                self.code_buffer.push(PendingCode {
                    url: doc.url.clone(),
                    code: block.code,
                    language: block.language,
                    context_before: block.context_before,
                    context_after: block.context_after,
                });
            }
        }

        while self.chunk_buffer.len() >= config.embedding_batch_size {
            self.flush_chunk_batch().await?;
        }
        Ok(())
    }

    /// Flush everything still buffered at end of job.
    async fn finish(&mut self) -> Result<(), CancelledMarker> {
        self.flush_pages().await;
        while !self.chunk_buffer.is_empty() {
            self.flush_chunk_batch().await?;
        }
        while !self.code_buffer.is_empty() {
            self.flush_code_batch().await?;
        }
        Ok(())
    }

    async fn flush_pages(&mut self) {
        if self.page_buffer.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.page_buffer);
        let count = batch.len();
        match self.pipeline.store.insert_pages(&batch).await {
            Ok(()) => self.counters.pages_stored += count,
            Err(error) => {
                tracing::warn!(error = %error, pages = count, "Page batch insert failed");
            }
        }
    }

    /// Embed and upsert one batch of chunks. Checkpoint: cancellation is observed first.
    async fn flush_chunk_batch(&mut self) -> Result<(), CancelledMarker> {
        if !self.pipeline.tracker.is_active(self.progress_id).await {
            return Err(CancelledMarker);
        }
        let config = get_config();
        let take = self.chunk_buffer.len().min(config.embedding_batch_size);
        let mut batch: Vec<PendingChunk> = self.chunk_buffer.drain(..take).collect();
        if batch.is_empty() {
            return Ok(());
        }

        if config.use_contextual_embeddings {
            let excerpt = self.summary_sample.clone();
            self.pipeline.contextualize_batch(&excerpt, &mut batch).await;
        }

        self.embed_batches_done += 1;
        let progress = (50 + self.embed_batches_done * 5).min(85) as u8;
        self.pipeline
            .tracker
            .update(
                self.progress_id,
                OperationStatus::Embedding,
                progress,
                format!("Embedding batch {} ({} chunks)", self.embed_batches_done, batch.len()),
                None,
            )
            .await;

        let texts: Vec<String> = batch.iter().map(|chunk| chunk.embed_text.clone()).collect();
        let outcome = match embed_batch_with_retry(
            self.pipeline.embedder.as_ref(),
            &texts,
            &config.embedding_model,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(error = %redact_secrets(&error.to_string()), "Embedding batch failed; marking items failed");
                self.counters.chunks_failed += batch.len();
                return Ok(());
            }
        };

        let mut documents = Vec::with_capacity(batch.len());
        for (chunk, slot) in batch.into_iter().zip(outcome.embeddings.into_iter()) {
            let Some(vector) = slot else {
                self.counters.chunks_failed += 1;
                continue;
            };
            let mut metadata = self.chunk_metadata.clone();
            metadata.insert("source_id".into(), json!(self.source_id));
            metadata.insert("url".into(), json!(chunk.url));
            documents.push(VectorDocument {
                id: deterministic_id(&chunk.url, &chunk.chunk_number.to_string()),
                source_id: self.source_id.clone(),
                page_id: Some(chunk.page_id),
                url: chunk.url,
                chunk_number: Some(chunk.chunk_number),
                content: chunk.content,
                metadata,
                embedding_dimension: vector.dimension,
                embedding: vector.values,
                embedding_model: config.embedding_model.clone(),
            });
        }

        // Checkpoint: cancellation before the store write.
        if !self.pipeline.tracker.is_active(self.progress_id).await {
            return Err(CancelledMarker);
        }
        self.store_documents(CHUNKS_COLLECTION, documents, true).await;
        Ok(())
    }

    /// Embed and upsert one batch of code examples.
    async fn flush_code_batch(&mut self) -> Result<(), CancelledMarker> {
        if !self.pipeline.tracker.is_active(self.progress_id).await {
            return Err(CancelledMarker);
        }
        let config = get_config();
        let take = self.code_buffer.len().min(config.embedding_batch_size);
        let batch: Vec<PendingCode> = self.code_buffer.drain(..take).collect();
        if batch.is_empty() {
            return Ok(());
        }

        self.pipeline
            .tracker
            .update(
                self.progress_id,
                OperationStatus::Embedding,
                86,
                format!("Embedding {} code examples", batch.len()),
                None,
            )
            .await;

        let texts: Vec<String> = batch
            .iter()
            .map(|code| format!("{}\n\n{}", code.context_before, code.code))
            .collect();
        let outcome = match embed_batch_with_retry(
            self.pipeline.embedder.as_ref(),
            &texts,
            &config.embedding_model,
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::warn!(error = %redact_secrets(&error.to_string()), "Code embedding batch failed");
                return Ok(());
            }
        };

        let mut documents = Vec::with_capacity(batch.len());
        for (code, slot) in batch.into_iter().zip(outcome.embeddings.into_iter()) {
            let Some(vector) = slot else { continue };
            let mut metadata = self.chunk_metadata.clone();
            metadata.insert("source_id".into(), json!(self.source_id));
            metadata.insert("url".into(), json!(code.url));
            metadata.insert("language".into(), json!(code.language));
            metadata.insert("context_before".into(), json!(code.context_before));
            metadata.insert("context_after".into(), json!(code.context_after));
            documents.push(VectorDocument {
                id: deterministic_id(&code.url, &code.code),
                source_id: self.source_id.clone(),
                page_id: None,
                url: code.url,
                chunk_number: None,
                content: code.code,
                metadata,
                embedding_dimension: vector.dimension,
                embedding: vector.values,
                embedding_model: config.embedding_model.clone(),
            });
        }

        if !self.pipeline.tracker.is_active(self.progress_id).await {
            return Err(CancelledMarker);
        }
        self.store_documents(CODE_COLLECTION, documents, false).await;
        Ok(())
    }

    async fn store_documents(
        &mut self,
        collection: &str,
        documents: Vec<VectorDocument>,
        count_as_chunks: bool,
    ) {
        if documents.is_empty() {
            return;
        }
        let config = get_config();
        self.pipeline
            .tracker
            .update(
                self.progress_id,
                OperationStatus::Storing,
                88,
                format!("Storing {} rows in {collection}", documents.len()),
                None,
            )
            .await;

        match self
            .pipeline
            .vectors
            .upsert(collection, documents, config.embedding_batch_size)
            .await
        {
            Ok(outcomes) => {
                let stored = outcomes.iter().filter(|outcome| outcome.stored).count();
                let failed = outcomes.len() - stored;
                if count_as_chunks {
                    self.counters.chunks_processed += stored;
                    self.counters.chunks_failed += failed;
                } else {
                    self.counters.code_examples_stored += stored;
                }
            }
            Err(error) => {
                tracing::error!(error = %error, collection, "Store batch failed");
                if count_as_chunks {
                    self.counters.chunks_failed += 1;
                }
            }
        }
    }
}

/// Convert llms-full sections to processed documents.
fn sections_to_docs(raw_text: &str, base_url: &str) -> Vec<ProcessedDoc> {
    parse_llms_full_sections(raw_text, base_url)
        .into_iter()
        .map(|section| ProcessedDoc {
            url: section.url,
            title: None,
            section_title: Some(section.section_title),
            section_order: Some(section.section_order as i64),
            markdown: section.content,
        })
        .collect()
}

/// Stable source identity derived from the canonical URL's host.
pub fn derive_source_id(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|parsed| parsed.host_str().map(|host| host.to_ascii_lowercase()))
        .unwrap_or_else(|| url.to_string())
}

/// Stable source identity for an uploaded file.
pub fn derive_upload_source_id(filename: &str) -> String {
    let slug: String = filename
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '.' || ch == '-' {
                ch.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("file_{slug}")
}

fn source_title(url: &str) -> String {
    derive_source_id(url)
}

fn source_metadata(knowledge_type: &str, tags: &[String], origin: &str) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("knowledge_type".into(), json!(knowledge_type));
    metadata.insert("tags".into(), json!(tags));
    metadata.insert("origin".into(), json!(origin));
    metadata
}

fn chunk_metadata(
    knowledge_type: &str,
    tags: &[String],
    seed_kind: SeedKind,
) -> Map<String, Value> {
    let crawl_type = match seed_kind {
        SeedKind::Sitemap => "sitemap",
        SeedKind::LlmsFull => "llms_full",
        SeedKind::LinkCollection => "link_collection",
        SeedKind::Page => "page",
    };
    let mut metadata = Map::new();
    metadata.insert("knowledge_type".into(), json!(knowledge_type));
    metadata.insert("tags".into(), json!(tags));
    metadata.insert("crawl_type".into(), json!(crawl_type));
    metadata
}

/// Deterministic UUID from a two-part key, keeping retries and re-crawls idempotent.
fn deterministic_id(left: &str, right: &str) -> Uuid {
    let mut hasher = Sha256::new();
    hasher.update(left.as_bytes());
    hasher.update([0]);
    hasher.update(right.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 16];
    bytes.copy_from_slice(&digest[..16]);
    Uuid::from_bytes(bytes)
}

fn fetch_progress(completed: usize, discovered: usize) -> u8 {
    let total = discovered.max(completed).max(1);
    (5 + (completed * 35) / total) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_ids_are_stable_and_distinct() {
        let a1 = deterministic_id("https://example.com/doc", "0");
        let a2 = deterministic_id("https://example.com/doc", "0");
        let b = deterministic_id("https://example.com/doc", "1");
        assert_eq!(a1, a2);
        assert_ne!(a1, b);
    }

    #[test]
    fn source_id_comes_from_the_host() {
        assert_eq!(
            derive_source_id("https://docs.example.com/en/intro"),
            "docs.example.com"
        );
        assert_eq!(derive_upload_source_id("My Notes.PDF"), "file_my_notes.pdf");
    }

    #[test]
    fn fetch_progress_is_bounded() {
        assert_eq!(fetch_progress(0, 0), 5);
        assert_eq!(fetch_progress(10, 10), 40);
        assert!(fetch_progress(3, 10) > 5);
        assert!(fetch_progress(3, 10) < 40);
    }

    #[test]
    fn llms_full_sections_become_docs_with_anchored_urls() {
        let raw = "# Core Concepts\n\nAlpha text.\n\n# Getting Started\n\nBeta text.\n";
        let docs = sections_to_docs(raw, "https://example.com/llms-full.txt");
        assert_eq!(docs.len(), 2);
        assert_eq!(
            docs[0].url,
            "https://example.com/llms-full.txt#section-0-core-concepts"
        );
        assert_eq!(docs[0].section_title.as_deref(), Some("# Core Concepts"));
        assert_eq!(docs[1].section_order, Some(1));
        assert!(docs[1].markdown.contains("Beta text."));
    }

    #[test]
    fn chunk_metadata_records_provenance() {
        let metadata = chunk_metadata("documentation", &["rust".into()], SeedKind::LlmsFull);
        assert_eq!(metadata["knowledge_type"], json!("documentation"));
        assert_eq!(metadata["crawl_type"], json!("llms_full"));
    }
}
