#![deny(missing_docs)]

//! Core library for the Archon knowledge-management backend.
//!
//! Archon turns heterogeneous source material (web sites, sitemaps,
//! llms-full.txt digests, uploaded PDFs and markdown) into a searchable
//! retrieval-augmented generation corpus and exposes that corpus to AI
//! agents over HTTP and a JSON-RPC tool bridge.

/// HTTP routing and REST handlers.
pub mod api;
/// Markdown-aware document chunking.
pub mod chunker;
/// Fenced code-block extraction from markdown.
pub mod code_extractor;
/// Environment-driven configuration management.
pub mod config;
/// Web crawling: seed classification, fetching, filtering.
pub mod crawler;
/// Format-aware text extraction (markdown, PDF, llms-full digests).
pub mod docproc;
/// Batch embedding client abstraction and adapters.
pub mod embedding;
/// Vendor-neutral error kinds and secret redaction.
pub mod errors;
/// Chat-completion client abstraction and adapters.
pub mod llm;
/// Structured logging and tracing setup.
pub mod logging;
/// Ingestion counters surfaced through the health endpoint.
pub mod metrics;
/// Ingestion pipeline orchestration.
pub mod pipeline;
/// Operation progress tracking and cancellation.
pub mod progress;
/// Bulk re-embedding when the embedding model changes.
pub mod reembed;
/// JSON-RPC tool bridge for AI clients.
pub mod rpc;
/// Hybrid vector + keyword retrieval.
pub mod search;
/// Tool-bridge session registry.
pub mod sessions;
/// Vector store abstraction and backends.
pub mod store;
