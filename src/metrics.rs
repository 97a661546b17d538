//! Lightweight ingestion counters used for diagnostics.
//!
//! The `IngestMetrics` type exposes lock-free counters that track:
//! - Ingest jobs completed
//! - Pages stored (cumulative)
//! - Chunks stored (cumulative)
//! - Code examples stored (cumulative)
//!
//! The snapshot is surfaced via the `/health` endpoint so operators can validate crawl and
//! chunking activity without attaching a debugger.

use std::sync::atomic::{AtomicU64, Ordering};

/// Thread-safe counters describing ingestion activity.
///
/// Intentionally just atomics so the pipeline can record from multiple jobs without locks.
#[derive(Default)]
pub struct IngestMetrics {
    jobs_completed: AtomicU64,
    pages_stored: AtomicU64,
    chunks_stored: AtomicU64,
    code_examples_stored: AtomicU64,
}

impl IngestMetrics {
    /// Create an empty metrics accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the counters of one finished ingest job.
    pub fn record_job(&self, pages: u64, chunks: u64, code_examples: u64) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
        self.pages_stored.fetch_add(pages, Ordering::Relaxed);
        self.chunks_stored.fetch_add(chunks, Ordering::Relaxed);
        self.code_examples_stored
            .fetch_add(code_examples, Ordering::Relaxed);
    }

    /// Return a snapshot of the current counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            pages_stored: self.pages_stored.load(Ordering::Relaxed),
            chunks_stored: self.chunks_stored.load(Ordering::Relaxed),
            code_examples_stored: self.code_examples_stored.load(Ordering::Relaxed),
        }
    }
}

/// Immutable view of ingestion counters used for reporting.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct MetricsSnapshot {
    /// Ingest jobs that ran to completion since startup.
    pub jobs_completed: u64,
    /// Total pages stored across all jobs.
    pub pages_stored: u64,
    /// Total chunks stored across all jobs.
    pub chunks_stored: u64,
    /// Total code examples stored across all jobs.
    pub code_examples_stored: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_jobs_cumulatively() {
        let metrics = IngestMetrics::new();
        metrics.record_job(2, 10, 1);
        metrics.record_job(3, 5, 0);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.jobs_completed, 2);
        assert_eq!(snapshot.pages_stored, 5);
        assert_eq!(snapshot.chunks_stored, 15);
        assert_eq!(snapshot.code_examples_stored, 1);
    }

    #[test]
    fn starts_at_zero() {
        let snapshot = IngestMetrics::new().snapshot();
        assert_eq!(snapshot.jobs_completed, 0);
        assert_eq!(snapshot.chunks_stored, 0);
    }
}
