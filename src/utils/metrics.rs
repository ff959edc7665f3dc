use std::collections::BTreeMap;
use std::sync::Arc;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};
use tokio::sync::Mutex;

/// Per-run pipeline counters
#[derive(Debug, Clone, Default)]
pub struct PipelineMetrics {
    metrics: Arc<Mutex<MetricsSnapshot>>,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// When the run started
    pub started_at: DateTime<Utc>,

    /// Tasks admitted into the pipeline
    pub tasks_admitted: usize,

    /// Fetches that produced an HTTP response
    pub fetch_successes: usize,

    /// Fetches that failed in transport
    pub fetch_failures: usize,

    /// Tasks that went through the extraction stage
    pub extractions: usize,

    /// Extractions that found at least one field
    pub extractions_with_content: usize,

    /// Records handed to the store successfully
    pub persisted: usize,

    /// Records the store rejected
    pub persist_failures: usize,

    /// In-flight tasks aborted at the drain deadline
    pub abandoned: usize,

    /// Body bytes downloaded
    pub bytes_downloaded: u64,

    /// Sum of fetch latencies, for the average
    pub total_latency_ms: f64,

    /// Response count per HTTP status
    pub status_codes: BTreeMap<u16, usize>,
}

impl Default for MetricsSnapshot {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            tasks_admitted: 0,
            fetch_successes: 0,
            fetch_failures: 0,
            extractions: 0,
            extractions_with_content: 0,
            persisted: 0,
            persist_failures: 0,
            abandoned: 0,
            bytes_downloaded: 0,
            total_latency_ms: 0.0,
            status_codes: BTreeMap::new(),
        }
    }
}

impl MetricsSnapshot {
    /// Tasks that reached a final outcome
    pub fn completed(&self) -> usize {
        self.persisted + self.persist_failures
    }

    pub fn average_latency_ms(&self) -> f64 {
        let fetches = self.fetch_successes + self.fetch_failures;
        if fetches == 0 {
            0.0
        } else {
            self.total_latency_ms / fetches as f64
        }
    }
}

impl PipelineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record_admitted(&self) {
        self.metrics.lock().await.tasks_admitted += 1;
    }

    /// Record the outcome of one fetch
    pub async fn record_fetch(&self, status_code: Option<u16>, latency_ms: f64, bytes: u64) {
        let mut metrics = self.metrics.lock().await;

        match status_code {
            Some(code) => {
                metrics.fetch_successes += 1;
                *metrics.status_codes.entry(code).or_default() += 1;
            }
            None => metrics.fetch_failures += 1,
        }

        metrics.bytes_downloaded += bytes;
        metrics.total_latency_ms += latency_ms;
    }

    pub async fn record_extraction(&self, found_content: bool) {
        let mut metrics = self.metrics.lock().await;
        metrics.extractions += 1;
        if found_content {
            metrics.extractions_with_content += 1;
        }
    }

    pub async fn record_persisted(&self) {
        self.metrics.lock().await.persisted += 1;
    }

    pub async fn record_persist_failure(&self) {
        self.metrics.lock().await.persist_failures += 1;
    }

    pub async fn record_abandoned(&self, count: usize) {
        self.metrics.lock().await.abandoned += count;
    }

    pub async fn snapshot(&self) -> MetricsSnapshot {
        self.metrics.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counters_accumulate() {
        let metrics = PipelineMetrics::new();

        metrics.record_admitted().await;
        metrics.record_admitted().await;
        metrics.record_fetch(Some(200), 10.0, 100).await;
        metrics.record_fetch(None, 30.0, 0).await;
        metrics.record_extraction(true).await;
        metrics.record_persisted().await;
        metrics.record_persist_failure().await;

        let snapshot = metrics.snapshot().await;
        assert_eq!(snapshot.tasks_admitted, 2);
        assert_eq!(snapshot.fetch_successes, 1);
        assert_eq!(snapshot.fetch_failures, 1);
        assert_eq!(snapshot.status_codes.get(&200), Some(&1));
        assert_eq!(snapshot.bytes_downloaded, 100);
        assert_eq!(snapshot.average_latency_ms(), 20.0);
        assert_eq!(snapshot.extractions_with_content, 1);
        assert_eq!(snapshot.completed(), 2);
    }
}
