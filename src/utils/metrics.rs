use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Crawl metrics collector, cheap to clone and share between branches
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    metrics: Arc<Mutex<Metrics>>,
}

/// Metrics data structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    /// Start time of the metrics collection
    pub start_time: DateTime<Utc>,

    /// Page fetches attempted
    pub fetches: usize,

    /// Page fetches that failed (dead link, timeout, non-HTML)
    pub fetch_failures: usize,

    /// Time spent in successful and failed fetches, in milliseconds
    pub fetch_time_ms: u64,

    /// Branch search tasks launched, root branches included
    pub branches_spawned: usize,

    /// Tasks taken off the work queue and answered
    pub tasks_processed: usize,

    /// Tasks answered with a path
    pub paths_found: usize,

    /// Tasks answered with an empty path
    pub paths_not_found: usize,

    /// Undecodable task messages dropped
    pub malformed_tasks: usize,

    /// Wall-clock time of the most recent crawl, in milliseconds
    pub last_crawl_ms: u64,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        let metrics = Metrics {
            start_time: Utc::now(),
            ..Default::default()
        };

        Self {
            metrics: Arc::new(Mutex::new(metrics)),
        }
    }

    pub async fn record_fetch(&self, success: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        metrics.fetches += 1;
        if !success {
            metrics.fetch_failures += 1;
        }
        metrics.fetch_time_ms += duration_ms;
    }

    pub async fn record_branch(&self) {
        self.metrics.lock().await.branches_spawned += 1;
    }

    /// Record a finished crawl
    pub async fn record_crawl(&self, found: bool, duration_ms: u64) {
        let mut metrics = self.metrics.lock().await;
        if found {
            metrics.paths_found += 1;
        } else {
            metrics.paths_not_found += 1;
        }
        metrics.last_crawl_ms = duration_ms;
    }

    pub async fn record_task(&self) {
        self.metrics.lock().await.tasks_processed += 1;
    }

    pub async fn record_malformed(&self) {
        self.metrics.lock().await.malformed_tasks += 1;
    }

    /// Start timing an operation
    pub fn start_timer(&self) -> RequestTimer {
        RequestTimer {
            start: Instant::now(),
        }
    }

    pub async fn get_metrics(&self) -> Metrics {
        self.metrics.lock().await.clone()
    }
}

/// Timer for measuring fetch and crawl durations
pub struct RequestTimer {
    start: Instant,
}

impl RequestTimer {
    /// End timing and get the duration in milliseconds
    pub fn end(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}
