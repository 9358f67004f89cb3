use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{watch, Semaphore};
use tracing::debug;

use crate::crawler::fetcher::{FetchError, LinkFetcher};
use crate::crawler::trace::Trace;
use crate::utils::metrics::MetricsCollector;

/// Shared state of a single crawl request.
///
/// Every branch of one crawl holds an `Arc` to the same context and nothing
/// else is shared, so crawls running side by side in one process never see
/// each other's signal, counter or result.
pub struct CrawlContext {
    target_url: String,
    max_depth: u32,
    fetcher: Arc<dyn LinkFetcher>,
    fetch_permits: Arc<Semaphore>,
    metrics: MetricsCollector,

    /// Found Signal: flips false -> true exactly once
    found: AtomicBool,
    /// Set when the coordinator stops waiting (deadline)
    cancelled: AtomicBool,
    /// Branches spawned and not yet finished
    active: AtomicUsize,
    /// Trace recorded by the winning branch
    result: Mutex<Option<Trace>>,
    /// Flipped to true by the winner or by the last branch to finish
    done: watch::Sender<bool>,
}

impl CrawlContext {
    pub fn new(
        target_url: impl Into<String>,
        max_depth: u32,
        fetcher: Arc<dyn LinkFetcher>,
        fetch_permits: Arc<Semaphore>,
        metrics: MetricsCollector,
    ) -> (Arc<Self>, watch::Receiver<bool>) {
        let (done, done_rx) = watch::channel(false);
        let context = Arc::new(Self {
            target_url: target_url.into(),
            max_depth,
            fetcher,
            fetch_permits,
            metrics,
            found: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            result: Mutex::new(None),
            done,
        });
        (context, done_rx)
    }

    pub fn target_url(&self) -> &str {
        &self.target_url
    }

    pub fn max_depth(&self) -> u32 {
        self.max_depth
    }

    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// Count a new branch. The branch is finished when the guard drops,
    /// whichever way it exits.
    pub fn branch_started(self: &Arc<Self>) -> BranchGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        BranchGuard {
            context: Arc::clone(self),
        }
    }

    pub fn active_branches(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_found(&self) -> bool {
        self.found.load(Ordering::Acquire)
    }

    /// No branch should do further work: a winner exists or the crawl was
    /// abandoned.
    pub fn is_settled(&self) -> bool {
        self.is_found() || self.cancelled.load(Ordering::Acquire)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Try to become the winning branch. Only the first caller succeeds; its
    /// trace becomes the crawl's result.
    pub fn try_claim(&self, trace: Trace) -> bool {
        if self
            .found
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        if let Ok(mut result) = self.result.lock() {
            *result = Some(trace);
        }
        self.done.send_replace(true);
        true
    }

    /// The winning trace, if any. Taken at most once.
    pub fn take_result(&self) -> Option<Trace> {
        self.result.lock().ok().and_then(|mut result| result.take())
    }

    /// Fetch the links of `url`, waiting for a fetch permit first
    pub async fn fetch_links(&self, url: &str) -> Result<Vec<String>, FetchError> {
        // never closed
        let _permit = self.fetch_permits.acquire().await.ok();

        let timer = self.metrics.start_timer();
        let result = self.fetcher.fetch_links(url).await;
        self.metrics.record_fetch(result.is_ok(), timer.end()).await;
        result
    }

    fn branch_finished(&self) {
        if self.active.fetch_sub(1, Ordering::AcqRel) == 1 {
            debug!(target_url = %self.target_url, "All branches finished");
            self.done.send_replace(true);
        }
    }
}

/// Holds one unit of the Active Branch Counter
pub struct BranchGuard {
    context: Arc<CrawlContext>,
}

impl Drop for BranchGuard {
    fn drop(&mut self) {
        self.context.branch_finished();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::MockLinkFetcher;

    fn context() -> (Arc<CrawlContext>, watch::Receiver<bool>) {
        CrawlContext::new(
            "http://target.test/",
            3,
            Arc::new(MockLinkFetcher::new()),
            Arc::new(Semaphore::new(4)),
            MetricsCollector::new(),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_exactly_one_claim_wins() {
        let (context, done) = context();
        let contenders = 16;

        let mut handles = Vec::new();
        for i in 0..contenders {
            let context = Arc::clone(&context);
            handles.push(tokio::spawn(async move {
                let trace = Trace::new().extended(format!("http://branch{}.test/", i), 1);
                context.try_claim(trace)
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert!(context.is_found());
        assert!(*done.borrow());
        assert!(context.take_result().is_some());
        assert!(context.take_result().is_none());
    }

    #[tokio::test]
    async fn test_last_guard_signals_done() {
        let (context, done) = context();

        let first = context.branch_started();
        let second = context.branch_started();
        assert_eq!(context.active_branches(), 2);

        drop(first);
        assert!(!*done.borrow());

        drop(second);
        assert_eq!(context.active_branches(), 0);
        assert!(*done.borrow());
        assert!(!context.is_found());
    }

    #[test]
    fn test_cancel_settles_without_finding() {
        let (context, _done) = context();
        assert!(!context.is_settled());

        context.cancel();
        assert!(context.is_settled());
        assert!(!context.is_found());
    }
}
