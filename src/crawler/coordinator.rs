use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cli::config::CrawlerSettings;
use crate::crawler::context::CrawlContext;
use crate::crawler::fetcher::LinkFetcher;
use crate::crawler::links::same_page;
use crate::crawler::search::spawn_branch;
use crate::crawler::task::ResultPath;
use crate::crawler::trace::Trace;
use crate::utils::metrics::MetricsCollector;

/// How a crawl ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlOutcome {
    Found(ResultPath),
    /// Every branch finished without reaching the target
    NotFound,
    /// The crawl deadline passed first. The target may still be reachable.
    Abandoned,
}

impl CrawlOutcome {
    /// The wire answer for this outcome; NotFound becomes an empty path.
    pub fn into_result_path(self, start_url: &str, target_url: &str) -> ResultPath {
        match self {
            CrawlOutcome::Found(path) => path,
            CrawlOutcome::NotFound | CrawlOutcome::Abandoned => ResultPath::not_found(start_url, target_url),
        }
    }
}

/// Runs crawl requests to completion.
///
/// One coordinator serves any number of crawls, sequential or concurrent;
/// each `run` builds a fresh `CrawlContext`. Only the fetch permits are shared,
/// which caps page fetches across all of them.
pub struct Coordinator {
    fetcher: Arc<dyn LinkFetcher>,
    settings: CrawlerSettings,
    fetch_permits: Arc<Semaphore>,
    metrics: MetricsCollector,
}

impl Coordinator {
    pub fn new(fetcher: Arc<dyn LinkFetcher>, settings: CrawlerSettings, metrics: MetricsCollector) -> Self {
        let fetch_permits = Arc::new(Semaphore::new(settings.max_concurrent_fetches.max(1)));
        Self {
            fetcher,
            settings,
            fetch_permits,
            metrics,
        }
    }

    /// Search outward from `start_url` until `target_url` is found or every
    /// branch has run out of links or depth.
    pub async fn run(&self, start_url: &str, target_url: &str) -> CrawlOutcome {
        let start_url = start_url.trim();
        let target_url = target_url.trim();
        let timer = self.metrics.start_timer();

        if same_page(start_url, target_url) {
            debug!(start_url, "Start is the target");
            self.metrics.record_crawl(true, timer.end()).await;
            return CrawlOutcome::Found(ResultPath::found(
                start_url,
                target_url,
                vec![target_url.to_string()],
            ));
        }

        let (context, mut done) = CrawlContext::new(
            target_url,
            self.settings.max_depth,
            Arc::clone(&self.fetcher),
            Arc::clone(&self.fetch_permits),
            self.metrics.clone(),
        );

        info!(start_url, target_url, max_depth = self.settings.max_depth, "Starting crawl");
        spawn_branch(&context, Trace::new(), start_url.to_string(), 0);

        let finished = done.wait_for(|done| *done);
        let timed_out = match self.settings.crawl_timeout() {
            Some(limit) => tokio::time::timeout(limit, finished).await.is_err(),
            None => {
                let _ = finished.await;
                false
            }
        };

        // Stragglers see this and stop branching
        context.cancel();

        let outcome = match context.take_result() {
            Some(trace) => CrawlOutcome::Found(ResultPath::found(start_url, target_url, trace.into_hops())),
            None if timed_out => {
                warn!(
                    start_url,
                    target_url,
                    active_branches = context.active_branches(),
                    "Crawl deadline passed with branches still running"
                );
                CrawlOutcome::Abandoned
            }
            None => CrawlOutcome::NotFound,
        };

        let elapsed = timer.end();
        let found = matches!(outcome, CrawlOutcome::Found(_));
        self.metrics.record_crawl(found, elapsed).await;
        info!(start_url, target_url, found, elapsed_ms = elapsed, "Crawl finished");

        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::fetcher::{FetchError, MockLinkFetcher};
    use crate::crawler::testing::GraphFetcher;
    use std::time::Duration;

    fn settings(max_depth: u32) -> CrawlerSettings {
        CrawlerSettings {
            max_depth,
            max_concurrent_fetches: 8,
            crawl_timeout_secs: Some(10),
        }
    }

    fn coordinator(fetcher: impl LinkFetcher + 'static, max_depth: u32) -> Coordinator {
        Coordinator::new(Arc::new(fetcher), settings(max_depth), MetricsCollector::new())
    }

    fn url(name: &str) -> String {
        format!("http://{}.test/", name.to_lowercase())
    }

    #[tokio::test]
    async fn test_chain_reports_start_target_then_hops() {
        let graph = GraphFetcher::new()
            .edge(&url("A"), &url("B"))
            .edge(&url("B"), &url("C"))
            .edge(&url("A"), &url("D"));

        let outcome = coordinator(graph, 3).run(&url("A"), &url("C")).await;

        let path = match outcome {
            CrawlOutcome::Found(path) => path,
            CrawlOutcome::NotFound | CrawlOutcome::Abandoned => panic!("expected a path"),
        };
        let wire: Vec<String> = path.into();
        assert_eq!(wire, vec![url("A"), url("C"), url("B"), url("C")]);
    }

    #[tokio::test]
    async fn test_unreachable_target_within_depth() {
        let graph = GraphFetcher::new()
            .edge(&url("A"), &url("X"))
            .edge(&url("A"), &url("Y"))
            .edge(&url("Y"), &url("Z"))
            .edge(&url("Z"), &url("Target"));

        let coordinator = coordinator(graph, 1);
        let outcome = coordinator.run(&url("A"), &url("Target")).await;

        assert_eq!(outcome, CrawlOutcome::NotFound);
        let path = outcome.into_result_path(&url("A"), &url("Target"));
        assert_eq!(path.to_wire(), format!(r#"["{}","{}"]"#, url("A"), url("Target")));
    }

    #[tokio::test]
    async fn test_cyclic_graph_terminates() {
        let graph = GraphFetcher::new()
            .edge(&url("A"), &url("B"))
            .edge(&url("B"), &url("A"))
            .edge(&url("B"), &url("C"))
            .edge(&url("C"), &url("A"))
            .edge(&url("C"), &url("B"));

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            coordinator(graph, 6).run(&url("A"), &url("Nowhere")),
        )
        .await
        .expect("crawl must terminate");

        assert_eq!(outcome, CrawlOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_found_path_is_a_walk_in_the_graph() {
        let graph = GraphFetcher::new()
            .edge(&url("A"), &url("B"))
            .edge(&url("A"), &url("C"))
            .edge(&url("B"), &url("D"))
            .edge(&url("C"), &url("D"))
            .edge(&url("C"), &url("E"))
            .edge(&url("D"), &url("F"))
            .edge(&url("E"), &url("F"))
            .edge(&url("F"), &url("G"));
        let check = graph.clone();

        let outcome = coordinator(graph, 5).run(&url("A"), &url("G")).await;

        let CrawlOutcome::Found(path) = outcome else {
            panic!("expected a path");
        };
        assert_eq!(path.start_url, url("A"));
        assert_eq!(path.target_url, url("G"));
        assert_eq!(path.hops.last(), Some(&url("G")));

        let mut previous = url("A");
        for hop in &path.hops {
            assert!(check.has_edge(&previous, hop), "{} -> {} is not an edge", previous, hop);
            previous = hop.clone();
        }
    }

    #[tokio::test]
    async fn test_concurrent_discoveries_record_one_path() {
        let mut graph = GraphFetcher::new();
        for i in 0..8 {
            let middle = url(&format!("M{}", i));
            graph = graph.edge(&url("A"), &middle).edge(&middle, &url("T"));
        }

        let outcome = coordinator(graph, 3).run(&url("A"), &url("T")).await;

        let CrawlOutcome::Found(path) = outcome else {
            panic!("expected a path");
        };
        assert_eq!(path.hops.len(), 2);
        assert!(path.hops[0].starts_with("http://m"));
        assert_eq!(path.hops[1], url("T"));
    }

    #[tokio::test]
    async fn test_target_match_ignores_query_and_fragment() {
        let graph = GraphFetcher::new().edge(&url("A"), "http://b.test/page?utm=1#top");

        let outcome = coordinator(graph, 2).run(&url("A"), "http://b.test/page").await;

        assert!(matches!(outcome, CrawlOutcome::Found(_)));
    }

    #[tokio::test]
    async fn test_start_equal_to_target_is_trivial() {
        let mut fetcher = MockLinkFetcher::new();
        fetcher.expect_fetch_links().never();

        let outcome = coordinator(fetcher, 3).run(&url("A"), &url("A")).await;

        let CrawlOutcome::Found(path) = outcome else {
            panic!("expected a trivial path");
        };
        assert_eq!(path.hops, vec![url("A")]);
    }

    #[tokio::test]
    async fn test_fetch_error_at_root_is_not_found() {
        let mut fetcher = MockLinkFetcher::new();
        fetcher
            .expect_fetch_links()
            .times(1)
            .returning(|_| Err(FetchError::Status(500)));

        let outcome = coordinator(fetcher, 3).run(&url("A"), &url("B")).await;

        assert_eq!(outcome, CrawlOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_depth_bound_limits_fetches() {
        let mut fetcher = MockLinkFetcher::new();
        // depth 0 and depth 1 pages are fetched, depth 2 is never branched into
        fetcher
            .expect_fetch_links()
            .withf(|url| url == "http://a.test/")
            .times(1)
            .returning(|_| Ok(vec!["http://b.test/".to_string()]));
        fetcher
            .expect_fetch_links()
            .withf(|url| url == "http://b.test/")
            .times(1)
            .returning(|_| Ok(vec!["http://c.test/".to_string()]));

        let outcome = coordinator(fetcher, 1).run(&url("A"), &url("Z")).await;

        assert_eq!(outcome, CrawlOutcome::NotFound);
    }

    #[tokio::test]
    async fn test_deadline_abandons_crawl() {
        let graph = GraphFetcher::new()
            .edge(&url("A"), &url("B"))
            .with_delay(Duration::from_millis(500));
        let mut settings = settings(3);
        settings.crawl_timeout_secs = Some(0);
        let coordinator = Coordinator::new(Arc::new(graph), settings, MetricsCollector::new());

        let outcome = coordinator.run(&url("A"), &url("B")).await;

        assert_eq!(outcome, CrawlOutcome::Abandoned);
        let path = outcome.into_result_path(&url("A"), &url("B"));
        assert!(!path.is_found());
    }

    #[tokio::test]
    async fn test_slow_crawl_without_deadline_finds_target() {
        let graph = GraphFetcher::new()
            .edge(&url("A"), &url("B"))
            .edge(&url("B"), &url("C"))
            .with_delay(Duration::from_millis(1200));
        let settings = CrawlerSettings {
            max_depth: 3,
            ..CrawlerSettings::default()
        };
        assert_eq!(settings.crawl_timeout_secs, None);
        let coordinator = Coordinator::new(Arc::new(graph), settings, MetricsCollector::new());

        let outcome = coordinator.run(&url("A"), &url("C")).await;

        let CrawlOutcome::Found(path) = outcome else {
            panic!("expected a path");
        };
        assert_eq!(path.hops, vec![url("B"), url("C")]);
    }

    #[tokio::test]
    async fn test_crawls_do_not_share_state() {
        let graph = GraphFetcher::new()
            .edge(&url("A"), &url("B"))
            .edge(&url("B"), &url("C"))
            .edge(&url("X"), &url("Y"));
        let coordinator = coordinator(graph, 3);

        let (a, c, x) = (url("A"), url("C"), url("X"));
        let (first, second) = tokio::join!(coordinator.run(&a, &c), coordinator.run(&x, &c));

        assert!(matches!(first, CrawlOutcome::Found(_)));
        assert_eq!(second, CrawlOutcome::NotFound);

        let metrics = coordinator.metrics.get_metrics().await;
        assert_eq!(metrics.paths_found, 1);
        assert_eq!(metrics.paths_not_found, 1);
    }
}
