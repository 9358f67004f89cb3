use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::{thread_rng, Rng};
use regex::Regex;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cli::config::FetcherSettings;
use crate::crawler::links::extract_links;

/// Why a page's links could not be produced.
///
/// Every variant is an ordinary outcome for a single branch (dead link,
/// timeout, a PDF instead of HTML) and never fails a whole crawl.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("not an HTML page (content type {0:?})")]
    NotHtml(String),

    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("could not parse page: {0}")]
    Parse(String),
}

impl FetchError {
    /// Whether trying the same URL again could give a different answer
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Request(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            FetchError::Status(code) => *code >= 500 || *code == 429,
            _ => false,
        }
    }
}

/// Retrieves a page and returns the absolute URLs it links to.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LinkFetcher: Send + Sync {
    async fn fetch_links(&self, url: &str) -> Result<Vec<String>, FetchError>;
}

/// `LinkFetcher` over HTTP with reqwest and scraper
pub struct HttpLinkFetcher {
    client: Client,
    retries: u32,
    retry_backoff: Duration,
    ignore_patterns: Vec<Regex>,
}

impl HttpLinkFetcher {
    pub fn new(settings: &FetcherSettings) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(settings.timeout_secs))
            .user_agent(settings.user_agent.clone())
            .build()
            .context("Failed to create HTTP client")?;

        let ignore_patterns = settings
            .ignore_patterns
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(e) => {
                    warn!("Invalid ignore pattern '{}': {}", pattern, e);
                    None
                }
            })
            .collect();

        Ok(Self {
            client,
            retries: settings.retries,
            retry_backoff: Duration::from_millis(settings.retry_backoff_ms),
            ignore_patterns,
        })
    }

    async fn fetch_once(&self, url: &str) -> Result<Vec<String>, FetchError> {
        let response = self.client.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("")
            .to_ascii_lowercase();
        if !content_type.is_empty() && !content_type.contains("html") {
            return Err(FetchError::NotHtml(content_type));
        }

        // Relative links resolve against where we ended up after redirects
        let page_url = response.url().to_string();
        let body = response.text().await?;

        extract_links(&body, &page_url, &self.ignore_patterns)
    }

    /// Exponential backoff with up to 50% jitter
    fn backoff_for(&self, attempt: u32) -> Duration {
        let base = self.retry_backoff.saturating_mul(2u32.saturating_pow(attempt));
        let jitter_ms = thread_rng().gen_range(0..=base.as_millis() as u64 / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

#[async_trait]
impl LinkFetcher for HttpLinkFetcher {
    async fn fetch_links(&self, url: &str) -> Result<Vec<String>, FetchError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url).await {
                Ok(links) => {
                    debug!(url, links = links.len(), "Fetched page");
                    return Ok(links);
                }
                Err(e) if e.is_transient() && attempt < self.retries => {
                    let delay = self.backoff_for(attempt);
                    debug!(url, attempt, error = %e, "Retrying fetch in {:?}", delay);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn settings(retries: u32) -> FetcherSettings {
        FetcherSettings {
            retries,
            retry_backoff_ms: 1,
            ignore_patterns: vec![r"\.pdf$".to_string(), "(".to_string()],
            ..FetcherSettings::default()
        }
    }

    #[tokio::test]
    async fn test_fetches_and_resolves_links() {
        let server = MockServer::start().await;
        let html = r#"<html><body>
            <a href="/b">B</a>
            <a href="http://elsewhere.test/c?q=1">C</a>
            <a href="/paper.pdf">paper</a>
        </body></html>"#;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_body_raw(html, "text/html; charset=utf-8"))
            .mount(&server)
            .await;

        let fetcher = HttpLinkFetcher::new(&settings(0)).unwrap();
        let links = fetcher.fetch_links(&format!("{}/a", server.uri())).await.unwrap();

        assert_eq!(
            links,
            vec![format!("{}/b", server.uri()), "http://elsewhere.test/c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/missing"))
            .respond_with(ResponseTemplate::new(404))
            .expect(1)
            .mount(&server)
            .await;

        let fetcher = HttpLinkFetcher::new(&settings(3)).unwrap();
        let err = fetcher
            .fetch_links(&format!("{}/missing", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Status(404)));
    }

    #[tokio::test]
    async fn test_server_error_is_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/flaky"))
            .respond_with(ResponseTemplate::new(503))
            .expect(3)
            .mount(&server)
            .await;

        let fetcher = HttpLinkFetcher::new(&settings(2)).unwrap();
        let err = fetcher
            .fetch_links(&format!("{}/flaky", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Status(503)));
    }

    #[tokio::test]
    async fn test_non_html_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data.json"))
            .respond_with(ResponseTemplate::new(200).set_body_raw("{}", "application/json"))
            .mount(&server)
            .await;

        let fetcher = HttpLinkFetcher::new(&settings(0)).unwrap();
        let err = fetcher
            .fetch_links(&format!("{}/data.json", server.uri()))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::NotHtml(_)));
    }
}
