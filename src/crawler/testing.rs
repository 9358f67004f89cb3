use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::crawler::fetcher::{FetchError, LinkFetcher};

/// A static link graph served as a `LinkFetcher`.
///
/// Pages without outbound edges answer 404, like a dead link would.
#[derive(Debug, Clone, Default)]
pub struct GraphFetcher {
    edges: HashMap<String, Vec<String>>,
    delay: Option<Duration>,
}

impl GraphFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edge(mut self, from: &str, to: &str) -> Self {
        self.edges.entry(from.to_string()).or_default().push(to.to_string());
        self
    }

    /// Make every fetch take `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        self.edges
            .get(from)
            .map_or(false, |links| links.iter().any(|link| link == to))
    }
}

#[async_trait]
impl LinkFetcher for GraphFetcher {
    async fn fetch_links(&self, url: &str) -> Result<Vec<String>, FetchError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.edges.get(url).cloned().ok_or(FetchError::Status(404))
    }
}
