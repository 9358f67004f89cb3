use crate::crawler::links::page_key;

#[derive(Debug, Clone, PartialEq, Eq)]
struct TraceEntry {
    url: String,
    key: Option<String>,
    depth: u32,
}

/// The path one branch took from the crawl's start URL to its current page,
/// each URL tagged with the depth it was reached at.
///
/// A trace is never shared between branches: spawning a child hands it an
/// extended copy, so siblings cannot see or disturb each other's paths.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Trace {
    entries: Vec<TraceEntry>,
}

impl Trace {
    pub fn new() -> Self {
        Self::default()
    }

    /// A copy of this trace with `url` appended at `depth`.
    pub fn extended(&self, url: impl Into<String>, depth: u32) -> Self {
        let url = url.into();
        debug_assert!(
            self.entries.last().map_or(true, |last| last.depth < depth),
            "trace depths must strictly increase"
        );

        let mut entries = Vec::with_capacity(self.entries.len() + 1);
        entries.extend(self.entries.iter().cloned());
        entries.push(TraceEntry {
            key: page_key(&url),
            url,
            depth,
        });
        Self { entries }
    }

    /// Whether this branch has already been on the page `url` points at
    pub fn contains(&self, url: &str) -> bool {
        match page_key(url) {
            Some(key) => self.entries.iter().any(|e| e.key.as_deref() == Some(key.as_str())),
            None => self.entries.iter().any(|e| e.url == url),
        }
    }

    /// URLs ordered by depth, skipping the depth-0 start page.
    pub fn into_hops(mut self) -> Vec<String> {
        self.entries.sort_by_key(|e| e.depth);
        self.entries
            .into_iter()
            .filter(|e| e.depth > 0)
            .map(|e| e.url)
            .collect()
    }
}
