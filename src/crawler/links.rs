use std::collections::HashSet;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::crawler::fetcher::FetchError;

/// hrefs that never lead anywhere new
const IGNORED_HREFS: &[&str] = &["#", "/"];

/// Schemes that are not hyperlinks to pages
const SKIPPED_PREFIXES: &[&str] = &["#", "mailto:", "tel:", "javascript:", "data:"];

/// Identity of a page for matching purposes: host plus path.
///
/// Query strings, fragments, scheme and default ports do not take part, so
/// `http://Example.com/a?x=1#top` and `https://example.com/a` share a key.
pub fn page_key(url: &str) -> Option<String> {
    let parsed = Url::parse(url.trim()).ok()?;
    let host = parsed.host_str()?;
    Some(format!("{}{}", host, parsed.path()))
}

/// True when both URLs point at the same page (host and path equal).
pub fn same_page(a: &str, b: &str) -> bool {
    match (page_key(a), page_key(b)) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// Resolve an href found on `base` into an absolute, normalized URL.
///
/// Returns `None` for anchors, non-http schemes and hrefs that do not parse.
/// The result keeps scheme, host, port and path; query and fragment are dropped.
pub fn normalize_link(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || IGNORED_HREFS.contains(&href) {
        return None;
    }

    let lower = href.to_ascii_lowercase();
    if SKIPPED_PREFIXES.iter().any(|prefix| lower.starts_with(prefix)) {
        return None;
    }

    let mut resolved = match Url::parse(href) {
        Ok(url) => url,
        Err(_) => base.join(href).ok()?,
    };

    if resolved.scheme() != "http" && resolved.scheme() != "https" {
        return None;
    }
    resolved.host_str()?;

    resolved.set_query(None);
    resolved.set_fragment(None);

    Some(resolved.to_string())
}

/// Extract every outbound page link from an HTML document.
///
/// Links are returned in document order with duplicates removed. Links whose
/// normalized form matches one of `ignore` are skipped.
pub fn extract_links(html: &str, page_url: &str, ignore: &[Regex]) -> Result<Vec<String>, FetchError> {
    let base = Url::parse(page_url)?;
    let selector = Selector::parse("a[href]")
        .map_err(|e| FetchError::Parse(format!("invalid link selector: {:?}", e)))?;

    let document = Html::parse_document(html);
    let mut seen = HashSet::new();
    let mut links = Vec::new();

    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let Some(link) = normalize_link(&base, href) else {
            continue;
        };
        if ignore.iter().any(|pattern| pattern.is_match(&link)) {
            debug!("Skipping ignored link: {}", link);
            continue;
        }
        if seen.insert(link.clone()) {
            links.push(link);
        }
    }

    Ok(links)
}
