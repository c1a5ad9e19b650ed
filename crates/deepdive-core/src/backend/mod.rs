//! Search backend adapters.
//!
//! Each adapter normalizes one external engine into the same
//! query -> ranked results contract. Adapters never retry beyond a single
//! transparent reconnect; retry policy belongs to the orchestrator.

mod browser;
mod firecrawl;
mod searxng;

pub use browser::BrowserBackend;
pub use firecrawl::FirecrawlBackend;
pub use searxng::SearxngBackend;

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::BackendError;
use crate::model::{ResearchQuery, SearchResult};

/// Engines selectable by name at session start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    /// Aggregated metasearch (SearXNG).
    Searxng,
    /// Crawl-and-extract service (Firecrawl).
    Firecrawl,
    /// Headless-browser automation service rendering a results page.
    Browser,
}

impl EngineKind {
    pub const ALL: [EngineKind; 3] = [Self::Searxng, Self::Firecrawl, Self::Browser];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Searxng => "searxng",
            Self::Firecrawl => "firecrawl",
            Self::Browser => "browser",
        }
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "searxng" => Ok(Self::Searxng),
            "firecrawl" => Ok(Self::Firecrawl),
            "browser" => Ok(Self::Browser),
            other => Err(format!(
                "unknown engine '{other}' (expected searxng, firecrawl or browser)"
            )),
        }
    }
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    fn engine(&self) -> EngineKind;

    /// Run one sub-query. Results come back ranked from 0, at most
    /// `max_results` long. Must be safe to call concurrently.
    async fn search(
        &self,
        query: &ResearchQuery,
        max_results: usize,
        timeout: Duration,
    ) -> Result<Vec<SearchResult>, BackendError>;
}

pub type DynBackend = Arc<dyn SearchBackend>;

/// Adapters available to a session, keyed by engine.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: HashMap<EngineKind, DynBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_backend(mut self, backend: DynBackend) -> Self {
        self.register(backend);
        self
    }

    pub fn register(&mut self, backend: DynBackend) {
        self.backends.insert(backend.engine(), backend);
    }

    pub fn get(&self, engine: EngineKind) -> Option<DynBackend> {
        self.backends.get(&engine).cloned()
    }

    pub fn contains(&self, engine: EngineKind) -> bool {
        self.backends.contains_key(&engine)
    }
}

/// Raw hit before normalization.
#[derive(Debug, Clone)]
pub(crate) struct RawHit {
    pub url: String,
    pub title: String,
    pub snippet: String,
}

/// Keep only absolute http(s) links, drop repeats, truncate and rank.
pub(crate) fn normalize_hits(
    engine: EngineKind,
    query: &ResearchQuery,
    hits: impl IntoIterator<Item = RawHit>,
    max_results: usize,
) -> Vec<SearchResult> {
    let mut seen = std::collections::HashSet::new();
    hits.into_iter()
        .filter(|hit| {
            Url::parse(hit.url.trim())
                .map(|url| matches!(url.scheme(), "http" | "https"))
                .unwrap_or(false)
        })
        .filter(|hit| seen.insert(hit.url.trim().to_string()))
        .take(max_results)
        .enumerate()
        .map(|(rank, hit)| SearchResult {
            query_id: query.id.clone(),
            source_engine: engine.as_str().to_string(),
            url: hit.url.trim().to_string(),
            title: collapse(&hit.title),
            raw_snippet: collapse(&hit.snippet),
            rank,
        })
        .collect()
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Send a request, reconnecting once if the connection could not be
/// established, and map transport/status failures onto `BackendError`.
pub(crate) async fn send_checked<F>(build: F) -> Result<Response, BackendError>
where
    F: Fn() -> RequestBuilder,
{
    let response = match build().send().await {
        Err(err) if err.is_connect() => {
            tracing::debug!(error = %err, "backend connect failed; reconnecting once");
            build().send().await.map_err(map_transport)?
        }
        other => other.map_err(map_transport)?,
    };

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(BackendError::RateLimited);
    }
    if !status.is_success() {
        return Err(BackendError::Unavailable(format!("HTTP {status}")));
    }
    Ok(response)
}

pub(crate) fn map_transport(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::Timeout
    } else {
        BackendError::Unavailable(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(url: &str) -> RawHit {
        RawHit {
            url: url.into(),
            title: "  Title \n here ".into(),
            snippet: "snippet".into(),
        }
    }

    #[test]
    fn engine_kind_parses_case_insensitively() {
        assert_eq!("SearXNG".parse::<EngineKind>(), Ok(EngineKind::Searxng));
        assert_eq!(" browser ".parse::<EngineKind>(), Ok(EngineKind::Browser));
        assert!("google".parse::<EngineKind>().is_err());
    }

    #[test]
    fn normalize_drops_non_http_and_repeats() {
        let query = ResearchQuery::root("q");
        let results = normalize_hits(
            EngineKind::Searxng,
            &query,
            vec![
                hit("javascript:void(0)"),
                hit("https://a.example/1"),
                hit("https://a.example/1"),
                hit("/relative/path"),
                hit("http://b.example/2"),
                hit("https://c.example/3"),
            ],
            2,
        );
        let urls: Vec<_> = results.iter().map(|r| r.url.as_str()).collect();
        assert_eq!(urls, vec!["https://a.example/1", "http://b.example/2"]);
        assert_eq!(results[1].rank, 1);
        assert_eq!(results[0].title, "Title here");
        assert_eq!(results[0].query_id, query.id);
        assert_eq!(results[0].source_engine, "searxng");
    }
}
