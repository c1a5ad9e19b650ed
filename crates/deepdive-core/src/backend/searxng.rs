use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use super::{EngineKind, RawHit, SearchBackend, normalize_hits, send_checked};
use crate::error::BackendError;
use crate::model::{ResearchQuery, SearchResult};

/// SearXNG metasearch adapter (`GET /search?format=json`).
pub struct SearxngBackend {
    client: Client,
    base_url: String,
}

impl SearxngBackend {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct SearxngResponse {
    #[serde(default)]
    results: Vec<SearxngHit>,
}

#[derive(Debug, Deserialize)]
struct SearxngHit {
    url: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    content: String,
}

fn parse_response(body: &str) -> Result<Vec<RawHit>, BackendError> {
    let parsed: SearxngResponse = serde_json::from_str(body)
        .map_err(|err| BackendError::Unavailable(format!("malformed searxng response: {err}")))?;
    Ok(parsed
        .results
        .into_iter()
        .map(|hit| RawHit {
            url: hit.url,
            title: hit.title,
            snippet: hit.content,
        })
        .collect())
}

#[async_trait]
impl SearchBackend for SearxngBackend {
    fn engine(&self) -> EngineKind {
        EngineKind::Searxng
    }

    #[tracing::instrument(name = "backend.searxng", skip(self, query), fields(query = %query.text))]
    async fn search(
        &self,
        query: &ResearchQuery,
        max_results: usize,
        timeout: Duration,
    ) -> Result<Vec<SearchResult>, BackendError> {
        let endpoint = format!("{}/search", self.base_url);
        let response = send_checked(|| {
            self.client
                .get(&endpoint)
                .timeout(timeout)
                .query(&[
                    ("q", query.text.as_str()),
                    ("format", "json"),
                    ("categories", "general"),
                    ("safesearch", "0"),
                ])
        })
        .await?;

        let body = response.text().await.map_err(super::map_transport)?;
        let hits = parse_response(&body)?;
        tracing::debug!(hits = hits.len(), "searxng returned results");
        Ok(normalize_hits(self.engine(), query, hits, max_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_results_array() {
        let body = r#"{
            "query": "rust",
            "results": [
                {"url": "https://www.rust-lang.org/", "title": "Rust", "content": "A language"},
                {"url": "https://doc.rust-lang.org/book/", "title": "The Book"}
            ]
        }"#;
        let hits = parse_response(body).expect("valid body");
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].snippet, "A language");
        assert_eq!(hits[1].snippet, "");
    }

    #[test]
    fn malformed_body_is_unavailable() {
        let err = parse_response("<html>captcha</html>").unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
