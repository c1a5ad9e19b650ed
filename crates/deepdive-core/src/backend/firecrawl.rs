use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{EngineKind, RawHit, SearchBackend, normalize_hits, send_checked};
use crate::error::BackendError;
use crate::model::{ResearchQuery, SearchResult};
use crate::security::SecretValue;

/// Firecrawl crawl-and-extract adapter (`POST /v1/search`).
pub struct FirecrawlBackend {
    client: Client,
    base_url: String,
    api_key: Option<SecretValue>,
}

impl FirecrawlBackend {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<SecretValue>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    limit: usize,
    timeout: u64,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Vec<FirecrawlHit>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FirecrawlHit {
    url: String,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    markdown: Option<String>,
}

fn parse_response(body: &str) -> Result<Vec<RawHit>, BackendError> {
    let parsed: SearchResponse = serde_json::from_str(body)
        .map_err(|err| BackendError::Unavailable(format!("malformed firecrawl response: {err}")))?;
    if !parsed.success {
        return Err(BackendError::Unavailable(
            parsed
                .error
                .unwrap_or_else(|| "firecrawl reported failure".to_string()),
        ));
    }
    Ok(parsed
        .data
        .into_iter()
        .map(|hit| RawHit {
            url: hit.url,
            title: hit.title.unwrap_or_default(),
            snippet: hit.description.or(hit.markdown).unwrap_or_default(),
        })
        .collect())
}

#[async_trait]
impl SearchBackend for FirecrawlBackend {
    fn engine(&self) -> EngineKind {
        EngineKind::Firecrawl
    }

    #[tracing::instrument(name = "backend.firecrawl", skip(self, query), fields(query = %query.text))]
    async fn search(
        &self,
        query: &ResearchQuery,
        max_results: usize,
        timeout: Duration,
    ) -> Result<Vec<SearchResult>, BackendError> {
        let endpoint = format!("{}/v1/search", self.base_url);
        let payload = SearchRequest {
            query: &query.text,
            limit: max_results,
            timeout: timeout.as_millis() as u64,
        };

        let response = send_checked(|| {
            let request = self.client.post(&endpoint).timeout(timeout).json(&payload);
            match &self.api_key {
                Some(key) => request.bearer_auth(key.expose()),
                None => request,
            }
        })
        .await?;

        let body = response.text().await.map_err(super::map_transport)?;
        let hits = parse_response(&body)?;
        Ok(normalize_hits(self.engine(), query, hits, max_results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_preferred_over_markdown() {
        let body = r##"{
            "success": true,
            "data": [
                {"url": "https://a.example", "title": "A", "description": "short", "markdown": "# long"},
                {"url": "https://b.example", "markdown": "# only markdown"}
            ]
        }"##;
        let hits = parse_response(body).expect("valid body");
        assert_eq!(hits[0].snippet, "short");
        assert_eq!(hits[1].snippet, "# only markdown");
        assert_eq!(hits[1].title, "");
    }

    #[test]
    fn unsuccessful_response_is_unavailable() {
        let err = parse_response(r#"{"success": false, "error": "quota"}"#).unwrap_err();
        assert_eq!(err, BackendError::Unavailable("quota".into()));
    }
}
