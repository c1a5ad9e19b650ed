use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Serialize;
use url::Url;

use super::{EngineKind, RawHit, SearchBackend, normalize_hits, send_checked};
use crate::error::BackendError;
use crate::model::{ResearchQuery, SearchResult};
use crate::security::SecretValue;

const RESULTS_PAGE: &str = "https://www.bing.com/search";

static RESULT_ITEM: Lazy<Selector> =
    Lazy::new(|| Selector::parse("li.b_algo").expect("valid result selector"));
static RESULT_LINK: Lazy<Selector> =
    Lazy::new(|| Selector::parse("h2 a").expect("valid link selector"));
static RESULT_SNIPPET: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".b_caption p, p").expect("valid snippet selector"));

/// Browser-automation adapter: asks a headless-browser service to render a
/// web results page (`POST /content`) and scrapes the organic hits from it.
pub struct BrowserBackend {
    client: Client,
    base_url: String,
    api_key: Option<SecretValue>,
}

impl BrowserBackend {
    pub fn new(client: Client, base_url: impl Into<String>, api_key: Option<SecretValue>) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ContentRequest {
    url: String,
    goto_options: GotoOptions,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GotoOptions {
    wait_until: &'static str,
    timeout: u64,
}

fn results_page_url(query: &str, max_results: usize) -> Result<String, BackendError> {
    let count = max_results.to_string();
    Url::parse_with_params(RESULTS_PAGE, &[("q", query), ("count", count.as_str())])
        .map(String::from)
        .map_err(|err| BackendError::Unavailable(format!("invalid results url: {err}")))
}

fn parse_results_page(html: &str) -> Vec<RawHit> {
    let document = Html::parse_document(html);
    document
        .select(&RESULT_ITEM)
        .filter_map(|item| {
            let link = item.select(&RESULT_LINK).next()?;
            let url = link.value().attr("href")?.to_string();
            let title = link.text().collect::<String>();
            let snippet = item
                .select(&RESULT_SNIPPET)
                .next()
                .map(|p| p.text().collect::<String>())
                .unwrap_or_default();
            Some(RawHit {
                url,
                title,
                snippet,
            })
        })
        .collect()
}

#[async_trait]
impl SearchBackend for BrowserBackend {
    fn engine(&self) -> EngineKind {
        EngineKind::Browser
    }

    #[tracing::instrument(name = "backend.browser", skip(self, query), fields(query = %query.text))]
    async fn search(
        &self,
        query: &ResearchQuery,
        max_results: usize,
        timeout: Duration,
    ) -> Result<Vec<SearchResult>, BackendError> {
        let endpoint = format!("{}/content", self.base_url);
        let payload = ContentRequest {
            url: results_page_url(&query.text, max_results)?,
            goto_options: GotoOptions {
                wait_until: "domcontentloaded",
                timeout: timeout.as_millis() as u64,
            },
        };

        let response = send_checked(|| {
            let request = self.client.post(&endpoint).timeout(timeout).json(&payload);
            match &self.api_key {
                Some(key) => request.query(&[("token", key.expose())]),
                None => request,
            }
        })
        .await?;

        let html = response.text().await.map_err(super::map_transport)?;
        let hits = parse_results_page(&html);
        if hits.is_empty() {
            tracing::debug!(bytes = html.len(), "rendered page contained no organic results");
        }
        Ok(normalize_hits(self.engine(), query, hits, max_results))
    }
}
