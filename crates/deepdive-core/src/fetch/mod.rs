//! Page retrieval and reduction to clean, hashed passages.

pub mod extract;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, header::CONTENT_TYPE};

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::model::ExtractedPassage;

#[async_trait]
pub trait ContentFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<ExtractedPassage, FetchError>;
}

pub type DynFetcher = Arc<dyn ContentFetcher>;

impl ExtractedPassage {
    /// Build a passage from already-extracted text, stamping time and hash.
    pub fn new(source_url: impl Into<String>, text: impl Into<String>) -> Self {
        let text = text.into();
        Self {
            source_url: source_url.into(),
            content_hash: extract::content_hash(&text),
            text,
            fetched_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Html,
    Plain,
}

fn classify_content_type(header: Option<&str>) -> Result<BodyKind, FetchError> {
    let Some(raw) = header else {
        return Ok(BodyKind::Html);
    };
    let mime = raw
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    match mime.as_str() {
        "text/html" | "application/xhtml+xml" | "" => Ok(BodyKind::Html),
        "text/plain" => Ok(BodyKind::Plain),
        _ => Err(FetchError::UnsupportedContentType(mime)),
    }
}

/// HTTP fetcher with a body-size cap and deterministic extraction.
pub struct HttpFetcher {
    client: Client,
    config: FetchConfig,
}

impl HttpFetcher {
    pub fn new(client: Client, config: FetchConfig) -> Self {
        Self { client, config }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.timeout_secs)
    }
}

fn map_transport(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout
    } else {
        FetchError::Blocked(err.to_string())
    }
}

#[async_trait]
impl ContentFetcher for HttpFetcher {
    #[tracing::instrument(name = "fetch.http", skip(self))]
    async fn fetch(&self, url: &str) -> Result<ExtractedPassage, FetchError> {
        let mut response = self
            .client
            .get(url)
            .timeout(self.timeout())
            .header(reqwest::header::USER_AGENT, &self.config.user_agent)
            .send()
            .await
            .map_err(map_transport)?;

        let status = response.status();
        // 401/403/451 are the common "blocked" answers; any other failure
        // status leaves the page just as unreachable.
        if !status.is_success() {
            return Err(FetchError::Blocked(format!("HTTP {status}")));
        }

        let kind = classify_content_type(
            response
                .headers()
                .get(CONTENT_TYPE)
                .and_then(|value| value.to_str().ok()),
        )?;

        let cap = self.config.max_body_bytes;
        let mut body: Vec<u8> = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_transport)? {
            let remaining = cap.saturating_sub(body.len());
            body.extend_from_slice(&chunk[..chunk.len().min(remaining)]);
            if body.len() >= cap {
                tracing::debug!(cap, "body truncated at size cap");
                break;
            }
        }

        let raw = String::from_utf8_lossy(&body);
        let text = match kind {
            BodyKind::Html => extract::extract_html(&raw, self.config.max_passage_chars),
            BodyKind::Plain => extract::extract_plain(&raw, self.config.max_passage_chars),
        };
        Ok(ExtractedPassage::new(url, text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_types_are_classified() {
        assert_eq!(
            classify_content_type(Some("text/html; charset=utf-8")),
            Ok(BodyKind::Html)
        );
        assert_eq!(classify_content_type(Some("TEXT/PLAIN")), Ok(BodyKind::Plain));
        assert_eq!(classify_content_type(None), Ok(BodyKind::Html));
        assert_eq!(
            classify_content_type(Some("application/pdf")),
            Err(FetchError::UnsupportedContentType("application/pdf".into()))
        );
    }

    #[test]
    fn passage_hash_uses_normalized_text() {
        let a = ExtractedPassage::new("https://a.example", "Hello   World");
        let b = ExtractedPassage::new("https://b.example", "hello world");
        assert_eq!(a.content_hash, b.content_hash);
    }
}
