#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use deepdive_core::config::{FilterConfig, ResearchConfig};
use deepdive_core::{
    BackendError, BackendRegistry, ContentFetcher, EngineKind, ExtractedPassage, FetchError,
    LanguageModel, LlmError, OrchestratorSettings, ResearchOrchestrator, ResearchQuery,
    SearchBackend, SearchResult, SessionRequest,
};
use serde_json::json;

type SearchFn = dyn Fn(&ResearchQuery) -> Result<Vec<SearchResult>, BackendError> + Send + Sync;

/// Backend answering from a closure, optionally after a delay.
pub struct FakeBackend {
    engine: EngineKind,
    respond: Box<SearchFn>,
    delay: Duration,
    slow: HashMap<String, Duration>,
    queries: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new<F>(respond: F) -> Self
    where
        F: Fn(&ResearchQuery) -> Result<Vec<SearchResult>, BackendError> + Send + Sync + 'static,
    {
        Self {
            engine: EngineKind::Searxng,
            respond: Box::new(respond),
            delay: Duration::ZERO,
            slow: HashMap::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Every query fails with the same error.
    pub fn failing(err: BackendError) -> Self {
        Self::new(move |_| Err(err.clone()))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Delay only the sub-query with this exact text.
    pub fn with_slow_query(mut self, text: &str, delay: Duration) -> Self {
        self.slow.insert(text.to_string(), delay);
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl SearchBackend for FakeBackend {
    fn engine(&self) -> EngineKind {
        self.engine
    }

    async fn search(
        &self,
        query: &ResearchQuery,
        max_results: usize,
        _timeout: Duration,
    ) -> Result<Vec<SearchResult>, BackendError> {
        self.queries.lock().unwrap().push(query.text.clone());
        let delay = self.slow.get(&query.text).copied().unwrap_or(self.delay);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut results = (self.respond)(query)?;
        results.truncate(max_results);
        Ok(results)
    }
}

/// One hit per query at `https://<slug>.example/page`.
pub fn slug_backend() -> FakeBackend {
    FakeBackend::new(|query| Ok(vec![hit(query, &slug_url(&query.text), 0)]))
}

pub fn slug_url(text: &str) -> String {
    format!("https://{}.example/page", text.trim().to_lowercase().replace(' ', "-"))
}

pub fn hit(query: &ResearchQuery, url: &str, rank: usize) -> SearchResult {
    SearchResult {
        query_id: query.id.clone(),
        source_engine: "searxng".into(),
        url: url.into(),
        title: format!("Page {url}"),
        raw_snippet: String::new(),
        rank,
    }
}

/// Fetcher serving fixed page texts; unknown URLs are blocked.
#[derive(Default)]
pub struct FakeFetcher {
    pages: HashMap<String, String>,
    echo_url: bool,
}

impl FakeFetcher {
    pub fn new<I, U, T>(pages: I) -> Self
    where
        I: IntoIterator<Item = (U, T)>,
        U: Into<String>,
        T: Into<String>,
    {
        Self {
            pages: pages
                .into_iter()
                .map(|(url, text)| (url.into(), text.into()))
                .collect(),
            echo_url: false,
        }
    }

    /// Serve every URL, using the URL's words as the page text.
    pub fn echo() -> Self {
        Self {
            pages: HashMap::new(),
            echo_url: true,
        }
    }
}

#[async_trait]
impl ContentFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<ExtractedPassage, FetchError> {
        if let Some(text) = self.pages.get(url) {
            return Ok(ExtractedPassage::new(url, text.clone()));
        }
        if self.echo_url {
            let text = url
                .trim_start_matches("https://")
                .replace(['/', '.', '-', '_'], " ");
            return Ok(ExtractedPassage::new(url, format!("notes about {text}")));
        }
        Err(FetchError::Blocked(format!("no fixture for {url}")))
    }
}

/// Language model replaying planner replies in order and answering every
/// synthesis prompt with the same text. Exhausted plans reply `done`.
pub struct ScriptedLlm {
    plans: Mutex<VecDeque<String>>,
    synthesis: String,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedLlm {
    pub fn new<S: Into<String>>(
        plans: impl IntoIterator<Item = S>,
        synthesis: impl Into<String>,
    ) -> Self {
        Self {
            plans: Mutex::new(plans.into_iter().map(Into::into).collect()),
            synthesis: synthesis.into(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn planner_calls(&self) -> usize {
        self.prompts().iter().filter(|p| is_plan_prompt(p)).count()
    }
}

pub fn is_plan_prompt(prompt: &str) -> bool {
    prompt.contains("You are planning web research")
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    async fn complete(&self, prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if is_plan_prompt(prompt) {
            let next = self.plans.lock().unwrap().pop_front();
            return Ok(next.unwrap_or_else(|| json!({"done": true, "queries": []}).to_string()));
        }
        Ok(self.synthesis.clone())
    }
}

pub fn plan(queries: &[&str]) -> String {
    let entries: Vec<_> = queries
        .iter()
        .map(|q| json!({"query": q, "research_goal": format!("learn about {q}")}))
        .collect();
    json!({"done": false, "queries": entries}).to_string()
}

pub fn done() -> String {
    json!({"done": true, "queries": []}).to_string()
}

pub fn settings() -> OrchestratorSettings {
    OrchestratorSettings {
        backoff: Duration::from_millis(5),
        rate_limit_backoff: Duration::from_millis(5),
        ..OrchestratorSettings::default()
    }
}

pub fn orchestrator(
    backend: Arc<FakeBackend>,
    fetcher: Arc<FakeFetcher>,
    llm: Arc<ScriptedLlm>,
) -> ResearchOrchestrator {
    ResearchOrchestrator::new(
        settings(),
        BackendRegistry::new().with_backend(backend),
        fetcher,
        llm,
        FilterConfig::default(),
    )
}

pub fn request(query: &str, max_depth: u32, max_breadth: usize) -> SessionRequest {
    SessionRequest::new(query, EngineKind::Searxng, &ResearchConfig::default())
        .with_limits(max_depth, max_breadth)
        .with_time_budget(Duration::from_secs(120))
}
