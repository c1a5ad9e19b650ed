use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::backend::{
    BackendRegistry, BrowserBackend, DynBackend, EngineKind, FirecrawlBackend, SearxngBackend,
};
use crate::config::{Config, ResearchConfig};
use crate::error::DeepDiveError;
use crate::events::EventCollector;
use crate::fetch::{DynFetcher, HttpFetcher};
use crate::llm::{DynLanguageModel, OpenAiCompatibleClient};
use crate::model::{Learning, ReportMode, ResearchReport};
use crate::orchestrator::{OrchestratorSettings, ResearchOrchestrator, SessionStats};
use crate::planner::{QueryPlanner, StopReason};

/// What the caller asks a session to research.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub query: String,
    pub engine: EngineKind,
    pub max_depth: u32,
    pub max_breadth: usize,
    pub time_budget: Duration,
    #[serde(default)]
    pub mode: ReportMode,
}

impl SessionRequest {
    /// Request with the limits from the `[research]` config section.
    pub fn new(query: impl Into<String>, engine: EngineKind, research: &ResearchConfig) -> Self {
        Self {
            query: query.into(),
            engine,
            max_depth: research.max_depth,
            max_breadth: research.max_breadth,
            time_budget: research.time_budget(),
            mode: ReportMode::default(),
        }
    }

    pub fn with_limits(mut self, max_depth: u32, max_breadth: usize) -> Self {
        self.max_depth = max_depth;
        self.max_breadth = max_breadth;
        self
    }

    pub fn with_time_budget(mut self, time_budget: Duration) -> Self {
        self.time_budget = time_budget;
        self
    }

    pub fn with_mode(mut self, mode: ReportMode) -> Self {
        self.mode = mode;
        self
    }

    /// Reject empty queries and non-positive budgets.
    pub fn validate(&self) -> Result<(), DeepDiveError> {
        if self.query.trim().is_empty() {
            return Err(DeepDiveError::invalid_session("query must not be empty"));
        }
        if self.max_depth == 0 {
            return Err(DeepDiveError::invalid_session("max_depth must be positive"));
        }
        if self.max_breadth == 0 {
            return Err(DeepDiveError::invalid_session("max_breadth must be positive"));
        }
        if self.time_budget.is_zero() {
            return Err(DeepDiveError::invalid_session("time_budget must be positive"));
        }
        Ok(())
    }
}

/// Result of a finished session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub report: ResearchReport,
    pub stop_reason: StopReason,
    pub stats: SessionStats,
    /// Learnings held by the store when the loop stopped.
    pub learnings: Vec<Learning>,
    pub visited_urls: Vec<String>,
}

/// Optional wiring for a session run.
#[derive(Default)]
pub struct SessionOptions {
    pub session_id: Option<String>,
    pub fallback_engine: Option<EngineKind>,
    pub events: Option<EventCollector>,
    pub cancellation: Option<CancellationToken>,
}

impl SessionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    /// Overrides `engines.fallback` from the config.
    pub fn with_fallback_engine(mut self, engine: EngineKind) -> Self {
        self.fallback_engine = Some(engine);
        self
    }

    pub fn with_event_collector(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

fn http_client(config: &Config) -> Result<Client, DeepDiveError> {
    Client::builder()
        .user_agent(config.fetch.user_agent.clone())
        .build()
        .map_err(|err| DeepDiveError::InvalidConfiguration(format!("http client: {err}")))
}

/// Adapters for every engine with a configured endpoint.
pub fn build_backends(config: &Config, client: &Client) -> Result<BackendRegistry, DeepDiveError> {
    let mut registry = BackendRegistry::new();
    for engine in config.engines.configured() {
        let Some(endpoint) = config.engines.endpoint(engine) else {
            continue;
        };
        let api_key = config.engines.api_key(engine)?;
        let backend: DynBackend = match engine {
            EngineKind::Searxng => {
                Arc::new(SearxngBackend::new(client.clone(), &endpoint.base_url))
            }
            EngineKind::Firecrawl => Arc::new(FirecrawlBackend::new(
                client.clone(),
                &endpoint.base_url,
                api_key,
            )),
            EngineKind::Browser => Arc::new(BrowserBackend::new(
                client.clone(),
                &endpoint.base_url,
                api_key,
            )),
        };
        registry.register(backend);
    }
    Ok(registry)
}

pub fn build_language_model(
    config: &Config,
    client: &Client,
) -> Result<DynLanguageModel, DeepDiveError> {
    let api_key = config.llm_api_key()?;
    Ok(Arc::new(OpenAiCompatibleClient::new(client.clone(), &config.llm, api_key)))
}

/// Run one research session with adapters, fetcher and model built from config.
pub async fn run_research_session(
    config: &Config,
    request: SessionRequest,
) -> Result<SessionOutcome, DeepDiveError> {
    run_research_session_with_options(config, request, SessionOptions::new()).await
}

pub async fn run_research_session_with_options(
    config: &Config,
    request: SessionRequest,
    options: SessionOptions,
) -> Result<SessionOutcome, DeepDiveError> {
    request.validate()?;
    if config.engines.endpoint(request.engine).is_none() {
        return Err(DeepDiveError::InvalidConfiguration(format!(
            "no endpoint configured for engine '{}' (add [engines.{}])",
            request.engine, request.engine
        )));
    }

    let client = http_client(config)?;
    let backends = build_backends(config, &client)?;
    let fetcher: DynFetcher = Arc::new(HttpFetcher::new(client.clone(), config.fetch.clone()));
    let llm = build_language_model(config, &client)?;

    let mut settings = OrchestratorSettings::from_config(config);
    if let Some(engine) = options.fallback_engine {
        settings.fallback_engine = Some(engine);
    }

    let mut orchestrator =
        ResearchOrchestrator::new(settings, backends, fetcher, llm, config.filter.clone());
    if let Some(session_id) = options.session_id {
        orchestrator = orchestrator.with_session_id(session_id);
    }
    if let Some(events) = options.events {
        orchestrator = orchestrator.with_event_collector(events);
    }
    if let Some(token) = options.cancellation {
        orchestrator = orchestrator.with_cancellation(token);
    }

    orchestrator.run(&request).await
}

/// Ask the configured model for follow-up questions about a query.
pub async fn clarifying_questions(
    config: &Config,
    query: &str,
    max_questions: usize,
) -> Result<Vec<String>, DeepDiveError> {
    if query.trim().is_empty() {
        return Err(DeepDiveError::invalid_session("query must not be empty"));
    }
    let client = http_client(config)?;
    let planner = QueryPlanner::new(build_language_model(config, &client)?, config.llm.max_tokens);
    planner
        .clarifying_questions(query, max_questions)
        .await
        .map_err(|err| DeepDiveError::Other(err.into()))
}
