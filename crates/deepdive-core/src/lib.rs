//! DeepDive core: an iterative web-research loop.
//!
//! A session plans sub-queries with a language model, fans them out to a
//! search backend, fetches and filters the top pages, accumulates scored
//! learnings under a token budget and finally synthesizes a cited report.

pub mod backend;
pub mod config;
mod error;
pub mod events;
pub mod fetch;
pub mod filter;
pub mod knowledge;
pub mod llm;
mod logging;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod planner;
mod security;
pub mod synthesis;
pub mod telemetry;
mod workflow;

pub use backend::{BackendRegistry, DynBackend, EngineKind, SearchBackend};
pub use config::{Config, ConfigLoader};
pub use error::{
    BackendError, DeepDiveError, FetchError, LlmError, PlannerError, SynthesisError,
};
pub use events::{Event, EventCollector, TraceCollector, UnitKind};
pub use fetch::{ContentFetcher, DynFetcher, HttpFetcher};
pub use filter::{FilterVerdict, RejectReason, RelevanceFilter};
pub use knowledge::{InvariantViolation, KnowledgeStore};
pub use llm::{DynLanguageModel, LanguageModel, OpenAiCompatibleClient};
pub use logging::{
    SessionLogInput, log_session_completion, log_session_completion_in, remove_session_logs,
    remove_session_logs_in,
};
pub use model::{
    Citation, ExtractedPassage, Finding, Learning, LearningId, ReportMode, ResearchQuery,
    ResearchReport, SearchResult,
};
pub use orchestrator::{
    OrchestratorSettings, Phase, ResearchOrchestrator, ResearchState, SessionStats,
};
pub use planner::{PlanDecision, QueryPlanner, StopReason};
pub use security::{SecretValue, require_env};
pub use synthesis::SynthesisEngine;
pub use telemetry::{TelemetryOptions, init_telemetry};
pub use workflow::{
    SessionOptions, SessionOutcome, SessionRequest, build_backends, build_language_model,
    clarifying_questions, run_research_session, run_research_session_with_options,
};
