//! Research loop driver.
//!
//! `Planning -> Dispatching -> Extracting -> Filtering -> Accumulating ->
//! Deciding` repeats until a stop condition holds, then `Synthesizing ->
//! Done`. Backend and fetch calls fan out on a semaphore-bounded `JoinSet`;
//! results come back in completion order and are folded into the knowledge
//! store by a single serialized accumulation step per round. One
//! cancellation token covers the whole session and fires at the deadline.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use uuid::Uuid;

use crate::backend::{BackendRegistry, DynBackend, EngineKind};
use crate::config::{Config, FilterConfig};
use crate::error::{BackendError, DeepDiveError, FetchError};
use crate::events::{EventCollector, UnitKind};
use crate::fetch::DynFetcher;
use crate::filter::{FilterVerdict, RejectReason, RelevanceFilter};
use crate::knowledge::KnowledgeStore;
use crate::llm::DynLanguageModel;
use crate::metrics;
use crate::model::{ExtractedPassage, Learning, ResearchQuery, SearchResult};
use crate::planner::{PlanDecision, QueryPlanner, StopReason, novelty_key};
use crate::synthesis::SynthesisEngine;
use crate::workflow::{SessionOutcome, SessionRequest};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Planning,
    Dispatching,
    Extracting,
    Filtering,
    Accumulating,
    Deciding,
    Synthesizing,
    Done,
    Failed,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Dispatching => "dispatching",
            Self::Extracting => "extracting",
            Self::Filtering => "filtering",
            Self::Accumulating => "accumulating",
            Self::Deciding => "deciding",
            Self::Synthesizing => "synthesizing",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Mutable state of one session, owned by the orchestrator for its lifetime.
#[derive(Debug)]
pub struct ResearchState {
    pub original_query: ResearchQuery,
    pub knowledge: KnowledgeStore,
    /// Completed rounds.
    pub current_depth: u32,
    pub max_depth: u32,
    pub max_breadth: usize,
    pub remaining_breadth_budget: usize,
    deadline: Instant,
    issued: Vec<ResearchQuery>,
    issued_keys: HashSet<String>,
    attempted_urls: HashSet<String>,
}

impl ResearchState {
    pub fn new(
        original_query: ResearchQuery,
        max_depth: u32,
        max_breadth: usize,
        session_breadth_budget: usize,
        token_budget: usize,
        time_budget: Duration,
    ) -> Self {
        let now = Instant::now();
        let deadline = now
            .checked_add(time_budget)
            .unwrap_or_else(|| now + Duration::from_secs(365 * 86_400));
        Self {
            original_query,
            knowledge: KnowledgeStore::new(token_budget),
            current_depth: 0,
            max_depth,
            max_breadth,
            remaining_breadth_budget: session_breadth_budget,
            deadline,
            issued: Vec::new(),
            issued_keys: HashSet::new(),
            attempted_urls: HashSet::new(),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining_time_budget(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Sub-queries the next round may issue: `max_breadth` halved (rounding
    /// up) for every completed round, capped by the session budget.
    pub fn round_breadth(&self) -> usize {
        let narrowed = (0..self.current_depth)
            .fold(self.max_breadth, |breadth, _| breadth.div_ceil(2));
        narrowed.min(self.remaining_breadth_budget)
    }

    pub fn issued_queries(&self) -> &[ResearchQuery] {
        &self.issued
    }

    /// `key` is the trimmed, lower-cased query text.
    pub fn was_issued(&self, key: &str) -> bool {
        self.issued_keys.contains(key)
    }

    pub fn record_issued(&mut self, queries: &[ResearchQuery]) {
        for query in queries {
            if self.issued_keys.insert(novelty_key(&query.text)) {
                self.issued.push(query.clone());
                self.remaining_breadth_budget = self.remaining_breadth_budget.saturating_sub(1);
            }
        }
    }

    /// True the first time a URL is claimed for fetching in this session.
    fn claim_url(&mut self, url: &str) -> bool {
        self.attempted_urls.insert(url.to_string())
    }
}

/// Tunables for the loop, usually derived from [`Config`].
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub results_per_query: usize,
    pub top_urls: usize,
    /// Worker pool size; defaults to the round's breadth.
    pub concurrency: Option<usize>,
    /// Defaults to `max_depth * max_breadth`.
    pub session_breadth_budget: Option<usize>,
    pub search_timeout: Duration,
    pub backoff: Duration,
    pub rate_limit_backoff: Duration,
    pub fallback_engine: Option<EngineKind>,
    pub token_budget: usize,
    pub llm_max_tokens: u32,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl OrchestratorSettings {
    pub fn from_config(config: &Config) -> Self {
        let research = &config.research;
        Self {
            results_per_query: research.results_per_query,
            top_urls: research.top_urls,
            concurrency: research.concurrency,
            session_breadth_budget: research.session_breadth_budget,
            search_timeout: research.search_timeout(),
            backoff: Duration::from_millis(research.backoff_ms),
            rate_limit_backoff: Duration::from_millis(research.rate_limit_backoff_ms),
            fallback_engine: config.engines.fallback,
            token_budget: config.knowledge.token_budget,
            llm_max_tokens: config.llm.max_tokens,
        }
    }
}

/// Counters reported with every finished session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub rounds: u32,
    pub deepest_query: u32,
    pub sub_queries_issued: usize,
    pub sub_queries_discarded: usize,
    pub sub_queries_failed: usize,
    pub urls_fetched: usize,
    pub urls_failed: usize,
    pub passages_accepted: usize,
    pub passages_rejected: usize,
    pub duplicates_merged: usize,
    pub learnings_evicted: usize,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_results: usize,
    search_timeout: Duration,
    backoff: Duration,
    rate_limit_backoff: Duration,
}

#[derive(Debug, Clone)]
struct FetchUnit {
    url: String,
    title: String,
    sub_query: String,
}

struct ScoredPassage {
    unit: FetchUnit,
    passage: ExtractedPassage,
    verdict: FilterVerdict,
    gist: Option<String>,
}

#[derive(Debug, Default)]
struct RoundOutcome {
    accepted: usize,
    skipped: usize,
    interrupted: bool,
}

pub struct ResearchOrchestrator {
    settings: OrchestratorSettings,
    backends: BackendRegistry,
    fetcher: DynFetcher,
    filter: Arc<RelevanceFilter>,
    planner: QueryPlanner,
    synthesis: SynthesisEngine,
    events: Option<EventCollector>,
    cancel: CancellationToken,
    session_id: Option<String>,
}

impl ResearchOrchestrator {
    pub fn new(
        settings: OrchestratorSettings,
        backends: BackendRegistry,
        fetcher: DynFetcher,
        llm: DynLanguageModel,
        filter_config: FilterConfig,
    ) -> Self {
        let max_tokens = settings.llm_max_tokens;
        Self {
            filter: Arc::new(RelevanceFilter::new(filter_config, Some(llm.clone()))),
            planner: QueryPlanner::new(llm.clone(), max_tokens),
            synthesis: SynthesisEngine::new(llm, max_tokens),
            settings,
            backends,
            fetcher,
            events: None,
            cancel: CancellationToken::new(),
            session_id: None,
        }
    }

    pub fn with_event_collector(mut self, events: EventCollector) -> Self {
        self.events = Some(events);
        self
    }

    /// Cancelling this token ends the session early, exactly like the deadline.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    fn enter(&self, phase: Phase, depth: u32) {
        tracing::debug!(phase = phase.as_str(), depth, "entering phase");
        if let Some(events) = &self.events {
            events.emit_phase(phase, depth);
        }
    }

    fn skipped(&self, kind: UnitKind, target: &str, reason: &str) {
        if let Some(events) = &self.events {
            events.emit_skipped(kind, target, reason);
        }
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_results: self.settings.results_per_query,
            search_timeout: self.settings.search_timeout,
            backoff: self.settings.backoff,
            rate_limit_backoff: self.settings.rate_limit_backoff,
        }
    }

    fn interruption_reason(&self, state: &ResearchState) -> StopReason {
        if state.remaining_time_budget().is_zero() {
            StopReason::TimeBudgetExhausted
        } else {
            StopReason::Cancelled
        }
    }

    /// Run one session to completion. Only invalid input or a failed
    /// synthesis produce an error; everything else yields a report.
    #[tracing::instrument(
        name = "research.session",
        skip_all,
        fields(engine = %request.engine, max_depth = request.max_depth, max_breadth = request.max_breadth)
    )]
    pub async fn run(&self, request: &SessionRequest) -> Result<SessionOutcome, DeepDiveError> {
        let session_id = self
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        if let Err(err) = request.validate() {
            self.enter(Phase::Failed, 0);
            return Err(err);
        }
        let Some(primary) = self.backends.get(request.engine) else {
            self.enter(Phase::Failed, 0);
            return Err(DeepDiveError::invalid_session(format!(
                "engine '{}' is not configured",
                request.engine
            )));
        };
        let fallback = self
            .settings
            .fallback_engine
            .filter(|engine| *engine != request.engine)
            .and_then(|engine| self.backends.get(engine));

        let started = Instant::now();
        let breadth_budget = self
            .settings
            .session_breadth_budget
            .unwrap_or(request.max_depth as usize * request.max_breadth);
        let mut state = ResearchState::new(
            ResearchQuery::root(request.query.trim()),
            request.max_depth,
            request.max_breadth,
            breadth_budget,
            self.settings.token_budget,
            request.time_budget,
        );
        let token = self.cancel.child_token();
        let _deadline = arm_deadline(token.clone(), state.deadline());
        let mut stats = SessionStats::default();

        tracing::info!(
            session_id = %session_id,
            query = %request.query,
            "research session started"
        );

        let stop_reason = loop {
            if token.is_cancelled() {
                break self.interruption_reason(&state);
            }

            self.enter(Phase::Planning, state.current_depth);
            let decision = tokio::select! {
                biased;
                _ = token.cancelled() => PlanDecision::Stop(self.interruption_reason(&state)),
                decision = self.planner.plan(&state) => decision,
            };
            let queries = match decision {
                PlanDecision::Stop(reason) => break reason,
                PlanDecision::Continue { queries, discarded } => {
                    for text in &discarded {
                        self.skipped(UnitKind::SubQuery, text, "already issued");
                    }
                    stats.sub_queries_discarded += discarded.len();
                    queries
                }
            };

            state.record_issued(&queries);
            stats.sub_queries_issued += queries.len();
            stats.deepest_query = queries
                .iter()
                .map(|q| q.depth)
                .fold(stats.deepest_query, u32::max);

            let round = self
                .run_round(&mut state, queries, &primary, fallback.as_ref(), &token, &mut stats)
                .await;
            if round.interrupted {
                break self.interruption_reason(&state);
            }

            state.current_depth += 1;
            stats.rounds = state.current_depth;
            if let Some(events) = &self.events {
                events.emit_round(state.current_depth, round.accepted, round.skipped);
            }
            tracing::info!(
                depth = state.current_depth,
                accepted = round.accepted,
                skipped = round.skipped,
                learnings = state.knowledge.len(),
                "round complete"
            );

            self.enter(Phase::Deciding, state.current_depth);
            if let Some(reason) = self.planner.should_stop(&state) {
                break reason;
            }
        };

        tracing::info!(
            stop_reason = %stop_reason,
            learnings = state.knowledge.len(),
            "research loop finished"
        );
        stats.learnings_evicted = state.knowledge.evicted_total();

        self.enter(Phase::Synthesizing, state.current_depth);
        let report = match self.synthesis.synthesize(&state, request.mode).await {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(error = %err, "synthesis failed");
                self.enter(Phase::Failed, state.current_depth);
                return Err(err.into());
            }
        };
        self.enter(Phase::Done, state.current_depth);
        if let Some(events) = &self.events {
            events.emit_finished(stop_reason);
        }
        metrics::record_session(stop_reason.as_str(), started.elapsed().as_millis() as u64);

        Ok(SessionOutcome {
            session_id,
            report,
            stop_reason,
            stats,
            learnings: state.knowledge.learnings().cloned().collect(),
            visited_urls: state.knowledge.visited_urls().to_vec(),
        })
    }

    async fn run_round(
        &self,
        state: &mut ResearchState,
        queries: Vec<ResearchQuery>,
        primary: &DynBackend,
        fallback: Option<&DynBackend>,
        token: &CancellationToken,
        stats: &mut SessionStats,
    ) -> RoundOutcome {
        let depth = state.current_depth + 1;
        let pool = self.settings.concurrency.unwrap_or(queries.len()).max(1);
        let mut outcome = RoundOutcome::default();

        self.enter(Phase::Dispatching, depth);
        let (searches, interrupted) = self.dispatch(queries, primary, fallback, pool, token).await;
        outcome.interrupted = interrupted;

        let mut units = Vec::new();
        for (query, result) in searches {
            match result {
                Ok(results) => units.extend(self.select_urls(state, &query, results)),
                Err(err) => {
                    tracing::warn!(query = %query.text, error = %err, "sub-query skipped");
                    self.skipped(UnitKind::SubQuery, &query.text, &err.to_string());
                    stats.sub_queries_failed += 1;
                    outcome.skipped += 1;
                }
            }
        }

        let mut fetched = Vec::new();
        if !outcome.interrupted && !units.is_empty() {
            self.enter(Phase::Extracting, depth);
            let (results, interrupted) = self.extract(units, pool, token).await;
            outcome.interrupted = interrupted;
            for (unit, result) in results {
                match result {
                    Ok(passage) => {
                        stats.urls_fetched += 1;
                        fetched.push((unit, passage));
                    }
                    Err(err) => {
                        tracing::warn!(url = %unit.url, error = %err, "url skipped");
                        self.skipped(UnitKind::Url, &unit.url, &err.to_string());
                        stats.urls_failed += 1;
                        outcome.skipped += 1;
                    }
                }
            }
        }

        // Visits are recorded for every fetched page, even if filtering is cut short.
        let visits: Vec<(String, String)> = fetched
            .iter()
            .map(|(unit, _)| (unit.url.clone(), unit.title.clone()))
            .collect();

        let mut verdicts = Vec::new();
        if !outcome.interrupted && !fetched.is_empty() {
            self.enter(Phase::Filtering, depth);
            let snapshot: Arc<Vec<Learning>> =
                Arc::new(state.knowledge.learnings().cloned().collect());
            let (results, interrupted) = self.score(fetched, snapshot, pool, token).await;
            outcome.interrupted = interrupted;
            verdicts = results;
        }

        self.enter(Phase::Accumulating, depth);
        self.accumulate(state, visits, verdicts, &mut outcome, stats);
        outcome
    }

    async fn dispatch(
        &self,
        queries: Vec<ResearchQuery>,
        primary: &DynBackend,
        fallback: Option<&DynBackend>,
        pool: usize,
        token: &CancellationToken,
    ) -> (Vec<(ResearchQuery, Result<Vec<SearchResult>, BackendError>)>, bool) {
        let permits = Arc::new(Semaphore::new(pool));
        let policy = self.retry_policy();
        let mut tasks = JoinSet::new();
        for query in queries {
            let permits = permits.clone();
            let primary = primary.clone();
            let fallback = fallback.cloned();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (query, Err(BackendError::Unavailable("worker pool closed".into())));
                };
                let result = search_with_retry(&primary, fallback.as_ref(), &query, policy).await;
                (query, result)
            });
        }
        drain(&mut tasks, token).await
    }

    /// Top-ranked, not yet attempted URLs of one sub-query's results.
    fn select_urls(
        &self,
        state: &mut ResearchState,
        query: &ResearchQuery,
        mut results: Vec<SearchResult>,
    ) -> Vec<FetchUnit> {
        results.sort_by_key(|result| result.rank);
        results
            .into_iter()
            .filter(|result| state.claim_url(&result.url))
            .take(self.settings.top_urls)
            .map(|result| FetchUnit {
                url: result.url,
                title: result.title,
                sub_query: query.text.clone(),
            })
            .collect()
    }

    async fn extract(
        &self,
        units: Vec<FetchUnit>,
        pool: usize,
        token: &CancellationToken,
    ) -> (Vec<(FetchUnit, Result<ExtractedPassage, FetchError>)>, bool) {
        let permits = Arc::new(Semaphore::new(pool));
        let backoff = self.settings.backoff;
        let mut tasks = JoinSet::new();
        for unit in units {
            let permits = permits.clone();
            let fetcher = self.fetcher.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return (unit, Err(FetchError::Blocked("worker pool closed".into())));
                };
                let result = fetch_with_retry(&fetcher, &unit.url, backoff).await;
                (unit, result)
            });
        }
        drain(&mut tasks, token).await
    }

    async fn score(
        &self,
        fetched: Vec<(FetchUnit, ExtractedPassage)>,
        snapshot: Arc<Vec<Learning>>,
        pool: usize,
        token: &CancellationToken,
    ) -> (Vec<ScoredPassage>, bool) {
        let permits = Arc::new(Semaphore::new(pool));
        let mut tasks = JoinSet::new();
        for (unit, passage) in fetched {
            let permits = permits.clone();
            let filter = self.filter.clone();
            let snapshot = snapshot.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                let verdict = filter.filter(&passage, &unit.sub_query, snapshot.iter()).await;
                let gist = match verdict {
                    FilterVerdict::Accept(_) => filter.condense(&passage, &unit.sub_query).await,
                    FilterVerdict::Reject(_) => None,
                };
                ScoredPassage {
                    unit,
                    passage,
                    verdict,
                    gist,
                }
            });
        }
        drain(&mut tasks, token).await
    }

    /// The only step that mutates the knowledge store during a round.
    fn accumulate(
        &self,
        state: &mut ResearchState,
        visits: Vec<(String, String)>,
        verdicts: Vec<ScoredPassage>,
        outcome: &mut RoundOutcome,
        stats: &mut SessionStats,
    ) {
        for (url, title) in &visits {
            state.knowledge.record_visit(url);
            state.knowledge.record_title(url, title);
        }

        for ScoredPassage {
            unit,
            passage,
            verdict,
            gist,
        } in verdicts
        {
            let label = match verdict {
                FilterVerdict::Accept(score) => {
                    // Passages accepted in the same round were never compared
                    // with each other.
                    if let Some(of) = self
                        .filter
                        .find_duplicate(&passage, state.knowledge.learnings())
                    {
                        state.knowledge.merge_supporting_url(of, &passage.source_url);
                        stats.duplicates_merged += 1;
                        "duplicate_content"
                    } else {
                        let learning = Learning::from_passage(&passage, score).with_gist(gist);
                        let insertion = state.knowledge.add_learning(learning);
                        for evicted in &insertion.evicted {
                            tracing::debug!(
                                learning_id = evicted.id,
                                score = evicted.relevance_score,
                                "learning evicted"
                            );
                        }
                        if insertion.retained() {
                            if let Some(events) = &self.events {
                                events.emit_learning(insertion.id, &unit.url, score);
                            }
                        }
                        stats.passages_accepted += 1;
                        outcome.accepted += 1;
                        "accepted"
                    }
                }
                FilterVerdict::Reject(RejectReason::DuplicateContent { of }) => {
                    if !state.knowledge.merge_supporting_url(of, &passage.source_url) {
                        tracing::debug!(
                            url = %unit.url,
                            learning_id = of,
                            "duplicate of an evicted learning"
                        );
                    }
                    stats.duplicates_merged += 1;
                    self.skipped(UnitKind::Passage, &unit.url, "duplicate_content");
                    "duplicate_content"
                }
                FilterVerdict::Reject(reason) => {
                    tracing::debug!(url = %unit.url, reason = reason.as_str(), "passage rejected");
                    self.skipped(UnitKind::Passage, &unit.url, reason.as_str());
                    stats.passages_rejected += 1;
                    outcome.skipped += 1;
                    reason.as_str()
                }
            };
            metrics::record_passage(label);
        }

        let check = state.knowledge.check_invariants();
        if let Err(violation) = &check {
            tracing::error!(%violation, "knowledge store invariant violated");
        }
        debug_assert!(check.is_ok(), "knowledge store invariant violated");
    }
}

/// Cancels `token` at the deadline; dropping the guard stops the timer.
fn arm_deadline(token: CancellationToken, deadline: Instant) -> DropGuard {
    let timer = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {
                tracing::info!("time budget exhausted; cancelling in-flight work");
                timer.cancel();
            }
            _ = timer.cancelled() => {}
        }
    });
    token.drop_guard()
}

/// Collect task results in completion order. On cancellation the remaining
/// tasks are aborted and their results discarded.
async fn drain<T: Send + 'static>(
    tasks: &mut JoinSet<T>,
    token: &CancellationToken,
) -> (Vec<T>, bool) {
    let mut done = Vec::new();
    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!(in_flight = tasks.len(), "aborting in-flight work");
                tasks.abort_all();
                return (done, true);
            }
            next = tasks.join_next() => match next {
                None => return (done, false),
                Some(Ok(value)) => done.push(value),
                Some(Err(err)) => tracing::warn!(error = %err, "worker task failed"),
            },
        }
    }
}

async fn call_backend(
    backend: &DynBackend,
    query: &ResearchQuery,
    policy: RetryPolicy,
) -> Result<Vec<SearchResult>, BackendError> {
    let result = backend
        .search(query, policy.max_results, policy.search_timeout)
        .await;
    let status = match &result {
        Ok(_) => "ok",
        Err(err) => err.as_str(),
    };
    metrics::record_backend_call(backend.engine().as_str(), status);
    result
}

/// Timeout: one retry after the backoff. Rate limit: longer backoff, then a
/// single attempt through the fallback engine when one is configured.
async fn search_with_retry(
    primary: &DynBackend,
    fallback: Option<&DynBackend>,
    query: &ResearchQuery,
    policy: RetryPolicy,
) -> Result<Vec<SearchResult>, BackendError> {
    match call_backend(primary, query, policy).await {
        Err(err) if err.is_retryable() => {
            tracing::debug!(query = %query.text, "backend timed out; retrying once");
            tokio::time::sleep(policy.backoff).await;
            call_backend(primary, query, policy).await
        }
        Err(BackendError::RateLimited) => {
            tokio::time::sleep(policy.rate_limit_backoff).await;
            match fallback {
                Some(fallback) => {
                    tracing::debug!(
                        query = %query.text,
                        fallback = %fallback.engine(),
                        "rate limited; trying fallback engine"
                    );
                    call_backend(fallback, query, policy).await
                }
                None => Err(BackendError::RateLimited),
            }
        }
        other => other,
    }
}

async fn fetch_with_retry(
    fetcher: &DynFetcher,
    url: &str,
    backoff: Duration,
) -> Result<ExtractedPassage, FetchError> {
    match fetcher.fetch(url).await {
        Err(err) if err.is_retryable() => {
            tracing::debug!(url, "fetch timed out; retrying once");
            tokio::time::sleep(backoff).await;
            fetcher.fetch(url).await
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SearchBackend;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct ScriptedBackend {
        engine: EngineKind,
        replies: Mutex<Vec<Result<Vec<SearchResult>, BackendError>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedBackend {
        fn new(
            engine: EngineKind,
            replies: Vec<Result<Vec<SearchResult>, BackendError>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                engine,
                replies: Mutex::new(replies),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl SearchBackend for ScriptedBackend {
        fn engine(&self) -> EngineKind {
            self.engine
        }

        async fn search(
            &self,
            query: &ResearchQuery,
            _max_results: usize,
            _timeout: Duration,
        ) -> Result<Vec<SearchResult>, BackendError> {
            *self.calls.lock().unwrap() += 1;
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Ok(vec![hit(query, "https://default.example")]);
            }
            replies.remove(0)
        }
    }

    fn hit(query: &ResearchQuery, url: &str) -> SearchResult {
        SearchResult {
            query_id: query.id.clone(),
            source_engine: "scripted".into(),
            url: url.into(),
            title: String::new(),
            raw_snippet: String::new(),
            rank: 0,
        }
    }

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_results: 5,
            search_timeout: Duration::from_secs(1),
            backoff: Duration::from_millis(500),
            rate_limit_backoff: Duration::from_millis(2_000),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_retried_once() {
        let query = ResearchQuery::root("q");
        let backend = ScriptedBackend::new(
            EngineKind::Searxng,
            vec![Err(BackendError::Timeout), Err(BackendError::Timeout)],
        );
        let primary: DynBackend = backend.clone();
        let result = search_with_retry(&primary, None, &query, policy()).await;
        assert_eq!(result, Err(BackendError::Timeout));
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_uses_fallback_engine() {
        let query = ResearchQuery::root("q");
        let primary =
            ScriptedBackend::new(EngineKind::Searxng, vec![Err(BackendError::RateLimited)]);
        let fallback = ScriptedBackend::new(EngineKind::Firecrawl, Vec::new());
        let primary_dyn: DynBackend = primary.clone();
        let fallback_dyn: DynBackend = fallback.clone();

        let started = Instant::now();
        let result = search_with_retry(&primary_dyn, Some(&fallback_dyn), &query, policy())
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(2_000));
        assert_eq!(result[0].url, "https://default.example");
        assert_eq!((primary.calls(), fallback.calls()), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_without_fallback_gives_up() {
        let query = ResearchQuery::root("q");
        let primary =
            ScriptedBackend::new(EngineKind::Browser, vec![Err(BackendError::RateLimited)]);
        let primary_dyn: DynBackend = primary.clone();
        let result = search_with_retry(&primary_dyn, None, &query, policy()).await;
        assert_eq!(result, Err(BackendError::RateLimited));
        assert_eq!(primary.calls(), 1);
    }

    #[test]
    fn breadth_budget_counts_distinct_issued_queries() {
        let mut state = ResearchState::new(
            ResearchQuery::root("root"),
            2,
            3,
            4,
            100,
            Duration::from_secs(10),
        );
        let a = ResearchQuery::child(&state.original_query, "A", 1);
        let b = ResearchQuery::child(&state.original_query, "a ", 1);
        state.record_issued(&[a, b]);
        assert_eq!(state.remaining_breadth_budget, 3);
        assert_eq!(state.round_breadth(), 3);
        assert!(state.was_issued("a"));
        assert!(!state.was_issued("root"));
    }

    #[test]
    fn round_breadth_halves_per_completed_round() {
        let mut state = ResearchState::new(
            ResearchQuery::root("root"),
            4,
            5,
            20,
            100,
            Duration::from_secs(10),
        );
        let widths: Vec<usize> = (0..4)
            .map(|depth| {
                state.current_depth = depth;
                state.round_breadth()
            })
            .collect();
        assert_eq!(widths, [5, 3, 2, 1]);

        state.current_depth = 1;
        state.remaining_breadth_budget = 2;
        assert_eq!(state.round_breadth(), 2);
        state.remaining_breadth_budget = 0;
        assert_eq!(state.round_breadth(), 0);
    }
}
