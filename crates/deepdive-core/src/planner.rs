//! LLM-driven sub-query planning.
//!
//! The model's reply is advisory. Every proposed sub-query is checked for
//! shape and novelty before it is issued, and anything unusable ends the
//! loop so synthesis can run on what already exists.

use std::collections::HashSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PlannerError;
use crate::llm::{DynLanguageModel, extract_json};
use crate::model::{Learning, ResearchQuery};
use crate::orchestrator::ResearchState;

const DIGEST_LEARNINGS: usize = 20;
const DIGEST_CHARS: usize = 300;

/// Why the research loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    MaxDepthReached,
    BreadthBudgetExhausted,
    TimeBudgetExhausted,
    NoLearnings,
    PlannerDone,
    PlannerFallback,
    NoNovelQueries,
    Cancelled,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MaxDepthReached => "max_depth_reached",
            Self::BreadthBudgetExhausted => "breadth_budget_exhausted",
            Self::TimeBudgetExhausted => "time_budget_exhausted",
            Self::NoLearnings => "no_learnings",
            Self::PlannerDone => "planner_done",
            Self::PlannerFallback => "planner_fallback",
            Self::NoNovelQueries => "no_novel_queries",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlanDecision {
    /// Validated sub-queries to issue, plus proposals dropped as repeats.
    Continue {
        queries: Vec<ResearchQuery>,
        discarded: Vec<String>,
    },
    Stop(StopReason),
}

/// A sub-query as proposed by the model, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProposedQuery {
    pub query: String,
    pub research_goal: Option<String>,
}

/// Parsed planner reply.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlannerReply {
    pub done: bool,
    pub queries: Vec<ProposedQuery>,
}

/// Outcome of validating a batch against the session history.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ValidatedBatch {
    pub accepted: Vec<ResearchQuery>,
    pub duplicates: Vec<String>,
    pub blank: usize,
    pub over_budget: usize,
}

pub(crate) fn novelty_key(text: &str) -> String {
    text.trim().to_lowercase()
}

pub struct QueryPlanner {
    llm: DynLanguageModel,
    max_tokens: u32,
}

impl QueryPlanner {
    pub fn new(llm: DynLanguageModel, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    /// Stop conditions evaluated before the model is consulted.
    pub fn should_stop(&self, state: &ResearchState) -> Option<StopReason> {
        if state.current_depth >= state.max_depth {
            return Some(StopReason::MaxDepthReached);
        }
        if state.remaining_breadth_budget == 0 {
            return Some(StopReason::BreadthBudgetExhausted);
        }
        if state.remaining_time_budget().is_zero() {
            return Some(StopReason::TimeBudgetExhausted);
        }
        if state.current_depth >= 1 && state.knowledge.is_empty() {
            return Some(StopReason::NoLearnings);
        }
        None
    }

    /// Ask the model for the next batch and validate it. An empty batch
    /// means the model considers the research complete.
    pub async fn next_sub_queries(
        &self,
        state: &ResearchState,
    ) -> Result<ValidatedBatch, PlannerError> {
        let limit = state.round_breadth();
        let prompt = build_plan_prompt(state, limit);
        let raw = self.llm.complete(&prompt, self.max_tokens).await?;
        let reply = parse_plan_reply(&raw)?;

        if reply.done {
            tracing::info!(depth = state.current_depth, "planner signalled completion");
            return Ok(ValidatedBatch::default());
        }
        if reply.queries.is_empty() {
            return Err(PlannerError::Empty);
        }
        Ok(validate_batch(state, reply.queries))
    }

    /// Full planning step: stop checks, model call, validation and fallback.
    #[tracing::instrument(name = "planner.plan", skip(self, state), fields(depth = state.current_depth))]
    pub async fn plan(&self, state: &ResearchState) -> PlanDecision {
        if let Some(reason) = self.should_stop(state) {
            return PlanDecision::Stop(reason);
        }

        let batch = match self.next_sub_queries(state).await {
            Ok(batch) => batch,
            Err(err) => {
                tracing::warn!(error = %err, "planner output unusable; stopping to synthesize");
                return PlanDecision::Stop(StopReason::PlannerFallback);
            }
        };

        for duplicate in &batch.duplicates {
            tracing::debug!(query = %duplicate, "discarded previously issued sub-query");
        }
        if batch.over_budget > 0 {
            tracing::debug!(
                dropped = batch.over_budget,
                "sub-queries beyond round breadth dropped"
            );
        }
        if batch.accepted.is_empty() {
            let reason = if !batch.duplicates.is_empty() {
                StopReason::NoNovelQueries
            } else if batch.blank > 0 {
                StopReason::PlannerFallback
            } else {
                StopReason::PlannerDone
            };
            return PlanDecision::Stop(reason);
        }
        PlanDecision::Continue {
            queries: batch.accepted,
            discarded: batch.duplicates,
        }
    }

    /// Follow-up questions that would sharpen an under-specified query.
    pub async fn clarifying_questions(
        &self,
        query: &str,
        max_questions: usize,
    ) -> Result<Vec<String>, PlannerError> {
        let prompt = format!(
            "Given the following research query from the user, ask up to {max_questions} \
             follow-up questions that clarify the research direction. Return fewer questions \
             if the query is already clear.\n\n<query>{query}</query>\n\n\
             Respond with JSON only: {{\"questions\": [\"...\"]}}"
        );
        let raw = self.llm.complete(&prompt, self.max_tokens).await?;
        let value = extract_json(&raw)
            .ok_or_else(|| PlannerError::Malformed("reply is not JSON".into()))?;
        let items = match &value {
            Value::Array(items) => items,
            Value::Object(map) => map
                .get("questions")
                .and_then(Value::as_array)
                .ok_or_else(|| PlannerError::Malformed("missing questions array".into()))?,
            _ => return Err(PlannerError::Malformed("unexpected JSON shape".into())),
        };

        let mut seen = HashSet::new();
        Ok(items
            .iter()
            .filter_map(Value::as_str)
            .map(str::trim)
            .filter(|question| !question.is_empty() && seen.insert(novelty_key(question)))
            .take(max_questions)
            .map(str::to_string)
            .collect())
    }
}

fn build_plan_prompt(state: &ResearchState, limit: usize) -> String {
    let mut prompt = format!(
        "You are planning web research for the query below. Propose at most {limit} new search \
         queries, each narrower than the original and distinct from the ones already issued. \
         Give every query a research goal describing what it should uncover and how research \
         should advance once results are found. Set \"done\" to true when the learnings already \
         answer the query.\n\n<query>{}</query>\n",
        state.original_query.text
    );

    let issued = state.issued_queries();
    if !issued.is_empty() {
        prompt.push_str("\nAlready issued:\n");
        for query in issued {
            match &query.research_goal {
                Some(goal) => prompt.push_str(&format!("- {} (goal: {goal})\n", query.text)),
                None => prompt.push_str(&format!("- {}\n", query.text)),
            }
        }
    }

    if !state.knowledge.is_empty() {
        prompt.push_str("\nLearnings so far:\n");
        for learning in state.knowledge.learnings().take(DIGEST_LEARNINGS) {
            prompt.push_str(&format!("- {}\n", digest(learning)));
        }
    }

    prompt.push_str(
        "\nRespond with JSON only: {\"done\": false, \"queries\": \
         [{\"query\": \"...\", \"research_goal\": \"...\"}]}",
    );
    prompt
}

/// The model's gist when there is one, otherwise the leading whole
/// sentences of the learning that fit in `DIGEST_CHARS`.
fn digest(learning: &Learning) -> String {
    if let Some(gist) = &learning.gist {
        return gist.clone();
    }
    let text = learning.text.split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() <= DIGEST_CHARS {
        return text;
    }
    let head: String = text.chars().take(DIGEST_CHARS).collect();
    match [". ", "! ", "? "].iter().filter_map(|end| head.rfind(end)).max() {
        Some(end) => head[..=end].to_string(),
        None => format!("{}...", head.trim_end()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawQuery {
    Text(String),
    Detailed {
        query: String,
        #[serde(default, alias = "researchGoal")]
        research_goal: Option<String>,
    },
}

impl From<RawQuery> for ProposedQuery {
    fn from(raw: RawQuery) -> Self {
        match raw {
            RawQuery::Text(query) => Self {
                query,
                research_goal: None,
            },
            RawQuery::Detailed {
                query,
                research_goal,
            } => Self {
                query,
                research_goal,
            },
        }
    }
}

/// Accepts `{"done": bool, "queries": [...]}` or a bare array of queries,
/// where each query is a string or `{"query", "research_goal"}`.
pub fn parse_plan_reply(raw: &str) -> Result<PlannerReply, PlannerError> {
    let value =
        extract_json(raw).ok_or_else(|| PlannerError::Malformed("reply is not JSON".into()))?;
    let (done, items) = match value {
        Value::Array(items) => (false, items),
        Value::Object(mut map) => {
            let done = map.get("done").and_then(Value::as_bool).unwrap_or(false);
            let items = match map.remove("queries") {
                Some(Value::Array(items)) => items,
                Some(_) => return Err(PlannerError::Malformed("queries is not an array".into())),
                None if done => Vec::new(),
                None => return Err(PlannerError::Malformed("missing queries".into())),
            };
            (done, items)
        }
        _ => return Err(PlannerError::Malformed("unexpected JSON shape".into())),
    };

    let queries = items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<RawQuery>(item)
                .map(ProposedQuery::from)
                .map_err(|err| PlannerError::Malformed(format!("bad query entry: {err}")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PlannerReply { done, queries })
}

/// Drop blank and previously issued sub-queries (case-insensitive, also
/// within the batch), cap at the round's breadth and stamp depth and parent.
pub fn validate_batch(state: &ResearchState, proposed: Vec<ProposedQuery>) -> ValidatedBatch {
    let limit = state.round_breadth();
    let depth = state.current_depth + 1;
    let mut batch_keys = HashSet::new();
    let mut validated = ValidatedBatch::default();

    for candidate in proposed {
        let text = candidate.query.trim();
        if text.is_empty() {
            validated.blank += 1;
            continue;
        }
        let key = novelty_key(text);
        if state.was_issued(&key) || !batch_keys.insert(key) {
            validated.duplicates.push(text.to_string());
            continue;
        }
        if validated.accepted.len() >= limit {
            validated.over_budget += 1;
            continue;
        }
        let mut query = ResearchQuery::child(&state.original_query, text, depth);
        if let Some(goal) = candidate.research_goal {
            query = query.with_goal(goal.trim());
        }
        validated.accepted.push(query);
    }
    validated
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::LanguageModel;
    use crate::model::ExtractedPassage;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    struct Reply(Result<String, LlmError>);

    #[async_trait]
    impl LanguageModel for Reply {
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
            self.0.clone()
        }
    }

    fn planner(reply: &str) -> QueryPlanner {
        QueryPlanner::new(Arc::new(Reply(Ok(reply.to_string()))), 512)
    }

    fn state() -> ResearchState {
        ResearchState::new(
            ResearchQuery::root("impact of X on Y"),
            2,
            3,
            6,
            1_000,
            Duration::from_secs(60),
        )
    }

    #[test]
    fn digest_prefers_gist_then_whole_sentences() {
        let mut state = state();
        let filler = "lorem ".repeat(80);
        let long = ExtractedPassage::new(
            "https://a.example",
            format!("X adoption doubled in 2024. Second  sentence {filler}"),
        );
        let condensed = ExtractedPassage::new("https://b.example", "raw page text about Y");
        state.knowledge.add_learning(Learning::from_passage(&long, 0.8));
        state.knowledge.add_learning(
            Learning::from_passage(&condensed, 0.7).with_gist(Some("Y fell 10% in 2023.".into())),
        );

        let prompt = build_plan_prompt(&state, 3);
        assert!(prompt.contains("\n- X adoption doubled in 2024.\n"), "{prompt}");
        assert!(prompt.contains("\n- Y fell 10% in 2023.\n"), "{prompt}");
        assert!(!prompt.contains("raw page text"));
        assert!(!prompt.contains("lorem"));
    }

    #[test]
    fn parses_object_and_bare_array_replies() {
        let reply = parse_plan_reply(
            "<think>hmm</think>```json\n{\"done\": false, \"queries\": \
             [{\"query\": \"X adoption\", \"researchGoal\": \"rates\"}, \"Y trends\"]}\n```",
        )
        .unwrap();
        assert!(!reply.done);
        assert_eq!(reply.queries.len(), 2);
        assert_eq!(reply.queries[0].research_goal.as_deref(), Some("rates"));
        assert_eq!(reply.queries[1].query, "Y trends");

        let bare = parse_plan_reply("[\"a\", \"b\"]").unwrap();
        assert_eq!(bare.queries.len(), 2);

        let done = parse_plan_reply("{\"done\": true}").unwrap();
        assert!(done.done);
    }

    #[test]
    fn malformed_replies_are_rejected() {
        assert!(matches!(
            parse_plan_reply("I think you should search for X"),
            Err(PlannerError::Malformed(_))
        ));
        assert!(matches!(
            parse_plan_reply("{\"queries\": \"X\"}"),
            Err(PlannerError::Malformed(_))
        ));
        assert!(matches!(
            parse_plan_reply("[{\"title\": 3}]"),
            Err(PlannerError::Malformed(_))
        ));
    }

    #[test]
    fn validation_drops_duplicates_and_caps_breadth() {
        let mut state = state();
        let issued = ResearchQuery::child(&state.original_query, "X adoption", 1);
        state.record_issued(std::slice::from_ref(&issued));

        let proposed = ["x ADOPTION ", "Y trends", "y trends", "", "Z effects", "W costs"]
            .into_iter()
            .map(|q| ProposedQuery {
                query: q.to_string(),
                research_goal: None,
            })
            .collect();
        let batch = validate_batch(&state, proposed);

        let texts: Vec<&str> = batch.accepted.iter().map(|q| q.text.as_str()).collect();
        assert_eq!(texts, ["Y trends", "Z effects", "W costs"]);
        assert_eq!(batch.duplicates, ["x ADOPTION", "y trends"]);
        assert_eq!(batch.blank, 1);
        assert!(batch.accepted.iter().all(|q| q.depth == 1));
        assert!(
            batch
                .accepted
                .iter()
                .all(|q| q.parent_id.as_deref() == Some(state.original_query.id.as_str()))
        );
    }

    #[tokio::test]
    async fn all_duplicate_batch_stops() {
        let mut state = state();
        let issued = ResearchQuery::child(&state.original_query, "X adoption", 1);
        state.record_issued(&[issued]);

        let decision = planner("{\"queries\": [\"X Adoption\"]}").plan(&state).await;
        assert_eq!(decision, PlanDecision::Stop(StopReason::NoNovelQueries));
    }

    #[tokio::test]
    async fn all_blank_batch_falls_back_to_stop() {
        let decision = planner("{\"queries\": [\"\", \"   \"]}").plan(&state()).await;
        assert_eq!(decision, PlanDecision::Stop(StopReason::PlannerFallback));
    }

    #[tokio::test]
    async fn malformed_output_falls_back_to_stop() {
        let decision = planner("no json here").plan(&state()).await;
        assert_eq!(decision, PlanDecision::Stop(StopReason::PlannerFallback));

        let failing = QueryPlanner::new(Arc::new(Reply(Err(LlmError::Timeout))), 512);
        assert_eq!(
            failing.plan(&state()).await,
            PlanDecision::Stop(StopReason::PlannerFallback)
        );
    }

    #[tokio::test]
    async fn done_signal_stops() {
        let decision = planner("{\"done\": true, \"queries\": []}").plan(&state()).await;
        assert_eq!(decision, PlanDecision::Stop(StopReason::PlannerDone));
    }

    #[test]
    fn stop_conditions_precede_model_call() {
        let planner = planner("[]");
        let mut state = state();
        assert_eq!(planner.should_stop(&state), None);

        state.current_depth = 1;
        assert_eq!(planner.should_stop(&state), Some(StopReason::NoLearnings));

        state.current_depth = 2;
        assert_eq!(planner.should_stop(&state), Some(StopReason::MaxDepthReached));

        let mut exhausted = self::state();
        exhausted.remaining_breadth_budget = 0;
        assert_eq!(
            planner.should_stop(&exhausted),
            Some(StopReason::BreadthBudgetExhausted)
        );
    }

    #[tokio::test]
    async fn clarifying_questions_are_deduplicated_and_capped() {
        let planner = planner(
            "{\"questions\": [\"Which region?\", \"which region?\", \"Since when?\", \"Why?\"]}",
        );
        let questions = planner.clarifying_questions("impact of X", 2).await.unwrap();
        assert_eq!(questions, ["Which region?", "Since when?"]);
    }
}
