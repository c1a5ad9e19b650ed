//! Relevance scoring and near-duplicate detection for extracted passages.
//!
//! Score = `lexical_weight * lexical + llm_weight * judge` when the model
//! judge is enabled and answers; otherwise the lexical overlap alone.

use std::collections::HashSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;

use crate::config::FilterConfig;
use crate::fetch::extract::normalize_text;
use crate::llm::{DynLanguageModel, strip_thinking_tokens};
use crate::model::{ExtractedPassage, Learning, LearningId};

const SHINGLE_WIDTH: usize = 3;
const JUDGE_MAX_TOKENS: u32 = 8;
const JUDGE_PASSAGE_CHARS: usize = 1_500;
const CONDENSE_MAX_TOKENS: u32 = 160;
const GIST_MAX_CHARS: usize = 400;

const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "also", "an", "and", "any", "are", "as", "at", "be", "been",
    "but", "by", "can", "did", "do", "does", "for", "from", "had", "has", "have", "how", "if",
    "in", "into", "is", "it", "its", "more", "most", "not", "of", "on", "or", "other", "over",
    "such", "than", "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "to", "was", "were", "what", "when", "where", "which", "who", "why", "will", "with", "would",
];

static JUDGE_SCORE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(10|[0-9])\b").expect("invalid judge regex"));

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectReason {
    DuplicateContent { of: LearningId },
    BelowRelevanceThreshold { score: f32 },
    EmptyAfterExtraction,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DuplicateContent { .. } => "duplicate_content",
            Self::BelowRelevanceThreshold { .. } => "below_relevance_threshold",
            Self::EmptyAfterExtraction => "empty_after_extraction",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum FilterVerdict {
    Accept(f32),
    Reject(RejectReason),
}

pub struct RelevanceFilter {
    config: FilterConfig,
    judge: Option<DynLanguageModel>,
    condenser: Option<DynLanguageModel>,
}

impl RelevanceFilter {
    /// The model is only consulted for what `config.llm_judge` and
    /// `config.condense` switch on.
    pub fn new(config: FilterConfig, llm: Option<DynLanguageModel>) -> Self {
        let judge = llm.clone().filter(|_| config.llm_judge);
        let condenser = llm.filter(|_| config.condense);
        Self {
            config,
            judge,
            condenser,
        }
    }

    pub fn config(&self) -> &FilterConfig {
        &self.config
    }

    /// Full verdict for one passage against the learnings gathered so far.
    pub async fn filter<'a>(
        &self,
        passage: &ExtractedPassage,
        sub_query: &str,
        existing: impl IntoIterator<Item = &'a Learning>,
    ) -> FilterVerdict {
        if passage.text.trim().is_empty() {
            return FilterVerdict::Reject(RejectReason::EmptyAfterExtraction);
        }
        if let Some(of) = self.find_duplicate(passage, existing) {
            return FilterVerdict::Reject(RejectReason::DuplicateContent { of });
        }
        self.score(passage, sub_query).await
    }

    /// Relevance half of the verdict, independent of accumulated knowledge.
    pub async fn score(&self, passage: &ExtractedPassage, sub_query: &str) -> FilterVerdict {
        if passage.text.trim().is_empty() {
            return FilterVerdict::Reject(RejectReason::EmptyAfterExtraction);
        }

        let lexical = lexical_overlap(sub_query, &passage.text);
        let score = match self.judge_relevance(passage, sub_query).await {
            Some(judged) => self.config.lexical_weight * lexical + self.config.llm_weight * judged,
            None => lexical,
        };

        if score >= self.config.min_relevance {
            FilterVerdict::Accept(score)
        } else {
            FilterVerdict::Reject(RejectReason::BelowRelevanceThreshold { score })
        }
    }

    /// Id of the first learning that matches by hash or near-duplicate text.
    pub fn find_duplicate<'a>(
        &self,
        passage: &ExtractedPassage,
        existing: impl IntoIterator<Item = &'a Learning>,
    ) -> Option<LearningId> {
        let shingles = shingles(&passage.text);
        existing.into_iter().find_map(|learning| {
            let duplicate = learning.content_hash == passage.content_hash
                || jaccard(&shingles, &self::shingles(&learning.text))
                    >= self.config.similarity_threshold;
            duplicate.then_some(learning.id)
        })
    }

    /// Short restatement of the passage's facts that bear on `sub_query`.
    /// `None` when condensing is off or the model gives nothing usable.
    pub async fn condense(&self, passage: &ExtractedPassage, sub_query: &str) -> Option<String> {
        let model = self.condenser.as_ref()?;
        let excerpt: String = passage.text.chars().take(JUDGE_PASSAGE_CHARS).collect();
        let prompt = format!(
            "Condense the passage into at most two sentences of concrete facts that bear on the \
             search query. Keep names and figures. Reply with the sentences only.\n\n\
             <query>{sub_query}</query>\n<passage>{excerpt}</passage>"
        );
        match model.complete(&prompt, CONDENSE_MAX_TOKENS).await {
            Ok(reply) => {
                let gist = strip_thinking_tokens(&reply)
                    .split_whitespace()
                    .collect::<Vec<_>>()
                    .join(" ");
                (!gist.is_empty()).then(|| gist.chars().take(GIST_MAX_CHARS).collect())
            }
            Err(err) => {
                tracing::debug!(error = %err, "condensing unavailable; keeping raw excerpt");
                None
            }
        }
    }

    async fn judge_relevance(&self, passage: &ExtractedPassage, sub_query: &str) -> Option<f32> {
        let judge = self.judge.as_ref()?;
        let excerpt: String = passage.text.chars().take(JUDGE_PASSAGE_CHARS).collect();
        let prompt = format!(
            "Rate how relevant the passage is to the search query on a scale from 0 (unrelated) \
             to 10 (directly answers it). Reply with a single integer only.\n\n\
             <query>{sub_query}</query>\n<passage>{excerpt}</passage>"
        );
        match judge.complete(&prompt, JUDGE_MAX_TOKENS).await {
            Ok(reply) => {
                let reply = strip_thinking_tokens(&reply);
                let parsed = JUDGE_SCORE
                    .captures(&reply)
                    .and_then(|caps| caps[1].parse::<u8>().ok())
                    .map(|value| f32::from(value) / 10.0);
                if parsed.is_none() {
                    tracing::debug!(reply = %reply, "unparseable relevance judgment ignored");
                }
                parsed
            }
            Err(err) => {
                tracing::debug!(error = %err, "relevance judge unavailable; lexical score only");
                None
            }
        }
    }
}

/// Lower-cased alphanumeric terms of at least two characters, minus stop words.
pub fn content_terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| token.chars().count() >= 2)
        .map(str::to_lowercase)
        .filter(|token| !STOP_WORDS.contains(&token.as_str()))
        .collect()
}

/// Fraction of the query's content terms present in the text. A query with
/// no content terms imposes no lexical constraint.
pub fn lexical_overlap(query: &str, text: &str) -> f32 {
    let query_terms = content_terms(query);
    if query_terms.is_empty() {
        return 1.0;
    }
    let text_terms = content_terms(text);
    let hits = query_terms
        .iter()
        .filter(|term| text_terms.contains(*term))
        .count();
    hits as f32 / query_terms.len() as f32
}

fn shingles(text: &str) -> HashSet<String> {
    let normalized = normalize_text(text);
    let words: Vec<&str> = normalized.split(' ').filter(|w| !w.is_empty()).collect();
    if words.len() < SHINGLE_WIDTH {
        return std::iter::once(words.join(" ")).collect();
    }
    words
        .windows(SHINGLE_WIDTH)
        .map(|window| window.join(" "))
        .collect()
}

fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f32 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f32 / union as f32
}

/// Word 3-shingle Jaccard similarity of two texts after normalization.
pub fn similarity(a: &str, b: &str) -> f32 {
    jaccard(&shingles(a), &shingles(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LlmError;
    use crate::llm::LanguageModel;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::sync::Arc;

    struct FixedJudge(Result<String, LlmError>);

    #[async_trait]
    impl LanguageModel for FixedJudge {
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> Result<String, LlmError> {
            self.0.clone()
        }
    }

    fn learning(id: LearningId, text: &str) -> Learning {
        let passage = ExtractedPassage::new("https://known.example", text);
        Learning {
            id,
            text: passage.text,
            content_hash: passage.content_hash,
            supporting_urls: BTreeSet::from(["https://known.example".to_string()]),
            relevance_score: 0.5,
            gist: None,
        }
    }

    #[test]
    fn lexical_overlap_ignores_stop_words_and_case() {
        let score = lexical_overlap("The impact of Tariffs on Steel", "steel tariffs rose");
        assert!((score - 2.0 / 3.0).abs() < 1e-6);
        assert_eq!(lexical_overlap("the of", "anything"), 1.0);
    }

    #[test]
    fn similarity_detects_near_duplicates() {
        let a = "Lithium demand grew by forty percent in 2023 across all regions";
        let b = "lithium  DEMAND grew by forty percent in 2023 across all regions worldwide";
        assert!(similarity(a, b) > 0.8);
        assert!(similarity(a, "Copper prices were flat for the year overall") < 0.1);
    }

    #[tokio::test]
    async fn identical_normalized_text_is_duplicate() {
        let filter = RelevanceFilter::new(FilterConfig::default(), None);
        let existing = vec![learning(7, "Steel tariffs raised prices")];
        let passage =
            ExtractedPassage::new("https://other.example", "steel   TARIFFS raised prices");
        let verdict = filter.filter(&passage, "steel tariffs", &existing).await;
        assert_eq!(
            verdict,
            FilterVerdict::Reject(RejectReason::DuplicateContent { of: 7 })
        );
    }

    #[tokio::test]
    async fn empty_and_irrelevant_passages_are_rejected() {
        let filter = RelevanceFilter::new(FilterConfig::default(), None);
        let empty = ExtractedPassage::new("https://e.example", "   ");
        let none: Vec<Learning> = Vec::new();
        assert_eq!(
            filter.filter(&empty, "steel", &none).await,
            FilterVerdict::Reject(RejectReason::EmptyAfterExtraction)
        );

        let unrelated = ExtractedPassage::new("https://u.example", "Recipes for banana bread");
        assert!(matches!(
            filter.filter(&unrelated, "steel tariffs", &none).await,
            FilterVerdict::Reject(RejectReason::BelowRelevanceThreshold { .. })
        ));
    }

    #[tokio::test]
    async fn judge_is_weighted_into_score() {
        let config = FilterConfig {
            llm_judge: true,
            ..FilterConfig::default()
        };
        let judge: DynLanguageModel = Arc::new(FixedJudge(Ok("<think>hm</think> 5".into())));
        let filter = RelevanceFilter::new(config, Some(judge));
        let passage = ExtractedPassage::new("https://a.example", "steel tariffs in 2024");
        match filter.score(&passage, "steel tariffs").await {
            FilterVerdict::Accept(score) => assert!((score - (0.6 + 0.4 * 0.5)).abs() < 1e-6),
            other => panic!("expected accept, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_judge_falls_back_to_lexical() {
        let config = FilterConfig {
            llm_judge: true,
            ..FilterConfig::default()
        };
        let judge: DynLanguageModel = Arc::new(FixedJudge(Err(LlmError::Timeout)));
        let filter = RelevanceFilter::new(config, Some(judge));
        let passage = ExtractedPassage::new("https://a.example", "steel output");
        assert_eq!(
            filter.score(&passage, "steel tariffs").await,
            FilterVerdict::Accept(0.5)
        );
    }

    #[tokio::test]
    async fn condensing_is_opt_in() {
        let model: DynLanguageModel = Arc::new(FixedJudge(Ok(
            "<think>short</think>\n Steel tariffs rose\n to 25% in 2024. ".into(),
        )));
        let passage = ExtractedPassage::new("https://a.example", "long text about steel tariffs");

        let off = RelevanceFilter::new(FilterConfig::default(), Some(model.clone()));
        assert_eq!(off.condense(&passage, "steel tariffs").await, None);

        let config = FilterConfig {
            condense: true,
            ..FilterConfig::default()
        };
        let on = RelevanceFilter::new(config, Some(model));
        assert_eq!(
            on.condense(&passage, "steel tariffs").await.as_deref(),
            Some("Steel tariffs rose to 25% in 2024.")
        );
    }

    #[tokio::test]
    async fn blank_or_failed_condensing_yields_nothing() {
        let config = FilterConfig {
            condense: true,
            ..FilterConfig::default()
        };
        let passage = ExtractedPassage::new("https://a.example", "steel output");
        for reply in [Ok("<think>nothing</think>  ".to_string()), Err(LlmError::Timeout)] {
            let filter = RelevanceFilter::new(config.clone(), Some(Arc::new(FixedJudge(reply))));
            assert_eq!(filter.condense(&passage, "steel").await, None);
        }
    }
}
