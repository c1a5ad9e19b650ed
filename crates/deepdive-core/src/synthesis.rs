//! Final report generation.
//!
//! The model drafts a summary and findings; every learning reference and
//! citation it returns is checked against the knowledge store. A finding
//! must rest on at least one stored learning and may only cite URLs that
//! support those learnings.

use std::collections::{BTreeMap, BTreeSet};

use serde::Deserialize;
use serde_json::Value;

use crate::error::SynthesisError;
use crate::knowledge::KnowledgeStore;
use crate::llm::{DynLanguageModel, extract_json, strip_thinking_tokens};
use crate::model::{Citation, Finding, LearningId, ReportMode, ResearchReport};
use crate::orchestrator::ResearchState;

#[derive(Debug, Deserialize)]
struct DraftReport {
    #[serde(default)]
    summary: String,
    #[serde(default)]
    findings: Vec<DraftFinding>,
}

#[derive(Debug, Deserialize)]
struct DraftFinding {
    #[serde(default)]
    text: String,
    #[serde(default)]
    learnings: Vec<Value>,
    #[serde(default)]
    citations: Vec<Value>,
}

/// A finding after referential checks, before citation numbering.
struct CheckedFinding {
    text: String,
    learning_ids: Vec<LearningId>,
    urls: BTreeSet<String>,
}

pub struct SynthesisEngine {
    llm: DynLanguageModel,
    max_tokens: u32,
}

impl SynthesisEngine {
    pub fn new(llm: DynLanguageModel, max_tokens: u32) -> Self {
        Self { llm, max_tokens }
    }

    /// Produce the report for a finished session. Fails only when the model
    /// cannot be reached; malformed output degrades to one finding per
    /// learning.
    #[tracing::instrument(name = "synthesis", skip(self, state), fields(learnings = state.knowledge.len()))]
    pub async fn synthesize(
        &self,
        state: &ResearchState,
        mode: ReportMode,
    ) -> Result<ResearchReport, SynthesisError> {
        let query = state.original_query.text.as_str();
        let knowledge = &state.knowledge;
        let numbered: Vec<LearningId> = knowledge.learnings().map(|l| l.id).collect();

        let prompt = build_prompt(query, knowledge, mode);
        let raw = self.llm.complete(&prompt, self.max_tokens).await?;

        let (summary, checked) = match extract_json(&raw)
            .and_then(|value| serde_json::from_value::<DraftReport>(value).ok())
            .filter(|draft| !draft.summary.trim().is_empty())
        {
            Some(draft) => {
                let findings = draft
                    .findings
                    .into_iter()
                    .filter_map(|finding| check_finding(finding, &numbered, knowledge))
                    .collect();
                (draft.summary.trim().to_string(), findings)
            }
            None => {
                tracing::warn!("synthesis output was not structured; using one finding per learning");
                (strip_thinking_tokens(&raw), fallback_findings(knowledge))
            }
        };

        // Nothing was learned, so nothing can be cited.
        let checked = if knowledge.is_empty() { Vec::new() } else { checked };
        let (findings, citations) = number_citations(checked, knowledge);

        Ok(ResearchReport {
            query: query.to_string(),
            mode,
            summary,
            findings,
            citations,
        })
    }
}

fn build_prompt(query: &str, knowledge: &KnowledgeStore, mode: ReportMode) -> String {
    let task = match mode {
        ReportMode::Report => {
            "Write a detailed summary answering the query, then list the key findings. \
             Each finding must reference the learnings it is based on and cite their source URLs."
        }
        ReportMode::Answer => {
            "Write the most concise, exact answer to the query as the summary, without \
             elaboration, then list the findings that support it with their source URLs."
        }
    };

    let mut prompt = format!("{task}\n\n<query>{query}</query>\n\n");
    if knowledge.is_empty() {
        prompt.push_str(
            "No learnings were gathered. Explain briefly that the research found no usable \
             sources and return an empty findings list.\n",
        );
    } else {
        prompt.push_str("<learnings>\n");
        for (idx, learning) in knowledge.learnings().enumerate() {
            let sources: Vec<&str> = learning.supporting_urls.iter().map(String::as_str).collect();
            prompt.push_str(&format!(
                "[{}] {}\n    sources: {}\n",
                idx + 1,
                learning.text,
                sources.join(", ")
            ));
        }
        prompt.push_str("</learnings>\n");
    }
    prompt.push_str(
        "\nOnly cite URLs listed above. Respond with JSON only: {\"summary\": \"...\", \
         \"findings\": [{\"text\": \"...\", \"learnings\": [1], \"citations\": [\"https://...\"]}]}",
    );
    prompt
}

fn as_index(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|n| usize::try_from(n).ok()),
        Value::String(s) => s.trim().trim_matches(['[', ']']).parse().ok(),
        _ => None,
    }
}

fn check_finding(
    finding: DraftFinding,
    numbered: &[LearningId],
    knowledge: &KnowledgeStore,
) -> Option<CheckedFinding> {
    let text = finding.text.trim().to_string();
    if text.is_empty() {
        return None;
    }

    let mut learning_ids = Vec::new();
    for reference in &finding.learnings {
        let Some(id) = as_index(reference)
            .and_then(|n| n.checked_sub(1))
            .and_then(|idx| numbered.get(idx))
        else {
            tracing::debug!(reference = %reference, "dropped unknown learning reference");
            continue;
        };
        if !learning_ids.contains(id) {
            learning_ids.push(*id);
        }
    }

    let cited: Vec<&str> = finding
        .citations
        .iter()
        .filter_map(Value::as_str)
        .map(str::trim)
        .collect();

    // A finding without explicit references is tied to the learnings its
    // citations support.
    if learning_ids.is_empty() {
        learning_ids = knowledge
            .learnings()
            .filter(|learning| cited.iter().any(|url| learning.supporting_urls.contains(*url)))
            .map(|learning| learning.id)
            .collect();
    }
    if learning_ids.is_empty() {
        tracing::debug!(finding = %text, "dropped finding not backed by any learning");
        return None;
    }

    let supporting: BTreeSet<String> = learning_ids
        .iter()
        .filter_map(|id| knowledge.learning(*id))
        .flat_map(|learning| learning.supporting_urls.iter().cloned())
        .collect();
    let mut urls = BTreeSet::new();
    for url in cited {
        if supporting.contains(url) {
            urls.insert(url.to_string());
        } else {
            tracing::warn!(
                url = %url,
                "dropped citation that supports none of the finding's learnings"
            );
        }
    }
    if urls.is_empty() {
        urls = supporting;
    }
    if urls.is_empty() {
        tracing::debug!(finding = %text, "dropped finding without a verifiable citation");
        return None;
    }

    Some(CheckedFinding {
        text,
        learning_ids,
        urls,
    })
}

fn fallback_findings(knowledge: &KnowledgeStore) -> Vec<CheckedFinding> {
    knowledge
        .learnings()
        .map(|learning| CheckedFinding {
            text: learning.text.clone(),
            learning_ids: vec![learning.id],
            urls: learning.supporting_urls.clone(),
        })
        .collect()
}

/// Number cited URLs by visit order and rewrite findings to those numbers.
fn number_citations(
    checked: Vec<CheckedFinding>,
    knowledge: &KnowledgeStore,
) -> (Vec<Finding>, Vec<Citation>) {
    let cited: BTreeMap<usize, &str> = checked
        .iter()
        .flat_map(|finding| finding.urls.iter())
        .filter_map(|url| knowledge.visit_position(url).map(|pos| (pos, url.as_str())))
        .collect();

    let citations: Vec<Citation> = cited
        .values()
        .enumerate()
        .map(|(idx, url)| Citation {
            index: idx + 1,
            url: url.to_string(),
            title: knowledge.title(url).map(str::to_string),
        })
        .collect();

    let index_of = |url: &str| citations.iter().find(|c| c.url == url).map(|c| c.index);
    let findings = checked
        .into_iter()
        .map(|finding| {
            let mut indexes: Vec<usize> = finding.urls.iter().filter_map(|u| index_of(u)).collect();
            indexes.sort_unstable();
            Finding {
                text: finding.text,
                learning_ids: finding.learning_ids,
                citations: indexes,
            }
        })
        .collect();

    (findings, citations)
}
