//! Data carried through a research session: queries, raw search hits,
//! extracted passages, accumulated learnings and the final report.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type QueryId = String;

/// A query issued during a session. The root query has depth 0 and no parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResearchQuery {
    pub id: QueryId,
    pub text: String,
    pub parent_id: Option<QueryId>,
    pub depth: u32,
    /// What the planner expects this query to uncover.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research_goal: Option<String>,
}

impl ResearchQuery {
    pub fn root(text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            parent_id: None,
            depth: 0,
            research_goal: None,
        }
    }

    pub fn child(parent: &ResearchQuery, text: impl Into<String>, depth: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            text: text.into(),
            parent_id: Some(parent.id.clone()),
            depth,
            research_goal: None,
        }
    }

    pub fn with_goal(mut self, goal: impl Into<String>) -> Self {
        let goal = goal.into();
        if !goal.trim().is_empty() {
            self.research_goal = Some(goal);
        }
        self
    }
}

/// One hit returned by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchResult {
    pub query_id: QueryId,
    pub source_engine: String,
    pub url: String,
    pub title: String,
    pub raw_snippet: String,
    pub rank: usize,
}

/// Clean text reduced from one fetched page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractedPassage {
    pub source_url: String,
    pub text: String,
    pub fetched_at: DateTime<Utc>,
    pub content_hash: String,
}

pub type LearningId = u64;

/// Deduplicated, scored unit of accumulated knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Learning {
    /// Insertion sequence inside the owning store; assigned on insert.
    pub id: LearningId,
    pub text: String,
    pub content_hash: String,
    pub supporting_urls: BTreeSet<String>,
    pub relevance_score: f32,
    /// Model-condensed restatement, present when condensing is enabled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gist: Option<String>,
}

impl Learning {
    pub fn from_passage(passage: &ExtractedPassage, relevance_score: f32) -> Self {
        Self {
            id: 0,
            text: passage.text.clone(),
            content_hash: passage.content_hash.clone(),
            supporting_urls: BTreeSet::from([passage.source_url.clone()]),
            relevance_score,
            gist: None,
        }
    }

    pub fn with_gist(mut self, gist: Option<String>) -> Self {
        self.gist = gist;
        self
    }
}

/// Output style requested for the final report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportMode {
    /// Detailed summary plus key findings.
    #[default]
    Report,
    /// Short, exact answer to the query.
    Answer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub text: String,
    pub learning_ids: Vec<LearningId>,
    /// 1-based indexes into `ResearchReport::citations`.
    pub citations: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Citation {
    pub index: usize,
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchReport {
    pub query: String,
    pub mode: ReportMode,
    pub summary: String,
    pub findings: Vec<Finding>,
    pub citations: Vec<Citation>,
}

impl ResearchReport {
    pub fn citation(&self, index: usize) -> Option<&Citation> {
        self.citations.iter().find(|c| c.index == index)
    }

    /// Render as Markdown: summary, numbered findings with `[n]` markers,
    /// then the ordered source list.
    pub fn to_markdown(&self) -> String {
        let mut out = String::new();
        let heading = match self.mode {
            ReportMode::Report => "Summary",
            ReportMode::Answer => "Answer",
        };
        out.push_str(&format!("## {heading}\n\n{}\n", self.summary.trim()));

        out.push_str("\n## Key Findings\n\n");
        if self.findings.is_empty() {
            out.push_str("(no findings)\n");
        }
        for (idx, finding) in self.findings.iter().enumerate() {
            let markers: String = finding
                .citations
                .iter()
                .map(|c| format!("[{c}]"))
                .collect();
            out.push_str(&format!("{}. {} {}\n", idx + 1, finding.text.trim(), markers));
        }

        out.push_str("\n## Sources\n\n");
        if self.citations.is_empty() {
            out.push_str("(none recorded)\n");
        }
        for citation in &self.citations {
            match &citation.title {
                Some(title) => {
                    out.push_str(&format!("[{}] {} - {}\n", citation.index, title, citation.url))
                }
                None => out.push_str(&format!("[{}] {}\n", citation.index, citation.url)),
            }
        }
        out
    }
}
