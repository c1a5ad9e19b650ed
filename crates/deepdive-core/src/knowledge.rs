//! Session-scoped accumulator of learnings, visited URLs and page titles.
//!
//! Two synchronized views back the store: learnings keyed by insertion id
//! (membership and order) and a score-ordered index used for eviction. The
//! lowest score is evicted first; equal scores evict the earliest insert.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use thiserror::Error;

use crate::model::{Learning, LearningId};

const CHARS_PER_TOKEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    #[error("learning {id} cites unvisited url {url}")]
    UnvisitedSupport { id: LearningId, url: String },
    #[error("estimated size {size} exceeds budget {budget}")]
    OverBudget { size: usize, budget: usize },
    #[error("score index holds {indexed} entries for {stored} learnings")]
    IndexDrift { indexed: usize, stored: usize },
}

#[derive(Debug, Clone, Copy)]
struct ScoreKey {
    score: f32,
    id: LearningId,
}

impl PartialEq for ScoreKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoreKey {}

impl PartialOrd for ScoreKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScoreKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.score
            .total_cmp(&other.score)
            .then(self.id.cmp(&other.id))
    }
}

/// Result of inserting one learning.
#[derive(Debug, Clone, PartialEq)]
pub struct Insertion {
    pub id: LearningId,
    /// Learnings removed to get back under budget, in eviction order.
    pub evicted: Vec<Learning>,
}

impl Insertion {
    /// Whether the inserted learning survived its own eviction pass.
    pub fn retained(&self) -> bool {
        self.evicted.iter().all(|learning| learning.id != self.id)
    }
}

#[derive(Debug, Clone)]
pub struct KnowledgeStore {
    token_budget: usize,
    next_id: LearningId,
    learnings: BTreeMap<LearningId, Learning>,
    by_score: BTreeSet<ScoreKey>,
    token_size: usize,
    visited: Vec<String>,
    visited_set: HashSet<String>,
    titles: HashMap<String, String>,
    evicted_total: usize,
}

fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

impl KnowledgeStore {
    pub fn new(token_budget: usize) -> Self {
        Self {
            token_budget,
            next_id: 1,
            learnings: BTreeMap::new(),
            by_score: BTreeSet::new(),
            token_size: 0,
            visited: Vec::new(),
            visited_set: HashSet::new(),
            titles: HashMap::new(),
            evicted_total: 0,
        }
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    /// Insert a learning, assigning its id and marking its URLs visited,
    /// then evict until the size estimate fits the budget again.
    pub fn add_learning(&mut self, mut learning: Learning) -> Insertion {
        let id = self.next_id;
        self.next_id += 1;
        learning.id = id;

        for url in &learning.supporting_urls {
            self.record_visit(url);
        }
        self.token_size += estimate_tokens(&learning.text);
        self.by_score.insert(ScoreKey {
            score: learning.relevance_score,
            id,
        });
        self.learnings.insert(id, learning);

        let mut evicted = Vec::new();
        while self.token_size > self.token_budget {
            let Some(lowest) = self.by_score.pop_first() else {
                break;
            };
            if let Some(removed) = self.learnings.remove(&lowest.id) {
                self.token_size -= estimate_tokens(&removed.text);
                tracing::debug!(
                    learning_id = removed.id,
                    score = removed.relevance_score,
                    "evicted learning over token budget"
                );
                evicted.push(removed);
            }
        }
        self.evicted_total += evicted.len();

        Insertion { id, evicted }
    }

    /// Attach another supporting URL to an existing learning. Returns false
    /// when the learning is no longer stored.
    pub fn merge_supporting_url(&mut self, id: LearningId, url: &str) -> bool {
        if !self.learnings.contains_key(&id) {
            return false;
        }
        self.record_visit(url);
        if let Some(learning) = self.learnings.get_mut(&id) {
            learning.supporting_urls.insert(url.to_string());
        }
        true
    }

    /// Mark a URL visited. Visit order is kept for citation numbering.
    pub fn record_visit(&mut self, url: &str) {
        if self.visited_set.insert(url.to_string()) {
            self.visited.push(url.to_string());
        }
    }

    pub fn record_title(&mut self, url: &str, title: &str) {
        let title = title.trim();
        if !title.is_empty() {
            self.titles
                .entry(url.to_string())
                .or_insert_with(|| title.to_string());
        }
    }

    pub fn title(&self, url: &str) -> Option<&str> {
        self.titles.get(url).map(String::as_str)
    }

    /// Visited URLs in first-visit order.
    pub fn visited_urls(&self) -> &[String] {
        &self.visited
    }

    pub fn has_visited(&self, url: &str) -> bool {
        self.visited_set.contains(url)
    }

    /// 0-based position of a URL in visit order.
    pub fn visit_position(&self, url: &str) -> Option<usize> {
        self.visited.iter().position(|visited| visited == url)
    }

    /// Stored learnings in insertion order.
    pub fn learnings(&self) -> impl Iterator<Item = &Learning> {
        self.learnings.values()
    }

    pub fn learning(&self, id: LearningId) -> Option<&Learning> {
        self.learnings.get(&id)
    }

    pub fn len(&self) -> usize {
        self.learnings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.learnings.is_empty()
    }

    pub fn estimated_token_size(&self) -> usize {
        self.token_size
    }

    pub fn evicted_total(&self) -> usize {
        self.evicted_total
    }

    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        if self.by_score.len() != self.learnings.len() {
            return Err(InvariantViolation::IndexDrift {
                indexed: self.by_score.len(),
                stored: self.learnings.len(),
            });
        }
        if self.token_size > self.token_budget {
            return Err(InvariantViolation::OverBudget {
                size: self.token_size,
                budget: self.token_budget,
            });
        }
        for learning in self.learnings.values() {
            if let Some(url) = learning
                .supporting_urls
                .iter()
                .find(|url| !self.visited_set.contains(*url))
            {
                return Err(InvariantViolation::UnvisitedSupport {
                    id: learning.id,
                    url: url.clone(),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExtractedPassage;

    fn learning(url: &str, text: &str, score: f32) -> Learning {
        Learning::from_passage(&ExtractedPassage::new(url, text), score)
    }

    #[test]
    fn insertion_assigns_ids_and_visits_urls() {
        let mut store = KnowledgeStore::new(1_000);
        let first = store.add_learning(learning("https://a.example", "alpha beta", 0.4));
        let second = store.add_learning(learning("https://b.example", "gamma delta", 0.9));

        assert_eq!((first.id, second.id), (1, 2));
        assert!(first.retained());
        assert_eq!(
            store.visited_urls(),
            ["https://a.example".to_string(), "https://b.example".to_string()]
        );
        let texts: Vec<&str> = store.learnings().map(|l| l.text.as_str()).collect();
        assert_eq!(texts, ["alpha beta", "gamma delta"]);
        assert_eq!(store.estimated_token_size(), 3 + 3);
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn evicts_lowest_score_first() {
        // Each 8-char text costs 2 tokens; budget fits three.
        let mut store = KnowledgeStore::new(6);
        store.add_learning(learning("https://a.example", "aaaaaaaa", 0.5));
        store.add_learning(learning("https://b.example", "bbbbbbbb", 0.2));
        store.add_learning(learning("https://c.example", "cccccccc", 0.9));
        let insertion = store.add_learning(learning("https://d.example", "dddddddd", 0.7));

        assert_eq!(insertion.evicted.len(), 1);
        assert_eq!(insertion.evicted[0].text, "bbbbbbbb");
        assert_eq!(store.len(), 3);
        assert_eq!(store.evicted_total(), 1);
        // Evicted learnings keep their URL in the visited history.
        assert!(store.has_visited("https://b.example"));
        assert!(store.check_invariants().is_ok());
    }

    #[test]
    fn equal_scores_evict_earliest_insert() {
        let mut store = KnowledgeStore::new(4);
        store.add_learning(learning("https://a.example", "aaaaaaaa", 0.5));
        store.add_learning(learning("https://b.example", "bbbbbbbb", 0.5));
        let insertion = store.add_learning(learning("https://c.example", "cccccccc", 0.5));

        let evicted: Vec<&str> = insertion.evicted.iter().map(|l| l.text.as_str()).collect();
        assert_eq!(evicted, ["aaaaaaaa"]);
        let kept: Vec<LearningId> = store.learnings().map(|l| l.id).collect();
        assert_eq!(kept, [2, 3]);
    }

    #[test]
    fn oversized_learning_can_evict_itself() {
        let mut store = KnowledgeStore::new(2);
        store.add_learning(learning("https://a.example", "aaaaaaaa", 0.9));
        let insertion =
            store.add_learning(learning("https://b.example", "b".repeat(40).as_str(), 0.1));
        assert!(!insertion.retained());
        assert_eq!(store.len(), 1);
        assert!(store.estimated_token_size() <= store.token_budget());
    }

    #[test]
    fn merge_adds_supporting_url() {
        let mut store = KnowledgeStore::new(100);
        let id = store.add_learning(learning("https://a.example", "fact", 0.5)).id;
        assert!(store.merge_supporting_url(id, "https://mirror.example"));
        assert!(!store.merge_supporting_url(99, "https://other.example"));

        let merged = store.learning(id).expect("stored");
        assert_eq!(merged.supporting_urls.len(), 2);
        assert_eq!(store.visit_position("https://mirror.example"), Some(1));
        assert!(!store.has_visited("https://other.example"));
    }

    #[test]
    fn titles_keep_first_non_empty_value() {
        let mut store = KnowledgeStore::new(100);
        store.record_title("https://a.example", "  ");
        store.record_title("https://a.example", "First");
        store.record_title("https://a.example", "Second");
        assert_eq!(store.title("https://a.example"), Some("First"));
    }
}
