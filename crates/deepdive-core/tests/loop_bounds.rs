mod common;

use std::sync::Arc;

use common::{FakeFetcher, ScriptedLlm, orchestrator, request, slug_backend, slug_url};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde_json::json;

const WORDS: &[&str] = &[
    "lithium", "cobalt", "nickel", "graphite", "tariffs", "recycling", "mining", "demand",
];

/// A planner reply: usually a batch of two-word queries, sometimes `done`,
/// an empty batch or garbage.
fn random_plan(rng: &mut StdRng) -> String {
    match rng.gen_range(0..10) {
        0 => "the plan is to keep digging".to_string(),
        1 => json!({"done": true, "queries": []}).to_string(),
        _ => {
            let count = rng.gen_range(0..=4);
            let queries: Vec<String> = (0..count)
                .map(|_| {
                    let picked: Vec<&str> = WORDS.choose_multiple(&mut *rng, 2).copied().collect();
                    picked.join(" ")
                })
                .collect();
            json!({"done": false, "queries": queries}).to_string()
        }
    }
}

#[tokio::test]
async fn random_planner_output_respects_session_limits() {
    for seed in 0..24u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let max_depth = rng.gen_range(1..=3u32);
        let max_breadth = rng.gen_range(1..=3usize);
        let plans: Vec<String> = (0..6).map(|_| random_plan(&mut rng)).collect();

        let citations: Vec<String> = WORDS
            .iter()
            .map(|w| slug_url(&format!("{w} {w}")))
            .chain(["https://never-fetched.example".to_string()])
            .collect();
        let synthesis = json!({
            "summary": "random",
            "findings": [{"text": "claim", "learnings": [1, 99], "citations": citations}]
        })
        .to_string();

        let backend = Arc::new(slug_backend());
        let llm = Arc::new(ScriptedLlm::new(plans, synthesis));
        let orchestrator = orchestrator(backend.clone(), Arc::new(FakeFetcher::echo()), llm);

        let outcome = orchestrator
            .run(&request("battery metals", max_depth, max_breadth))
            .await
            .unwrap_or_else(|err| panic!("seed {seed}: {err}"));
        let stats = &outcome.stats;

        assert!(stats.rounds <= max_depth, "seed {seed}: {stats:?}");
        assert!(stats.deepest_query <= max_depth, "seed {seed}: {stats:?}");
        assert!(
            stats.sub_queries_issued <= max_depth as usize * max_breadth,
            "seed {seed}: {stats:?}"
        );
        assert_eq!(backend.queries().len(), stats.sub_queries_issued, "seed {seed}");

        for learning in &outcome.learnings {
            assert!(!learning.supporting_urls.is_empty());
            for url in &learning.supporting_urls {
                assert!(outcome.visited_urls.contains(url), "seed {seed}: {url}");
            }
        }
        for citation in &outcome.report.citations {
            assert!(outcome.visited_urls.contains(&citation.url), "seed {seed}");
        }
        if outcome.learnings.is_empty() {
            assert!(outcome.report.findings.is_empty(), "seed {seed}");
        }
    }
}
