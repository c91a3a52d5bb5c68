//! The recursive research control loop.
//!
//! [`DeepResearcher`] drives a tree of research branches. Each level asks the
//! completion service for sub-queries, searches each one, extracts learnings,
//! and recurses with halved breadth and decremented depth. One process-wide
//! semaphore gates admission for every external call in the tree — a wide
//! shallow run and a narrow deep run compete for the same budget. A permit
//! covers a single branch body (search + extraction) and is released before
//! the branch recurses, so descendants can always be admitted.
//!
//! Failure handling is strictly local: a branch that errors contributes an
//! empty result and its siblings keep running. Nothing escapes
//! [`DeepResearcher::research`].

use crate::Completer;
use crate::context::budget::PromptBudget;
use crate::error::ResearchError;
use crate::research::config::ResearcherConfig;
use crate::research::protocol::{ResearchProtocol, ResearchQuery};
use crate::search::SearchProvider;
use futures::future::{BoxFuture, join_all};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Per-subtree recursion state. Each branch owns an independent copy; no
/// state is shared across concurrent branches except the admission gate.
#[derive(Debug, Clone)]
pub struct ResearchState {
    /// The topic (or synthesized follow-up text) this subtree researches.
    pub query: String,
    /// Sibling queries to generate at this level. Halves per level, never
    /// below 1.
    pub breadth: usize,
    /// Levels remaining before forced termination.
    pub depth: usize,
    /// Learnings accumulated on the path from the root.
    pub learnings: HashSet<String>,
    /// URLs visited on the path from the root.
    pub visited_urls: HashSet<String>,
}

impl ResearchState {
    /// Root state: empty accumulators.
    pub fn root(query: impl Into<String>, breadth: usize, depth: usize) -> Self {
        Self {
            query: query.into(),
            breadth: breadth.max(1),
            depth,
            learnings: HashSet::new(),
            visited_urls: HashSet::new(),
        }
    }
}

/// The externally visible output of any subtree, including the root.
/// Learnings and URLs are deduplicated by exact text; ordering is
/// unspecified.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResearchResult {
    pub learnings: HashSet<String>,
    pub visited_urls: HashSet<String>,
}

impl ResearchResult {
    /// Union another result into this one. Set union is commutative and
    /// idempotent, so branch completion order never changes the merge.
    pub fn absorb(&mut self, other: ResearchResult) {
        self.learnings.extend(other.learnings);
        self.visited_urls.extend(other.visited_urls);
    }
}

/// The recursive research orchestrator.
///
/// Collaborators are injected: the completion service, the search service,
/// and the prompt budget all arrive by reference, so a run has no ambient
/// global state and tests drive the loop with scripted fakes.
pub struct DeepResearcher<'a> {
    protocol: ResearchProtocol<'a>,
    search: &'a dyn SearchProvider,
    limiter: Arc<Semaphore>,
    max_learnings: usize,
}

impl<'a> DeepResearcher<'a> {
    pub fn new(
        completer: &'a dyn Completer,
        search: &'a dyn SearchProvider,
        budget: &'a PromptBudget,
        config: ResearcherConfig,
    ) -> Self {
        let protocol = ResearchProtocol::new(completer, budget)
            .with_document_token_budget(config.document_token_budget)
            .with_report_token_budget(config.report_token_budget);
        Self {
            protocol,
            search,
            limiter: Arc::new(Semaphore::new(config.concurrency.max(1))),
            max_learnings: config.max_learnings,
        }
    }

    /// The protocol layer this run uses — handy for synthesizing the final
    /// report with the same budgets.
    pub fn protocol(&self) -> &ResearchProtocol<'a> {
        &self.protocol
    }

    /// Run the full research tree for `query` and return the merged result.
    ///
    /// Infallible by contract: every known failure mode degrades to fewer
    /// learnings, never to an error.
    pub async fn research(&self, query: &str, breadth: usize, depth: usize) -> ResearchResult {
        info!("starting research: breadth={breadth}, depth={depth}");
        self.explore(ResearchState::root(query, breadth, depth)).await
    }

    /// One fan-out level. Boxed because the future recurses through
    /// [`Self::branch`].
    fn explore(&self, state: ResearchState) -> BoxFuture<'_, ResearchResult> {
        Box::pin(async move {
            let queries = match self.fan_out(&state).await {
                Ok(queries) if !queries.is_empty() => queries,
                Ok(_) => {
                    debug!("no queries generated, closing subtree");
                    return ResearchResult {
                        learnings: state.learnings,
                        visited_urls: state.visited_urls,
                    };
                }
                Err(e) => {
                    warn!("query generation failed: {e}; closing subtree");
                    return ResearchResult {
                        learnings: state.learnings,
                        visited_urls: state.visited_urls,
                    };
                }
            };

            let branches = queries.into_iter().map(|query| self.branch(&state, query));
            let mut merged = ResearchResult::default();
            for result in join_all(branches).await {
                merged.absorb(result);
            }
            merged
        })
    }

    /// Generate this level's sub-queries under the admission gate.
    async fn fan_out(&self, state: &ResearchState) -> Result<Vec<ResearchQuery>, ResearchError> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|_| ResearchError::LimiterClosed)?;
        self.protocol
            .generate_queries(&state.query, state.breadth, &state.learnings)
            .await
    }

    /// One branch, with its failures absorbed so siblings keep running.
    async fn branch(&self, state: &ResearchState, query: ResearchQuery) -> ResearchResult {
        match self.branch_inner(state, &query).await {
            Ok(result) => result,
            Err(e) => {
                warn!("branch '{}' failed: {e}", query.text);
                ResearchResult::default()
            }
        }
    }

    async fn branch_inner(
        &self,
        state: &ResearchState,
        query: &ResearchQuery,
    ) -> Result<ResearchResult, ResearchError> {
        let new_breadth = (state.breadth / 2).max(1);
        let new_depth = state.depth.saturating_sub(1);

        // The permit covers this branch's external calls only. It drops at
        // the end of the block, before any recursion, so a chain of
        // ancestors can never starve its own descendants of permits.
        let (documents, batch) = {
            let _permit = self
                .limiter
                .acquire()
                .await
                .map_err(|_| ResearchError::LimiterClosed)?;

            let documents = self.search.search(&query.text).await?;
            let batch = self
                .protocol
                .extract_learnings(&query.text, &documents, self.max_learnings, new_breadth)
                .await?;
            (documents, batch)
        };

        let mut learnings = state.learnings.clone();
        learnings.extend(batch.learnings.iter().cloned());
        let mut visited_urls = state.visited_urls.clone();
        visited_urls.extend(
            documents
                .iter()
                .filter(|d| !d.url.is_empty())
                .map(|d| d.url.clone()),
        );

        if new_depth > 0 {
            debug!("researching deeper: breadth={new_breadth}, depth={new_depth}");
            let next_query = format!(
                "Previous research goal: {}\nFollow-up research directions: {}",
                query.research_goal,
                batch.follow_up_questions.join(" ")
            );
            Ok(self
                .explore(ResearchState {
                    query: next_query,
                    breadth: new_breadth,
                    depth: new_depth,
                    learnings,
                    visited_urls,
                })
                .await)
        } else {
            Ok(ResearchResult {
                learnings,
                visited_urls,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::{Document, SearchFuture};
    use crate::{Completer, CompletionFuture};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Completer whose reply is computed from the user prompt, with a call
    /// counter.
    struct ScriptedCompleter {
        script: Box<dyn Fn(&str) -> Result<String, ResearchError> + Send + Sync>,
        calls: Arc<AtomicUsize>,
    }

    impl ScriptedCompleter {
        fn new(
            script: impl Fn(&str) -> Result<String, ResearchError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                script: Box::new(script),
                calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl Completer for ScriptedCompleter {
        fn complete(&self, _system_prompt: &str, user_prompt: &str) -> CompletionFuture<'_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = (self.script)(user_prompt);
            Box::pin(async move { result })
        }
    }

    /// Search stub returning fixed documents, with a call counter and an
    /// optional per-query failure.
    struct StubSearch {
        documents: Vec<Document>,
        calls: Arc<AtomicUsize>,
        fail_on: Option<String>,
    }

    impl StubSearch {
        fn new(documents: Vec<Document>) -> Self {
            Self {
                documents,
                calls: Arc::new(AtomicUsize::new(0)),
                fail_on: None,
            }
        }

        fn failing_on(mut self, query: impl Into<String>) -> Self {
            self.fail_on = Some(query.into());
            self
        }
    }

    impl SearchProvider for StubSearch {
        fn search(&self, query: &str) -> SearchFuture<'_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let result = if self.fail_on.as_deref() == Some(query) {
                Err(ResearchError::Search("request failed: timed out".into()))
            } else {
                Ok(self.documents.clone())
            };
            Box::pin(async move { result })
        }
    }

    fn doc(url: &str) -> Document {
        Document {
            url: url.into(),
            content: format!("content of {url}"),
            title: url.into(),
        }
    }

    fn queries_json(queries: &[(&str, &str)]) -> String {
        let items: Vec<serde_json::Value> = queries
            .iter()
            .map(|(q, g)| serde_json::json!({"query": q, "research_goal": g}))
            .collect();
        serde_json::json!({"queries": items}).to_string()
    }

    fn learnings_json(learnings: &[&str], followups: &[&str]) -> String {
        serde_json::json!({"learnings": learnings, "follow_up_questions": followups}).to_string()
    }

    /// Script: top-level generation returns `roots`; deeper generation (the
    /// synthesized "Previous research goal" prompt) returns `deeper`;
    /// extraction returns one learning derived from the query text.
    fn research_script(
        roots: Vec<(String, String)>,
        deeper: Vec<(String, String)>,
    ) -> impl Fn(&str) -> Result<String, ResearchError> + Send + Sync + 'static {
        move |prompt: &str| {
            if prompt.contains("list of search queries") {
                let source = if prompt.contains("Previous research goal") {
                    &deeper
                } else {
                    &roots
                };
                let pairs: Vec<(&str, &str)> = source
                    .iter()
                    .map(|(q, g)| (q.as_str(), g.as_str()))
                    .collect();
                Ok(queries_json(&pairs))
            } else if let Some(rest) = prompt.split("<query>").nth(1) {
                let query = rest.split("</query>").next().unwrap_or("unknown");
                let learning = format!("learned-{query}");
                Ok(learnings_json(&[learning.as_str()], &["follow up?"]))
            } else {
                Ok("{}".into())
            }
        }
    }

    fn budget() -> PromptBudget {
        PromptBudget::new().expect("cl100k_base should load")
    }

    #[tokio::test]
    async fn empty_generation_returns_empty_result_without_searching() {
        let completer = ScriptedCompleter::new(|_| Ok(r#"{"queries": []}"#.into()));
        let search = StubSearch::new(vec![doc("https://a.example")]);
        let budget = budget();
        let researcher =
            DeepResearcher::new(&completer, &search, &budget, ResearcherConfig::default());

        let result = researcher.research("topic", 4, 2).await;

        assert!(result.learnings.is_empty());
        assert!(result.visited_urls.is_empty());
        assert_eq!(search.calls.load(Ordering::SeqCst), 0, "no search may run");
        assert_eq!(completer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn single_level_merges_both_branches() {
        let completer = ScriptedCompleter::new(research_script(
            vec![("q1".into(), "g1".into()), ("q2".into(), "g2".into())],
            vec![],
        ));
        let search = StubSearch::new(vec![doc("https://a.example")]);
        let budget = budget();
        let researcher =
            DeepResearcher::new(&completer, &search, &budget, ResearcherConfig::default());

        let result = researcher.research("topic", 2, 1).await;

        assert!(result.learnings.contains("learned-q1"));
        assert!(result.learnings.contains("learned-q2"));
        assert!(result.visited_urls.contains("https://a.example"));
        assert_eq!(search.calls.load(Ordering::SeqCst), 2, "one search per branch");
        // One generation call + two extraction calls, no recursion.
        assert_eq!(completer.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn depth_zero_still_processes_one_level() {
        let completer = ScriptedCompleter::new(research_script(
            vec![("q1".into(), "g1".into())],
            vec![("should-not-run".into(), "g".into())],
        ));
        let search = StubSearch::new(vec![doc("https://a.example")]);
        let budget = budget();
        let researcher =
            DeepResearcher::new(&completer, &search, &budget, ResearcherConfig::default());

        let result = researcher.research("topic", 2, 0).await;

        assert!(result.learnings.contains("learned-q1"));
        assert_eq!(search.calls.load(Ordering::SeqCst), 1);
        assert!(
            !result.learnings.contains("learned-should-not-run"),
            "depth 0 must not recurse"
        );
    }

    #[tokio::test]
    async fn recursion_halves_breadth_and_decrements_depth() {
        let completer = ScriptedCompleter::new(research_script(
            vec![("q1".into(), "g1".into()), ("q2".into(), "g2".into())],
            vec![("d1".into(), "dg".into())],
        ));
        let search = StubSearch::new(vec![doc("https://a.example")]);
        let budget = budget();
        let researcher =
            DeepResearcher::new(&completer, &search, &budget, ResearcherConfig::default());

        let result = researcher.research("topic", 2, 2).await;

        // Level 0: q1, q2. Level 1: one branch (breadth 2 -> 1) under each,
        // searching d1. Depth then hits 0 and the tree stops.
        assert_eq!(search.calls.load(Ordering::SeqCst), 4);
        assert!(result.learnings.contains("learned-q1"));
        assert!(result.learnings.contains("learned-q2"));
        assert!(result.learnings.contains("learned-d1"));
        // Generations: 1 root + 2 deeper; extractions: 4.
        assert_eq!(completer.calls.load(Ordering::SeqCst), 7);
    }

    #[tokio::test]
    async fn failed_branch_is_isolated() {
        let completer = ScriptedCompleter::new(research_script(
            vec![("q1".into(), "g1".into()), ("q2".into(), "g2".into())],
            vec![],
        ));
        let search = StubSearch::new(vec![doc("https://a.example")]).failing_on("q1");
        let budget = budget();
        let researcher =
            DeepResearcher::new(&completer, &search, &budget, ResearcherConfig::default());

        let result = researcher.research("topic", 2, 1).await;

        assert!(
            !result.learnings.contains("learned-q1"),
            "failed branch contributes nothing"
        );
        assert!(result.learnings.contains("learned-q2"));
        assert!(result.visited_urls.contains("https://a.example"));
    }

    #[tokio::test]
    async fn completer_failure_never_escapes() {
        let completer =
            ScriptedCompleter::new(|_| Err(ResearchError::Completion("HTTP 500: down".into())));
        let search = StubSearch::new(vec![doc("https://a.example")]);
        let budget = budget();
        let researcher =
            DeepResearcher::new(&completer, &search, &budget, ResearcherConfig::default());

        let result = researcher.research("topic", 4, 2).await;

        assert!(result.learnings.is_empty());
        assert!(result.visited_urls.is_empty());
        assert_eq!(search.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn duplicate_learnings_merge_once() {
        let completer = ScriptedCompleter::new(move |prompt: &str| {
            if prompt.contains("list of search queries") {
                Ok(queries_json(&[("q1", "g1"), ("q2", "g2")]))
            } else {
                Ok(learnings_json(&["shared fact"], &[]))
            }
        });
        let search = StubSearch::new(vec![doc("https://same.example")]);
        let budget = budget();
        let researcher =
            DeepResearcher::new(&completer, &search, &budget, ResearcherConfig::default());

        let result = researcher.research("topic", 2, 1).await;

        assert_eq!(result.learnings.len(), 1);
        assert_eq!(result.visited_urls.len(), 1);
    }

    #[tokio::test]
    async fn wide_deep_tree_completes_under_single_permit() {
        // Regression guard: a permit held across recursion would deadlock
        // the run at concurrency 1.
        let completer = ScriptedCompleter::new(research_script(
            vec![
                ("q1".into(), "g1".into()),
                ("q2".into(), "g2".into()),
                ("q3".into(), "g3".into()),
                ("q4".into(), "g4".into()),
            ],
            vec![("d1".into(), "dg".into()), ("d2".into(), "dg".into())],
        ));
        let search = StubSearch::new(vec![doc("https://a.example")]);
        let budget = budget();
        let researcher = DeepResearcher::new(
            &completer,
            &search,
            &budget,
            ResearcherConfig::default().with_concurrency(1),
        );

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            researcher.research("topic", 4, 2),
        )
        .await
        .expect("research deadlocked");

        assert!(result.learnings.contains("learned-q1"));
        assert!(result.learnings.contains("learned-d1"));
    }

    #[test]
    fn merge_is_commutative() {
        let a = ResearchResult {
            learnings: ["x".to_string(), "y".to_string()].into_iter().collect(),
            visited_urls: ["https://a.example".to_string()].into_iter().collect(),
        };
        let b = ResearchResult {
            learnings: ["y".to_string(), "z".to_string()].into_iter().collect(),
            visited_urls: ["https://b.example".to_string()].into_iter().collect(),
        };

        let mut ab = ResearchResult::default();
        ab.absorb(a.clone());
        ab.absorb(b.clone());

        let mut ba = ResearchResult::default();
        ba.absorb(b);
        ba.absorb(a);

        assert_eq!(ab, ba);
        assert_eq!(ab.learnings.len(), 3);
    }

    #[test]
    fn root_state_clamps_breadth() {
        let state = ResearchState::root("q", 0, 3);
        assert_eq!(state.breadth, 1);
        assert_eq!(state.depth, 3);
        assert!(state.learnings.is_empty());
    }
}
