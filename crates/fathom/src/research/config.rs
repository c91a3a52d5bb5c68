//! Configuration for a research run.
//!
//! Defaults mirror the reference behavior: one outstanding external call at
//! a time, three learnings per processed query, 25k-token document excerpts,
//! and a 150k-token learnings digest for report synthesis.

use crate::research::protocol::{DOCUMENT_TOKEN_BUDGET, REPORT_TOKEN_BUDGET};

/// Knobs for [`DeepResearcher`](super::orchestrator::DeepResearcher).
#[derive(Debug, Clone)]
pub struct ResearcherConfig {
    /// Maximum simultaneous outstanding calls to the completion and search
    /// services, shared by every branch at every depth of the tree.
    pub concurrency: usize,
    /// Maximum learnings extracted per processed query.
    pub max_learnings: usize,
    /// Token budget applied to each document's content before extraction.
    pub document_token_budget: usize,
    /// Token budget for the joined learnings embedded in the report prompt.
    pub report_token_budget: usize,
}

impl Default for ResearcherConfig {
    fn default() -> Self {
        Self {
            concurrency: 1,
            max_learnings: 3,
            document_token_budget: DOCUMENT_TOKEN_BUDGET,
            report_token_budget: REPORT_TOKEN_BUDGET,
        }
    }
}

impl ResearcherConfig {
    /// Set the shared concurrency limit (clamped to at least 1).
    pub fn with_concurrency(mut self, limit: usize) -> Self {
        self.concurrency = limit.max(1);
        self
    }

    /// Set the per-query learning cap (clamped to at least 1).
    pub fn with_max_learnings(mut self, count: usize) -> Self {
        self.max_learnings = count.max(1);
        self
    }

    /// Set the per-document token budget.
    pub fn with_document_token_budget(mut self, tokens: usize) -> Self {
        self.document_token_budget = tokens;
        self
    }

    /// Set the report learnings token budget.
    pub fn with_report_token_budget(mut self, tokens: usize) -> Self {
        self.report_token_budget = tokens;
        self
    }
}
