//! Error types for the research pipeline.
//!
//! Only misconfiguration surfaces as a hard failure, and only at setup time
//! (splitter parameters, tokenizer load). Transport failures from the
//! completion and search services are absorbed at branch boundaries inside
//! the orchestrator, and a malformed LLM response is not an error at all —
//! the protocol layer degrades it to an empty value.

use thiserror::Error;

/// All failure modes of the research pipeline.
#[derive(Debug, Error)]
pub enum ResearchError {
    /// Invalid splitter parameters. Raised at construction, never mid-run.
    #[error("chunk overlap {overlap} must be smaller than chunk size {chunk_size}")]
    InvalidChunking { chunk_size: usize, overlap: usize },

    /// The token encoder could not be loaded. Raised at setup.
    #[error("tokenizer initialization failed: {0}")]
    Tokenizer(String),

    /// Transport or API failure from the completion service.
    #[error("completion request failed: {0}")]
    Completion(String),

    /// Transport or API failure from the search service.
    #[error("search request failed: {0}")]
    Search(String),

    /// The shared admission gate was closed. Should not happen in practice;
    /// absorbed like any other branch failure if it does.
    #[error("concurrency limiter closed")]
    LimiterClosed,
}
