//! Web search collaborator: the [`SearchProvider`] boundary, a
//! Firecrawl-compatible HTTP client, and wire-shape normalization.
//!
//! Search backends disagree about response envelopes — a `data` array, a
//! `success`/`data` pair, or a bare list, with content under `markdown` or
//! `content` and the title sometimes buried in `metadata`. All of that is
//! flattened into the canonical [`Document`] here, at the boundary, so the
//! orchestrator only ever sees one shape. Empty result lists are valid; the
//! service is treated as slow and unreliable, and the orchestrator absorbs
//! its failures per branch.

use crate::api::retry::{RetryConfig, run_with_retry};
use crate::error::ResearchError;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, warn};

/// Default Firecrawl API base URL.
pub const DEFAULT_SEARCH_URL: &str = "https://api.firecrawl.dev";

/// Default number of results requested per query.
pub const DEFAULT_RESULT_LIMIT: usize = 5;

/// HTTP timeout for one search call. A call that exceeds it fails the
/// surrounding branch, not the run.
const SEARCH_TIMEOUT: Duration = Duration::from_secs(15);

/// A search hit: one fetched page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub url: String,
    pub content: String,
    pub title: String,
}

/// Boxed future returned by [`SearchProvider::search`].
pub type SearchFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<Document>, ResearchError>> + Send + 'a>>;

/// The search-service boundary: a query string in, documents out.
pub trait SearchProvider: Send + Sync {
    fn search(&self, query: &str) -> SearchFuture<'_>;
}

/// Async HTTP client for a Firecrawl-compatible search API.
pub struct FirecrawlClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    limit: usize,
    retry: RetryConfig,
}

impl FirecrawlClient {
    /// Create a client with the given API key and the default endpoint.
    /// Self-hosted instances accept an empty key.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ResearchError> {
        let http = reqwest::Client::builder()
            .user_agent("fathom/0.2")
            .timeout(SEARCH_TIMEOUT)
            .build()
            .map_err(|e| ResearchError::Search(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            api_key: api_key.into(),
            base_url: DEFAULT_SEARCH_URL.into(),
            limit: DEFAULT_RESULT_LIMIT,
            retry: RetryConfig::default(),
        })
    }

    /// Override the API base URL (e.g. a self-hosted instance).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Override the per-query result limit.
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    /// Set the retry policy for transient failures.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    async fn search_once(&self, query: &str) -> Result<Vec<Document>, ResearchError> {
        let url = format!("{}/v1/search", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({ "query": query, "limit": self.limit });

        let resp = self
            .http
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ResearchError::Search(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ResearchError::Search(format!("failed to read response: {e}")))?;

        if !status.is_success() {
            return Err(ResearchError::Search(format!("HTTP {status}: {text}")));
        }

        let value: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| ResearchError::Search(format!("failed to parse response: {e}")))?;

        let documents = normalize_response(&value);
        debug!("search '{query}': {} document(s)", documents.len());
        Ok(documents)
    }
}

impl SearchProvider for FirecrawlClient {
    fn search(&self, query: &str) -> SearchFuture<'_> {
        let query = query.to_string();
        Box::pin(async move {
            run_with_retry(&self.retry, "search", || {
                let query = query.clone();
                async move { self.search_once(&query).await }
            })
            .await
        })
    }
}

/// Map every accepted wire shape onto the canonical document list.
///
/// Accepted envelopes: a bare array, `{"data": [...]}`, and
/// `{"success": ..., "data": [...]}`. Item content comes from `markdown` or
/// `content`; the title from `title` or `metadata.title`. Items with none of
/// those fields are dropped. Anything else normalizes to an empty list.
pub fn normalize_response(value: &serde_json::Value) -> Vec<Document> {
    let items: &[serde_json::Value] = if let Some(arr) = value.as_array() {
        arr
    } else if let Some(arr) = value.get("data").and_then(|d| d.as_array()) {
        arr
    } else {
        warn!("unexpected search response shape; treating as no results");
        return Vec::new();
    };

    items.iter().filter_map(document_from_item).collect()
}

fn document_from_item(item: &serde_json::Value) -> Option<Document> {
    let obj = item.as_object()?;
    let str_field = |key: &str| {
        obj.get(key)
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    let url = str_field("url");
    let content = {
        let markdown = str_field("markdown");
        if markdown.is_empty() {
            str_field("content")
        } else {
            markdown
        }
    };
    let title = {
        let title = str_field("title");
        if title.is_empty() {
            obj.get("metadata")
                .and_then(|m| m.get("title"))
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        } else {
            title
        }
    };

    if url.is_empty() && content.is_empty() && title.is_empty() {
        None
    } else {
        Some(Document { url, content, title })
    }
}
