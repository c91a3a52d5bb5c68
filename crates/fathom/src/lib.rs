//! Recursive deep-research engine for LLM-driven topic exploration.
//!
//! `fathom` turns a single question into a tree of searches: an LLM proposes
//! sub-queries, a search backend fetches documents, learnings are extracted
//! and fed into narrower follow-up branches, and the accumulated findings
//! are synthesized into a cited report. The heart of the crate is
//! [`DeepResearcher`](research::orchestrator::DeepResearcher) — a
//! bounded-concurrency recursive control loop in which breadth halves and
//! depth decrements at every level, results merge bottom-up with exact-text
//! deduplication, and a failed branch degrades to "fewer learnings" instead
//! of aborting the run.
//!
//! # Getting started
//!
//! ```ignore
//! use fathom::CompletionClient;
//! use fathom::context::budget::PromptBudget;
//! use fathom::research::{DeepResearcher, ResearcherConfig};
//! use fathom::search::FirecrawlClient;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), fathom::ResearchError> {
//!     let completer = CompletionClient::new(std::env::var("OPENROUTER_KEY").unwrap())?;
//!     let search = FirecrawlClient::new(std::env::var("FIRECRAWL_KEY").unwrap())?;
//!     let budget = PromptBudget::new()?;
//!
//!     let researcher = DeepResearcher::new(
//!         &completer,
//!         &search,
//!         &budget,
//!         ResearcherConfig::default().with_concurrency(2),
//!     );
//!     let result = researcher.research("rust async runtimes", 4, 2).await;
//!
//!     let report = researcher
//!         .protocol()
//!         .synthesize_report("rust async runtimes", &result.learnings, &result.visited_urls)
//!         .await?;
//!     println!("{report}");
//!     Ok(())
//! }
//! ```
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`research`] | [`DeepResearcher`](research::orchestrator::DeepResearcher) control loop, [`ResearchProtocol`](research::protocol::ResearchProtocol) LLM contract, run configuration |
//! | [`context`] | [`RecursiveSplitter`](context::splitter::RecursiveSplitter) chunking and [`PromptBudget`](context::budget::PromptBudget) token trimming |
//! | [`search`] | [`SearchProvider`](search::SearchProvider) boundary, Firecrawl-compatible client, wire-shape normalization |
//! | [`api`] | Retry with backoff for transient service failures |
//!
//! # Design principles
//!
//! 1. **Collaborators are injected.** The completion and search services are
//!    trait objects constructed by the caller; nothing reaches for ambient
//!    global clients, and tests swap in scripted fakes.
//!
//! 2. **Failures shrink the result, they don't abort it.** A branch that
//!    times out or returns garbage contributes an empty result; only setup
//!    misconfiguration is a hard error.
//!
//! 3. **Every prompt fragment is budgeted.** Document excerpts and learning
//!    digests pass through [`PromptBudget`](context::budget::PromptBudget)
//!    before they reach a prompt.

pub mod api;
pub mod context;
pub mod error;
pub mod research;
pub mod search;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::debug;

pub use error::ResearchError;

// Re-export schemars for downstream crates.
pub use schemars;

// ── Constants ──────────────────────────────────────────────────────

/// Default OpenRouter-compatible chat completions endpoint.
pub const DEFAULT_COMPLETION_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// Default model for all completion calls.
pub const DEFAULT_MODEL: &str = "openai/o3-mini";

/// Per-response token limit for protocol calls.
const COMPLETION_MAX_TOKENS: u32 = 8192;

/// HTTP timeout for one completion call. A call that exceeds it fails the
/// surrounding branch, not the run.
const COMPLETION_TIMEOUT: Duration = Duration::from_secs(120);

// ── Schema generation ──────────────────────────────────────────────

/// Generate a JSON Schema `serde_json::Value` from a type that implements
/// `schemars::JsonSchema`. This is the bridge between strong Rust types and
/// the JSON shapes the protocol prompts describe to the model.
///
/// # Example
///
/// ```
/// use fathom::json_schema_for;
/// use schemars::JsonSchema;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, JsonSchema)]
/// struct QueryPlan {
///     topic: String,
///     #[serde(default)]
///     notes: Option<String>,
/// }
///
/// let schema = json_schema_for::<QueryPlan>();
/// assert_eq!(schema["type"], "object");
/// assert!(schema["required"].as_array().unwrap().contains(&"topic".into()));
/// ```
pub fn json_schema_for<T: JsonSchema>() -> serde_json::Value {
    let schema = schemars::schema_for!(T);
    serde_json::to_value(schema)
        .unwrap_or_else(|_| serde_json::json!({"type": "object", "properties": {}}))
}

// ── Message types ──────────────────────────────────────────────────

/// Role of a message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

/// A message in the conversation.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Message {
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: content.into(),
        }
    }
}

// ── Request types ──────────────────────────────────────────────────

/// JSON output format type.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum ResponseFormatType {
    #[serde(rename = "json_object")]
    JsonObject,
}

/// JSON output mode.
#[derive(Serialize, Debug)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub fmt_type: ResponseFormatType,
}

/// Chat completion request body — the OpenRouter-compatible subset the
/// protocol layer needs. Zero/absent optional fields are omitted from
/// serialization.
#[derive(Serialize, Debug)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "is_zero_u32")]
    pub max_tokens: u32,
    #[serde(skip_serializing_if = "is_zero_f32")]
    pub temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
}

fn is_zero_u32(v: &u32) -> bool {
    *v == 0
}
fn is_zero_f32(v: &f32) -> bool {
    *v == 0.0
}

// ── Response types ─────────────────────────────────────────────────

/// Raw API response (internal deserialization target).
#[derive(Deserialize, Debug)]
struct RawChatResponse {
    choices: Option<Vec<RawChoice>>,
    error: Option<ApiErrorResponse>,
    #[serde(default)]
    usage: Option<UsageInfo>,
}

#[derive(Deserialize, Debug)]
struct RawChoice {
    message: RawResponseMessage,
}

#[derive(Deserialize, Debug)]
struct RawResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize, Debug)]
struct ApiErrorResponse {
    message: String,
}

/// Token usage statistics.
#[derive(Deserialize, Debug, Clone)]
pub struct UsageInfo {
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub total_tokens: Option<u32>,
}

// ── Completion service boundary ────────────────────────────────────

/// Boxed future returned by [`Completer::complete`].
///
/// Type alias to keep trait signatures and implementations readable.
pub type CompletionFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ResearchError>> + Send + 'a>>;

/// The completion-service boundary: a system + user prompt pair in, raw
/// response text out. Implementations are expected — but not guaranteed —
/// to return a JSON object as text; the protocol layer tolerates arbitrary
/// malformed output.
pub trait Completer: Send + Sync {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> CompletionFuture<'_>;
}

/// Async HTTP client for an OpenRouter-compatible chat completions API.
pub struct CompletionClient {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
    model: String,
    temperature: f32,
    retry: api::retry::RetryConfig,
}

impl CompletionClient {
    /// Create a client with the given API key and the default endpoint and
    /// model.
    pub fn new(api_key: impl Into<String>) -> Result<Self, ResearchError> {
        let client = reqwest::Client::builder()
            .user_agent("fathom/0.2")
            .timeout(COMPLETION_TIMEOUT)
            .build()
            .map_err(|e| ResearchError::Completion(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            api_key: api_key.into(),
            endpoint: DEFAULT_COMPLETION_URL.into(),
            model: DEFAULT_MODEL.into(),
            temperature: 0.7,
            retry: api::retry::RetryConfig::default(),
        })
    }

    /// Override the chat completions endpoint.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    /// Override the model.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Override the sampling temperature.
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the retry policy for transient failures.
    pub fn with_retry(mut self, retry: api::retry::RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Send one chat request and return the first choice's text content.
    async fn complete_once(
        &self,
        system_prompt: &str,
        user_prompt: &str,
    ) -> Result<String, ResearchError> {
        let body = ChatRequest {
            model: self.model.clone(),
            messages: vec![Message::system(system_prompt), Message::user(user_prompt)],
            max_tokens: COMPLETION_MAX_TOKENS,
            temperature: self.temperature,
            response_format: Some(ResponseFormat {
                fmt_type: ResponseFormatType::JsonObject,
            }),
        };

        debug!(
            "completion request: model={}, system={} chars, user={} chars",
            self.model,
            system_prompt.len(),
            user_prompt.len()
        );
        let start = Instant::now();

        let resp = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| ResearchError::Completion(format!("request failed: {e}")))?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ResearchError::Completion(format!("failed to read response: {e}")))?;

        debug!(
            "completion response: HTTP {status} in {:.1}s ({} bytes)",
            start.elapsed().as_secs_f64(),
            text.len()
        );

        if !status.is_success() {
            return Err(ResearchError::Completion(format!("HTTP {status}: {text}")));
        }

        let parsed: RawChatResponse = serde_json::from_str(&text)
            .map_err(|e| ResearchError::Completion(format!("failed to parse response: {e}")))?;

        if let Some(err) = parsed.error {
            return Err(ResearchError::Completion(format!("API error: {}", err.message)));
        }

        if let Some(ref usage) = parsed.usage {
            debug!(
                "token usage: prompt={}, completion={}",
                usage.prompt_tokens.unwrap_or(0),
                usage.completion_tokens.unwrap_or(0),
            );
        }

        Ok(parsed
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message.content)
            .unwrap_or_default())
    }
}

impl Completer for CompletionClient {
    fn complete(&self, system_prompt: &str, user_prompt: &str) -> CompletionFuture<'_> {
        let system = system_prompt.to_string();
        let user = user_prompt.to_string();
        Box::pin(async move {
            api::retry::run_with_retry(&self.retry, "completion", || {
                let system = system.clone();
                let user = user.clone();
                async move { self.complete_once(&system, &user).await }
            })
            .await
        })
    }
}
