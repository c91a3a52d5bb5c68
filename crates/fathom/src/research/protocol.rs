//! The LLM protocol layer: prompts, completion invocation, and tolerant
//! decoding.
//!
//! Every operation follows one pattern: build a prompt with the fixed
//! researcher system instructions, call the [`Completer`], parse the reply
//! as a JSON object, pull out the named fields, and cap collection sizes to
//! the caller's limits. A reply that is not valid JSON — or is JSON of the
//! wrong shape — is never an error: the operation logs the raw text at
//! `warn` level for diagnosis and returns the empty value, so callers treat
//! "nothing extracted" as a normal outcome. Only transport failures from the
//! completion service surface as `Err`.

use crate::context::budget::PromptBudget;
use crate::error::ResearchError;
use crate::search::Document;
use crate::{Completer, json_schema_for};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{debug, warn};

/// Token budget applied to each document's content before it is embedded in
/// an extraction prompt.
pub const DOCUMENT_TOKEN_BUDGET: usize = 25_000;

/// Token budget for the joined learnings embedded in the report prompt.
pub const REPORT_TOKEN_BUDGET: usize = 150_000;

/// How much of a malformed response is kept in the diagnostic log line.
const RAW_LOG_CHARS: usize = 400;

// ── Wire types ─────────────────────────────────────────────────────

/// One generated search query and the goal it serves. Produced by query
/// generation, consumed one recursion level down.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct ResearchQuery {
    /// The query to hand to the search service.
    #[serde(rename = "query")]
    pub text: String,
    /// What this query is meant to uncover, and how to advance it deeper.
    #[serde(default, alias = "researchGoal")]
    pub research_goal: String,
}

/// Learnings and follow-up questions extracted from one query's search
/// results.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct LearningsBatch {
    /// Short, information-dense facts extracted from the documents.
    #[serde(default)]
    pub learnings: Vec<String>,
    /// Narrower questions worth researching next.
    #[serde(default, alias = "followUpQuestions")]
    pub follow_up_questions: Vec<String>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct GeneratedQueries {
    #[serde(default)]
    queries: Vec<ResearchQuery>,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct ReportPayload {
    #[serde(default, alias = "reportMarkdown")]
    report_markdown: String,
}

#[derive(Debug, Default, Deserialize, JsonSchema)]
struct GeneratedQuestions {
    #[serde(default)]
    questions: Vec<String>,
}

// ── Prompts ────────────────────────────────────────────────────────

/// Fixed system instructions shared by every protocol call.
fn system_prompt() -> String {
    let today = chrono::Utc::now().format("%Y-%m-%d");
    format!(
        "You are an expert researcher. Today is {today}. Follow these instructions when responding:\n\
         - The user is a highly experienced analyst; no need to simplify, be as detailed as possible.\n\
         - Be highly organized and proactive: anticipate needs and suggest solutions the user hasn't considered.\n\
         - Treat the user as an expert in all subject matter; mistakes erode trust.\n\
         - Value good arguments over authorities; consider new technologies and contrarian ideas, not just conventional wisdom.\n\
         - You may speculate or predict, but flag it clearly."
    )
}

// ── Decoding ───────────────────────────────────────────────────────

/// Parse the completion response as a JSON object, tolerating surrounding
/// prose or markdown fences. Returns `None` when no object can be recovered.
fn extract_json_object(raw: &str) -> Option<serde_json::Value> {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(raw.trim())
        && value.is_object()
    {
        return Some(value);
    }

    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    serde_json::from_str(raw.get(start..=end)?)
        .ok()
        .filter(serde_json::Value::is_object)
}

/// Decode a response into `T`, degrading to `T::default()` on any shape
/// mismatch. The raw text is kept in the log for diagnosis.
fn decode<T: DeserializeOwned + Default>(raw: &str, operation: &str) -> T {
    match extract_json_object(raw).and_then(|v| serde_json::from_value::<T>(v).ok()) {
        Some(value) => value,
        None => {
            warn!(
                "{operation}: response was not the expected JSON shape, continuing with an empty result (raw: {})",
                preview(raw)
            );
            T::default()
        }
    }
}

fn preview(raw: &str) -> String {
    let mut p: String = raw.chars().take(RAW_LOG_CHARS).collect();
    if raw.chars().count() > RAW_LOG_CHARS {
        p.push('…');
    }
    p
}

// ── Protocol ───────────────────────────────────────────────────────

/// The three LLM interactions of a research run, plus the pre-run
/// clarifying-questions step.
pub struct ResearchProtocol<'a> {
    completer: &'a dyn Completer,
    budget: &'a PromptBudget,
    document_token_budget: usize,
    report_token_budget: usize,
}

impl<'a> ResearchProtocol<'a> {
    pub fn new(completer: &'a dyn Completer, budget: &'a PromptBudget) -> Self {
        Self {
            completer,
            budget,
            document_token_budget: DOCUMENT_TOKEN_BUDGET,
            report_token_budget: REPORT_TOKEN_BUDGET,
        }
    }

    /// Override the per-document token budget.
    pub fn with_document_token_budget(mut self, tokens: usize) -> Self {
        self.document_token_budget = tokens;
        self
    }

    /// Override the report learnings token budget.
    pub fn with_report_token_budget(mut self, tokens: usize) -> Self {
        self.report_token_budget = tokens;
        self
    }

    /// Generate up to `count` search queries for `topic`.
    ///
    /// Prior learnings are appended verbatim as hint text — sizing them is
    /// the caller's concern. An unusable response yields an empty list.
    pub async fn generate_queries(
        &self,
        topic: &str,
        count: usize,
        prior_learnings: &HashSet<String>,
    ) -> Result<Vec<ResearchQuery>, ResearchError> {
        let schema = serde_json::to_string(&json_schema_for::<GeneratedQueries>())
            .unwrap_or_default();
        let mut prompt = format!(
            "Given the following prompt from the user, generate a list of search queries to research the topic. \
             Return a JSON object with a 'queries' array containing at most {count} queries (fewer if the original \
             prompt is already clear). Each query object has 'query' and 'research_goal' fields; make every query \
             unique and dissimilar from the others. The response must match this JSON schema: {schema}\n\n\
             <prompt>{topic}</prompt>"
        );
        if !prior_learnings.is_empty() {
            let hints = prior_learnings
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(" ");
            prompt.push_str(&format!(
                "\n\nHere are some learnings from previous research, use them to generate more specific queries: {hints}"
            ));
        }

        let raw = self.completer.complete(&system_prompt(), &prompt).await?;
        let mut queries = decode::<GeneratedQueries>(&raw, "query generation").queries;
        queries.truncate(count);
        debug!("query generation: {} candidate(s)", queries.len());
        Ok(queries)
    }

    /// Extract learnings and follow-up questions from one query's search
    /// results, capped to the given sizes.
    pub async fn extract_learnings(
        &self,
        query: &str,
        documents: &[Document],
        max_learnings: usize,
        max_followups: usize,
    ) -> Result<LearningsBatch, ResearchError> {
        let contents: String = documents
            .iter()
            .filter(|d| !d.content.is_empty())
            .map(|d| {
                format!(
                    "<content>\n{}\n</content>",
                    self.budget.trim(&d.content, self.document_token_budget)
                )
            })
            .collect();

        let prompt = format!(
            "Given the following contents from a search for the query <query>{query}</query>, generate a list of \
             learnings from the contents. Return a JSON object with 'learnings' and 'follow_up_questions' arrays. \
             Include up to {max_learnings} learnings and {max_followups} follow-up questions. The learnings should \
             be unique, concise, and information-dense, including entities, metrics, numbers, and dates.\n\n\
             <contents>{contents}</contents>"
        );

        let raw = self.completer.complete(&system_prompt(), &prompt).await?;
        let mut batch = decode::<LearningsBatch>(&raw, "learning extraction");
        batch.learnings.truncate(max_learnings);
        batch.follow_up_questions.truncate(max_followups);
        Ok(batch)
    }

    /// Write the final report from the accumulated learnings and append the
    /// source list. An unusable response yields an empty string.
    pub async fn synthesize_report(
        &self,
        topic: &str,
        learnings: &HashSet<String>,
        visited_urls: &HashSet<String>,
    ) -> Result<String, ResearchError> {
        let joined = learnings
            .iter()
            .map(|l| format!("<learning>\n{l}\n</learning>"))
            .collect::<Vec<_>>()
            .join("\n");
        let digest = self.budget.trim(&joined, self.report_token_budget);

        let prompt = format!(
            "Given the following prompt from the user, write a final report on the topic using the learnings from \
             research. Return a JSON object with a 'report_markdown' field containing a detailed markdown report \
             (aim for 3 or more pages). Include ALL the learnings from research:\n\n<prompt>{topic}</prompt>\n\n\
             Here are all the learnings from research:\n\n<learnings>\n{digest}\n</learnings>"
        );

        let raw = self.completer.complete(&system_prompt(), &prompt).await?;
        let report = decode::<ReportPayload>(&raw, "report synthesis").report_markdown;
        if report.is_empty() {
            return Ok(String::new());
        }
        Ok(append_sources(&report, visited_urls))
    }

    /// Ask for 3-5 questions that sharpen the research direction before the
    /// run starts.
    pub async fn clarifying_questions(&self, topic: &str) -> Result<Vec<String>, ResearchError> {
        let prompt = format!(
            "Given this research topic: {topic}, generate 3-5 follow-up questions to better understand the user's \
             research needs. Return the response as a JSON object with a 'questions' array field."
        );
        let raw = self.completer.complete(&system_prompt(), &prompt).await?;
        Ok(decode::<GeneratedQuestions>(&raw, "clarifying questions").questions)
    }
}

/// Append the `## Sources` footer: one bullet per URL, in the set's
/// iteration order.
fn append_sources(report: &str, visited_urls: &HashSet<String>) -> String {
    let bullets = visited_urls
        .iter()
        .map(|url| format!("- {url}"))
        .collect::<Vec<_>>()
        .join("\n");
    format!("{report}\n\n## Sources\n\n{bullets}")
}
