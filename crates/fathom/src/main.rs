//! Run a recursive deep-research session from the command line and write the
//! final report to disk.
//!
//! Reads the completion API key from the `OPENROUTER_KEY` environment
//! variable and the search API key from `FIRECRAWL_KEY` (optional for
//! self-hosted search instances; point `FIRECRAWL_BASE_URL` at one).
//!
//! # Examples
//!
//! ```sh
//! # Default breadth/depth
//! fathom "How do production Rust services manage async backpressure?"
//!
//! # Wider and deeper, four concurrent external calls
//! fathom --breadth 6 --depth 3 --concurrency 4 "State of RISC-V laptops"
//!
//! # Ask clarifying questions first and fold the answers into the run
//! fathom --clarify "Compare vector databases"
//!
//! # Retry transient service failures twice before failing a branch
//! fathom --retries 2 "LLM inference pricing trends"
//! ```

use clap::Parser;
use fathom::api::retry::RetryConfig;
use fathom::context::budget::PromptBudget;
use fathom::research::{DeepResearcher, ResearcherConfig};
use fathom::search::FirecrawlClient;
use fathom::{CompletionClient, DEFAULT_MODEL};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Recursive deep-research assistant: generates search queries, explores
/// them breadth-first, digs deeper on follow-ups, and writes a cited report.
#[derive(Parser)]
#[command(name = "fathom")]
struct Cli {
    /// The topic or question to research
    query: String,

    // ── Tree shape ─────────────────────────────────────────────
    /// Sibling queries explored at the top level (halves at each deeper level)
    #[arg(long, default_value_t = 4)]
    breadth: usize,

    /// Recursion levels before the tree stops deepening
    #[arg(long, default_value_t = 2)]
    depth: usize,

    // ── Services ───────────────────────────────────────────────
    /// Completion model
    #[arg(long, default_value = DEFAULT_MODEL)]
    model: String,

    /// Maximum simultaneous outstanding calls to the completion and search
    /// services, shared across the whole run
    #[arg(long, default_value_t = 1)]
    concurrency: usize,

    /// Retries for transient service failures (0 = fail the branch immediately)
    #[arg(long, default_value_t = 0)]
    retries: u32,

    // ── Session ────────────────────────────────────────────────
    /// Ask clarifying questions on stdin before researching
    #[arg(long)]
    clarify: bool,

    /// Path the final markdown report is written to
    #[arg(long, default_value = "report.md")]
    output: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default_directive = if verbose { "fathom=debug" } else { "fathom=info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn run(cli: &Cli) -> Result<(), String> {
    let completion_key = std::env::var("OPENROUTER_KEY")
        .map_err(|_| "OPENROUTER_KEY environment variable is not set".to_string())?;
    let search_key = std::env::var("FIRECRAWL_KEY").unwrap_or_default();

    let retry = RetryConfig::with_retries(cli.retries);

    let mut completer = CompletionClient::new(completion_key)
        .map_err(|e| e.to_string())?
        .with_model(cli.model.clone())
        .with_retry(retry.clone());
    if let Ok(endpoint) = std::env::var("OPENROUTER_ENDPOINT") {
        completer = completer.with_endpoint(endpoint);
    }

    let mut search = FirecrawlClient::new(search_key)
        .map_err(|e| e.to_string())?
        .with_retry(retry);
    if let Ok(base_url) = std::env::var("FIRECRAWL_BASE_URL") {
        search = search.with_base_url(base_url);
    }

    let prompt_budget = PromptBudget::new().map_err(|e| e.to_string())?;
    let config = ResearcherConfig::default().with_concurrency(cli.concurrency);
    let researcher = DeepResearcher::new(&completer, &search, &prompt_budget, config);

    let query = if cli.clarify {
        clarified_query(&researcher, &cli.query).await?
    } else {
        cli.query.clone()
    };

    let result = researcher.research(&query, cli.breadth, cli.depth).await;
    info!(
        "research finished: {} learning(s), {} source(s)",
        result.learnings.len(),
        result.visited_urls.len()
    );
    for learning in &result.learnings {
        println!("• {learning}");
    }

    let report = researcher
        .protocol()
        .synthesize_report(&query, &result.learnings, &result.visited_urls)
        .await
        .map_err(|e| e.to_string())?;
    if report.is_empty() {
        return Err("report synthesis returned no usable content".to_string());
    }

    save_report(&cli.output, &report)?;
    println!("\nReport saved to {}", cli.output.display());
    Ok(())
}

/// Ask the protocol's clarifying questions on stdin and fold the answers
/// into the research query.
async fn clarified_query(
    researcher: &DeepResearcher<'_>,
    topic: &str,
) -> Result<String, String> {
    let questions = researcher
        .protocol()
        .clarifying_questions(topic)
        .await
        .map_err(|e| e.to_string())?;
    if questions.is_empty() {
        return Ok(topic.to_string());
    }

    let mut pairs = Vec::with_capacity(questions.len());
    let stdin = std::io::stdin();
    for question in &questions {
        println!("{question}");
        print!("> ");
        std::io::stdout()
            .flush()
            .map_err(|e| format!("failed to flush stdout: {e}"))?;
        let mut answer = String::new();
        stdin
            .read_line(&mut answer)
            .map_err(|e| format!("failed to read answer: {e}"))?;
        pairs.push(format!("Q: {question} A: {}", answer.trim()));
    }

    Ok(format!(
        "Initial query: {topic}\nFollow-up questions and answers:\n{}",
        pairs.join("\n")
    ))
}

/// Write the report, with a generation-date footer, to `path`.
fn save_report(path: &Path, report: &str) -> Result<(), String> {
    let stamped = format!(
        "{report}\n\n_Generated on {}_\n",
        chrono::Utc::now().format("%Y-%m-%d")
    );
    std::fs::write(path, stamped)
        .map_err(|e| format!("failed to write '{}': {e}", path.display()))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    if let Err(e) = run(&cli).await {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
