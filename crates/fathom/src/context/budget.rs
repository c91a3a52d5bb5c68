//! Token-budget prompt trimming.
//!
//! Downstream completion calls carry document excerpts and accumulated
//! learning digests that can exceed the model's context window.
//! [`PromptBudget`] measures real token counts with the cl100k_base encoding
//! and trims oversized text until it fits a caller-specified budget, cutting
//! at natural boundaries via [`RecursiveSplitter`] instead of mid-sentence.

use crate::context::splitter::RecursiveSplitter;
use crate::error::ResearchError;
use tiktoken_rs::CoreBPE;
use tracing::debug;

/// Hard floor (in characters) below which trimming stops estimating and
/// truncates outright. Keeps the fit loop from chasing pathologically
/// token-dense input forever.
pub const MIN_CHUNK_CHARS: usize = 140;

/// Average characters reclaimed per token of overflow when estimating the
/// next target length.
const CHARS_PER_OVERFLOW_TOKEN: usize = 3;

/// Token-measured prompt trimmer.
///
/// Construct once at setup — loading the encoder is not cheap — and share by
/// reference; [`trim`](Self::trim) takes `&self` and is freely reusable
/// across branches.
pub struct PromptBudget {
    encoder: CoreBPE,
}

impl PromptBudget {
    /// Load the cl100k_base encoder. Failure here is fatal misconfiguration
    /// and surfaces immediately rather than mid-run.
    pub fn new() -> Result<Self, ResearchError> {
        let encoder =
            tiktoken_rs::cl100k_base().map_err(|e| ResearchError::Tokenizer(e.to_string()))?;
        Ok(Self { encoder })
    }

    /// Number of tokens `text` encodes to.
    pub fn token_len(&self, text: &str) -> usize {
        self.encoder.encode_ordinary(text).len()
    }

    /// Trim `text` so its encoded length fits within `token_budget` tokens.
    ///
    /// Text already within budget is returned unchanged. Oversized text goes
    /// through repeated estimate-and-split passes; two guards force
    /// convergence:
    ///
    /// - the [`MIN_CHUNK_CHARS`] floor — once the estimated target drops
    ///   below it, the text is hard-truncated to the floor and returned;
    /// - forced progress — when a split pass returns the text unchanged (no
    ///   separator found a boundary), the next pass starts from a hard
    ///   prefix truncation instead of the same text.
    pub fn trim(&self, text: &str, token_budget: usize) -> String {
        let mut current = text.to_string();
        loop {
            if current.is_empty() {
                return current;
            }
            let tokens = self.token_len(&current);
            if tokens <= token_budget {
                return current;
            }

            let overflow = tokens - token_budget;
            let chars = current.chars().count();
            let target = chars.saturating_sub(overflow * CHARS_PER_OVERFLOW_TOKEN);
            if target < MIN_CHUNK_CHARS {
                return truncate_chars(&current, MIN_CHUNK_CHARS);
            }

            debug!("trimming prompt: {tokens} tokens over a budget of {token_budget}, target {target} chars");

            // target >= MIN_CHUNK_CHARS and overlap is 0, so construction
            // cannot fail; the fallback keeps the guarantee anyway.
            let trimmed = match RecursiveSplitter::new(target, 0) {
                Ok(splitter) => splitter.split(&current).into_iter().next().unwrap_or_default(),
                Err(_) => return truncate_chars(&current, MIN_CHUNK_CHARS),
            };

            if trimmed.chars().count() == chars {
                current = truncate_chars(&current, target);
            } else {
                current = trimmed;
            }
        }
    }
}

/// Char-boundary-safe prefix truncation.
fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}
