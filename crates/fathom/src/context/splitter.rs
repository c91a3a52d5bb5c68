//! Recursive separator-priority text chunking.
//!
//! Splits text into chunks of at most `chunk_size` characters by trying a
//! prioritized separator list: paragraph break, line break, sentence
//! punctuation, then single characters. Undersized fragments are merged
//! greedily; up to `chunk_overlap` characters of trailing context carry over
//! between consecutive chunks. A fragment that alone exceeds `chunk_size` is
//! re-split with the same list — the terminal empty-string separator splits
//! into individual characters, so every pass makes progress and the
//! recursion is bounded by the input length.

use crate::error::ResearchError;
use tracing::warn;

/// Separator priority list used by [`RecursiveSplitter::new`]. The final
/// empty string matches any text and means "split into characters".
pub const DEFAULT_SEPARATORS: [&str; 8] = ["\n\n", "\n", ".", ",", ">", "<", " ", ""];

/// Recursive character-level text splitter.
#[derive(Debug, Clone)]
pub struct RecursiveSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl RecursiveSplitter {
    /// Create a splitter with the default separator list.
    ///
    /// Fails when `chunk_overlap >= chunk_size` — an overlap that large
    /// would make the merge step unable to close a chunk.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self, ResearchError> {
        Self::with_separators(
            chunk_size,
            chunk_overlap,
            DEFAULT_SEPARATORS.iter().map(|s| (*s).to_string()).collect(),
        )
    }

    /// Create a splitter with a custom separator priority list.
    ///
    /// A terminal empty-string separator is appended if missing; without it
    /// a fragment containing none of the separators could never shrink.
    pub fn with_separators(
        chunk_size: usize,
        chunk_overlap: usize,
        mut separators: Vec<String>,
    ) -> Result<Self, ResearchError> {
        if chunk_overlap >= chunk_size {
            return Err(ResearchError::InvalidChunking {
                chunk_size,
                overlap: chunk_overlap,
            });
        }
        if separators.last().is_none_or(|s| !s.is_empty()) {
            separators.push(String::new());
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            separators,
        })
    }

    /// Split `text` into chunks of at most `chunk_size` characters.
    ///
    /// Chunks are returned in text order. An individual chunk may exceed the
    /// target when the merge step cannot do better; that case is logged and
    /// otherwise tolerated.
    pub fn split(&self, text: &str) -> Vec<String> {
        // First separator that occurs in the text wins; the empty string
        // always matches. Fall back to the last entry for custom lists.
        let separator = self
            .separators
            .iter()
            .find(|s| s.is_empty() || text.contains(s.as_str()))
            .or_else(|| self.separators.last())
            .cloned()
            .unwrap_or_default();

        let fragments: Vec<String> = if separator.is_empty() {
            text.chars().map(|c| c.to_string()).collect()
        } else {
            text.split(separator.as_str()).map(str::to_string).collect()
        };

        let mut chunks = Vec::new();
        let mut pending: Vec<String> = Vec::new();
        for fragment in fragments {
            if char_len(&fragment) < self.chunk_size {
                pending.push(fragment);
            } else {
                if !pending.is_empty() {
                    chunks.extend(self.merge(&pending, &separator));
                    pending.clear();
                }
                chunks.extend(self.split(&fragment));
            }
        }
        if !pending.is_empty() {
            chunks.extend(self.merge(&pending, &separator));
        }
        chunks
    }

    /// Greedily merge undersized fragments into chunks, sliding a window so
    /// each new chunk starts with at most `chunk_overlap` characters of the
    /// previous one.
    fn merge(&self, fragments: &[String], separator: &str) -> Vec<String> {
        let mut merged: Vec<String> = Vec::new();
        let mut window: Vec<&str> = Vec::new();
        let mut total = 0usize;

        for fragment in fragments {
            let len = char_len(fragment);
            if total + len >= self.chunk_size {
                if total > self.chunk_size {
                    warn!(
                        "produced a chunk of {total} characters ({} requested)",
                        self.chunk_size
                    );
                }
                if !window.is_empty() {
                    if let Some(chunk) = join_fragments(&window, separator) {
                        merged.push(chunk);
                    }
                    // Trim fragments off the front until what remains fits
                    // inside the overlap allowance.
                    while total > self.chunk_overlap
                        || (total + len > self.chunk_size && total > 0)
                    {
                        total -= char_len(window[0]);
                        window.remove(0);
                    }
                }
            }
            window.push(fragment);
            total += len;
        }

        if let Some(chunk) = join_fragments(&window, separator) {
            merged.push(chunk);
        }
        merged
    }
}

/// Join fragments with the separator, dropping whitespace-only results.
fn join_fragments(fragments: &[&str], separator: &str) -> Option<String> {
    let joined = fragments.join(separator);
    let trimmed = joined.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Length in characters, not bytes — multi-byte text must never be cut
/// mid-character.
fn char_len(s: &str) -> usize {
    s.chars().count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_overlap_not_smaller_than_chunk_size() {
        assert!(RecursiveSplitter::new(100, 100).is_err());
        assert!(RecursiveSplitter::new(100, 200).is_err());
        assert!(RecursiveSplitter::new(100, 99).is_ok());
    }

    #[test]
    fn empty_text_yields_no_chunks() {
        let splitter = RecursiveSplitter::new(10, 0).unwrap();
        assert!(splitter.split("").is_empty());
    }

    #[test]
    fn short_text_is_a_single_chunk() {
        let splitter = RecursiveSplitter::new(100, 0).unwrap();
        let chunks = splitter.split("hello world");
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn splits_on_paragraph_breaks_first() {
        let splitter = RecursiveSplitter::new(12, 0).unwrap();
        let chunks = splitter.split("first para\n\nsecond one\n\nthird");
        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(!chunk.contains("\n\n"), "chunk kept a paragraph break: {chunk:?}");
        }
    }

    #[test]
    fn character_fallback_round_trips_content() {
        let splitter = RecursiveSplitter::new(5, 0).unwrap();
        let text = "abcdefghijklmnop";
        let chunks = splitter.split(text);
        assert!(chunks.iter().all(|c| c.chars().count() <= 5));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn overlap_carries_tail_of_previous_chunk() {
        let splitter = RecursiveSplitter::new(10, 3).unwrap();
        let text = "0123456789ABCDEFGHIJKLMNOP";
        let chunks = splitter.split(text);
        assert!(chunks.len() >= 2);

        let first = &chunks[0];
        let tail: String = first
            .chars()
            .skip(first.chars().count().saturating_sub(3))
            .collect();
        assert!(
            chunks[1].starts_with(&tail),
            "second chunk {:?} should start with {tail:?}",
            chunks[1]
        );
    }

    #[test]
    fn oversized_fragment_is_resplit() {
        let splitter = RecursiveSplitter::new(10, 0).unwrap();
        let text = "aaaaaaaaaaaaaaa bbb";
        let chunks = splitter.split(text);
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
        let total_a: usize = chunks
            .iter()
            .map(|c| c.chars().filter(|&ch| ch == 'a').count())
            .sum();
        assert_eq!(total_a, 15, "no 'a' content may be dropped");
        assert!(chunks.iter().any(|c| c.contains("bbb")));
    }

    #[test]
    fn no_fragment_dropped_across_sentence_splits() {
        let splitter = RecursiveSplitter::new(20, 0).unwrap();
        let text = "alpha.bravo.charlie.delta.echo.foxtrot.golf.hotel";
        let chunks = splitter.split(text);
        for word in ["alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel"] {
            assert!(
                chunks.iter().any(|c| c.contains(word)),
                "{word} missing from {chunks:?}"
            );
        }
    }

    #[test]
    fn terminates_on_pathological_input() {
        let splitter = RecursiveSplitter::new(9, 0).unwrap();
        let text = "x".repeat(5000);
        let chunks = splitter.split(&text);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 9));
    }

    #[test]
    fn custom_separator_list_gains_terminal_empty() {
        let splitter =
            RecursiveSplitter::with_separators(5, 0, vec!["|".to_string()]).unwrap();
        // No '|' anywhere: only the appended empty separator can make progress.
        let chunks = splitter.split("aaaaaaaaaa");
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 5));
    }

    #[test]
    fn multibyte_text_never_panics() {
        let splitter = RecursiveSplitter::new(4, 1).unwrap();
        let text = "日本語のテキストを分割する。長い文章でも安全に。";
        let chunks = splitter.split(text);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 4));
    }
}
