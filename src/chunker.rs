//! Token-aware sliding-window chunker.
//!
//! Splits concatenated conversation text into overlapping windows, preferring
//! to cut at sentence or whitespace boundaries. The algorithm is
//! deterministic: the same input always yields the same chunk sequence, which
//! (with deterministic point ids) is what makes re-ingestion idempotent.

use crate::config::{CHUNK_OVERLAP_CHARS, CHUNK_WINDOW_CHARS};

/// Boundary candidates, in preference order. A separator is only accepted
/// past the window midpoint, so chunks never degenerate to fragments.
const SEPARATORS: &[&str] = &[". ", ".\n", "! ", "? ", "\n\n", "\n", " "];

/// Chunk `text` into trimmed, non-empty windows of at most
/// [`CHUNK_WINDOW_CHARS`] characters with [`CHUNK_OVERLAP_CHARS`] overlap.
pub fn chunk_text(text: &str) -> Vec<String> {
    chunk_with(text, CHUNK_WINDOW_CHARS, CHUNK_OVERLAP_CHARS)
}

fn chunk_with(text: &str, window: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();

    if total == 0 {
        return Vec::new();
    }
    if total <= window {
        let trimmed = text.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let mut end = (start + window).min(total);

        if end < total {
            let min_cut = start + window / 2;
            for sep in SEPARATORS {
                if let Some(pos) = rfind_separator(&chars, start, end, sep) {
                    if pos > min_cut {
                        // Chunk ends just past the separator.
                        end = pos + sep.chars().count();
                        break;
                    }
                }
            }
        }

        let piece: String = chars[start..end].iter().collect();
        let trimmed = piece.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= total {
            break;
        }
        start = (start + 1).max(end.saturating_sub(overlap));
    }

    chunks
}

/// Latest start position of `sep` within `chars[start..end)`, if any.
fn rfind_separator(chars: &[char], start: usize, end: usize, sep: &str) -> Option<usize> {
    let sep_chars: Vec<char> = sep.chars().collect();
    let len = sep_chars.len();
    if end - start < len {
        return None;
    }
    let mut pos = end - len;
    loop {
        if chars[pos..pos + len] == sep_chars[..] {
            return Some(pos);
        }
        if pos == start {
            return None;
        }
        pos -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_input_yields_nothing() {
        assert!(chunk_text("").is_empty());
        assert!(chunk_text("   \n  ").is_empty());
    }

    #[test]
    fn test_short_input_single_chunk() {
        let chunks = chunk_text("Hello, world.");
        assert_eq!(chunks, vec!["Hello, world.".to_string()]);
    }

    #[test]
    fn test_input_at_window_boundary_single_chunk() {
        let text = "a".repeat(CHUNK_WINDOW_CHARS);
        assert_eq!(chunk_text(&text).len(), 1);
    }

    #[test]
    fn test_long_input_multiple_chunks_with_overlap() {
        let sentence = "The quick brown fox jumps over the lazy dog. ";
        let text = sentence.repeat(200); // ~9000 chars
        let chunks = chunk_text(&text);
        assert!(chunks.len() > 2);
        for chunk in &chunks {
            assert!(!chunk.is_empty());
            assert!(chunk.chars().count() <= CHUNK_WINDOW_CHARS);
        }
        // Sentence-boundary cuts: every chunk ends with a full sentence.
        for chunk in &chunks {
            assert!(chunk.ends_with("dog."), "chunk ended mid-sentence: {:?}", chunk);
        }
    }

    #[test]
    fn test_deterministic() {
        let text = "Lorem ipsum dolor sit amet. ".repeat(150);
        let a = chunk_text(&text);
        let b = chunk_text(&text);
        assert_eq!(a, b);
    }

    #[test]
    fn test_covers_entire_input() {
        // With no trimmable edges, consecutive chunks overlap, so every
        // window of the input appears in some chunk. Tokens are unique so
        // each chunk matches exactly one position.
        let text = (0..400)
            .map(|i| format!("token{i:04}"))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_with(&text, 100, 20);
        let mut covered_to = 0usize;
        for chunk in &chunks {
            let at = text.find(chunk.as_str()).expect("chunk not found in input");
            assert!(at <= covered_to, "gap before chunk at {}", at);
            covered_to = covered_to.max(at + chunk.len());
        }
        assert_eq!(covered_to, text.len());
    }

    #[test]
    fn test_separator_preference_order() {
        // A period boundary past the midpoint wins over later whitespace.
        let mut text = String::new();
        text.push_str(&"x".repeat(70));
        text.push_str(". ");
        text.push_str(&"y ".repeat(100));
        let chunks = chunk_with(&text, 100, 10);
        assert!(chunks[0].ends_with('.'));
    }

    #[test]
    fn test_no_separator_hard_cut() {
        let text = "z".repeat(500);
        let chunks = chunk_with(&text, 100, 10);
        assert!(chunks.len() > 1);
        assert_eq!(chunks[0].len(), 100);
    }

    #[test]
    fn test_multibyte_safe() {
        let text = "héllo wörld — ünïcode. ".repeat(120);
        let chunks = chunk_text(&text);
        assert!(!chunks.is_empty());
        // Would panic on a byte-slicing implementation.
        for chunk in chunks {
            assert!(chunk.chars().count() <= CHUNK_WINDOW_CHARS);
        }
    }
}
