//! Sliding-window text chunker with boundary snapping.
//!
//! Splits document text into bounded, overlapping segments. Lengths are
//! measured in characters (Unicode scalar values), never bytes, so
//! multi-byte text is never cut inside a code point.
//!
//! # Algorithm
//!
//! 1. Normalize whitespace: runs of spaces/tabs collapse to one space,
//!    blank lines are dropped, and the text is trimmed. Newlines survive
//!    so they remain usable as cut points.
//! 2. If the normalized text fits in `max_chars`, return it as one chunk.
//! 3. Otherwise slide a `max_chars` window across the text. For every
//!    window except the last, look for a cut point in the trailing 30% of
//!    the window, preferring a sentence terminator, then a newline, then a
//!    space. Without one, cut at `max_chars`.
//! 4. The next window starts at `end - overlap`, but always strictly after
//!    the previous window's start.
//! 5. Pieces are trimmed; empty pieces are dropped.
//!
//! # Example
//!
//! ```rust
//! use tutor_rag_core::chunk::chunk_text;
//!
//! let chunks = chunk_text("Hello   world.\n\nSecond paragraph.", 1000, 200);
//! assert_eq!(chunks, vec!["Hello world.\nSecond paragraph.".to_string()]);
//! ```

/// Fraction of the window (in tenths) searched for a cut point, from the end.
const BOUNDARY_WINDOW_TENTHS: usize = 3;

const SENTENCE_TERMINATORS: [char; 3] = ['.', '!', '?'];

/// Split `text` into ordered, non-empty chunks of at most `max_chars`
/// characters, with consecutive chunks sharing up to `overlap_chars`.
///
/// Empty or whitespace-only input produces no chunks. `overlap_chars` is
/// clamped below `max_chars`. Output is deterministic.
pub fn chunk_text(text: &str, max_chars: usize, overlap_chars: usize) -> Vec<String> {
    let max_chars = max_chars.max(1);
    let overlap = overlap_chars.min(max_chars - 1);

    let normalized = normalize_whitespace(text);
    if normalized.is_empty() {
        return Vec::new();
    }

    let chars: Vec<char> = normalized.chars().collect();
    let total = chars.len();
    if total <= max_chars {
        return vec![normalized];
    }

    let mut chunks = Vec::new();
    let mut start = 0usize;

    loop {
        let window_end = (start + max_chars).min(total);
        let end = if window_end < total {
            find_cut(&chars, start, window_end)
        } else {
            window_end
        };

        let piece: String = chars[start..end].iter().collect();
        let piece = piece.trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }

        if end >= total {
            break;
        }
        start = end.saturating_sub(overlap).max(start + 1);
    }

    chunks
}

/// Collapse horizontal whitespace, drop blank lines, and trim.
pub fn normalize_whitespace(text: &str) -> String {
    text.lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Pick the exclusive end of the window `[start, end)`.
///
/// Searches the trailing 30% for the last sentence terminator, then the
/// last newline, then the last space. Returns `end` when none is found.
fn find_cut(chars: &[char], start: usize, end: usize) -> usize {
    let len = end - start;
    let search_len = (len * BOUNDARY_WINDOW_TENTHS).div_ceil(10).max(1);
    let search_start = end - search_len.min(len);
    let region = &chars[search_start..end];

    let last = |pred: &dyn Fn(char) -> bool| region.iter().rposition(|&c| pred(c));

    last(&|c| SENTENCE_TERMINATORS.contains(&c))
        .or_else(|| last(&|c| c == '\n'))
        .or_else(|| last(&|c| c == ' '))
        .map(|pos| search_start + pos + 1)
        .unwrap_or(end)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sentence_text(len: usize) -> String {
        let sentence = "The browser parses markup into a tree. ";
        sentence.repeat(len / sentence.len() + 1)[..len].to_string()
    }

    #[test]
    fn test_small_text_single_chunk() {
        let chunks = chunk_text("Hello, world!", 1000, 200);
        assert_eq!(chunks, vec!["Hello, world!".to_string()]);
    }

    #[test]
    fn test_single_chunk_is_normalized() {
        let chunks = chunk_text("  a\t\tb  \n\n\n c ", 1000, 200);
        assert_eq!(chunks, vec!["a b\nc".to_string()]);
    }

    #[test]
    fn test_empty_text() {
        assert!(chunk_text("", 1000, 200).is_empty());
        assert!(chunk_text("   \n\t ", 1000, 200).is_empty());
    }

    #[test]
    fn test_exact_fit_is_one_chunk() {
        let text = "x".repeat(1000);
        assert_eq!(chunk_text(&text, 1000, 200).len(), 1);
    }

    #[test]
    fn test_2500_chars_gives_three_overlapping_chunks() {
        let text = sentence_text(2500);
        let chunks = chunk_text(&text, 1000, 200);
        assert_eq!(chunks.len(), 3);
        for c in &chunks {
            assert!(c.chars().count() <= 1000);
            assert!(!c.is_empty());
        }
        for pair in chunks.windows(2) {
            let prefix: String = pair[1].chars().take(50).collect();
            assert!(
                pair[0].contains(&prefix),
                "consecutive chunks should overlap: {:?}",
                prefix
            );
        }
    }

    #[test]
    fn test_cuts_on_sentence_boundary() {
        let text = sentence_text(2500);
        let chunks = chunk_text(&text, 1000, 200);
        assert!(chunks[0].ends_with('.'));
        assert!(chunks[1].ends_with('.'));
    }

    #[test]
    fn test_hard_cut_without_boundary() {
        let text = "a".repeat(2500);
        let chunks = chunk_text(&text, 1000, 200);
        assert_eq!(chunks[0].len(), 1000);
        assert_eq!(chunks[1].len(), 1000);
        assert_eq!(chunks.len(), 3);
    }

    #[test]
    fn test_reassembly_covers_content() {
        let text = (0..400)
            .map(|i| format!("word{}", i))
            .collect::<Vec<_>>()
            .join(" ");
        let chunks = chunk_text(&text, 300, 50);
        assert!(chunks.len() > 1);
        assert!(text.starts_with(&chunks[0]));
        assert!(text.ends_with(chunks.last().unwrap().as_str()));
        for i in 0..400 {
            let word = format!("word{}", i);
            assert!(
                chunks.iter().any(|c| c.split(' ').any(|w| w == word)),
                "{} missing from chunks",
                word
            );
        }
    }

    #[test]
    fn test_multibyte_utf8_chars() {
        let text = "┌──────┐ │ héllo wörld │ └──────┘ ".repeat(40);
        let chunks = chunk_text(&text, 64, 16);
        assert!(chunks.len() > 1);
        for c in &chunks {
            assert!(c.chars().count() <= 64);
        }
    }

    #[test]
    fn test_overlap_not_smaller_than_window_still_progresses() {
        let text = "abc ".repeat(100);
        let chunks = chunk_text(&text, 10, 50);
        assert!(!chunks.is_empty());
        assert!(chunks.iter().all(|c| c.chars().count() <= 10));
    }

    #[test]
    fn test_deterministic() {
        let text = sentence_text(5000);
        let c1 = chunk_text(&text, 700, 120);
        let c2 = chunk_text(&text, 700, 120);
        assert_eq!(c1, c2);
    }
}
