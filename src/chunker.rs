//! Character-budget chunking with overlap carry-over.

/// Split text into chunks of at most `chunk_size` characters, repeating the
/// trailing `overlap` characters of each chunk at the start of the next.
/// With `semantic` set, chunk boundaries snap back to the nearest paragraph
/// or sentence break in the second half of the window instead of cutting
/// mid-word.
pub fn chunk_text(content: &str, chunk_size: usize, overlap: usize, semantic: bool) -> Vec<String> {
    debug_assert!(overlap < chunk_size);

    let chars: Vec<(usize, char)> = content.char_indices().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    if chars.len() <= chunk_size {
        let trimmed = content.trim();
        return if trimmed.is_empty() {
            Vec::new()
        } else {
            vec![trimmed.to_string()]
        };
    }

    let byte_at = |char_idx: usize| -> usize {
        if char_idx >= chars.len() {
            content.len()
        } else {
            chars[char_idx].0
        }
    };

    let mut chunks = Vec::new();
    let mut start = 0usize;
    while start < chars.len() {
        let hard_end = (start + chunk_size).min(chars.len());
        let end = if semantic && hard_end < chars.len() {
            snap_to_break(&chars, start, hard_end)
        } else {
            hard_end
        };

        let slice = &content[byte_at(start)..byte_at(end)];
        let trimmed = slice.trim();
        if !trimmed.is_empty() {
            chunks.push(trimmed.to_string());
        }

        if end >= chars.len() {
            break;
        }
        // Carry `overlap` characters into the next window; always advance.
        start = (end.saturating_sub(overlap)).max(start + 1);
    }
    chunks
}

/// Snap the cut back to the latest paragraph break, sentence end, or space in
/// the second half of the window; fall back to the hard cut.
fn snap_to_break(chars: &[(usize, char)], start: usize, hard_end: usize) -> usize {
    let floor = start + (hard_end - start) / 2;

    let mut sentence = None;
    let mut space = None;
    let mut i = hard_end;
    while i > floor {
        i -= 1;
        let c = chars[i].1;
        if c == '\n' && i > 0 && chars[i - 1].1 == '\n' {
            return i + 1;
        }
        if sentence.is_none() && matches!(c, '.' | '!' | '?') {
            sentence = Some(i + 1);
        }
        if space.is_none() && c.is_whitespace() {
            space = Some(i + 1);
        }
    }
    sentence.or(space).unwrap_or(hard_end)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input_yields_no_chunks() {
        assert!(chunk_text("", 100, 10, false).is_empty());
        assert!(chunk_text("   \n  ", 100, 10, false).is_empty());
    }

    #[test]
    fn short_input_is_a_single_chunk() {
        let chunks = chunk_text("hello world", 100, 10, false);
        assert_eq!(chunks, vec!["hello world".to_string()]);
    }

    #[test]
    fn windows_overlap_by_the_configured_amount() {
        let content = "abcdefghijklmnopqrstuvwxyz";
        let chunks = chunk_text(content, 10, 4, false);
        assert!(chunks.len() > 1);
        // Each successor repeats the 4-char tail of its predecessor.
        for pair in chunks.windows(2) {
            let tail: String = pair[0].chars().rev().take(4).collect::<Vec<_>>().into_iter().rev().collect();
            assert!(pair[1].starts_with(&tail));
        }
    }

    #[test]
    fn every_chunk_respects_the_size_budget() {
        let content = "word ".repeat(500);
        for chunk in chunk_text(&content, 120, 20, true) {
            assert!(chunk.chars().count() <= 120);
        }
    }

    #[test]
    fn semantic_mode_prefers_sentence_boundaries() {
        let content = format!("{}. {}", "a".repeat(60), "b".repeat(60));
        let chunks = chunk_text(&content, 80, 10, true);
        assert!(chunks[0].ends_with('.'));
    }

    #[test]
    fn multibyte_content_chunks_on_char_boundaries() {
        let content = "\u{4e2d}".repeat(50);
        let chunks = chunk_text(&content, 20, 5, false);
        assert!(!chunks.is_empty());
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 20);
        }
    }
}
