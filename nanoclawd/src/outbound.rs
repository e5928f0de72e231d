//! Outbound splitter — breaks an agent's reply into platform-sized chunks.
//!
//! Agent output can run far past a single Telegram message's character
//! limit. Splitting naively at the limit can tear a paragraph mid-sentence
//! or, worse, split a fenced code block so half of it renders as plain text
//! on one side and a dangling fence on the other. This module finds natural
//! boundaries — paragraph breaks first, then sentence breaks, then
//! whitespace — and keeps fenced code blocks intact across a split by
//! re-opening the fence on the next chunk.

/// Split `text` into segments no longer than `max_chars`, preferring to
/// break at paragraph boundaries, then sentence boundaries, then any
/// whitespace, and never inside a fenced code block.
pub fn split_message(text: &str, max_chars: usize) -> Vec<String> {
    if text.chars().count() <= max_chars {
        return vec![text.to_string()];
    }

    let mut segments = Vec::new();
    let mut remaining = text;
    let mut open_fence: Option<String> = None;

    while !remaining.is_empty() {
        if remaining.chars().count() <= max_chars {
            segments.push(prefix_with_fence(&open_fence, remaining));
            break;
        }

        let budget = max_chars.saturating_sub(fence_prefix_len(&open_fence));
        let split_at = find_split_point(remaining, budget).max(1);
        let (chunk, rest) = split_at_char(remaining, split_at);

        let chunk_with_fence = prefix_with_fence(&open_fence, chunk);
        open_fence = track_fence_state(open_fence, chunk);
        if open_fence.is_some() {
            segments.push(close_fence(&chunk_with_fence));
        } else {
            segments.push(chunk_with_fence);
        }

        remaining = rest.trim_start_matches('\n');
    }

    segments
}

fn fence_prefix_len(open_fence: &Option<String>) -> usize {
    open_fence.as_ref().map(|f| f.chars().count() + 1).unwrap_or(0)
}

fn prefix_with_fence(open_fence: &Option<String>, chunk: &str) -> String {
    match open_fence {
        Some(fence) => format!("{fence}\n{chunk}"),
        None => chunk.to_string(),
    }
}

fn close_fence(chunk: &str) -> String {
    format!("{chunk}\n```")
}

/// Track whether `chunk` leaves us inside an open fenced code block, and if
/// so, what the fence marker was (e.g. "```rust").
fn track_fence_state(mut open_fence: Option<String>, chunk: &str) -> Option<String> {
    for line in chunk.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") {
            open_fence = if open_fence.is_some() {
                None
            } else {
                Some(trimmed.to_string())
            };
        }
    }
    open_fence
}

/// Find the best split point within `budget` chars: paragraph break, then
/// sentence break, then whitespace, then a hard cut.
fn find_split_point(text: &str, budget: usize) -> usize {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= budget {
        return chars.len();
    }

    let window = &chars[..budget];

    if let Some(idx) = rfind_sequence(window, &['\n', '\n']) {
        return idx + 2;
    }

    for terminator in ['.', '!', '?'] {
        if let Some(idx) = rfind_sentence_end(window, terminator) {
            return idx + 1;
        }
    }

    if let Some(idx) = window.iter().rposition(|c| c.is_whitespace()) {
        return idx + 1;
    }

    budget
}

fn rfind_sequence(chars: &[char], seq: &[char]) -> Option<usize> {
    if seq.is_empty() || chars.len() < seq.len() {
        return None;
    }
    (0..=chars.len() - seq.len())
        .rev()
        .find(|&i| &chars[i..i + seq.len()] == seq)
}

fn rfind_sentence_end(chars: &[char], terminator: char) -> Option<usize> {
    chars.iter().rposition(|&c| c == terminator).filter(|&idx| {
        // Don't split mid-ellipsis or mid-number ("3.14").
        chars.get(idx + 1).map(|c| c.is_whitespace()).unwrap_or(true)
    })
}

fn split_at_char(text: &str, char_idx: usize) -> (&str, &str) {
    match text.char_indices().nth(char_idx) {
        Some((byte_idx, _)) => text.split_at(byte_idx),
        None => (text, ""),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_single_segment() {
        let segments = split_message("hello world", 100);
        assert_eq!(segments, vec!["hello world".to_string()]);
    }

    #[test]
    fn splits_at_paragraph_boundary() {
        let text = format!("{}\n\n{}", "a".repeat(50), "b".repeat(50));
        let segments = split_message(&text, 60);
        assert_eq!(segments.len(), 2);
        assert!(segments[0].chars().all(|c| c == 'a'));
        assert!(segments[1].chars().all(|c| c == 'b'));
    }

    #[test]
    fn splits_at_sentence_boundary() {
        let text = format!("{}. {}.", "a".repeat(40), "b".repeat(40));
        let segments = split_message(&text, 45);
        assert!(segments.len() >= 2);
        assert!(segments[0].ends_with('.'));
    }

    #[test]
    fn falls_back_to_whitespace() {
        let text = format!("{} {}", "a".repeat(40), "b".repeat(40));
        let segments = split_message(&text, 45);
        assert!(segments.len() >= 2);
        assert!(!segments[0].contains(' '));
    }

    #[test]
    fn keeps_fenced_code_block_intact_across_split() {
        let code_body = "line_of_code();\n".repeat(10);
        let text = format!("intro text here\n\n```rust\n{code_body}```\n\noutro text here");
        let segments = split_message(&text, 60);
        assert!(segments.len() > 1);
        for segment in &segments {
            let fence_count = segment.matches("```").count();
            assert_eq!(fence_count % 2, 0, "segment has unbalanced fence: {segment}");
        }
    }

    #[test]
    fn reassembled_segments_cover_all_non_whitespace_content() {
        let text = "word ".repeat(200);
        let segments = split_message(&text, 50);
        let joined: String = segments.join("");
        let original_words: Vec<&str> = text.split_whitespace().collect();
        let joined_words: Vec<&str> = joined.split_whitespace().collect();
        assert_eq!(original_words, joined_words);
    }
}
