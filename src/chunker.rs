//! Markdown-aware character chunking.
//!
//! The chunker slices page markdown into pieces small enough to embed while respecting the
//! document's structure. Boundary preference, in order: never inside a fenced code block,
//! immediately before a heading, at a blank line, after a sentence, after a word, and only
//! then a hard cut at the character budget. An indivisible code fence may force a chunk
//! larger than the budget; an unclosed trailing fence is treated as runaway and closed at
//! end of document.
//!
//! Invariant: every emitted chunk contains an even number of ``` fence markers.

use std::ops::Range;

/// Split a markdown document into chunks of at most `chunk_size` characters.
///
/// The only exception to the budget is a fenced code block longer than the budget, which is
/// emitted whole. Returns an empty vector for blank input.
pub fn chunk_markdown(text: &str, chunk_size: usize) -> Vec<String> {
    if text.trim().is_empty() {
        return Vec::new();
    }
    let chunk_size = chunk_size.max(1);
    let spans = fence_spans(text);
    let len = text.len();

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < len {
        let budget_end = match text[start..].char_indices().nth(chunk_size) {
            Some((offset, _)) => start + offset,
            None => len,
        };

        if budget_end >= len {
            push_chunk(&mut chunks, &text[start..]);
            break;
        }

        let end = match fence_containing(&spans, budget_end) {
            Some(span) if span.start > start => {
                // The budget lands inside a fence that starts within this chunk: cut just
                // before the fence and let the whole block open the next chunk.
                span.start
            }
            Some(span) => {
                // The chunk begins inside an oversized fence: emit the block whole.
                span.end.min(len)
            }
            None => choose_boundary(text, start, budget_end, &spans),
        };

        // Guarantee forward progress even against pathological inputs.
        let end = end.max(next_char_boundary(text, start));
        push_chunk(&mut chunks, &text[start..end]);
        start = end;
    }

    chunks
}

/// Byte ranges of fenced code blocks, opening line through closing line inclusive.
///
/// A trailing fence that never closes is treated as running to end of document.
fn fence_spans(text: &str) -> Vec<Range<usize>> {
    let mut spans = Vec::new();
    let mut open_start: Option<usize> = None;
    let mut offset = 0;

    for line in text.split_inclusive('\n') {
        if line.trim_start().starts_with("```") {
            match open_start {
                None => open_start = Some(offset),
                Some(start) => {
                    spans.push(start..offset + line.len());
                    open_start = None;
                }
            }
        }
        offset += line.len();
    }

    if let Some(start) = open_start {
        spans.push(start..text.len());
    }
    spans
}

fn fence_containing(spans: &[Range<usize>], position: usize) -> Option<Range<usize>> {
    spans
        .iter()
        .find(|span| span.start < position && position < span.end)
        .cloned()
}

/// Pick the best split point inside `text[start..budget_end]`.
fn choose_boundary(
    text: &str,
    start: usize,
    budget_end: usize,
    spans: &[Range<usize>],
) -> usize {
    let window = &text[start..budget_end];
    // Structural boundaries too close to the chunk start produce fragment chunks; require
    // at least 30% of the window before accepting one.
    let min_offset = window.len() * 3 / 10;

    // Heading boundary: split before the `#` that follows a newline.
    if let Some(boundary) = rfind_outside_fences(window, "\n#", start, spans, min_offset) {
        return start + boundary + 1;
    }

    // Blank line: split after the paragraph break.
    if let Some(boundary) = rfind_outside_fences(window, "\n\n", start, spans, min_offset) {
        return start + boundary + 2;
    }

    // Sentence end: `.`, `!` or `?` followed by whitespace.
    if let Some(boundary) = rfind_sentence_end(window, start, spans, min_offset) {
        return start + boundary;
    }

    // Word end: any whitespace.
    if let Some((index, ch)) = window
        .char_indices()
        .rev()
        .find(|(index, ch)| ch.is_whitespace() && !in_fence(spans, start + index))
    {
        return start + index + ch.len_utf8();
    }

    budget_end
}

fn rfind_outside_fences(
    window: &str,
    needle: &str,
    start: usize,
    spans: &[Range<usize>],
    min_offset: usize,
) -> Option<usize> {
    let mut search_end = window.len();
    while let Some(index) = window[..search_end].rfind(needle) {
        if index >= min_offset && !in_fence(spans, start + index) {
            return Some(index);
        }
        if index == 0 {
            break;
        }
        search_end = index;
    }
    None
}

fn rfind_sentence_end(
    window: &str,
    start: usize,
    spans: &[Range<usize>],
    min_offset: usize,
) -> Option<usize> {
    let mut best: Option<usize> = None;
    let mut previous: Option<(usize, char)> = None;
    for (index, ch) in window.char_indices() {
        if let Some((prev_index, prev_ch)) = previous
            && matches!(prev_ch, '.' | '!' | '?')
            && ch.is_whitespace()
            && prev_index >= min_offset
            && !in_fence(spans, start + prev_index)
        {
            best = Some(index + ch.len_utf8());
        }
        previous = Some((index, ch));
    }
    best
}

fn in_fence(spans: &[Range<usize>], position: usize) -> bool {
    spans
        .iter()
        .any(|span| span.start < position && position < span.end)
}

fn next_char_boundary(text: &str, position: usize) -> usize {
    text[position..]
        .char_indices()
        .nth(1)
        .map(|(offset, _)| position + offset)
        .unwrap_or(text.len())
}

fn push_chunk(chunks: &mut Vec<String>, raw: &str) {
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fence_count(chunk: &str) -> usize {
        chunk.matches("```").count()
    }

    #[test]
    fn short_documents_become_one_chunk() {
        let chunks = chunk_markdown("A short note.", 100);
        assert_eq!(chunks, vec!["A short note."]);
    }

    #[test]
    fn blank_input_yields_nothing() {
        assert!(chunk_markdown("   \n\n  ", 100).is_empty());
    }

    #[test]
    fn chunks_respect_the_character_budget() {
        let text = "word ".repeat(400);
        let chunks = chunk_markdown(&text, 100);
        assert!(chunks.len() > 1);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 100, "oversized chunk: {chunk:?}");
        }
    }

    #[test]
    fn prefers_heading_boundaries() {
        let text = format!(
            "{}\n# Section Two\n{}",
            "alpha ".repeat(12).trim(),
            "beta ".repeat(12).trim()
        );
        let chunks = chunk_markdown(&text, 90);
        assert!(chunks.iter().any(|chunk| chunk.starts_with("# Section Two")));
    }

    #[test]
    fn prefers_blank_lines_over_mid_sentence_cuts() {
        let text = format!(
            "{}\n\n{}",
            "first paragraph words ".repeat(3).trim(),
            "second paragraph words ".repeat(3).trim()
        );
        let chunks = chunk_markdown(&text, 80);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].contains("first paragraph"));
        assert!(chunks[1].starts_with("second paragraph"));
    }

    #[test]
    fn code_fences_are_never_split() {
        let body = "x = 1\n".repeat(42);
        let text = format!("Intro paragraph text.\n\n```python\n{body}```\n\nClosing prose.");
        assert!(text.len() >= 300);

        let chunks = chunk_markdown(&text, 100);
        let with_fence: Vec<&String> = chunks
            .iter()
            .filter(|chunk| fence_count(chunk) > 0)
            .collect();
        assert_eq!(with_fence.len(), 1);
        assert!(with_fence[0].contains("```python"));
        assert!(with_fence[0].matches("x = 1").count() == 42);

        for chunk in &chunks {
            assert_eq!(fence_count(chunk) % 2, 0, "odd fence count in {chunk:?}");
        }
    }

    #[test]
    fn runaway_fence_is_closed_at_end_of_document() {
        let text = format!("Prose first.\n\n```js\n{}", "call();\n".repeat(30));
        let chunks = chunk_markdown(&text, 60);
        // The unterminated fence runs to EOF and stays in one chunk.
        let fenced: Vec<&String> = chunks
            .iter()
            .filter(|chunk| fence_count(chunk) > 0)
            .collect();
        assert_eq!(fenced.len(), 1);
        assert!(fenced[0].matches("call();").count() == 30);
    }

    #[test]
    fn falls_back_to_word_boundaries() {
        let text = "alpha beta gamma delta epsilon zeta eta theta";
        let chunks = chunk_markdown(text, 20);
        for chunk in &chunks {
            assert!(!chunk.starts_with(' ') && !chunk.ends_with(' '));
            assert!(chunk.chars().count() <= 20);
        }
        let rejoined = chunks.join(" ");
        assert_eq!(rejoined, text);
    }

    #[test]
    fn hard_cut_when_no_boundary_exists() {
        let text = "a".repeat(250);
        let chunks = chunk_markdown(&text, 100);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 100);
        assert_eq!(chunks[2].len(), 50);
    }
}
