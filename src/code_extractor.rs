//! Fenced code-block extraction from markdown.
//!
//! Scans page markdown for fenced blocks, keeps the ones that look like real code, and
//! captures the prose neighbourhood around each so code search results carry context.
//! Extraction is unified across sources: crawled pages, converted PDFs and uploaded
//! markdown all flow through the same scanner.
//!
//! Filtering drops blocks below the minimum length and blocks whose body reads like prose.
//! HTML entities are decoded iteratively so double- and triple-encoded crawl artifacts
//! (`&amp;amp;lt;`) come out as real characters. Near-identical bodies are deduplicated on
//! a whitespace-normalised hash, keeping the first occurrence.

use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// Fraction of prose-looking lines above which a block is judged to be quoted text.
const PROSE_RATIO_THRESHOLD: f64 = 0.6;

/// Maximum recursion depth when recovering from malformed nested fences.
const MAX_NESTED_FENCE_DEPTH: usize = 3;

/// Maximum entity-decoding passes; enough for triple-encoded crawl output.
const MAX_DECODE_PASSES: usize = 3;

/// Lines of surrounding markdown captured on each side of a fence.
const CONTEXT_LINES: usize = 5;

/// One extracted code example candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeBlock {
    /// Decoded code body; never contains a fence marker.
    pub code: String,
    /// Lowercased language tag; empty when the fence had none.
    pub language: String,
    /// Trimmed markdown lines immediately preceding the fence.
    pub context_before: String,
    /// Trimmed markdown lines immediately following the fence.
    pub context_after: String,
}

/// Extract code blocks from a markdown document.
///
/// Blocks shorter than `min_length` characters (after entity decoding) are dropped, as are
/// blocks judged to be prose quoted inside a fence.
pub fn extract_code_blocks(markdown: &str, min_length: usize) -> Vec<CodeBlock> {
    let raw = scan_fences(markdown, 0);

    let mut seen = HashSet::new();
    let mut blocks = Vec::new();
    for candidate in raw {
        let code = decode_entities(&candidate.code);
        if code.chars().count() < min_length {
            continue;
        }
        if prose_ratio(&code) > PROSE_RATIO_THRESHOLD {
            continue;
        }
        let fingerprint = normalized_hash(&code);
        if !seen.insert(fingerprint) {
            continue;
        }
        blocks.push(CodeBlock {
            code,
            language: candidate.language,
            context_before: candidate.context_before,
            context_after: candidate.context_after,
        });
    }
    blocks
}

struct RawBlock {
    code: String,
    language: String,
    context_before: String,
    context_after: String,
}

/// Walk the document line by line collecting well-formed fences.
///
/// A fence opens on ```` ```tag ```` where the tag is alphanumeric (plus `_+.-`) or empty,
/// and closes on the next bare ```` ``` ````. The pathological ```` ```tag` ```` shape
/// (a stray backtick glued to the tag) marks a malformed nested fence; the scanner retries
/// on the content after it, at most [`MAX_NESTED_FENCE_DEPTH`] levels deep.
fn scan_fences(markdown: &str, depth: usize) -> Vec<RawBlock> {
    if depth > MAX_NESTED_FENCE_DEPTH {
        return Vec::new();
    }

    let lines: Vec<&str> = markdown.lines().collect();
    let mut blocks = Vec::new();
    let mut index = 0;

    while index < lines.len() {
        let trimmed = lines[index].trim();
        let Some(tag) = trimmed.strip_prefix("```") else {
            index += 1;
            continue;
        };

        if !tag.is_empty() && tag.ends_with('`') {
            let inner = lines[index + 1..].join("\n");
            blocks.extend(scan_fences(&inner, depth + 1));
            break;
        }

        if !is_valid_language_tag(tag) {
            index += 1;
            continue;
        }

        let mut close = index + 1;
        let mut found_close = false;
        while close < lines.len() {
            if lines[close].trim() == "```" {
                found_close = true;
                break;
            }
            close += 1;
        }
        if !found_close {
            break;
        }

        blocks.push(RawBlock {
            code: lines[index + 1..close].join("\n"),
            language: tag.to_lowercase(),
            context_before: context_window(&lines, index.saturating_sub(CONTEXT_LINES), index),
            context_after: context_window(
                &lines,
                close + 1,
                (close + 1 + CONTEXT_LINES).min(lines.len()),
            ),
        });
        index = close + 1;
    }

    blocks
}

fn is_valid_language_tag(tag: &str) -> bool {
    tag.chars()
        .all(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '_' | '+' | '.' | '-'))
}

fn context_window(lines: &[&str], start: usize, end: usize) -> String {
    lines[start.min(lines.len())..end.min(lines.len())]
        .iter()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Decode HTML entities iteratively until stable, up to three passes.
fn decode_entities(code: &str) -> String {
    let mut current = code.to_string();
    for _ in 0..MAX_DECODE_PASSES {
        let decoded = html_escape::decode_html_entities(&current).into_owned();
        if decoded == current {
            break;
        }
        current = decoded;
    }
    current
}

/// Share of non-empty lines that end with sentence punctuation and carry no code tokens.
fn prose_ratio(code: &str) -> f64 {
    let lines: Vec<&str> = code
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect();
    if lines.is_empty() {
        return 0.0;
    }

    let prose_lines = lines
        .iter()
        .filter(|line| {
            let sentence_end = line.ends_with('.') || line.ends_with('!') || line.ends_with('?');
            sentence_end && !contains_code_tokens(line)
        })
        .count();

    prose_lines as f64 / lines.len() as f64
}

fn contains_code_tokens(line: &str) -> bool {
    const TOKENS: [&str; 8] = ["::", "->", "=>", "==", "();", "= ", "</", "/>"];
    line.chars()
        .any(|ch| matches!(ch, '{' | '}' | ';' | '(' | ')' | '[' | ']' | '<' | '>' | '$' | '`'))
        || TOKENS.iter().any(|token| line.contains(token))
}

fn normalized_hash(code: &str) -> String {
    let normalized = code.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_block_with_language_and_context() {
        let markdown = "\n# Example\n\nHere is some code:\n\n```python\ndef hello_world():\n    print(\"Hello, World!\")\n    return True\n```\n\nThat is all.\n";
        let blocks = extract_code_blocks(markdown, 10);

        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "python");
        assert!(blocks[0].code.contains("def hello_world():"));
        assert!(blocks[0].context_before.contains("# Example"));
        assert!(blocks[0].context_after.contains("That is all."));
    }

    #[test]
    fn language_tag_is_lowercased_and_may_be_empty() {
        let markdown = "```BASH\nnpm install some-package\ncd my-project\n```\n\n```\nplain --flags --here\n```\n";
        let blocks = extract_code_blocks(markdown, 10);
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].language, "bash");
        assert_eq!(blocks[1].language, "");
    }

    #[test]
    fn short_blocks_are_dropped() {
        let markdown = "```python\nx = 1\n```\n";
        assert!(extract_code_blocks(markdown, 100).is_empty());
        assert_eq!(extract_code_blocks(markdown, 5).len(), 1);
    }

    #[test]
    fn decodes_nested_html_entities() {
        let markdown = "```erb\n&lt;h1&gt;Hi&lt;/h1&gt;&lt;p&gt;welcome friend&lt;/p&gt;\n```\n";
        let blocks = extract_code_blocks(markdown, 10);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "erb");
        assert!(blocks[0].code.contains("<h1>Hi</h1>"));
        assert!(!blocks[0].code.contains("&lt;"));
    }

    #[test]
    fn triple_encoded_entities_resolve_in_three_passes() {
        assert_eq!(decode_entities("&amp;amp;lt;"), "<");
    }

    #[test]
    fn prose_in_fences_is_rejected() {
        let markdown = "```\nThis is really just a paragraph of text.\nIt has sentences and full stops.\nNothing code-shaped lives here at all.\n```\n";
        assert!(extract_code_blocks(markdown, 10).is_empty());
    }

    #[test]
    fn duplicate_bodies_keep_first_occurrence() {
        let markdown = "First:\n\n```js\nconsole.log(\"hi there\");\n```\n\nSecond copy:\n\n```js\nconsole.log(\"hi   there\");\n```\n";
        let blocks = extract_code_blocks(markdown, 10);
        assert_eq!(blocks.len(), 1);
        assert!(blocks[0].context_before.contains("First:"));
    }

    #[test]
    fn body_never_contains_fence_markers() {
        let markdown = "```rust\nfn main() { println!(\"ok\"); }\n```\n\n```rust\nfn other() { println!(\"ok2\"); }\n```\n";
        for block in extract_code_blocks(markdown, 10) {
            assert_eq!(block.code.matches("```").count(), 0);
        }
    }

    #[test]
    fn unterminated_fence_yields_nothing() {
        let markdown = "```python\nprint(\"never closed\")\n";
        assert!(extract_code_blocks(markdown, 5).is_empty());
    }

    #[test]
    fn malformed_nested_fences_recover_bounded() {
        let markdown = "```erb`\n```ruby\nputs \"inner block ok\"; x = 42\n```\n";
        let blocks = extract_code_blocks(markdown, 10);
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].language, "ruby");

        // Deeper than three levels of malformed nesting returns nothing.
        let deep = "```a`\n```b`\n```c`\n```d`\n```e`\n```ruby\nputs \"too deep to trust\"\n```\n";
        assert!(extract_code_blocks(deep, 5).is_empty());
    }
}
