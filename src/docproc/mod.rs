//! Format-aware text extraction for uploaded documents.
//!
//! The ingestion pipeline normalises everything to markdown before chunking. Markdown and
//! plain text pass through unchanged; PDFs go through text extraction with an OCR fallback
//! for scanned documents. Crawled HTML is converted upstream by the crawler, so it never
//! reaches this module.

/// llms-full.txt section parsing.
pub mod llms_full;
mod pdf;

pub use pdf::extract_pdf_markdown;

use thiserror::Error;

/// Errors raised while extracting text from an uploaded document.
#[derive(Debug, Error)]
pub enum DocError {
    /// File bytes were not valid UTF-8 where text was expected.
    #[error("Document is not valid UTF-8: {0}")]
    InvalidUtf8(String),
    /// PDF parsing failed.
    #[error("Failed to read PDF: {0}")]
    Pdf(String),
    /// Filesystem or subprocess failure during OCR.
    #[error("OCR failed: {0}")]
    Ocr(String),
    /// The file extension maps to no known extractor.
    #[error("Unsupported document type: {0}")]
    Unsupported(String),
}

/// Extract markdown text from an uploaded file based on its extension.
///
/// Markdown and plain text are passed through unchanged; PDFs are converted, falling back
/// to OCR for image-only documents when the OCR tools are installed.
pub async fn extract_document(filename: &str, bytes: &[u8]) -> Result<String, DocError> {
    let extension = filename
        .rsplit('.')
        .next()
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "md" | "markdown" | "txt" => String::from_utf8(bytes.to_vec())
            .map_err(|error| DocError::InvalidUtf8(error.to_string())),
        "pdf" => extract_pdf_markdown(bytes).await,
        other => Err(DocError::Unsupported(other.to_string())),
    }
}

/// Repair code spans that an HTML-to-text pass split with whitespace.
///
/// BeautifulSoup-style extractors insert spaces between nested elements, corrupting import
/// paths (`next / headers`) and hyphenated package names (`server - only`). The repair is
/// applied only to quoted strings inside fenced code blocks, never to prose.
pub fn fix_code_span_spaces(markdown: &str) -> String {
    let mut lines = Vec::new();
    let mut in_fence = false;

    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
            lines.push(line.to_string());
            continue;
        }
        if in_fence {
            lines.push(repair_code_line(line));
        } else {
            lines.push(line.to_string());
        }
    }

    let mut result = lines.join("\n");
    if markdown.ends_with('\n') {
        result.push('\n');
    }
    result
}

/// Count whitespace-separated words.
pub fn word_count(text: &str) -> usize {
    text.split_whitespace().count()
}

fn repair_code_line(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut rest = line;

    while let Some(pos) = rest.find(['\'', '"']) {
        let quote = rest[pos..].chars().next().expect("find returned a match");
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];
        match after.find(quote) {
            Some(close) => {
                out.push(quote);
                out.push_str(&repair_path_tokens(&after[..close]));
                out.push(quote);
                rest = &after[close + 1..];
            }
            None => {
                out.push(quote);
                rest = after;
            }
        }
    }

    out.push_str(rest);
    out
}

fn repair_path_tokens(inner: &str) -> String {
    let mut value = inner.to_string();

    // Collapse spaces around slashes; repeated passes handle chains like 'lib / utils / x'.
    for _ in 0..5 {
        let next = value
            .replace(" / ", "/")
            .replace("/ ", "/")
            .replace(" /", "/");
        if next == value {
            break;
        }
        value = next;
    }

    // Join hyphenated package names when both sides are lowercase words.
    let mut search_from = 0;
    while let Some(rel) = value[search_from..].find(" - ") {
        let pos = search_from + rel;
        let before_ok = value[..pos]
            .chars()
            .next_back()
            .map(|ch| ch.is_ascii_lowercase())
            .unwrap_or(false);
        let after_ok = value[pos + 3..]
            .chars()
            .next()
            .map(|ch| ch.is_ascii_lowercase())
            .unwrap_or(false);
        if before_ok && after_ok {
            value.replace_range(pos..pos + 3, "-");
            search_from = pos.saturating_sub(1);
        } else {
            search_from = pos + 3;
        }
        if search_from >= value.len() {
            break;
        }
    }

    value
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn markdown_passes_through_unchanged() {
        let body = "# Title\n\nSome text.\n";
        let extracted = extract_document("notes.md", body.as_bytes())
            .await
            .expect("markdown");
        assert_eq!(extracted, body);
    }

    #[tokio::test]
    async fn unknown_extensions_are_rejected() {
        let error = extract_document("archive.tar", b"data").await.unwrap_err();
        assert!(matches!(error, DocError::Unsupported(_)));
    }

    #[test]
    fn repairs_split_import_paths_inside_fences() {
        let markdown = "```ts\nimport { headers } from 'next / headers'\n```\n";
        let fixed = fix_code_span_spaces(markdown);
        assert!(fixed.contains("'next/headers'"));
    }

    #[test]
    fn repairs_chained_paths_and_alias_prefix() {
        let markdown = "```ts\nimport x from '@/ lib / utils / helper'\n```\n";
        let fixed = fix_code_span_spaces(markdown);
        assert!(fixed.contains("'@/lib/utils/helper'"));
    }

    #[test]
    fn repairs_hyphenated_package_names() {
        let markdown = "```ts\nimport 'server - only'\n```\n";
        let fixed = fix_code_span_spaces(markdown);
        assert!(fixed.contains("'server-only'"));
    }

    #[test]
    fn prose_is_never_touched() {
        let markdown = "The ratio is 'a / b' in prose.\n\n```\nok\n```\n";
        let fixed = fix_code_span_spaces(markdown);
        assert!(fixed.contains("'a / b'"));
    }

    #[test]
    fn unquoted_code_is_left_alone() {
        let markdown = "```py\nresult = total / count\n```\n";
        assert_eq!(fix_code_span_spaces(markdown), markdown);
    }
}
